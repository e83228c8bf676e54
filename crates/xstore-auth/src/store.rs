//! Account storage
//!
//! In-memory accounts with salted SHA-256 password hashes. This is the default
//! `Authenticator` used when the embedding application does not supply its
//! own security backend.

use crate::error::AuthError;
use crate::identity::{DBA_GROUP, Identity, IdentityId};
use crate::provider::{Authenticator, Credentials};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

/// First id handed out to user-created accounts
const FIRST_ACCOUNT_ID: IdentityId = 1000;

/// Account status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    #[default]
    Enabled,
    Disabled,
}

/// A stored account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: IdentityId,
    pub name: String,
    pub groups: BTreeSet<String>,
    pub status: AccountStatus,
    salt: String,
    password_hash: String,
}

impl Account {
    fn new(id: IdentityId, name: String, password: &str, groups: BTreeSet<String>) -> Self {
        let salt = generate_salt();
        let password_hash = hash_password(&salt, password);
        Self {
            id,
            name,
            groups,
            status: AccountStatus::Enabled,
            salt,
            password_hash,
        }
    }

    fn password_matches(&self, password: &str) -> bool {
        constant_time_eq(
            hash_password(&self.salt, password).as_bytes(),
            self.password_hash.as_bytes(),
        )
    }

    /// The identity this account authenticates as
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.id, self.name.clone(), self.groups.iter().cloned())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.status == AccountStatus::Enabled
    }
}

/// In-memory account store
pub struct AccountStore {
    /// Accounts indexed by name
    accounts: RwLock<HashMap<String, Account>>,
    next_id: AtomicU32,
}

impl Default for AccountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountStore {
    /// Create a new empty account store
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(FIRST_ACCOUNT_ID),
        }
    }

    /// Create an account store with an `admin` account in the `dba` group
    pub fn with_admin(password: &str) -> Self {
        let store = Self::new();
        let admin = Account::new(
            store.next_id.fetch_add(1, Ordering::Relaxed),
            "admin".to_string(),
            password,
            BTreeSet::from([DBA_GROUP.to_string()]),
        );
        store.accounts.write().insert(admin.name.clone(), admin);
        info!("Created account store with admin account");
        store
    }

    /// Create a new account
    pub fn create_account<I, S>(
        &self,
        name: &str,
        password: &str,
        groups: I,
    ) -> Result<Identity, AuthError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut accounts = self.accounts.write();
        if accounts.contains_key(name) {
            return Err(AuthError::AccountAlreadyExists(name.to_string()));
        }

        let account = Account::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            name.to_string(),
            password,
            groups.into_iter().map(Into::into).collect(),
        );
        let identity = account.identity();
        accounts.insert(name.to_string(), account);

        debug!(account = name, id = identity.id(), "created account");
        Ok(identity)
    }

    /// Get account by name
    pub fn get_account(&self, name: &str) -> Result<Account, AuthError> {
        self.accounts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AuthError::AccountNotFound(name.to_string()))
    }

    /// List all account names
    pub fn list_accounts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.accounts.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Enable or disable an account
    pub fn set_status(&self, name: &str, status: AccountStatus) -> Result<(), AuthError> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(name)
            .ok_or_else(|| AuthError::AccountNotFound(name.to_string()))?;
        account.status = status;
        Ok(())
    }

    /// Replace an account's password
    pub fn set_password(&self, name: &str, password: &str) -> Result<(), AuthError> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(name)
            .ok_or_else(|| AuthError::AccountNotFound(name.to_string()))?;
        account.salt = generate_salt();
        account.password_hash = hash_password(&account.salt, password);
        Ok(())
    }

    /// Remove an account; identities already issued stay valid until superseded
    pub fn remove_account(&self, name: &str) -> Result<(), AuthError> {
        self.accounts
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AuthError::AccountNotFound(name.to_string()))
    }
}

impl Authenticator for AccountStore {
    fn name(&self) -> &str {
        "accounts"
    }

    fn verify(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let accounts = self.accounts.read();
        let account = accounts
            .get(&credentials.username)
            .ok_or(AuthError::InvalidCredentials)?;

        if !account.password_matches(&credentials.password) {
            return Err(AuthError::InvalidCredentials);
        }
        if !account.is_enabled() {
            return Err(AuthError::AccountDisabled(account.name.clone()));
        }

        Ok(account.identity())
    }
}

/// Generate a random 16-byte salt, hex encoded
fn generate_salt() -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    hex::encode(salt)
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_can_authenticate() {
        let store = AccountStore::with_admin("secret");
        let identity = store.verify(&Credentials::new("admin", "secret")).unwrap();

        assert_eq!(identity.name(), "admin");
        assert!(identity.is_dba());
    }

    #[test]
    fn test_wrong_password_rejected() {
        let store = AccountStore::with_admin("secret");
        let err = store
            .verify(&Credentials::new("admin", "guess"))
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));

        // Unknown users get the same answer as bad passwords
        let err = store
            .verify(&Credentials::new("nobody", "secret"))
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[test]
    fn test_create_account() {
        let store = AccountStore::new();
        let identity = store
            .create_account("editor", "pw", ["authors"])
            .unwrap();
        assert_eq!(identity.id(), FIRST_ACCOUNT_ID);
        assert!(identity.is_member_of("authors"));

        let err = store.create_account("editor", "pw", ["authors"]).unwrap_err();
        assert!(matches!(err, AuthError::AccountAlreadyExists(_)));

        let verified = store.verify(&Credentials::new("editor", "pw")).unwrap();
        assert_eq!(verified, identity);
    }

    #[test]
    fn test_disabled_account() {
        let store = AccountStore::new();
        store.create_account("temp", "pw", Vec::<String>::new()).unwrap();
        store.set_status("temp", AccountStatus::Disabled).unwrap();

        let err = store.verify(&Credentials::new("temp", "pw")).unwrap_err();
        assert!(matches!(err, AuthError::AccountDisabled(_)));
    }

    #[test]
    fn test_password_change_and_removal() {
        let store = AccountStore::new();
        store.create_account("user", "old", ["users"]).unwrap();
        store.set_password("user", "new").unwrap();

        assert!(store.verify(&Credentials::new("user", "old")).is_err());
        assert!(store.verify(&Credentials::new("user", "new")).is_ok());

        store.remove_account("user").unwrap();
        assert!(store.list_accounts().is_empty());
        assert!(matches!(
            store.get_account("user"),
            Err(AuthError::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_salts_differ() {
        let store = AccountStore::new();
        store.create_account("a", "same", ["users"]).unwrap();
        store.create_account("b", "same", ["users"]).unwrap();

        let a = store.get_account("a").unwrap();
        let b = store.get_account("b").unwrap();
        assert_ne!(a.password_hash, b.password_hash);
    }
}
