//! Pluggable credential verification
//!
//! The broker pool never checks passwords itself. It hands the caller's
//! credentials to an `Authenticator` and receives an `Identity` back.

use crate::error::AuthError;
use crate::identity::Identity;
use std::fmt;

/// Username and secret presented by a caller
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Trait for pluggable credential verifiers
pub trait Authenticator: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Verify the credentials and return the identity they belong to
    fn verify(&self, credentials: &Credentials) -> Result<Identity, AuthError>;
}
