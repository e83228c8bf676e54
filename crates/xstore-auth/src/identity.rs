//! Authenticated identities
//!
//! An `Identity` is issued by an authenticator and never changes afterwards.
//! Brokers and transactions hold it behind an `Arc`; re-authentication issues
//! a new value rather than mutating the old one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Numeric identity id
pub type IdentityId = u32;

/// Group every administrator belongs to
pub const DBA_GROUP: &str = "dba";

/// Group of the anonymous identity
pub const GUEST_GROUP: &str = "guest";

/// An authenticated principal plus its group memberships
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    id: IdentityId,
    name: String,
    groups: BTreeSet<String>,
}

impl Identity {
    /// Id of the internal system identity
    pub const SYSTEM_ID: IdentityId = 0;
    /// Id of the anonymous guest identity
    pub const GUEST_ID: IdentityId = 1;

    /// Create a new identity
    pub fn new<I, S>(id: IdentityId, name: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            name: name.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// The identity used by the database itself for maintenance work
    #[must_use]
    pub fn system() -> Self {
        Self::new(Self::SYSTEM_ID, "SYSTEM", [DBA_GROUP])
    }

    /// The anonymous identity
    #[must_use]
    pub fn guest() -> Self {
        Self::new(Self::GUEST_ID, "guest", [GUEST_GROUP])
    }

    #[must_use]
    pub const fn id(&self) -> IdentityId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }

    #[must_use]
    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Check if this identity has administrative rights
    #[must_use]
    pub fn is_dba(&self) -> bool {
        self.is_member_of(DBA_GROUP)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}#{})", self.name, self.id)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_groups() {
        let identity = Identity::new(42, "editor", ["authors", "reviewers"]);
        assert_eq!(identity.id(), 42);
        assert_eq!(identity.name(), "editor");
        assert!(identity.is_member_of("authors"));
        assert!(!identity.is_dba());
        assert_eq!(identity.groups().collect::<Vec<_>>(), vec!["authors", "reviewers"]);
    }

    #[test]
    fn test_well_known_identities() {
        assert!(Identity::system().is_dba());
        assert_eq!(Identity::guest().id(), Identity::GUEST_ID);
        assert_ne!(Identity::system(), Identity::guest());
    }
}
