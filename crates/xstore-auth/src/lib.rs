//! XStore Authentication
//!
//! This crate provides:
//! - Immutable authenticated identities bound to brokers
//! - The pluggable `Authenticator` collaborator consulted by the broker pool
//! - An in-memory account store with salted password hashes
//!
//! # Example
//!
//! ```rust,ignore
//! use xstore_auth::{AccountStore, Authenticator, Credentials};
//!
//! let store = AccountStore::with_admin("secret");
//! let identity = store.verify(&Credentials::new("admin", "secret"))?;
//! assert!(identity.is_member_of("dba"));
//! ```

pub mod error;
pub mod identity;
pub mod provider;
pub mod store;

pub use error::AuthError;
pub use identity::{Identity, IdentityId};
pub use provider::{Authenticator, Credentials};
pub use store::{Account, AccountStatus, AccountStore};
