//! Identity model types.

use serde::{Deserialize, Serialize};
use tidemail_imap::ImapConfig;

/// Unique identifier for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityId(pub i64);

impl IdentityId {
    /// Create a new identity ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected mailbox account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique identifier (None for unsaved identities).
    pub id: Option<IdentityId>,
    /// User that owns the identity and everything synced through it.
    pub owner_id: String,
    /// Address of the account.
    pub email: String,
    /// Server endpoint and credentials.
    pub imap: ImapConfig,
}

impl Identity {
    /// Creates an unsaved identity.
    #[must_use]
    pub fn new(owner_id: impl Into<String>, email: impl Into<String>, imap: ImapConfig) -> Self {
        Self {
            id: None,
            owner_id: owner_id.into(),
            email: email.into(),
            imap,
        }
    }
}
