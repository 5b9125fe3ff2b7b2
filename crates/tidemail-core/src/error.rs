//! Error types for the sync engine.

use thiserror::Error;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IMAP operation failed.
    #[error("IMAP error: {0}")]
    Imap(#[from] tidemail_imap::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request to an external service failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The raw message could not be parsed.
    #[error("Parse error: {0}")]
    Parse(#[from] mailparse::MailParseError),

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session actor for an identity is gone.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// The search index rejected a request.
    #[error("Search index error: {0}")]
    Search(String),

    /// Object storage failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Returns true for errors caused by the remote mail server or the link to it.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Imap(_) | Self::SessionClosed(_))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
