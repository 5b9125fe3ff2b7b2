//! Error types for the protocol session layer.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a remote mail server.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server rejected the command (NO/BAD) or sent something we could not use.
    #[error("Server rejected command: {0}")]
    Rejected(String),

    /// The named folder does not exist on the server.
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// A folder-scoped command was issued with no folder selected.
    #[error("No folder selected")]
    NotSelected,

    /// The connection is gone and must be re-established.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The server refused or garbled the STARTTLS upgrade.
    #[error("STARTTLS failed: {0}")]
    StartTls(String),
}

impl Error {
    /// Whether this error means the session can no longer be used.
    ///
    /// Command-level rejections leave the connection usable; everything
    /// else forces a reconnect.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Rejected(_) | Self::FolderNotFound(_) | Self::NotSelected
        )
    }
}

impl From<async_imap::error::Error> for Error {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapError;

        match err {
            ImapError::Io(e) => Self::Io(e),
            ImapError::No(msg) | ImapError::Bad(msg) => Self::Rejected(msg),
            ImapError::ConnectionLost => Self::Disconnected("connection lost".to_string()),
            other => Self::Disconnected(other.to_string()),
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_not_fatal() {
        assert!(!Error::Rejected("NO [TRYCREATE]".into()).is_fatal());
        assert!(!Error::FolderNotFound("Archive".into()).is_fatal());
        assert!(!Error::NotSelected.is_fatal());
    }

    #[test]
    fn transport_errors_are_fatal() {
        assert!(Error::Disconnected("bye".into()).is_fatal());
        assert!(Error::Timeout(Duration::from_secs(5)).is_fatal());
        assert!(Error::Io(std::io::Error::other("reset")).is_fatal());
    }
}
