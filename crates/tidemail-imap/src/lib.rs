//! # tidemail-imap
//!
//! The protocol-session seam used by the tidemail sync engine.
//!
//! ## Features
//!
//! - **Session trait**: [`MailSession`] captures the stateful IMAP operations
//!   the engine relies on (LIST, SELECT/EXAMINE, UID FETCH/STORE/MOVE,
//!   delete + UID EXPUNGE, UID SEARCH, CREATE, NOOP)
//! - **Real servers**: [`ImapConnector`] drives `async-imap` over TLS via rustls
//! - **In-memory server**: [`MemoryServer`] records every call and can inject
//!   failures, for tests and local runs
//! - **Typed identifiers**: [`Uid`], [`UidValidity`] and compact [`UidSet`]s
//!
//! ## Quick Start
//!
//! ```ignore
//! use tidemail_imap::{Connector, ImapConfig, ImapConnector, MailSession, Security, UidSet};
//!
//! let config = ImapConfig::new("imap.example.com", Security::Tls)
//!     .credentials("me@example.com", "password");
//! let mut session = ImapConnector::default().connect(&config).await?;
//!
//! let status = session.select("INBOX", true).await?;
//! let head = status.head_uid();
//! let window = UidSet::range(head.saturating_sub(99).max(1), head).unwrap();
//! for message in session.uid_fetch(&window).await? {
//!     println!("{} ({} bytes)", message.uid, message.size);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
mod error;
pub mod imap;
pub mod memory;
pub mod session;
pub mod stream;
pub mod types;

pub use config::{ImapConfig, Security};
pub use error::{Error, Result};
pub use imap::{ImapConnector, ImapSession};
pub use memory::{FailPoint, MemoryServer, MemorySession, RecordedOp};
pub use session::{Connector, MailSession};
pub use stream::{ImapStream, Transport};
pub use types::{
    FetchedMessage, Flag, FolderInfo, FolderStatus, MessageFlags, SpecialUse, StoreAction, Uid,
    UidSet, UidValidity,
};
