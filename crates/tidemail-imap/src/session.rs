//! The protocol-session seam.
//!
//! [`MailSession`] is the set of stateful operations the sync engine needs
//! from a remote server. Folder selection is part of the session state, so
//! every folder-scoped call operates on whatever [`MailSession::select`]
//! opened last.
//!
//! [`Connector`] produces authenticated sessions; the connection manager
//! calls it again whenever a session dies.

use std::future::Future;

use crate::Result;
use crate::config::ImapConfig;
use crate::types::{FetchedMessage, FolderInfo, FolderStatus, StoreAction, Uid, UidSet};

/// An authenticated, stateful session with a remote mail server.
pub trait MailSession: Send + 'static {
    /// Lists every folder visible to the account.
    fn list_folders(&mut self) -> impl Future<Output = Result<Vec<FolderInfo>>> + Send;

    /// Opens a folder, read-only (EXAMINE) or read-write (SELECT).
    fn select(
        &mut self,
        path: &str,
        read_only: bool,
    ) -> impl Future<Output = Result<FolderStatus>> + Send;

    /// Fetches flags, internal date, size and raw source for the UIDs.
    fn uid_fetch(
        &mut self,
        uids: &UidSet,
    ) -> impl Future<Output = Result<Vec<FetchedMessage>>> + Send;

    /// Adds or removes flags on the UIDs.
    fn uid_store(
        &mut self,
        uids: &UidSet,
        action: &StoreAction,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Moves the UIDs to another folder.
    fn uid_move(&mut self, uids: &UidSet, dest: &str) -> impl Future<Output = Result<()>> + Send;

    /// Marks the UIDs `\Deleted` and expunges exactly those UIDs.
    fn uid_delete(&mut self, uids: &UidSet) -> impl Future<Output = Result<()>> + Send;

    /// Returns every UID in the selected folder.
    fn uid_search_all(&mut self) -> impl Future<Output = Result<Vec<Uid>>> + Send;

    /// Creates a folder.
    fn create_folder(&mut self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Keepalive.
    fn noop(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Ends the session politely.
    fn logout(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Opens authenticated sessions.
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by this connector.
    type Session: MailSession;

    /// Connects and authenticates with the given endpoint and credentials.
    fn connect(&self, config: &ImapConfig) -> impl Future<Output = Result<Self::Session>> + Send;
}
