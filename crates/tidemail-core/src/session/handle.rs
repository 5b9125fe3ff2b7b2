use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc, oneshot};

use tidemail_imap::{FetchedMessage, FolderInfo, FolderStatus, StoreAction, Uid, UidSet};

use super::command::SessionCommand;
use crate::identity::IdentityId;
use crate::{Error, Result};

/// Per-folder locks shared by every handle of one session.
#[derive(Debug, Default)]
struct FolderLocks {
    folders: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FolderLocks {
    fn get(&self, path: &str) -> Arc<AsyncMutex<()>> {
        let mut folders = self.folders.lock().unwrap_or_else(PoisonError::into_inner);
        folders.entry(path.to_string()).or_default().clone()
    }
}

/// Cloneable, `Send + Sync` facade over an identity's session actor.
///
/// Every folder-scoped call names its folder; the actor selects it before
/// running the command. Sequences of calls that must not interleave with
/// other engines on the same folder hold [`SessionHandle::lock_folder`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    identity_id: IdentityId,
    tx: mpsc::Sender<SessionCommand>,
    locks: Arc<FolderLocks>,
}

impl SessionHandle {
    pub(super) fn new(identity_id: IdentityId, tx: mpsc::Sender<SessionCommand>) -> Self {
        Self {
            identity_id,
            tx,
            locks: Arc::new(FolderLocks::default()),
        }
    }

    /// Identity this session belongs to.
    #[must_use]
    pub const fn identity_id(&self) -> IdentityId {
        self.identity_id
    }

    /// Returns true once the actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn closed(&self) -> Error {
        Error::SessionClosed(format!("identity {}", self.identity_id))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Waits for exclusive use of a folder.
    pub async fn lock_folder(&self, path: &str) -> OwnedMutexGuard<()> {
        self.locks.get(path).lock_owned().await
    }

    /// Lists every remote folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or the server fails.
    pub async fn list_folders(&self) -> Result<Vec<FolderInfo>> {
        self.request(|reply| SessionCommand::ListFolders { reply })
            .await
    }

    /// Opens a folder read-only and returns its status.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or the server fails.
    pub async fn status(&self, path: &str) -> Result<FolderStatus> {
        let path = path.to_string();
        self.request(|reply| SessionCommand::Status { path, reply })
            .await
    }

    /// Fetches full messages by UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or the server fails.
    pub async fn fetch(&self, path: &str, uids: &UidSet) -> Result<Vec<FetchedMessage>> {
        let path = path.to_string();
        let uids = uids.clone();
        self.request(|reply| SessionCommand::Fetch { path, uids, reply })
            .await
    }

    /// Adds or removes flags by UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or the server fails.
    pub async fn store(&self, path: &str, uids: &UidSet, action: StoreAction) -> Result<()> {
        let path = path.to_string();
        let uids = uids.clone();
        self.request(|reply| SessionCommand::Store {
            path,
            uids,
            action,
            reply,
        })
        .await
    }

    /// Moves UIDs to another folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or the server fails.
    pub async fn move_messages(&self, path: &str, uids: &UidSet, dest: &str) -> Result<()> {
        let path = path.to_string();
        let uids = uids.clone();
        let dest = dest.to_string();
        self.request(|reply| SessionCommand::Move {
            path,
            uids,
            dest,
            reply,
        })
        .await
    }

    /// Permanently deletes UIDs.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or the server fails.
    pub async fn delete(&self, path: &str, uids: &UidSet) -> Result<()> {
        let path = path.to_string();
        let uids = uids.clone();
        self.request(|reply| SessionCommand::Delete { path, uids, reply })
            .await
    }

    /// Every UID in a folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or the server fails.
    pub async fn search_all(&self, path: &str) -> Result<Vec<Uid>> {
        let path = path.to_string();
        self.request(|reply| SessionCommand::SearchAll { path, reply })
            .await
    }

    /// Creates a folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or the server fails.
    pub async fn create_folder(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.request(|reply| SessionCommand::CreateFolder { path, reply })
            .await
    }

    /// Logs out and stops the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
