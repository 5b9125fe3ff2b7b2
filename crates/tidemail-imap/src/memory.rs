//! An in-memory mail server implementing [`Connector`] and [`MailSession`].
//!
//! Used by the engine's tests and for running the worker without a real
//! server. Every protocol call is recorded so callers can assert on exactly
//! what reached the "remote" side, and individual operations can be made to
//! fail on demand.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::config::ImapConfig;
use crate::session::{Connector, MailSession};
use crate::types::{
    FetchedMessage, Flag, FolderInfo, FolderStatus, SpecialUse, StoreAction, Uid, UidSet,
    UidValidity,
};
use crate::{Error, Result};

const DELIMITER: &str = "/";

/// Operations that can be forced to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// Opening a new session.
    Connect,
    /// LIST.
    List,
    /// SELECT / EXAMINE.
    Select,
    /// UID FETCH.
    Fetch,
    /// UID STORE.
    Store,
    /// UID MOVE.
    Move,
    /// Delete + expunge.
    Delete,
    /// UID SEARCH.
    Search,
    /// CREATE.
    Create,
    /// NOOP.
    Noop,
}

/// A protocol call as observed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    /// LIST.
    List,
    /// SELECT (`read_only == false`) or EXAMINE.
    Select {
        /// Folder path.
        path: String,
        /// Whether EXAMINE was used.
        read_only: bool,
    },
    /// UID FETCH.
    Fetch {
        /// Selected folder.
        path: String,
        /// UID set as sent.
        uids: String,
    },
    /// UID STORE.
    Store {
        /// Selected folder.
        path: String,
        /// UID set as sent.
        uids: String,
        /// STORE data item.
        query: String,
    },
    /// UID MOVE.
    Move {
        /// Source folder.
        path: String,
        /// UID set as sent.
        uids: String,
        /// Destination folder.
        dest: String,
    },
    /// Delete + UID EXPUNGE.
    Delete {
        /// Selected folder.
        path: String,
        /// UID set as sent.
        uids: String,
    },
    /// UID SEARCH ALL.
    SearchAll {
        /// Selected folder.
        path: String,
    },
    /// CREATE.
    Create {
        /// New folder path.
        path: String,
    },
    /// NOOP.
    Noop,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    flags: HashSet<Flag>,
    internal_date: DateTime<Utc>,
    raw: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Folder {
    uid_validity: u32,
    uid_next: u32,
    special_use: Option<SpecialUse>,
    selectable: bool,
    messages: BTreeMap<u32, StoredMessage>,
}

impl Folder {
    fn new(uid_validity: u32, special_use: Option<SpecialUse>) -> Self {
        Self {
            uid_validity,
            uid_next: 1,
            special_use,
            selectable: true,
            messages: BTreeMap::new(),
        }
    }

    fn insert(&mut self, message: StoredMessage) -> u32 {
        let uid = self.uid_next;
        self.messages.insert(uid, message);
        self.uid_next += 1;
        uid
    }
}

#[derive(Debug, Default)]
struct ServerState {
    folders: BTreeMap<String, Folder>,
    next_validity: u32,
    failures: HashSet<FailPoint>,
    ops: Vec<RecordedOp>,
    connects: usize,
}

impl ServerState {
    fn check(&self, point: FailPoint) -> Result<()> {
        if self.failures.contains(&point) {
            let err = match point {
                FailPoint::Connect | FailPoint::Noop => {
                    Error::Disconnected(format!("injected {point:?} failure"))
                }
                _ => Error::Rejected(format!("injected {point:?} failure")),
            };
            return Err(err);
        }
        Ok(())
    }

    fn folder_mut(&mut self, path: &str) -> Result<&mut Folder> {
        self.folders
            .get_mut(path)
            .ok_or_else(|| Error::FolderNotFound(path.to_string()))
    }

    fn allocate_validity(&mut self) -> u32 {
        self.next_validity += 1;
        self.next_validity
    }
}

/// Shared in-memory server. Cloning yields another handle to the same state.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    /// Creates a server holding an empty `INBOX`.
    #[must_use]
    pub fn new() -> Self {
        let server = Self {
            state: Arc::new(Mutex::new(ServerState {
                next_validity: 1000,
                ..ServerState::default()
            })),
        };
        server.add_folder("INBOX", None);
        server
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an empty folder (no-op if it already exists).
    pub fn add_folder(&self, path: &str, special_use: Option<SpecialUse>) {
        let mut state = self.lock();
        if !state.folders.contains_key(path) {
            let validity = state.allocate_validity();
            state
                .folders
                .insert(path.to_string(), Folder::new(validity, special_use));
        }
    }

    /// Removes a folder and everything in it.
    pub fn remove_folder(&self, path: &str) {
        self.lock().folders.remove(path);
    }

    /// Marks a folder `\Noselect`.
    pub fn set_selectable(&self, path: &str, selectable: bool) {
        if let Some(folder) = self.lock().folders.get_mut(path) {
            folder.selectable = selectable;
        }
    }

    /// Appends a message, returning its UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder does not exist.
    pub fn append(&self, path: &str, raw: &[u8], flags: &[Flag]) -> Result<Uid> {
        self.append_at(path, raw, flags, Utc::now())
    }

    /// Appends a message with an explicit internal date.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder does not exist.
    pub fn append_at(
        &self,
        path: &str,
        raw: &[u8],
        flags: &[Flag],
        internal_date: DateTime<Utc>,
    ) -> Result<Uid> {
        let mut state = self.lock();
        let folder = state.folder_mut(path)?;
        let uid = folder.insert(StoredMessage {
            flags: flags.iter().cloned().collect(),
            internal_date,
            raw: raw.to_vec(),
        });
        Uid::new(uid).ok_or_else(|| Error::Rejected("UID space exhausted".to_string()))
    }

    /// Advances `UIDNEXT` without adding messages, as if UIDs had been
    /// assigned and then expunged.
    pub fn skip_uids(&self, path: &str, count: u32) {
        if let Some(folder) = self.lock().folders.get_mut(path) {
            folder.uid_next += count;
        }
    }

    /// Replaces the UIDVALIDITY of a folder.
    pub fn set_uid_validity(&self, path: &str, validity: u32) {
        if let Some(folder) = self.lock().folders.get_mut(path) {
            folder.uid_validity = validity;
        }
    }

    /// Current UIDVALIDITY of a folder.
    #[must_use]
    pub fn uid_validity(&self, path: &str) -> Option<u32> {
        self.lock().folders.get(path).map(|f| f.uid_validity)
    }

    /// UIDs currently present in a folder.
    #[must_use]
    pub fn uids(&self, path: &str) -> Vec<u32> {
        self.lock()
            .folders
            .get(path)
            .map(|f| f.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Flags of a message, if it exists.
    #[must_use]
    pub fn flags(&self, path: &str, uid: u32) -> Option<Vec<Flag>> {
        self.lock()
            .folders
            .get(path)
            .and_then(|f| f.messages.get(&uid))
            .map(|m| m.flags.iter().cloned().collect())
    }

    /// Folder paths present on the server.
    #[must_use]
    pub fn folder_paths(&self) -> Vec<String> {
        self.lock().folders.keys().cloned().collect()
    }

    /// Makes an operation fail until [`MemoryServer::heal`] is called.
    pub fn fail(&self, point: FailPoint) {
        self.lock().failures.insert(point);
    }

    /// Stops failing an operation.
    pub fn heal(&self, point: FailPoint) {
        self.lock().failures.remove(&point);
    }

    /// Every protocol call seen so far.
    #[must_use]
    pub fn operations(&self) -> Vec<RecordedOp> {
        self.lock().ops.clone()
    }

    /// Forgets recorded operations.
    pub fn clear_operations(&self) {
        self.lock().ops.clear();
    }

    /// Number of sessions opened.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }
}

impl Connector for MemoryServer {
    type Session = MemorySession;

    async fn connect(&self, _config: &ImapConfig) -> Result<MemorySession> {
        let mut state = self.lock();
        state.check(FailPoint::Connect)?;
        state.connects += 1;
        drop(state);

        Ok(MemorySession {
            server: self.clone(),
            selected: None,
        })
    }
}

/// A session against a [`MemoryServer`].
#[derive(Debug)]
pub struct MemorySession {
    server: MemoryServer,
    selected: Option<String>,
}

impl MemorySession {
    fn selected(&self) -> Result<String> {
        self.selected.clone().ok_or(Error::NotSelected)
    }

    fn do_store(&self, uids: &UidSet, action: &StoreAction) -> Result<()> {
        let path = self.selected()?;
        let mut state = self.server.lock();
        state.check(FailPoint::Store)?;
        state.ops.push(RecordedOp::Store {
            path: path.clone(),
            uids: uids.to_string(),
            query: action.to_query(),
        });

        let folder = state.folder_mut(&path)?;
        for (uid, message) in &mut folder.messages {
            let Some(uid) = Uid::new(*uid) else { continue };
            if !uids.contains(uid) {
                continue;
            }
            match action {
                StoreAction::Add(flags) => message.flags.extend(flags.iter().cloned()),
                StoreAction::Remove(flags) => {
                    for flag in flags {
                        message.flags.remove(flag);
                    }
                }
            }
        }
        Ok(())
    }
}

impl MailSession for MemorySession {
    async fn list_folders(&mut self) -> Result<Vec<FolderInfo>> {
        let mut state = self.server.lock();
        state.check(FailPoint::List)?;
        state.ops.push(RecordedOp::List);

        Ok(state
            .folders
            .iter()
            .map(|(path, folder)| {
                let mut attributes = vec!["\\HasNoChildren".to_string()];
                if let Some(special) = folder.special_use {
                    attributes.push(special.as_str().to_string());
                }
                if !folder.selectable {
                    attributes.push("\\Noselect".to_string());
                }
                FolderInfo {
                    path: path.clone(),
                    delimiter: Some(DELIMITER.to_string()),
                    attributes,
                    special_use: folder.special_use,
                    selectable: folder.selectable,
                }
            })
            .collect())
    }

    async fn select(&mut self, path: &str, read_only: bool) -> Result<FolderStatus> {
        let status = {
            let mut state = self.server.lock();
            state.check(FailPoint::Select)?;
            state.ops.push(RecordedOp::Select {
                path: path.to_string(),
                read_only,
            });
            let folder = state.folder_mut(path)?;
            if !folder.selectable {
                return Err(Error::Rejected(format!("{path} is not selectable")));
            }
            FolderStatus {
                uid_validity: UidValidity::new(folder.uid_validity),
                uid_next: folder.uid_next,
                exists: u32::try_from(folder.messages.len()).unwrap_or(u32::MAX),
            }
        };
        self.selected = Some(path.to_string());
        Ok(status)
    }

    async fn uid_fetch(&mut self, uids: &UidSet) -> Result<Vec<FetchedMessage>> {
        let path = self.selected()?;
        let mut state = self.server.lock();
        state.check(FailPoint::Fetch)?;
        state.ops.push(RecordedOp::Fetch {
            path: path.clone(),
            uids: uids.to_string(),
        });

        let folder = state.folder_mut(&path)?;
        Ok(folder
            .messages
            .iter()
            .filter_map(|(uid, message)| {
                let uid = Uid::new(*uid)?;
                uids.contains(uid).then(|| FetchedMessage {
                    uid,
                    flags: message.flags.iter().cloned().collect(),
                    internal_date: Some(message.internal_date),
                    size: u32::try_from(message.raw.len()).unwrap_or(u32::MAX),
                    raw: message.raw.clone(),
                })
            })
            .collect())
    }

    async fn uid_store(&mut self, uids: &UidSet, action: &StoreAction) -> Result<()> {
        self.do_store(uids, action)
    }

    async fn uid_move(&mut self, uids: &UidSet, dest: &str) -> Result<()> {
        let path = self.selected()?;
        let mut state = self.server.lock();
        state.check(FailPoint::Move)?;
        state.ops.push(RecordedOp::Move {
            path: path.clone(),
            uids: uids.to_string(),
            dest: dest.to_string(),
        });

        if !state.folders.contains_key(dest) {
            return Err(Error::Rejected(format!("[TRYCREATE] {dest} does not exist")));
        }

        let source = state.folder_mut(&path)?;
        let moving: Vec<u32> = source
            .messages
            .keys()
            .copied()
            .filter(|uid| Uid::new(*uid).is_some_and(|u| uids.contains(u)))
            .collect();
        let messages: Vec<StoredMessage> = moving
            .iter()
            .filter_map(|uid| source.messages.remove(uid))
            .collect();

        let target = state.folder_mut(dest)?;
        for message in messages {
            target.insert(message);
        }
        Ok(())
    }

    async fn uid_delete(&mut self, uids: &UidSet) -> Result<()> {
        let path = self.selected()?;
        let mut state = self.server.lock();
        state.check(FailPoint::Delete)?;
        state.ops.push(RecordedOp::Delete {
            path: path.clone(),
            uids: uids.to_string(),
        });

        let folder = state.folder_mut(&path)?;
        folder
            .messages
            .retain(|uid, _| Uid::new(*uid).is_none_or(|u| !uids.contains(u)));
        Ok(())
    }

    async fn uid_search_all(&mut self) -> Result<Vec<Uid>> {
        let path = self.selected()?;
        let mut state = self.server.lock();
        state.check(FailPoint::Search)?;
        state.ops.push(RecordedOp::SearchAll { path: path.clone() });

        let folder = state.folder_mut(&path)?;
        Ok(folder.messages.keys().filter_map(|uid| Uid::new(*uid)).collect())
    }

    async fn create_folder(&mut self, path: &str) -> Result<()> {
        let mut state = self.server.lock();
        state.check(FailPoint::Create)?;
        state.ops.push(RecordedOp::Create {
            path: path.to_string(),
        });

        if state.folders.contains_key(path) {
            return Err(Error::Rejected(format!("[ALREADYEXISTS] {path}")));
        }
        let validity = state.allocate_validity();
        let special_use = path
            .eq_ignore_ascii_case("trash")
            .then_some(SpecialUse::Trash);
        state
            .folders
            .insert(path.to_string(), Folder::new(validity, special_use));
        Ok(())
    }

    async fn noop(&mut self) -> Result<()> {
        let mut state = self.server.lock();
        state.check(FailPoint::Noop)?;
        state.ops.push(RecordedOp::Noop);
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"Message-ID: <a@example.com>\r\nSubject: hi\r\n\r\nbody\r\n";

    async fn session(server: &MemoryServer) -> MemorySession {
        server.connect(&ImapConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn append_assigns_increasing_uids() {
        let server = MemoryServer::new();
        let first = server.append("INBOX", RAW, &[]).unwrap();
        let second = server.append("INBOX", RAW, &[Flag::Seen]).unwrap();
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 2);

        let mut session = session(&server).await;
        let status = session.select("INBOX", true).await.unwrap();
        assert_eq!(status.uid_next, 3);
        assert_eq!(status.head_uid(), 2);
        assert_eq!(status.exists, 2);
    }

    #[tokio::test]
    async fn fetch_requires_selection() {
        let server = MemoryServer::new();
        let mut session = session(&server).await;
        let err = session
            .uid_fetch(&UidSet::range(1, 5).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotSelected));
    }

    #[tokio::test]
    async fn fetch_returns_only_requested_uids() {
        let server = MemoryServer::new();
        for _ in 0..5 {
            server.append("INBOX", RAW, &[]).unwrap();
        }
        let mut session = session(&server).await;
        session.select("INBOX", true).await.unwrap();
        let fetched = session.uid_fetch(&UidSet::range(2, 3).unwrap()).await.unwrap();
        let uids: Vec<u32> = fetched.iter().map(|m| m.uid.get()).collect();
        assert_eq!(uids, vec![2, 3]);
        assert_eq!(fetched[0].raw, RAW);
    }

    #[tokio::test]
    async fn move_reassigns_uids_in_destination() {
        let server = MemoryServer::new();
        server.add_folder("Trash", Some(SpecialUse::Trash));
        server.append("Trash", RAW, &[]).unwrap();
        let uid = server.append("INBOX", RAW, &[Flag::Flagged]).unwrap();

        let mut session = session(&server).await;
        session.select("INBOX", false).await.unwrap();
        session.uid_move(&UidSet::single(uid), "Trash").await.unwrap();

        assert!(server.uids("INBOX").is_empty());
        assert_eq!(server.uids("Trash"), vec![1, 2]);
        assert_eq!(server.flags("Trash", 2).unwrap(), vec![Flag::Flagged]);
    }

    #[tokio::test]
    async fn store_and_delete() {
        let server = MemoryServer::new();
        let a = server.append("INBOX", RAW, &[]).unwrap();
        let b = server.append("INBOX", RAW, &[]).unwrap();

        let mut session = session(&server).await;
        session.select("INBOX", false).await.unwrap();
        session
            .uid_store(&UidSet::single(a), &StoreAction::Add(vec![Flag::Seen]))
            .await
            .unwrap();
        assert_eq!(server.flags("INBOX", a.get()).unwrap(), vec![Flag::Seen]);

        session.uid_delete(&UidSet::single(b)).await.unwrap();
        assert_eq!(server.uids("INBOX"), vec![a.get()]);
    }

    #[tokio::test]
    async fn injected_failures_surface_and_heal() {
        let server = MemoryServer::new();
        server.fail(FailPoint::Connect);
        assert!(server.connect(&ImapConfig::default()).await.is_err());
        server.heal(FailPoint::Connect);

        let mut session = session(&server).await;
        server.fail(FailPoint::Create);
        let err = session.create_folder("Trash").await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(!server.folder_paths().contains(&"Trash".to_string()));
    }

    #[tokio::test]
    async fn operations_are_recorded() {
        let server = MemoryServer::new();
        let mut session = session(&server).await;
        session.list_folders().await.unwrap();
        session.select("INBOX", true).await.unwrap();
        session.uid_search_all().await.unwrap();

        assert_eq!(
            server.operations(),
            vec![
                RecordedOp::List,
                RecordedOp::Select {
                    path: "INBOX".into(),
                    read_only: true
                },
                RecordedOp::SearchAll {
                    path: "INBOX".into()
                },
            ]
        );
    }
}
