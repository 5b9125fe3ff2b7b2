use tokio::sync::oneshot;

use tidemail_imap::{FetchedMessage, FolderInfo, FolderStatus, StoreAction, Uid, UidSet};

use crate::Result;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests handled by a session actor.
pub(super) enum SessionCommand {
    ListFolders {
        reply: Reply<Vec<FolderInfo>>,
    },
    Status {
        path: String,
        reply: Reply<FolderStatus>,
    },
    Fetch {
        path: String,
        uids: UidSet,
        reply: Reply<Vec<FetchedMessage>>,
    },
    Store {
        path: String,
        uids: UidSet,
        action: StoreAction,
        reply: Reply<()>,
    },
    Move {
        path: String,
        uids: UidSet,
        dest: String,
        reply: Reply<()>,
    },
    Delete {
        path: String,
        uids: UidSet,
        reply: Reply<()>,
    },
    SearchAll {
        path: String,
        reply: Reply<Vec<Uid>>,
    },
    CreateFolder {
        path: String,
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
