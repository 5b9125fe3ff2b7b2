//! User-initiated mutations: flags, moves and permanent deletes.
//!
//! Each action first tries the remote server and then commits the local
//! change regardless of the remote outcome. A remote failure is logged; the
//! next delta pass brings the two sides back together.

mod delete;
mod flags;
mod moves;

use std::collections::BTreeMap;

use tidemail_imap::{Uid, UidSet};

pub use delete::{DeleteEngine, DeleteReport, DeleteTarget};
pub use flags::{FlagOperation, FlagSyncEngine};
pub use moves::MoveEngine;

use crate::Result;
use crate::identity::{IdentityId, IdentityRepository};
use crate::jobs::{Job, JobQueue};
use crate::message::Message;
use crate::session::{ConnectionManager, SessionHandle};

/// Remote UIDs of `messages`, grouped by the folder they live in.
///
/// Messages without a known remote location are left out.
#[must_use]
pub fn folder_groups<'a, I>(messages: I) -> BTreeMap<String, UidSet>
where
    I: IntoIterator<Item = &'a Message>,
{
    let mut folders: BTreeMap<String, Vec<Uid>> = BTreeMap::new();
    for message in messages {
        if let (Some(path), Some(uid)) = (&message.mailbox_path, message.uid.and_then(Uid::new)) {
            folders.entry(path.clone()).or_default().push(uid);
        }
    }
    folders
        .into_iter()
        .map(|(path, uids)| (path, UidSet::from_uids(uids)))
        .collect()
}

/// Session lookup and search follow-ups shared by the action engines.
#[derive(Debug, Clone)]
struct ActionContext {
    identities: IdentityRepository,
    connections: ConnectionManager,
    queue: JobQueue,
}

impl ActionContext {
    async fn session(&self, identity_id: IdentityId) -> Result<SessionHandle> {
        let identity = self.identities.require(identity_id).await?;
        self.connections.session(&identity)
    }

    /// Queues a search follow-up; failing to queue only costs freshness.
    async fn follow_up(&self, job: Job) {
        if let Err(e) = self.queue.enqueue(&job).await {
            tracing::warn!(job = job.name(), error = %e, "failed to queue search update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityId;
    use crate::mailbox::MailboxId;
    use crate::testing::message;
    use crate::thread::ThreadId;

    fn located(path: Option<&str>, uid: Option<u32>) -> Message {
        let mut m = message(IdentityId(1), MailboxId(1), ThreadId(1), "<x@x>");
        m.mailbox_path = path.map(str::to_string);
        m.uid = uid;
        m
    }

    #[test]
    fn groups_by_folder_and_skips_unlocated() {
        let messages = [
            located(Some("INBOX"), Some(3)),
            located(Some("Sent"), Some(9)),
            located(Some("INBOX"), Some(4)),
            located(None, Some(5)),
            located(Some("INBOX"), None),
        ];
        let groups = folder_groups(&messages);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups["INBOX"].to_string(), "3:4");
        assert_eq!(groups["Sent"].to_string(), "9");
    }
}
