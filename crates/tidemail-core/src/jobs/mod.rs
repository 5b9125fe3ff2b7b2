//! Background jobs.
//!
//! Every unit of background work is a [`Job`] variant with a typed payload.
//! Jobs are persisted in `SQLite` by the [`JobQueue`], claimed one at a time by
//! the [`Worker`], and produced by the [`Scheduler`], the engines themselves
//! (backfill re-enqueues, search updates) and user actions.

mod queue;
mod scheduler;
mod worker;

use serde::{Deserialize, Serialize};

pub use queue::{ClaimedJob, FailOutcome, JobId, JobQueue, JobStatus};
pub use scheduler::Scheduler;
pub use worker::{Engines, Worker};

use crate::actions::{DeleteTarget, FlagOperation};
use crate::identity::IdentityId;
use crate::mailbox::{MailboxId, MailboxKind};
use crate::message::MessageId;
use crate::thread::{ThreadId, ThreadListId};

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload")]
pub enum Job {
    /// Fetch new mail above the delta high-water mark.
    #[serde(rename = "delta-fetch")]
    DeltaFetch {
        /// Identity.
        identity_id: IdentityId,
        /// Mailbox.
        mailbox_id: MailboxId,
    },
    /// Walk history backward.
    #[serde(rename = "backfill")]
    Backfill {
        /// Identity.
        identity_id: IdentityId,
        /// Mailbox.
        mailbox_id: MailboxId,
    },
    /// Mirror the remote folder list.
    #[serde(rename = "mailboxes:reconcile")]
    ReconcileMailboxes {
        /// Identity.
        identity_id: IdentityId,
    },
    /// Move a thread to the identity's mailbox of another kind.
    #[serde(rename = "mail:move")]
    Move {
        /// Thread-list row.
        thread_list_id: ThreadListId,
        /// Destination role.
        destination: MailboxKind,
    },
    /// Apply a flag transition to a thread.
    #[serde(rename = "mail:set-flags")]
    SetFlags {
        /// Thread-list row.
        thread_list_id: ThreadListId,
        /// Transition.
        operation: FlagOperation,
    },
    /// Permanently delete messages.
    #[serde(rename = "mail:delete-permanent")]
    DeletePermanent {
        /// What to delete.
        target: DeleteTarget,
    },
    /// Upsert one message's search document.
    #[serde(rename = "search:index-message")]
    IndexMessage {
        /// Message row.
        message_id: MessageId,
    },
    /// Remove one message's search document.
    #[serde(rename = "search:delete-message")]
    DeleteMessageDocument {
        /// Message row.
        message_id: MessageId,
    },
    /// Re-derive every document of a thread.
    #[serde(rename = "search:refresh-thread")]
    RefreshThread {
        /// Thread.
        thread_id: ThreadId,
    },
    /// Recreate the search collection.
    #[serde(rename = "search:rebuild")]
    RebuildSearch,
}

impl Job {
    /// Wire name of the job.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DeltaFetch { .. } => "delta-fetch",
            Self::Backfill { .. } => "backfill",
            Self::ReconcileMailboxes { .. } => "mailboxes:reconcile",
            Self::Move { .. } => "mail:move",
            Self::SetFlags { .. } => "mail:set-flags",
            Self::DeletePermanent { .. } => "mail:delete-permanent",
            Self::IndexMessage { .. } => "search:index-message",
            Self::DeleteMessageDocument { .. } => "search:delete-message",
            Self::RefreshThread { .. } => "search:refresh-thread",
            Self::RebuildSearch => "search:rebuild",
        }
    }

    /// Key under which at most one pending copy of the job may exist.
    ///
    /// User actions are never collapsed.
    #[must_use]
    pub fn dedupe_key(&self) -> Option<String> {
        let name = self.name();
        match self {
            Self::DeltaFetch { mailbox_id, .. } | Self::Backfill { mailbox_id, .. } => {
                Some(format!("{name}:{mailbox_id}"))
            }
            Self::ReconcileMailboxes { identity_id } => Some(format!("{name}:{identity_id}")),
            Self::IndexMessage { message_id } | Self::DeleteMessageDocument { message_id } => {
                Some(format!("{name}:{message_id}"))
            }
            Self::RefreshThread { thread_id } => Some(format!("{name}:{thread_id}")),
            Self::RebuildSearch => Some(name.to_string()),
            Self::Move { .. } | Self::SetFlags { .. } | Self::DeletePermanent { .. } => None,
        }
    }
}
