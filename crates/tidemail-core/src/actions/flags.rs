//! Read/unread, flag/unflag and answered transitions.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use tracing::{info, warn};

use tidemail_imap::{StoreAction, Uid, UidSet};

use super::{ActionContext, folder_groups};
use crate::db::Database;
use crate::identity::IdentityRepository;
use crate::jobs::{Job, JobQueue};
use crate::message::{Message, MessageFlag, MessageRepository};
use crate::projection::ThreadProjectionAggregator;
use crate::session::ConnectionManager;
use crate::thread::{MailboxThreadSummary, SummaryRepository, ThreadListId};
use crate::{Error, Result};

/// A flag transition requested for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagOperation {
    /// Mark as seen.
    Read,
    /// Clear seen.
    Unread,
    /// Star the newest message.
    Flag,
    /// Unstar the newest message.
    Unflag,
    /// Mark as answered.
    Answered,
    /// Clear answered.
    Unanswered,
}

impl FlagOperation {
    /// The flag this operation touches.
    #[must_use]
    pub const fn flag(self) -> MessageFlag {
        match self {
            Self::Read | Self::Unread => MessageFlag::Seen,
            Self::Flag | Self::Unflag => MessageFlag::Flagged,
            Self::Answered | Self::Unanswered => MessageFlag::Answered,
        }
    }

    /// Value the flag takes.
    #[must_use]
    pub const fn value(self) -> bool {
        matches!(self, Self::Read | Self::Flag | Self::Answered)
    }

    /// Whether the operation covers every message of the thread rather than
    /// only the newest one.
    #[must_use]
    pub const fn is_thread_wide(self) -> bool {
        !matches!(self, Self::Flag | Self::Unflag)
    }

    fn store_action(self) -> StoreAction {
        let flags = vec![self.flag().remote()];
        if self.value() {
            StoreAction::Add(flags)
        } else {
            StoreAction::Remove(flags)
        }
    }
}

/// Applies flag transitions remotely (best-effort) and locally.
#[derive(Debug, Clone)]
pub struct FlagSyncEngine {
    pool: SqlitePool,
    summaries: SummaryRepository,
    messages: MessageRepository,
    context: ActionContext,
}

impl FlagSyncEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(db: &Database, connections: ConnectionManager, queue: JobQueue) -> Self {
        Self {
            pool: db.pool().clone(),
            summaries: SummaryRepository::new(db),
            messages: MessageRepository::new(db),
            context: ActionContext {
                identities: IdentityRepository::new(db),
                connections,
                queue,
            },
        }
    }

    /// Applies `operation` to the thread behind a thread-list row.
    ///
    /// Remote failures are logged and never prevent the local write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the row or its messages are gone, or a
    /// database error.
    pub async fn apply(&self, thread_list_id: ThreadListId, operation: FlagOperation) -> Result<()> {
        let summary = self.summaries.require(thread_list_id).await?;

        if operation.is_thread_wide() {
            self.apply_thread_wide(&summary, operation).await?;
        } else {
            self.apply_newest(&summary, operation).await?;
        }

        info!(
            %thread_list_id,
            thread_id = %summary.thread_id,
            ?operation,
            "flag operation applied"
        );
        self.context
            .follow_up(Job::RefreshThread {
                thread_id: summary.thread_id,
            })
            .await;
        Ok(())
    }

    async fn apply_newest(&self, summary: &MailboxThreadSummary, operation: FlagOperation) -> Result<()> {
        let newest = self
            .messages
            .list_thread_in_mailbox(summary.thread_id, summary.mailbox_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("messages of thread {}", summary.thread_id)))?;
        let id = newest
            .id
            .ok_or_else(|| Error::NotFound("unsaved message".into()))?;

        if let (Some(path), Some(uid)) = (&newest.mailbox_path, newest.uid.and_then(Uid::new)) {
            self.store_remote(summary, path, &UidSet::single(uid), operation)
                .await;
        }

        let mut tx = self.pool.begin().await?;
        MessageRepository::set_flag_on(&mut tx, id, operation.flag(), operation.value()).await?;
        let starred = MessageRepository::thread_has_flagged_on(&mut tx, summary.thread_id).await?;
        SummaryRepository::set_thread_starred_on(&mut tx, summary.thread_id, starred).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_thread_wide(
        &self,
        summary: &MailboxThreadSummary,
        operation: FlagOperation,
    ) -> Result<()> {
        let messages = self.messages.list_thread(summary.thread_id).await?;
        if messages.is_empty() {
            return Err(Error::NotFound(format!("messages of thread {}", summary.thread_id)));
        }

        for (path, uids) in folder_groups(&messages) {
            self.store_remote(summary, &path, &uids, operation).await;
        }

        let mailboxes: BTreeSet<_> = messages.iter().map(|m| m.mailbox_id).collect();
        let mut tx = self.pool.begin().await?;
        for id in messages.iter().filter_map(|m: &Message| m.id) {
            MessageRepository::set_flag_on(&mut tx, id, operation.flag(), operation.value()).await?;
        }
        for mailbox_id in mailboxes {
            ThreadProjectionAggregator::recompute_on(&mut tx, summary.thread_id, mailbox_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn store_remote(
        &self,
        summary: &MailboxThreadSummary,
        path: &str,
        uids: &UidSet,
        operation: FlagOperation,
    ) {
        let result = async {
            let session = self.context.session(summary.identity_id).await?;
            let _folder = session.lock_folder(path).await;
            session.store(path, uids, operation.store_action()).await
        }
        .await;

        if let Err(e) = result {
            warn!(
                identity_id = %summary.identity_id,
                folder = path,
                %uids,
                ?operation,
                error = %e,
                "remote flag update failed, keeping local change"
            );
        }
    }
}
