//! Moving a thread to another mailbox of the same identity.

use std::sync::Arc;

use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};

use super::{ActionContext, folder_groups};
use crate::db::Database;
use crate::identity::IdentityRepository;
use crate::jobs::{Job, JobQueue};
use crate::mailbox::{Mailbox, MailboxKind, MailboxRepository};
use crate::message::{Message, MessageId, MessageRepository};
use crate::projection::ThreadProjectionAggregator;
use crate::session::ConnectionManager;
use crate::storage::{ObjectStore, delete_objects};
use crate::thread::{MailboxThreadSummary, SummaryRepository, ThreadListId};
use crate::{Error, Result};

/// Moves threads between mailboxes, remotely first (best-effort) and then
/// locally in one transaction.
#[derive(Clone)]
pub struct MoveEngine {
    pool: SqlitePool,
    mailboxes: MailboxRepository,
    summaries: SummaryRepository,
    messages: MessageRepository,
    storage: Arc<dyn ObjectStore>,
    context: ActionContext,
}

impl std::fmt::Debug for MoveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveEngine").finish_non_exhaustive()
    }
}

impl MoveEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(
        db: &Database,
        connections: ConnectionManager,
        queue: JobQueue,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            pool: db.pool().clone(),
            mailboxes: MailboxRepository::new(db),
            summaries: SummaryRepository::new(db),
            messages: MessageRepository::new(db),
            storage,
            context: ActionContext {
                identities: IdentityRepository::new(db),
                connections,
                queue,
            },
        }
    }

    /// Moves the thread behind a thread-list row to the identity's mailbox of
    /// kind `destination`, returning the row now listing it there.
    ///
    /// Moving into the mailbox the row already belongs to changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the row, its messages or a destination
    /// mailbox of that kind do not exist, or a database error.
    pub async fn move_thread(
        &self,
        thread_list_id: ThreadListId,
        destination: MailboxKind,
    ) -> Result<ThreadListId> {
        let summary = self.summaries.require(thread_list_id).await?;
        let target = self
            .mailboxes
            .find_by_kind(summary.identity_id, destination)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} mailbox", destination.as_str())))?;
        let target_id = target
            .id
            .ok_or_else(|| Error::NotFound("unsaved mailbox".into()))?;

        if target_id == summary.mailbox_id {
            debug!(%thread_list_id, "thread already in destination mailbox");
            return Ok(thread_list_id);
        }

        let messages = self
            .messages
            .list_thread_in_mailbox(summary.thread_id, summary.mailbox_id)
            .await?;
        if messages.is_empty() {
            return Err(Error::NotFound(format!("messages of thread {}", summary.thread_id)));
        }

        self.move_remote(&summary, &messages, &target).await;
        let (row, dropped) = self.move_local(&summary, &target).await?;

        info!(
            %thread_list_id,
            thread_id = %summary.thread_id,
            from = %summary.mailbox_id,
            to = %target_id,
            messages = messages.len(),
            "thread moved"
        );
        for message_id in dropped {
            self.context
                .follow_up(Job::DeleteMessageDocument { message_id })
                .await;
        }
        self.context
            .follow_up(Job::RefreshThread {
                thread_id: summary.thread_id,
            })
            .await;
        Ok(row)
    }

    async fn move_remote(&self, summary: &MailboxThreadSummary, messages: &[Message], target: &Mailbox) {
        let Some(dest) = target.remote_path.as_deref() else {
            debug!(mailbox_id = ?target.id, "destination is local-only, skipping remote move");
            return;
        };

        for (path, uids) in folder_groups(messages) {
            let result = async {
                let session = self.context.session(summary.identity_id).await?;
                let _folder = session.lock_folder(&path).await;
                session.move_messages(&path, &uids, dest).await
            }
            .await;

            if let Err(e) = result {
                warn!(
                    identity_id = %summary.identity_id,
                    folder = %path,
                    dest,
                    %uids,
                    error = %e,
                    "remote move failed, moving locally only"
                );
            }
        }
    }

    /// Returns the destination row and the ids of source messages dropped
    /// because the destination already held them.
    async fn move_local(
        &self,
        summary: &MailboxThreadSummary,
        target: &Mailbox,
    ) -> Result<(ThreadListId, Vec<MessageId>)> {
        let thread_id = summary.thread_id;

        let mut tx = self.pool.begin().await?;
        // UIDs in the destination are learned when that folder is next fetched.
        let relocation = ThreadProjectionAggregator::relocate_thread_on(
            &mut tx,
            thread_id,
            summary.mailbox_id,
            target,
            None,
        )
        .await?;
        let row = relocation
            .thread_list_id
            .ok_or_else(|| Error::NotFound(format!("messages of thread {thread_id}")))?;
        tx.commit().await?;

        delete_objects(self.storage.as_ref(), &relocation.attachments).await;
        Ok((row, relocation.dropped))
    }
}
