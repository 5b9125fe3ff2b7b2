//! Mailbox-scoped thread rollups.
//!
//! Summaries are always re-aggregated from the message rows of one thread in
//! one mailbox. The ingest path merges the fresh aggregate monotonically into
//! the stored row; paths that remove messages replace the row outright (or
//! delete it) so counts never drift.

use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::db::Database;
use crate::mailbox::{Mailbox, MailboxId, MailboxRepository};
use crate::message::{Message, MessageId, MessageRepository};
use crate::thread::{
    MailboxThreadSummary, Participants, SummaryRepository, ThreadId, ThreadListId, ThreadRepository,
};
use crate::{Error, Result};

/// Aggregates a newest-first message list into a summary row.
///
/// Returns `None` for an empty list. `starred` only reflects the given
/// messages; callers widen it to the whole thread.
#[must_use]
pub fn aggregate(
    messages: &[Message],
    mailbox_id: MailboxId,
    mailbox_slug: &str,
) -> Option<MailboxThreadSummary> {
    let newest = messages.first()?;
    let activity = messages.iter().map(Message::activity_at);
    let first_message_at = activity.clone().min()?;
    let last_activity_at = activity.max()?;
    let unread = messages.iter().filter(|m| !m.seen).count();

    Some(MailboxThreadSummary {
        id: None,
        owner_id: newest.owner_id.clone(),
        identity_id: newest.identity_id,
        thread_id: newest.thread_id,
        mailbox_id,
        mailbox_slug: mailbox_slug.to_string(),
        subject: newest.subject.clone(),
        preview: newest.snippet.clone(),
        first_message_at,
        last_activity_at,
        message_count: i64::try_from(messages.len()).unwrap_or(i64::MAX),
        unread_count: i64::try_from(unread).unwrap_or(i64::MAX),
        has_attachments: messages.iter().any(|m| m.has_attachments),
        starred: messages.iter().any(|m| m.flagged),
        participants: Participants::collect(messages),
    })
}

/// Recomputes thread-list rows from the message table.
#[derive(Debug, Clone)]
pub struct ThreadProjectionAggregator {
    pool: SqlitePool,
    messages: MessageRepository,
}

impl ThreadProjectionAggregator {
    /// Creates an aggregator over the shared database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
            messages: MessageRepository::new(db),
        }
    }

    /// Refreshes the summary of the thread and mailbox a message belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the message does not exist, or a
    /// database error.
    pub async fn upsert_mailbox_thread_item(&self, message_id: MessageId) -> Result<ThreadListId> {
        let message = self.messages.require(message_id).await?;
        let mut tx = self.pool.begin().await?;
        let id = Self::upsert_on(&mut tx, &message).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Monotonic refresh for `message`'s thread in its mailbox.
    ///
    /// If the message set reads back empty, a summary of `message` alone is
    /// written instead of failing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn upsert_on(conn: &mut SqliteConnection, message: &Message) -> Result<ThreadListId> {
        let slug = MailboxRepository::slug_on(conn, message.mailbox_id).await?;
        let mut rows =
            MessageRepository::list_thread_in_mailbox_on(conn, message.thread_id, message.mailbox_id)
                .await?;
        if rows.is_empty() {
            warn!(
                thread_id = %message.thread_id,
                mailbox_id = %message.mailbox_id,
                "thread has no messages in mailbox, summarizing the trigger alone"
            );
            rows.push(message.clone());
        }

        let mut summary = aggregate(&rows, message.mailbox_id, &slug)
            .ok_or_else(|| Error::NotFound(format!("messages of thread {}", message.thread_id)))?;
        summary.starred |= MessageRepository::thread_has_flagged_on(conn, message.thread_id).await?;

        if let Some(existing) =
            SummaryRepository::find_on(conn, message.thread_id, message.mailbox_id).await?
        {
            summary.participants = existing.participants.merge(&summary.participants);
        }

        let id = SummaryRepository::upsert_monotonic_on(conn, &summary).await?;
        debug!(
            thread_id = %message.thread_id,
            mailbox_id = %message.mailbox_id,
            messages = summary.message_count,
            "thread summary upserted"
        );
        Ok(id)
    }

    /// Replaces the summary of a thread in a mailbox with a fresh aggregate,
    /// or deletes it when the mailbox holds none of the thread's messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn recompute_mailbox_thread(
        &self,
        thread_id: ThreadId,
        mailbox_id: MailboxId,
    ) -> Result<Option<ThreadListId>> {
        let mut tx = self.pool.begin().await?;
        let id = Self::recompute_on(&mut tx, thread_id, mailbox_id).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// [`Self::recompute_mailbox_thread`] on an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn recompute_on(
        conn: &mut SqliteConnection,
        thread_id: ThreadId,
        mailbox_id: MailboxId,
    ) -> Result<Option<ThreadListId>> {
        let rows = MessageRepository::list_thread_in_mailbox_on(conn, thread_id, mailbox_id).await?;
        let slug = MailboxRepository::slug_on(conn, mailbox_id).await?;

        let Some(mut summary) = aggregate(&rows, mailbox_id, &slug) else {
            SummaryRepository::delete_on(conn, thread_id, mailbox_id).await?;
            debug!(%thread_id, %mailbox_id, "thread left mailbox, summary removed");
            return Ok(None);
        };

        summary.starred |= MessageRepository::thread_has_flagged_on(conn, thread_id).await?;
        SummaryRepository::replace_on(conn, &summary).await.map(Some)
    }

    /// Moves a thread's messages from one mailbox into another and carries
    /// its thread-list row along.
    ///
    /// `observed` names a message whose UID in the destination is already
    /// known; the others keep only the destination path until they are
    /// fetched there. Messages the destination already holds are deleted
    /// from the source instead of moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn relocate_thread_on(
        conn: &mut SqliteConnection,
        thread_id: ThreadId,
        from: MailboxId,
        to: &Mailbox,
        observed: Option<(MessageId, u32)>,
    ) -> Result<Relocation> {
        let to_id = to
            .id
            .ok_or_else(|| Error::NotFound("unsaved mailbox".into()))?;
        let path = to.remote_path.as_deref();

        let mut dropped = Vec::new();
        for message in MessageRepository::list_thread_in_mailbox_on(conn, thread_id, from).await? {
            let Some(id) = message.id else { continue };
            let uid = observed.and_then(|(seen, uid)| (seen == id).then_some(uid));
            if uid.is_none()
                && MessageRepository::find_in_mailbox_on(conn, to_id, &message.message_id)
                    .await?
                    .is_some()
            {
                dropped.push(id);
            } else {
                MessageRepository::relocate_on(conn, id, to_id, uid, path).await?;
            }
        }

        let attachments = MessageRepository::attachment_locations_on(conn, &dropped).await?;
        for id in &dropped {
            MessageRepository::delete_on(conn, *id).await?;
        }

        let source = SummaryRepository::find_on(conn, thread_id, from).await?;
        let target = SummaryRepository::find_on(conn, thread_id, to_id).await?;
        match (source.and_then(|s| s.id), target) {
            (Some(id), None) => SummaryRepository::repoint_on(conn, id, to_id, &to.slug).await?,
            _ => SummaryRepository::delete_on(conn, thread_id, from).await?,
        }
        let thread_list_id = Self::recompute_on(conn, thread_id, to_id).await?;
        ThreadRepository::repoint_mailbox_on(conn, thread_id, from, to_id).await?;

        debug!(%thread_id, %from, to = %to_id, dropped = dropped.len(), "thread relocated");
        Ok(Relocation {
            thread_list_id,
            dropped,
            attachments,
        })
    }
}

/// Result of [`ThreadProjectionAggregator::relocate_thread_on`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relocation {
    /// Thread-list row in the destination, if any message arrived there.
    pub thread_list_id: Option<ThreadListId>,
    /// Source rows deleted because the destination already held them.
    pub dropped: Vec<MessageId>,
    /// Storage locations of the dropped rows' attachments.
    pub attachments: Vec<(String, String)>,
}
