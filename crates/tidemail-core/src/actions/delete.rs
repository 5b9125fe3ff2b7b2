//! Permanent deletion of threads, single messages, or whole mailboxes.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use tidemail_imap::UidSet;

use super::{ActionContext, folder_groups};
use crate::db::Database;
use crate::identity::{IdentityId, IdentityRepository};
use crate::jobs::{Job, JobQueue};
use crate::mailbox::{Mailbox, MailboxId, MailboxRepository};
use crate::message::{Message, MessageId, MessageRepository};
use crate::projection::ThreadProjectionAggregator;
use crate::session::ConnectionManager;
use crate::storage::{ObjectStore, delete_objects};
use crate::thread::{SummaryRepository, ThreadId, ThreadListId, ThreadRepository};
use crate::{Error, Result};

/// What a permanent delete removes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DeleteTarget {
    /// The messages of a thread in the row's mailbox.
    Thread {
        /// Thread-list row.
        thread_list_id: ThreadListId,
    },
    /// Every message in a mailbox ("empty trash").
    Mailbox {
        /// Mailbox to empty.
        mailbox_id: MailboxId,
    },
    /// Individual messages.
    Messages {
        /// Message rows.
        message_ids: Vec<MessageId>,
    },
}

/// What a delete removed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Deleted message rows.
    pub messages: Vec<MessageId>,
    /// Threads removed because no message referenced them any more.
    pub threads: Vec<ThreadId>,
}

/// Removes messages remotely (best-effort) and locally.
#[derive(Clone)]
pub struct DeleteEngine {
    pool: SqlitePool,
    mailboxes: MailboxRepository,
    summaries: SummaryRepository,
    messages: MessageRepository,
    storage: Arc<dyn ObjectStore>,
    context: ActionContext,
}

impl std::fmt::Debug for DeleteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeleteEngine").finish_non_exhaustive()
    }
}

impl DeleteEngine {
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

    /// Permanently deletes `target`.
    ///
    /// The remote leg is skipped for messages without a remote location and
    /// its failures are logged; the local delete always runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the thread-list row or mailbox does not
    /// exist, or a database error.
    pub async fn delete(&self, target: &DeleteTarget) -> Result<DeleteReport> {
        let report = match target {
            DeleteTarget::Thread { thread_list_id } => {
                let summary = self.summaries.require(*thread_list_id).await?;
                let messages = self
                    .messages
                    .list_thread_in_mailbox(summary.thread_id, summary.mailbox_id)
                    .await?;
                self.delete_messages(summary.identity_id, &messages).await?
            }
            DeleteTarget::Messages { message_ids } => {
                let mut messages = Vec::with_capacity(message_ids.len());
                for id in message_ids {
                    match self.messages.get(*id).await? {
                        Some(message) => messages.push(message),
                        None => debug!(message_id = %id, "message already deleted"),
                    }
                }
                let Some(identity_id) = messages.first().map(|m| m.identity_id) else {
                    return Ok(DeleteReport::default());
                };
                self.delete_messages(identity_id, &messages).await?
            }
            DeleteTarget::Mailbox { mailbox_id } => {
                let mailbox = self.mailboxes.require(*mailbox_id).await?;
                self.empty_mailbox(&mailbox).await?
            }
        };

        info!(
            ?target,
            messages = report.messages.len(),
            threads = report.threads.len(),
            "permanent delete finished"
        );
        Ok(report)
    }

    async fn delete_messages(&self, identity_id: IdentityId, messages: &[Message]) -> Result<DeleteReport> {
        for (path, uids) in folder_groups(messages) {
            self.delete_remote(identity_id, &path, Some(uids)).await;
        }

        let ids: Vec<MessageId> = messages.iter().filter_map(|m| m.id).collect();
        let placements: BTreeSet<(ThreadId, MailboxId)> =
            messages.iter().map(|m| (m.thread_id, m.mailbox_id)).collect();
        let threads: BTreeSet<ThreadId> = placements.iter().map(|(t, _)| *t).collect();

        let mut tx = self.pool.begin().await?;
        let locations = MessageRepository::attachment_locations_on(&mut tx, &ids).await?;
        for id in &ids {
            MessageRepository::delete_on(&mut tx, *id).await?;
        }
        for (thread_id, mailbox_id) in placements {
            ThreadProjectionAggregator::recompute_on(&mut tx, thread_id, mailbox_id).await?;
        }
        let removed = settle_threads(&mut tx, threads.iter().copied()).await?;
        tx.commit().await?;

        self.finish(ids, threads, removed, &locations).await
    }

    async fn empty_mailbox(&self, mailbox: &Mailbox) -> Result<DeleteReport> {
        let mailbox_id = mailbox
            .id
            .ok_or_else(|| Error::NotFound("unsaved mailbox".into()))?;

        match (&mailbox.remote_path, mailbox.selectable) {
            (Some(path), true) => self.delete_remote(mailbox.identity_id, path, None).await,
            _ => debug!(%mailbox_id, "mailbox has no remote folder, deleting locally only"),
        }

        let mut tx = self.pool.begin().await?;
        let ids = MessageRepository::ids_in_mailbox_on(&mut tx, mailbox_id).await?;
        let locations = MessageRepository::attachment_locations_on(&mut tx, &ids).await?;
        let threads = MessageRepository::delete_mailbox_on(&mut tx, mailbox_id).await?;
        SummaryRepository::delete_mailbox_on(&mut tx, mailbox_id).await?;
        let removed = settle_threads(&mut tx, threads.iter().copied()).await?;
        tx.commit().await?;

        self.finish(ids, threads.into_iter().collect(), removed, &locations)
            .await
    }

    /// Deletes `uids` in `path`, or every message there when `uids` is `None`.
    async fn delete_remote(&self, identity_id: IdentityId, path: &str, uids: Option<UidSet>) {
        let result = async {
            let session = self.context.session(identity_id).await?;
            let _folder = session.lock_folder(path).await;
            let uids = match uids {
                Some(uids) => uids,
                None => UidSet::from_uids(session.search_all(path).await?),
            };
            if uids.is_empty() {
                return Ok(());
            }
            session.delete(path, &uids).await
        }
        .await;

        if let Err(e) = result {
            warn!(
                %identity_id,
                folder = path,
                error = %e,
                "remote delete failed, deleting locally only"
            );
        }
    }

    async fn finish(
        &self,
        ids: Vec<MessageId>,
        threads: BTreeSet<ThreadId>,
        removed: Vec<ThreadId>,
        locations: &[(String, String)],
    ) -> Result<DeleteReport> {
        delete_objects(self.storage.as_ref(), locations).await;

        for &message_id in &ids {
            self.context
                .follow_up(Job::DeleteMessageDocument { message_id })
                .await;
        }
        for thread_id in threads.into_iter().filter(|t| !removed.contains(t)) {
            self.context.follow_up(Job::RefreshThread { thread_id }).await;
        }

        Ok(DeleteReport {
            messages: ids,
            threads: removed,
        })
    }
}

/// Drops threads no message references any more and refreshes the rest.
async fn settle_threads<I>(conn: &mut SqliteConnection, threads: I) -> Result<Vec<ThreadId>>
where
    I: IntoIterator<Item = ThreadId>,
{
    let mut removed = Vec::new();
    for thread_id in threads {
        if ThreadRepository::delete_if_orphan_on(conn, thread_id).await? {
            removed.push(thread_id);
        } else {
            ThreadRepository::refresh_last_message_date_on(conn, thread_id).await?;
        }
    }
    Ok(removed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use tidemail_imap::{FailPoint, MemoryServer, RecordedOp};

    use super::*;
    use crate::jobs::JobStatus;
    use crate::message::Attachment;
    use crate::storage::{ATTACHMENT_BUCKET, MemoryObjectStore};
    use crate::testing::Fixture;

    fn at(minutes: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn engine(fx: &Fixture, server: &MemoryServer, storage: &Arc<MemoryObjectStore>) -> DeleteEngine {
        DeleteEngine::new(
            &fx.db,
            fx.connections(server),
            fx.queue(),
            Arc::clone(storage) as Arc<dyn ObjectStore>,
        )
    }

    #[tokio::test]
    async fn deleting_last_message_removes_thread_and_row() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        let storage = Arc::new(MemoryObjectStore::new());
        let inbox = fx.mailbox("INBOX").await;
        let thread = fx.thread(inbox).await;
        let id = fx.store_remote(inbox, thread, "<a@x>", at(0), "INBOX", 12).await;
        let row = fx.summarize(id).await;

        let report = engine(&fx, &server, &storage)
            .delete(&DeleteTarget::Thread { thread_list_id: row })
            .await
            .unwrap();

        assert_eq!(report.messages, vec![id]);
        assert_eq!(report.threads, vec![thread]);
        assert!(fx.threads.get(thread).await.unwrap().is_none());
        assert!(fx.summaries.get(row).await.unwrap().is_none());
        assert!(server.operations().contains(&RecordedOp::Delete {
            path: "INBOX".into(),
            uids: "12".into(),
        }));
        let queued = fx.queue().list(JobStatus::Pending).await.unwrap();
        assert!(queued.contains(&Job::DeleteMessageDocument { message_id: id }));
        assert!(!queued.contains(&Job::RefreshThread { thread_id: thread }));
    }

    #[tokio::test]
    async fn deleting_one_of_several_keeps_thread() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        let storage = Arc::new(MemoryObjectStore::new());
        let inbox = fx.mailbox("INBOX").await;
        let thread = fx.thread(inbox).await;
        let old = fx.store(inbox, thread, "<a@x>", at(0), false).await;
        let new = fx.store(inbox, thread, "<b@x>", at(5), false).await;
        let row = fx.summarize(new).await;

        let report = engine(&fx, &server, &storage)
            .delete(&DeleteTarget::Messages {
                message_ids: vec![new, MessageId::new(999)],
            })
            .await
            .unwrap();

        assert_eq!(report.messages, vec![new]);
        assert!(report.threads.is_empty());
        let thread_row = fx.threads.get(thread).await.unwrap().unwrap();
        assert_eq!(thread_row.last_message_date, Some(at(0)));
        let summary = fx.summaries.require(row).await.unwrap();
        assert_eq!(summary.message_count, 1);
        assert_eq!(summary.last_activity_at, at(0));
        assert!(fx.messages.get(old).await.unwrap().is_some());
        assert_eq!(server.connect_count(), 0);
    }

    #[tokio::test]
    async fn thread_delete_keeps_copies_in_other_mailboxes() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        let storage = Arc::new(MemoryObjectStore::new());
        let inbox = fx.mailbox("INBOX").await;
        let sent = fx.mailbox("Sent").await;
        let thread = fx.thread(inbox).await;
        let a = fx.store(inbox, thread, "<a@x>", at(0), false).await;
        let b = fx.store(sent, thread, "<b@x>", at(1), true).await;
        let row = fx.summarize(a).await;
        let sent_row = fx.summarize(b).await;

        let report = engine(&fx, &server, &storage)
            .delete(&DeleteTarget::Thread { thread_list_id: row })
            .await
            .unwrap();

        assert!(report.threads.is_empty());
        assert!(fx.summaries.get(row).await.unwrap().is_none());
        assert_eq!(fx.summaries.require(sent_row).await.unwrap().message_count, 1);
        let queued = fx.queue().list(JobStatus::Pending).await.unwrap();
        assert!(queued.contains(&Job::RefreshThread { thread_id: thread }));
    }

    #[tokio::test]
    async fn emptying_mailbox_clears_remote_and_local() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        server.add_folder("Trash", None);
        for n in 0..3 {
            server
                .append("Trash", format!("Subject: {n}\r\n\r\nx").as_bytes(), &[])
                .unwrap();
        }
        let storage = Arc::new(MemoryObjectStore::new());
        let trash = fx.mailbox("Trash").await;
        let thread = fx.thread(trash).await;
        let id = fx.store_remote(trash, thread, "<a@x>", at(0), "Trash", 1).await;
        fx.summarize(id).await;

        let mut conn = fx.db.pool().acquire().await.unwrap();
        MessageRepository::insert_attachment_on(
            &mut conn,
            &Attachment {
                id: None,
                owner_id: crate::testing::OWNER.into(),
                message_id: id,
                bucket: ATTACHMENT_BUCKET.into(),
                path: "owner-1/1/0-a.txt".into(),
                filename: "a.txt".into(),
                content_type: "text/plain".into(),
                size: 1,
                checksum: String::new(),
                inline: false,
                content_id: None,
            },
        )
        .await
        .unwrap();
        drop(conn);
        storage
            .put(ATTACHMENT_BUCKET, "owner-1/1/0-a.txt", b"a")
            .await
            .unwrap();

        let report = engine(&fx, &server, &storage)
            .delete(&DeleteTarget::Mailbox { mailbox_id: trash })
            .await
            .unwrap();

        assert_eq!(report.messages, vec![id]);
        assert_eq!(report.threads, vec![thread]);
        assert!(server.uids("Trash").is_empty());
        assert!(storage.keys(ATTACHMENT_BUCKET).is_empty());
        assert_eq!(fx.messages.count_in_mailbox(trash).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remote_failure_still_deletes_locally() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        server.fail(FailPoint::Delete);
        let storage = Arc::new(MemoryObjectStore::new());
        let inbox = fx.mailbox("INBOX").await;
        let thread = fx.thread(inbox).await;
        let id = fx.store_remote(inbox, thread, "<a@x>", at(0), "INBOX", 1).await;
        let row = fx.summarize(id).await;

        engine(&fx, &server, &storage)
            .delete(&DeleteTarget::Thread { thread_list_id: row })
            .await
            .unwrap();

        assert!(fx.messages.get(id).await.unwrap().is_none());
    }
}
