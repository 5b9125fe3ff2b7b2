//! Message ingestion.
//!
//! Every path that brings a message into the store (backfill, delta, pushed
//! deliveries) goes through [`MessageIngestionPipeline::ingest`]. Ingestion
//! is idempotent on `(mailbox, Message-ID)`: a second copy of the same
//! message changes nothing.

mod parse;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tidemail_imap::{FetchedMessage, MessageFlags};
use tracing::{debug, warn};

pub use parse::{ParsedAttachment, ParsedMessage, header_message_id, message_ids};

use crate::db::Database;
use crate::jobs::{Job, JobQueue};
use crate::mailbox::{Mailbox, MailboxId};
use crate::message::{Attachment, Message, MessageId, MessageRepository};
use crate::projection::ThreadProjectionAggregator;
use crate::storage::{
    ATTACHMENT_BUCKET, ObjectStore, RAW_BUCKET, attachment_path, delete_objects, raw_key,
};
use crate::thread::{Thread, ThreadId, ThreadListId, ThreadRepository};
use crate::{Error, Result};

/// Domain of synthesized Message-IDs.
const SYNTHETIC_DOMAIN: &str = "synthetic.invalid";

/// One message to ingest into a mailbox.
#[derive(Debug, Clone, Copy)]
pub struct IngestRequest<'a> {
    /// Destination mailbox.
    pub mailbox: &'a Mailbox,
    /// RFC 822 source.
    pub raw: &'a [u8],
    /// Remote UID, when the message came from the mailbox's folder.
    pub uid: Option<u32>,
    /// Remote flags at fetch time.
    pub flags: MessageFlags,
    /// Server receive time.
    pub internal_date: Option<DateTime<Utc>>,
}

impl<'a> IngestRequest<'a> {
    /// A message fetched from the mailbox's remote folder.
    #[must_use]
    pub fn fetched(mailbox: &'a Mailbox, message: &'a FetchedMessage) -> Self {
        Self {
            mailbox,
            raw: &message.raw,
            uid: Some(message.uid.get()),
            flags: MessageFlags::from_flags(&message.flags),
            internal_date: message.internal_date,
        }
    }

    /// A message delivered without a remote folder, e.g. by a webhook.
    #[must_use]
    pub fn pushed(mailbox: &'a Mailbox, raw: &'a [u8]) -> Self {
        Self {
            mailbox,
            raw,
            uid: None,
            flags: MessageFlags::default(),
            internal_date: Some(Utc::now()),
        }
    }
}

/// Rows written for a newly stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredMessage {
    /// Message row.
    pub message_id: MessageId,
    /// Thread it joined or started.
    pub thread_id: ThreadId,
    /// Thread-list row in the mailbox.
    pub thread_list_id: ThreadListId,
}

/// Result of an ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new message row was written.
    Stored(StoredMessage),
    /// The mailbox already holds this message.
    Duplicate,
    /// The source could not be parsed; nothing was written.
    Unparseable,
}

impl IngestOutcome {
    /// The new message row, if one was written.
    #[must_use]
    pub const fn stored(&self) -> Option<StoredMessage> {
        match self {
            Self::Stored(stored) => Some(*stored),
            Self::Duplicate | Self::Unparseable => None,
        }
    }
}

/// Parses, threads and persists messages.
#[derive(Clone)]
pub struct MessageIngestionPipeline {
    pool: SqlitePool,
    storage: Arc<dyn ObjectStore>,
    queue: JobQueue,
}

impl std::fmt::Debug for MessageIngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageIngestionPipeline")
            .finish_non_exhaustive()
    }
}

impl MessageIngestionPipeline {
    /// Creates a pipeline writing to `db` and `storage`, queueing search
    /// updates on `queue`.
    #[must_use]
    pub fn new(db: &Database, storage: Arc<dyn ObjectStore>, queue: JobQueue) -> Self {
        Self {
            pool: db.pool().clone(),
            storage,
            queue,
        }
    }

    /// The object store raw sources and attachments are written to.
    #[must_use]
    pub fn storage(&self) -> &dyn ObjectStore {
        self.storage.as_ref()
    }

    /// Ingests one message.
    ///
    /// # Errors
    ///
    /// Returns an error if object storage or the database fails. A message
    /// that cannot be parsed is not an error.
    pub async fn ingest(&self, request: IngestRequest<'_>) -> Result<IngestOutcome> {
        let mailbox = request.mailbox;
        let mailbox_id = mailbox
            .id
            .ok_or_else(|| Error::NotFound("unsaved mailbox".into()))?;

        let parsed = match ParsedMessage::parse(request.raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(%mailbox_id, uid = ?request.uid, error = %e, "skipping unparseable message");
                return Ok(IngestOutcome::Unparseable);
            }
        };

        let raw_storage_key = hex_digest(request.raw);
        self.storage
            .put(
                RAW_BUCKET,
                &raw_key(&mailbox.owner_id, &raw_storage_key),
                request.raw,
            )
            .await?;

        let message = build_message(mailbox, mailbox_id, &request, &parsed, raw_storage_key);
        if message.message_id_synthetic {
            warn!(
                %mailbox_id,
                uid = ?request.uid,
                message_id = %message.message_id,
                "message has no Message-ID, stored under a synthetic one"
            );
        }

        if self.already_stored(mailbox_id, &message.message_id).await? {
            debug!(%mailbox_id, message_id = %message.message_id, "duplicate message ignored");
            return Ok(IngestOutcome::Duplicate);
        }

        let uploads = self
            .upload_attachments(&message.owner_id, &message.raw_storage_key, &parsed.attachments)
            .await?;

        let persisted = self.persist(mailbox_id, &parsed, message, &uploads).await;
        if !matches!(persisted, Ok(Some(_))) {
            self.discard(&uploads).await;
        }
        let Some(stored) = persisted? else {
            return Ok(IngestOutcome::Duplicate);
        };

        debug!(
            %mailbox_id,
            thread_id = %stored.thread_id,
            message_id = %stored.message_id,
            uid = ?request.uid,
            "message ingested"
        );

        if let Err(e) = self
            .queue
            .enqueue(&Job::IndexMessage {
                message_id: stored.message_id,
            })
            .await
        {
            warn!(message_id = %stored.message_id, error = %e, "failed to queue search indexing");
        }

        Ok(IngestOutcome::Stored(stored))
    }

    async fn already_stored(&self, mailbox_id: MailboxId, message_id: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let existing = MessageRepository::find_in_mailbox_on(&mut conn, mailbox_id, message_id).await?;
        Ok(existing.is_some())
    }

    /// Writes every attachment body to object storage. Nothing is left
    /// behind if one of the writes fails.
    async fn upload_attachments<'a>(
        &self,
        owner_id: &str,
        raw_storage_key: &str,
        parts: &'a [ParsedAttachment],
    ) -> Result<Vec<Upload<'a>>> {
        let upload_id = upload_id(raw_storage_key);
        let mut uploads = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            let path = attachment_path(owner_id, &upload_id, index, &part.filename);
            if let Err(e) = self.storage.put(ATTACHMENT_BUCKET, &path, &part.data).await {
                self.discard(&uploads).await;
                return Err(e);
            }
            uploads.push(Upload { part, path });
        }
        Ok(uploads)
    }

    async fn discard(&self, uploads: &[Upload<'_>]) {
        if uploads.is_empty() {
            return;
        }
        let locations: Vec<(String, String)> = uploads
            .iter()
            .map(|upload| (ATTACHMENT_BUCKET.to_string(), upload.path.clone()))
            .collect();
        debug!(objects = locations.len(), "discarding uploaded attachments");
        delete_objects(self.storage.as_ref(), &locations).await;
    }

    /// Writes the message, its attachment rows and its thread-list row in
    /// one transaction. `None` if the mailbox already holds the message.
    async fn persist(
        &self,
        mailbox_id: MailboxId,
        parsed: &ParsedMessage,
        message: Message,
        uploads: &[Upload<'_>],
    ) -> Result<Option<StoredMessage>> {
        let mut tx = self.pool.begin().await?;

        let thread_id = resolve_thread(&mut tx, mailbox_id, parsed, &message).await?;
        let mut message = Message {
            thread_id,
            ..message
        };

        let Some(message_row) = MessageRepository::insert_on(&mut tx, &message).await? else {
            debug!(%mailbox_id, message_id = %message.message_id, "duplicate message ignored");
            return Ok(None);
        };
        message.id = Some(message_row);

        for upload in uploads {
            MessageRepository::insert_attachment_on(
                &mut tx,
                &upload.attachment(&message.owner_id, message_row),
            )
            .await?;
        }

        let thread_list_id = ThreadProjectionAggregator::upsert_on(&mut tx, &message).await?;
        ThreadRepository::advance_last_message_date_on(&mut tx, thread_id, message.activity_at())
            .await?;

        tx.commit().await?;

        Ok(Some(StoredMessage {
            message_id: message_row,
            thread_id,
            thread_list_id,
        }))
    }
}

/// An attachment body already written to object storage.
struct Upload<'a> {
    part: &'a ParsedAttachment,
    path: String,
}

impl Upload<'_> {
    fn attachment(&self, owner_id: &str, message_id: MessageId) -> Attachment {
        Attachment {
            id: None,
            owner_id: owner_id.to_string(),
            message_id,
            bucket: ATTACHMENT_BUCKET.to_string(),
            path: self.path.clone(),
            filename: self.part.filename.clone(),
            content_type: self.part.content_type.clone(),
            size: self.part.data.len() as u64,
            checksum: hex_digest(&self.part.data),
            inline: self.part.inline,
            content_id: self.part.content_id.clone(),
        }
    }
}

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Directory for one ingest's attachments. Two ingests of the same source
/// never share object keys.
fn upload_id(raw_storage_key: &str) -> String {
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let digest = raw_storage_key.get(..16).unwrap_or(raw_storage_key);
    format!("{digest}-{:x}-{seq}", Utc::now().timestamp_micros())
}

fn build_message(
    mailbox: &Mailbox,
    mailbox_id: MailboxId,
    request: &IngestRequest<'_>,
    parsed: &ParsedMessage,
    raw_storage_key: String,
) -> Message {
    let (message_id, synthetic) = parsed.message_id.clone().map_or_else(
        || (format!("<{raw_storage_key}@{SYNTHETIC_DOMAIN}>"), true),
        |id| (id, false),
    );

    Message {
        id: None,
        owner_id: mailbox.owner_id.clone(),
        identity_id: mailbox.identity_id,
        mailbox_id,
        thread_id: ThreadId(0),
        uid: request.uid,
        mailbox_path: request.uid.and(mailbox.remote_path.clone()),
        message_id,
        message_id_synthetic: synthetic,
        in_reply_to: parsed.in_reply_to.clone(),
        references: parsed.references.clone(),
        subject: parsed.subject.clone(),
        from: parsed.from.clone(),
        to: parsed.to.clone(),
        cc: parsed.cc.clone(),
        bcc: parsed.bcc.clone(),
        date: parsed.date.or(request.internal_date),
        seen: request.flags.seen,
        answered: request.flags.answered,
        flagged: request.flags.flagged,
        draft: request.flags.draft,
        has_attachments: !parsed.attachments.is_empty(),
        text_body: parsed.text_body.clone(),
        html_body: parsed.html_body.clone(),
        snippet: parsed.snippet(),
        size: request.raw.len() as u64,
        raw_storage_key,
        created_at: Utc::now(),
    }
}

/// Finds the thread of the message's parent in the same mailbox, trying the
/// In-Reply-To target before References, or starts a new thread.
async fn resolve_thread(
    conn: &mut SqliteConnection,
    mailbox_id: MailboxId,
    parsed: &ParsedMessage,
    message: &Message,
) -> Result<ThreadId> {
    let (direct, references) = parsed.thread_candidates();
    for candidates in [&direct, &references] {
        if let Some(thread_id) =
            MessageRepository::find_thread_by_candidates_on(conn, mailbox_id, candidates).await?
        {
            return Ok(thread_id);
        }
    }

    ThreadRepository::insert_on(
        conn,
        &Thread {
            id: None,
            owner_id: message.owner_id.clone(),
            identity_id: message.identity_id,
            mailbox_id,
            subject: message.subject.clone(),
            last_message_date: message.date,
        },
    )
    .await
}

fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::config::JobsConfig;
    use crate::jobs::JobStatus;
    use crate::storage::MemoryObjectStore;
    use crate::testing::{Fixture, OWNER, message, raw_email};

    /// Object store with hooks around attachment writes.
    #[derive(Default)]
    struct HookedStore {
        inner: MemoryObjectStore,
        attachment_puts: AtomicUsize,
        /// Attachment writes after this many fail.
        fail_after: Option<usize>,
        /// Inserted into the database during the first attachment write.
        rival: Mutex<Option<(Database, Message)>>,
    }

    #[async_trait]
    impl ObjectStore for HookedStore {
        async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
            if bucket == ATTACHMENT_BUCKET {
                let n = self.attachment_puts.fetch_add(1, Ordering::SeqCst);
                if self.fail_after.is_some_and(|limit| n >= limit) {
                    return Err(Error::Storage("disk full".into()));
                }
                let rival = self.rival.lock().unwrap().take();
                if let Some((db, message)) = rival {
                    let mut conn = db.pool().acquire().await?;
                    MessageRepository::insert_on(&mut conn, &message).await?;
                }
            }
            self.inner.put(bucket, key, bytes).await
        }

        async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(bucket, key).await
        }

        async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
            self.inner.delete(bucket, key).await
        }
    }

    const WITH_TWO_ATTACHMENTS: &[u8] = b"Message-ID: <two@example.com>\r\n\
From: alice@example.com\r\n\
Subject: reports\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
\r\n\
two files\r\n\
--b\r\n\
Content-Type: text/csv; name=\"q1.csv\"\r\n\
Content-Disposition: attachment; filename=\"q1.csv\"\r\n\
\r\n\
a,b\r\n\
--b\r\n\
Content-Type: text/csv; name=\"q2.csv\"\r\n\
Content-Disposition: attachment; filename=\"q2.csv\"\r\n\
\r\n\
c,d\r\n\
--b--\r\n";

    struct Harness {
        fx: Fixture,
        storage: Arc<MemoryObjectStore>,
        queue: JobQueue,
        pipeline: MessageIngestionPipeline,
    }

    async fn harness() -> Harness {
        let fx = Fixture::new().await;
        let storage = Arc::new(MemoryObjectStore::new());
        let queue = JobQueue::new(&fx.db, JobsConfig::default());
        let pipeline = MessageIngestionPipeline::new(&fx.db, storage.clone(), queue.clone());
        Harness {
            fx,
            storage,
            queue,
            pipeline,
        }
    }

    const WITH_ATTACHMENT: &[u8] = b"Message-ID: <att@example.com>\r\n\
From: alice@example.com\r\n\
Subject: report\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--b\r\n\
Content-Type: text/csv; name=\"q1.csv\"\r\n\
Content-Disposition: attachment; filename=\"q1.csv\"\r\n\
\r\n\
a,b\r\n\
--b--\r\n";

    #[tokio::test]
    async fn stores_message_thread_summary_and_raw_source() {
        let h = harness().await;
        let inbox = h.fx.mailbox_record("INBOX").await;
        let raw = raw_email("<m1@example.com>", "Hello", None);

        let outcome = h
            .pipeline
            .ingest(IngestRequest {
                uid: Some(7),
                ..IngestRequest::pushed(&inbox, &raw)
            })
            .await
            .unwrap();
        let stored = outcome.stored().unwrap();

        let message = h.fx.messages.require(stored.message_id).await.unwrap();
        assert_eq!(message.subject, "Hello");
        assert_eq!(message.uid, Some(7));
        assert_eq!(message.mailbox_path.as_deref(), Some("INBOX"));
        assert_eq!(message.snippet, "Hello there.");

        let summary = h.fx.summaries.require(stored.thread_list_id).await.unwrap();
        assert_eq!(summary.message_count, 1);
        assert_eq!(summary.unread_count, 1);
        assert_eq!(summary.mailbox_slug, "inbox");

        let thread = h.fx.threads.get(stored.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.last_message_date, message.date);

        assert_eq!(
            h.storage.keys(RAW_BUCKET),
            vec![raw_key(OWNER, &message.raw_storage_key)]
        );
        assert_eq!(
            h.queue.list(JobStatus::Pending).await.unwrap(),
            vec![Job::IndexMessage {
                message_id: stored.message_id
            }]
        );
    }

    #[tokio::test]
    async fn second_ingest_of_same_message_is_a_no_op() {
        let h = harness().await;
        let inbox = h.fx.mailbox_record("INBOX").await;

        let first = h
            .pipeline
            .ingest(IngestRequest::pushed(&inbox, WITH_ATTACHMENT))
            .await
            .unwrap();
        let second = h
            .pipeline
            .ingest(IngestRequest::pushed(&inbox, WITH_ATTACHMENT))
            .await
            .unwrap();

        assert!(first.stored().is_some());
        assert_eq!(second, IngestOutcome::Duplicate);
        assert_eq!(h.fx.messages.count_in_mailbox(inbox.id.unwrap()).await.unwrap(), 1);

        let attachments = h
            .fx
            .messages
            .attachments(first.stored().unwrap().message_id)
            .await
            .unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "q1.csv");
        assert_eq!(attachments[0].content_type, "text/csv");
        assert_eq!(attachments[0].checksum.len(), 64);
        assert_eq!(h.storage.keys(ATTACHMENT_BUCKET).len(), 1);
    }

    #[tokio::test]
    async fn reply_joins_parent_thread_in_same_mailbox_only() {
        let h = harness().await;
        let inbox = h.fx.mailbox_record("INBOX").await;
        let archive = h.fx.mailbox_record("Archive").await;

        let parent = h
            .pipeline
            .ingest(IngestRequest::pushed(&inbox, &raw_email("<p@x>", "Plan", None)))
            .await
            .unwrap()
            .stored()
            .unwrap();
        let reply_raw = raw_email("<r@x>", "Re: Plan", Some("<p@x>"));
        let reply = h
            .pipeline
            .ingest(IngestRequest::pushed(&inbox, &reply_raw))
            .await
            .unwrap()
            .stored()
            .unwrap();
        assert_eq!(reply.thread_id, parent.thread_id);
        assert_eq!(reply.thread_list_id, parent.thread_list_id);

        let summary = h.fx.summaries.require(parent.thread_list_id).await.unwrap();
        assert_eq!(summary.message_count, 2);
        assert_eq!(summary.subject, "Re: Plan");

        let elsewhere = h
            .pipeline
            .ingest(IngestRequest::pushed(&archive, &reply_raw))
            .await
            .unwrap()
            .stored()
            .unwrap();
        assert_ne!(elsewhere.thread_id, parent.thread_id);
    }

    #[tokio::test]
    async fn in_reply_to_wins_over_references() {
        let h = harness().await;
        let inbox = h.fx.mailbox_record("INBOX").await;

        let a = h
            .pipeline
            .ingest(IngestRequest::pushed(&inbox, &raw_email("<a@x>", "A", None)))
            .await
            .unwrap()
            .stored()
            .unwrap();
        let b = h
            .pipeline
            .ingest(IngestRequest::pushed(&inbox, &raw_email("<b@x>", "B", None)))
            .await
            .unwrap()
            .stored()
            .unwrap();

        let raw = b"Message-ID: <c@x>\r\nIn-Reply-To: <b@x>\r\nReferences: <a@x>\r\nSubject: C\r\n\r\nbody";
        let c = h
            .pipeline
            .ingest(IngestRequest::pushed(&inbox, raw))
            .await
            .unwrap()
            .stored()
            .unwrap();
        assert_eq!(c.thread_id, b.thread_id);
        assert_ne!(c.thread_id, a.thread_id);
    }

    #[tokio::test]
    async fn missing_message_id_is_synthesized_and_stays_idempotent() {
        let h = harness().await;
        let inbox = h.fx.mailbox_record("INBOX").await;
        let raw = b"From: bob@example.com\r\nSubject: anonymous\r\n\r\nno id here";

        let stored = h
            .pipeline
            .ingest(IngestRequest::pushed(&inbox, raw))
            .await
            .unwrap()
            .stored()
            .unwrap();
        let message = h.fx.messages.require(stored.message_id).await.unwrap();
        assert!(message.message_id_synthetic);
        assert_eq!(
            message.message_id,
            format!("<{}@synthetic.invalid>", hex_digest(raw))
        );

        assert_eq!(
            h.pipeline
                .ingest(IngestRequest::pushed(&inbox, raw))
                .await
                .unwrap(),
            IngestOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn fetched_request_carries_flags() {
        let h = harness().await;
        let inbox = h.fx.mailbox_record("INBOX").await;
        let fetched = FetchedMessage {
            uid: tidemail_imap::Uid::new(42).unwrap(),
            flags: vec![tidemail_imap::Flag::Seen, tidemail_imap::Flag::Flagged],
            internal_date: None,
            size: 0,
            raw: raw_email("<f@x>", "flags", None),
        };

        let stored = h
            .pipeline
            .ingest(IngestRequest::fetched(&inbox, &fetched))
            .await
            .unwrap()
            .stored()
            .unwrap();
        let message = h.fx.messages.require(stored.message_id).await.unwrap();
        assert!(message.seen && message.flagged);
        assert_eq!(message.uid, Some(42));

        let summary = h.fx.summaries.require(stored.thread_list_id).await.unwrap();
        assert_eq!(summary.unread_count, 0);
        assert!(summary.starred);
    }

    #[tokio::test]
    async fn losing_a_race_discards_uploaded_attachments() {
        let fx = Fixture::new().await;
        let inbox = fx.mailbox_record("INBOX").await;
        let inbox_id = inbox.id.unwrap();
        let thread = fx.thread(inbox_id).await;

        // A concurrent ingest lands the same message while attachments
        // upload. The database must be free for it at that point.
        let store = Arc::new(HookedStore {
            rival: Mutex::new(Some((
                fx.db.clone(),
                message(fx.identity_id, inbox_id, thread, "<att@example.com>"),
            ))),
            ..HookedStore::default()
        });
        let pipeline = MessageIngestionPipeline::new(&fx.db, store.clone(), fx.queue());

        let outcome = pipeline
            .ingest(IngestRequest::pushed(&inbox, WITH_ATTACHMENT))
            .await
            .unwrap();

        assert_eq!(outcome, IngestOutcome::Duplicate);
        assert_eq!(store.attachment_puts.load(Ordering::SeqCst), 1);
        assert!(store.inner.keys(ATTACHMENT_BUCKET).is_empty());
        assert_eq!(fx.messages.count_in_mailbox(inbox_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_upload_leaves_no_objects_or_rows() {
        let fx = Fixture::new().await;
        let inbox = fx.mailbox_record("INBOX").await;
        let store = Arc::new(HookedStore {
            fail_after: Some(1),
            ..HookedStore::default()
        });
        let pipeline = MessageIngestionPipeline::new(&fx.db, store.clone(), fx.queue());

        let err = pipeline
            .ingest(IngestRequest::pushed(&inbox, WITH_TWO_ATTACHMENTS))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Storage(_)));
        assert!(store.inner.keys(ATTACHMENT_BUCKET).is_empty());
        assert_eq!(store.inner.keys(RAW_BUCKET).len(), 1);
        assert_eq!(fx.messages.count_in_mailbox(inbox.id.unwrap()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn attachment_rows_point_at_stored_objects() {
        let h = harness().await;
        let inbox = h.fx.mailbox_record("INBOX").await;

        let stored = h
            .pipeline
            .ingest(IngestRequest::pushed(&inbox, WITH_TWO_ATTACHMENTS))
            .await
            .unwrap()
            .stored()
            .unwrap();

        let attachments = h.fx.messages.attachments(stored.message_id).await.unwrap();
        assert_eq!(attachments.len(), 2);
        let mut paths: Vec<String> = attachments.iter().map(|a| a.path.clone()).collect();
        paths.sort();
        assert_eq!(h.storage.keys(ATTACHMENT_BUCKET), paths);
        for attachment in &attachments {
            assert!(attachment.path.starts_with(&format!("{OWNER}/")));
            let body = h
                .storage
                .get(ATTACHMENT_BUCKET, &attachment.path)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(body.len() as u64, attachment.size);
        }
    }
}
