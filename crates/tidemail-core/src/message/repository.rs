//! Message and attachment storage repository.
//!
//! Reads go through the pool. Writes that must share a transaction with
//! thread or projection updates take a `&mut SqliteConnection`, so callers
//! can pass a transaction.

use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use super::model::{Attachment, AttachmentId, EmailAddress, Message, MessageFlag, MessageId};
use crate::db::{self, Database};
use crate::identity::IdentityId;
use crate::mailbox::MailboxId;
use crate::thread::ThreadId;
use crate::{Error, Result};

const MESSAGE_COLUMNS: &str = "id, owner_id, identity_id, mailbox_id, thread_id, uid, \
     mailbox_path, message_id, message_id_synthetic, in_reply_to, references_json, subject, \
     from_json, to_json, cc_json, bcc_json, date, seen, answered, flagged, draft, \
     has_attachments, text_body, html_body, snippet, size, raw_storage_key, created_at";

/// Newest-first ordering used everywhere a thread's latest message matters.
const NEWEST_FIRST: &str = "coalesce(date, created_at) DESC, id DESC";

/// Repository for messages and attachments.
#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    /// Creates a repository over the shared database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Get message by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_on(&mut conn, id).await
    }

    /// Get message by ID, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if there is no such message.
    pub async fn require(&self, id: MessageId) -> Result<Message> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message {id}")))
    }

    /// Get message by ID on an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_on(conn: &mut SqliteConnection, id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?;

        row.as_ref().map(row_to_message).transpose()
    }

    /// Messages of an owner carrying a real (non-synthetic) Message-ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_by_message_id(&self, owner_id: &str, message_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE owner_id = ? AND message_id = ? AND message_id_synthetic = 0
            ORDER BY {NEWEST_FIRST}
            "
        ))
        .bind(owner_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    /// The message with a given Message-ID in a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_in_mailbox(
        &self,
        mailbox_id: MailboxId,
        message_id: &str,
    ) -> Result<Option<Message>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_in_mailbox_on(&mut conn, mailbox_id, message_id).await
    }

    /// The message with a given Message-ID in a mailbox, on an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_in_mailbox_on(
        conn: &mut SqliteConnection,
        mailbox_id: MailboxId,
        message_id: &str,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE mailbox_id = ? AND message_id = ?"
        ))
        .bind(mailbox_id.0)
        .bind(message_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(row_to_message).transpose()
    }

    /// Every message of a thread across mailboxes, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_thread(&self, thread_id: ThreadId) -> Result<Vec<Message>> {
        let mut conn = self.pool.acquire().await?;
        Self::list_thread_on(&mut conn, thread_id).await
    }

    /// Every message of a thread across mailboxes, on an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_thread_on(
        conn: &mut SqliteConnection,
        thread_id: ThreadId,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ? ORDER BY {NEWEST_FIRST}"
        ))
        .bind(thread_id.0)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    /// Messages of a thread within one mailbox, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_thread_in_mailbox(
        &self,
        thread_id: ThreadId,
        mailbox_id: MailboxId,
    ) -> Result<Vec<Message>> {
        let mut conn = self.pool.acquire().await?;
        Self::list_thread_in_mailbox_on(&mut conn, thread_id, mailbox_id).await
    }

    /// Messages of a thread within one mailbox, on an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_thread_in_mailbox_on(
        conn: &mut SqliteConnection,
        thread_id: ThreadId,
        mailbox_id: MailboxId,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE thread_id = ? AND mailbox_id = ?
            ORDER BY {NEWEST_FIRST}
            "
        ))
        .bind(thread_id.0)
        .bind(mailbox_id.0)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    /// Every message in a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_mailbox(&self, mailbox_id: MailboxId) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE mailbox_id = ? ORDER BY {NEWEST_FIRST}"
        ))
        .bind(mailbox_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    /// IDs of every message in a mailbox, on an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn ids_in_mailbox_on(
        conn: &mut SqliteConnection,
        mailbox_id: MailboxId,
    ) -> Result<Vec<MessageId>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM messages WHERE mailbox_id = ?")
            .bind(mailbox_id.0)
            .fetch_all(&mut *conn)
            .await?;
        Ok(ids.into_iter().map(MessageId::new).collect())
    }

    /// Number of messages in a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count_in_mailbox(&self, mailbox_id: MailboxId) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE mailbox_id = ?")
                .bind(mailbox_id.0)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Message IDs greater than `after`, ascending, for batched scans.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn ids_after(&self, after: Option<MessageId>, limit: u32) -> Result<Vec<MessageId>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM messages WHERE id > ? ORDER BY id ASC LIMIT ?")
                .bind(after.map_or(0, |id| id.0))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(MessageId::new).collect())
    }

    /// Thread of the most recent message in `mailbox_id` whose Message-ID is
    /// one of `candidates`. Synthetic IDs never match.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_thread_by_candidates_on(
        conn: &mut SqliteConnection,
        mailbox_id: MailboxId,
        candidates: &[String],
    ) -> Result<Option<ThreadId>> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut query = QueryBuilder::<Sqlite>::new("SELECT thread_id FROM messages WHERE mailbox_id = ");
        query.push_bind(mailbox_id.0);
        query.push(" AND message_id_synthetic = 0 AND message_id IN (");
        let mut separated = query.separated(", ");
        for candidate in candidates {
            separated.push_bind(candidate.as_str());
        }
        separated.push_unseparated(") ORDER BY ");
        query.push(NEWEST_FIRST);
        query.push(" LIMIT 1");

        let thread: Option<i64> = query
            .build_query_scalar()
            .fetch_optional(&mut *conn)
            .await?;
        Ok(thread.map(ThreadId::new))
    }

    /// Inserts a message unless `(mailbox_id, message_id)` already exists.
    ///
    /// Returns the new row ID, or `None` when the insert was a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn insert_on(
        conn: &mut SqliteConnection,
        message: &Message,
    ) -> Result<Option<MessageId>> {
        let id: Option<i64> = sqlx::query_scalar(
            r"
            INSERT INTO messages
                (owner_id, identity_id, mailbox_id, thread_id, uid, mailbox_path, message_id,
                 message_id_synthetic, in_reply_to, references_json, subject, from_json, to_json,
                 cc_json, bcc_json, date, seen, answered, flagged, draft, has_attachments,
                 text_body, html_body, snippet, size, raw_storage_key, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(mailbox_id, message_id) DO NOTHING
            RETURNING id
            ",
        )
        .bind(&message.owner_id)
        .bind(message.identity_id.0)
        .bind(message.mailbox_id.0)
        .bind(message.thread_id.0)
        .bind(message.uid.map(i64::from))
        .bind(&message.mailbox_path)
        .bind(&message.message_id)
        .bind(message.message_id_synthetic)
        .bind(&message.in_reply_to)
        .bind(serde_json::to_string(&message.references)?)
        .bind(&message.subject)
        .bind(serde_json::to_string(&message.from)?)
        .bind(serde_json::to_string(&message.to)?)
        .bind(serde_json::to_string(&message.cc)?)
        .bind(serde_json::to_string(&message.bcc)?)
        .bind(message.date.map(db::timestamp))
        .bind(message.seen)
        .bind(message.answered)
        .bind(message.flagged)
        .bind(message.draft)
        .bind(message.has_attachments)
        .bind(&message.text_body)
        .bind(&message.html_body)
        .bind(&message.snippet)
        .bind(i64::try_from(message.size).unwrap_or(i64::MAX))
        .bind(&message.raw_storage_key)
        .bind(db::timestamp(message.created_at))
        .fetch_optional(&mut *conn)
        .await?;

        Ok(id.map(MessageId::new))
    }

    /// Refreshes the remote location of a message that stayed in its mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_remote_uid(
        &self,
        id: MessageId,
        uid: Option<u32>,
        mailbox_path: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE messages SET uid = ?, mailbox_path = ? WHERE id = ?")
            .bind(uid.map(i64::from))
            .bind(mailbox_path)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves a message row to another mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn relocate_on(
        conn: &mut SqliteConnection,
        id: MessageId,
        mailbox_id: MailboxId,
        uid: Option<u32>,
        mailbox_path: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE messages SET mailbox_id = ?, uid = ?, mailbox_path = ? WHERE id = ?")
            .bind(mailbox_id.0)
            .bind(uid.map(i64::from))
            .bind(mailbox_path)
            .bind(id.0)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Sets one flag on one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_flag_on(
        conn: &mut SqliteConnection,
        id: MessageId,
        flag: MessageFlag,
        value: bool,
    ) -> Result<()> {
        sqlx::query(&format!("UPDATE messages SET {} = ? WHERE id = ?", flag.column()))
            .bind(value)
            .bind(id.0)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Whether any message of the thread is flagged.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn thread_has_flagged_on(
        conn: &mut SqliteConnection,
        thread_id: ThreadId,
    ) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM messages WHERE thread_id = ? AND flagged = 1 LIMIT 1")
                .bind(thread_id.0)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(found.is_some())
    }

    /// Deletes one message row (attachments cascade).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_on(conn: &mut SqliteConnection, id: MessageId) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.0)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Deletes every message of a mailbox, returning the affected thread IDs.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_mailbox_on(
        conn: &mut SqliteConnection,
        mailbox_id: MailboxId,
    ) -> Result<Vec<ThreadId>> {
        let threads: Vec<i64> =
            sqlx::query_scalar("SELECT DISTINCT thread_id FROM messages WHERE mailbox_id = ?")
                .bind(mailbox_id.0)
                .fetch_all(&mut *conn)
                .await?;

        sqlx::query("DELETE FROM messages WHERE mailbox_id = ?")
            .bind(mailbox_id.0)
            .execute(&mut *conn)
            .await?;

        Ok(threads.into_iter().map(ThreadId::new).collect())
    }

    /// Inserts an attachment row unless its path already exists for the message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn insert_attachment_on(
        conn: &mut SqliteConnection,
        attachment: &Attachment,
    ) -> Result<Option<AttachmentId>> {
        let id: Option<i64> = sqlx::query_scalar(
            r"
            INSERT INTO attachments
                (owner_id, message_id, bucket, path, filename, content_type, size, checksum,
                 inline, content_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id, path) DO NOTHING
            RETURNING id
            ",
        )
        .bind(&attachment.owner_id)
        .bind(attachment.message_id.0)
        .bind(&attachment.bucket)
        .bind(&attachment.path)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(i64::try_from(attachment.size).unwrap_or(i64::MAX))
        .bind(&attachment.checksum)
        .bind(attachment.inline)
        .bind(&attachment.content_id)
        .bind(db::now())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(id.map(AttachmentId))
    }

    /// Attachments of a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn attachments(&self, message_id: MessageId) -> Result<Vec<Attachment>> {
        let rows = sqlx::query(
            r"
            SELECT id, owner_id, message_id, bucket, path, filename, content_type, size,
                   checksum, inline, content_id
            FROM attachments
            WHERE message_id = ?
            ORDER BY id ASC
            ",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Attachment {
                id: Some(AttachmentId(row.get("id"))),
                owner_id: row.get("owner_id"),
                message_id: MessageId::new(row.get("message_id")),
                bucket: row.get("bucket"),
                path: row.get("path"),
                filename: row.get("filename"),
                content_type: row.get("content_type"),
                size: u64::try_from(row.get::<i64, _>("size")).unwrap_or(0),
                checksum: row.get("checksum"),
                inline: row.get("inline"),
                content_id: row.get("content_id"),
            })
            .collect())
    }

    /// Storage locations of the attachments of several messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn attachment_locations_on(
        conn: &mut SqliteConnection,
        message_ids: &[MessageId],
    ) -> Result<Vec<(String, String)>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new("SELECT bucket, path FROM attachments WHERE message_id IN (");
        let mut separated = query.separated(", ");
        for id in message_ids {
            separated.push_bind(id.0);
        }
        separated.push_unseparated(")");

        let rows = query.build().fetch_all(&mut *conn).await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("bucket"), row.get("path")))
            .collect())
    }
}

fn parse_addresses(row: &SqliteRow, column: &str) -> Result<Vec<EmailAddress>> {
    let json: String = row.get(column);
    Ok(serde_json::from_str(&json)?)
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let references: String = row.get("references_json");
    let created_at: String = row.get("created_at");

    Ok(Message {
        id: Some(MessageId::new(row.get("id"))),
        owner_id: row.get("owner_id"),
        identity_id: IdentityId::new(row.get("identity_id")),
        mailbox_id: MailboxId::new(row.get("mailbox_id")),
        thread_id: ThreadId::new(row.get("thread_id")),
        uid: row
            .get::<Option<i64>, _>("uid")
            .and_then(|uid| u32::try_from(uid).ok()),
        mailbox_path: row.get("mailbox_path"),
        message_id: row.get("message_id"),
        message_id_synthetic: row.get("message_id_synthetic"),
        in_reply_to: row.get("in_reply_to"),
        references: serde_json::from_str(&references)?,
        subject: row.get("subject"),
        from: parse_addresses(row, "from_json")?,
        to: parse_addresses(row, "to_json")?,
        cc: parse_addresses(row, "cc_json")?,
        bcc: parse_addresses(row, "bcc_json")?,
        date: row
            .get::<Option<String>, _>("date")
            .as_deref()
            .and_then(db::parse_timestamp),
        seen: row.get("seen"),
        answered: row.get("answered"),
        flagged: row.get("flagged"),
        draft: row.get("draft"),
        has_attachments: row.get("has_attachments"),
        text_body: row.get("text_body"),
        html_body: row.get("html_body"),
        snippet: row.get("snippet"),
        size: u64::try_from(row.get::<i64, _>("size")).unwrap_or(0),
        raw_storage_key: row.get("raw_storage_key"),
        created_at: db::parse_timestamp(&created_at).unwrap_or_default(),
    })
}
