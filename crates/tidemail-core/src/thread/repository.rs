//! Thread and summary storage repositories.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};

use super::model::{MailboxThreadSummary, Participants, Thread, ThreadId, ThreadListId};
use crate::db::{self, Database};
use crate::identity::IdentityId;
use crate::mailbox::MailboxId;
use crate::{Error, Result};

/// Repository for threads.
#[derive(Debug, Clone)]
pub struct ThreadRepository {
    pool: SqlitePool,
}

impl ThreadRepository {
    /// Creates a repository over the shared database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Get thread by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: ThreadId) -> Result<Option<Thread>> {
        let row = sqlx::query(
            r"
            SELECT id, owner_id, identity_id, mailbox_id, subject, last_message_date
            FROM threads
            WHERE id = ?
            ",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_thread))
    }

    /// Inserts a thread and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn insert_on(conn: &mut SqliteConnection, thread: &Thread) -> Result<ThreadId> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO threads (owner_id, identity_id, mailbox_id, subject, last_message_date, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            ",
        )
        .bind(&thread.owner_id)
        .bind(thread.identity_id.0)
        .bind(thread.mailbox_id.0)
        .bind(&thread.subject)
        .bind(thread.last_message_date.map(db::timestamp))
        .bind(db::now())
        .fetch_one(&mut *conn)
        .await?;

        Ok(ThreadId::new(id))
    }

    /// Advances `last_message_date` if `date` is newer.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn advance_last_message_date_on(
        conn: &mut SqliteConnection,
        id: ThreadId,
        date: DateTime<Utc>,
    ) -> Result<()> {
        let date = db::timestamp(date);
        sqlx::query(
            r"
            UPDATE threads
            SET last_message_date = ?1
            WHERE id = ?2 AND (last_message_date IS NULL OR last_message_date < ?1)
            ",
        )
        .bind(&date)
        .bind(id.0)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Points the thread at `to` only if it currently points at `from`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn repoint_mailbox_on(
        conn: &mut SqliteConnection,
        id: ThreadId,
        from: MailboxId,
        to: MailboxId,
    ) -> Result<()> {
        sqlx::query("UPDATE threads SET mailbox_id = ? WHERE id = ? AND mailbox_id = ?")
            .bind(to.0)
            .bind(id.0)
            .bind(from.0)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Deletes the thread if no message references it any more.
    ///
    /// Returns true if the thread was deleted. Summary rows cascade.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_if_orphan_on(conn: &mut SqliteConnection, id: ThreadId) -> Result<bool> {
        let result = sqlx::query(
            r"
            DELETE FROM threads
            WHERE id = ? AND NOT EXISTS (SELECT 1 FROM messages WHERE messages.thread_id = threads.id)
            ",
        )
        .bind(id.0)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Recomputes `last_message_date` from the remaining messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn refresh_last_message_date_on(
        conn: &mut SqliteConnection,
        id: ThreadId,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE threads
            SET last_message_date = (
                SELECT max(coalesce(date, created_at)) FROM messages WHERE thread_id = threads.id
            )
            WHERE id = ?
            ",
        )
        .bind(id.0)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

fn row_to_thread(row: &SqliteRow) -> Thread {
    Thread {
        id: Some(ThreadId::new(row.get("id"))),
        owner_id: row.get("owner_id"),
        identity_id: IdentityId::new(row.get("identity_id")),
        mailbox_id: MailboxId::new(row.get("mailbox_id")),
        subject: row.get("subject"),
        last_message_date: row
            .get::<Option<String>, _>("last_message_date")
            .as_deref()
            .and_then(db::parse_timestamp),
    }
}

const SUMMARY_COLUMNS: &str = "id, owner_id, identity_id, thread_id, mailbox_id, mailbox_slug, \
     subject, preview, first_message_at, last_activity_at, message_count, unread_count, \
     has_attachments, starred, participants_json";

/// Repository for mailbox-scoped thread summaries.
#[derive(Debug, Clone)]
pub struct SummaryRepository {
    pool: SqlitePool,
}

impl SummaryRepository {
    /// Creates a repository over the shared database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Get a summary by thread-list ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: ThreadListId) -> Result<Option<MailboxThreadSummary>> {
        let row = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM mailbox_thread_summaries WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_summary).transpose()
    }

    /// Get a summary by thread-list ID, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if there is no such row.
    pub async fn require(&self, id: ThreadListId) -> Result<MailboxThreadSummary> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("thread list item {id}")))
    }

    /// Get the summary of a thread in a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find(
        &self,
        thread_id: ThreadId,
        mailbox_id: MailboxId,
    ) -> Result<Option<MailboxThreadSummary>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_on(&mut conn, thread_id, mailbox_id).await
    }

    /// Get the summary of a thread in a mailbox, on an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_on(
        conn: &mut SqliteConnection,
        thread_id: ThreadId,
        mailbox_id: MailboxId,
    ) -> Result<Option<MailboxThreadSummary>> {
        let row = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM mailbox_thread_summaries WHERE thread_id = ? AND mailbox_id = ?"
        ))
        .bind(thread_id.0)
        .bind(mailbox_id.0)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(row_to_summary).transpose()
    }

    /// Every summary row of a thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_for_thread(&self, thread_id: ThreadId) -> Result<Vec<MailboxThreadSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM mailbox_thread_summaries WHERE thread_id = ? ORDER BY id"
        ))
        .bind(thread_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_summary).collect()
    }

    /// Thread list of a mailbox, most recent activity first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_mailbox(
        &self,
        mailbox_id: MailboxId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MailboxThreadSummary>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {SUMMARY_COLUMNS} FROM mailbox_thread_summaries
            WHERE mailbox_id = ?
            ORDER BY last_activity_at DESC, id DESC
            LIMIT ? OFFSET ?
            "
        ))
        .bind(mailbox_id.0)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_summary).collect()
    }

    /// Monotonic upsert: activity bounds widen, booleans OR together, counts
    /// are replaced, subject and preview follow the newest activity.
    /// Participants must already be merged by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn upsert_monotonic_on(
        conn: &mut SqliteConnection,
        summary: &MailboxThreadSummary,
    ) -> Result<ThreadListId> {
        Self::write_on(
            conn,
            summary,
            r"
            ON CONFLICT(thread_id, mailbox_id) DO UPDATE SET
                mailbox_slug = excluded.mailbox_slug,
                subject = CASE WHEN excluded.last_activity_at >= mailbox_thread_summaries.last_activity_at
                               THEN excluded.subject ELSE mailbox_thread_summaries.subject END,
                preview = CASE WHEN excluded.last_activity_at >= mailbox_thread_summaries.last_activity_at
                               THEN excluded.preview ELSE mailbox_thread_summaries.preview END,
                first_message_at = min(mailbox_thread_summaries.first_message_at, excluded.first_message_at),
                last_activity_at = max(mailbox_thread_summaries.last_activity_at, excluded.last_activity_at),
                message_count = excluded.message_count,
                unread_count = excluded.unread_count,
                has_attachments = mailbox_thread_summaries.has_attachments OR excluded.has_attachments,
                starred = mailbox_thread_summaries.starred OR excluded.starred,
                participants_json = excluded.participants_json,
                updated_at = excluded.updated_at
            ",
        )
        .await
    }

    /// Replacing upsert: every field takes the fresh aggregate.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn replace_on(
        conn: &mut SqliteConnection,
        summary: &MailboxThreadSummary,
    ) -> Result<ThreadListId> {
        Self::write_on(
            conn,
            summary,
            r"
            ON CONFLICT(thread_id, mailbox_id) DO UPDATE SET
                mailbox_slug = excluded.mailbox_slug,
                subject = excluded.subject,
                preview = excluded.preview,
                first_message_at = excluded.first_message_at,
                last_activity_at = excluded.last_activity_at,
                message_count = excluded.message_count,
                unread_count = excluded.unread_count,
                has_attachments = excluded.has_attachments,
                starred = excluded.starred,
                participants_json = excluded.participants_json,
                updated_at = excluded.updated_at
            ",
        )
        .await
    }

    async fn write_on(
        conn: &mut SqliteConnection,
        summary: &MailboxThreadSummary,
        on_conflict: &str,
    ) -> Result<ThreadListId> {
        let id: i64 = sqlx::query_scalar(&format!(
            r"
            INSERT INTO mailbox_thread_summaries
                (owner_id, identity_id, thread_id, mailbox_id, mailbox_slug, subject, preview,
                 first_message_at, last_activity_at, message_count, unread_count,
                 has_attachments, starred, participants_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            {on_conflict}
            RETURNING id
            "
        ))
        .bind(&summary.owner_id)
        .bind(summary.identity_id.0)
        .bind(summary.thread_id.0)
        .bind(summary.mailbox_id.0)
        .bind(&summary.mailbox_slug)
        .bind(&summary.subject)
        .bind(&summary.preview)
        .bind(db::timestamp(summary.first_message_at))
        .bind(db::timestamp(summary.last_activity_at))
        .bind(summary.message_count)
        .bind(summary.unread_count)
        .bind(summary.has_attachments)
        .bind(summary.starred)
        .bind(serde_json::to_string(&summary.participants)?)
        .bind(db::now())
        .fetch_one(&mut *conn)
        .await?;

        Ok(ThreadListId::new(id))
    }

    /// Moves a summary row to another mailbox, keeping its ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn repoint_on(
        conn: &mut SqliteConnection,
        id: ThreadListId,
        mailbox_id: MailboxId,
        mailbox_slug: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE mailbox_thread_summaries SET mailbox_id = ?, mailbox_slug = ?, updated_at = ? WHERE id = ?",
        )
        .bind(mailbox_id.0)
        .bind(mailbox_slug)
        .bind(db::now())
        .bind(id.0)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Sets `starred` on every summary row of a thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_thread_starred_on(
        conn: &mut SqliteConnection,
        thread_id: ThreadId,
        starred: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE mailbox_thread_summaries SET starred = ?, updated_at = ? WHERE thread_id = ?")
            .bind(starred)
            .bind(db::now())
            .bind(thread_id.0)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Deletes the summary of a thread in a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_on(
        conn: &mut SqliteConnection,
        thread_id: ThreadId,
        mailbox_id: MailboxId,
    ) -> Result<()> {
        sqlx::query("DELETE FROM mailbox_thread_summaries WHERE thread_id = ? AND mailbox_id = ?")
            .bind(thread_id.0)
            .bind(mailbox_id.0)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Deletes every summary of a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_mailbox_on(conn: &mut SqliteConnection, mailbox_id: MailboxId) -> Result<()> {
        sqlx::query("DELETE FROM mailbox_thread_summaries WHERE mailbox_id = ?")
            .bind(mailbox_id.0)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

fn row_to_summary(row: &SqliteRow) -> Result<MailboxThreadSummary> {
    let first: String = row.get("first_message_at");
    let last: String = row.get("last_activity_at");
    let participants: String = row.get("participants_json");
    let participants: Participants = serde_json::from_str(&participants)?;

    Ok(MailboxThreadSummary {
        id: Some(ThreadListId::new(row.get("id"))),
        owner_id: row.get("owner_id"),
        identity_id: IdentityId::new(row.get("identity_id")),
        thread_id: ThreadId::new(row.get("thread_id")),
        mailbox_id: MailboxId::new(row.get("mailbox_id")),
        mailbox_slug: row.get("mailbox_slug"),
        subject: row.get("subject"),
        preview: row.get("preview"),
        first_message_at: db::parse_timestamp(&first).unwrap_or_default(),
        last_activity_at: db::parse_timestamp(&last).unwrap_or_default(),
        message_count: row.get("message_count"),
        unread_count: row.get("unread_count"),
        has_attachments: row.get("has_attachments"),
        starred: row.get("starred"),
        participants,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::testing::Fixture;

    use super::*;

    #[tokio::test]
    async fn repoint_only_moves_a_thread_still_in_the_source_mailbox() {
        let f = Fixture::new().await;
        let inbox = f.mailbox("INBOX").await;
        let archive = f.mailbox("Archive").await;
        let trash = f.mailbox("Trash").await;
        let thread = f.thread(inbox).await;

        {
            let mut conn = f.db.pool().acquire().await.unwrap();
            ThreadRepository::repoint_mailbox_on(&mut conn, thread, inbox, archive)
                .await
                .unwrap();
        }
        assert_eq!(f.threads.get(thread).await.unwrap().unwrap().mailbox_id, archive);

        {
            // Stale source: the thread has already left INBOX.
            let mut conn = f.db.pool().acquire().await.unwrap();
            ThreadRepository::repoint_mailbox_on(&mut conn, thread, inbox, trash)
                .await
                .unwrap();
        }
        assert_eq!(f.threads.get(thread).await.unwrap().unwrap().mailbox_id, archive);
    }
}
