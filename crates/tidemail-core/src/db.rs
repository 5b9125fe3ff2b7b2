//! Shared `SQLite` database and schema.
//!
//! All repositories borrow one pool. Timestamps are stored as RFC 3339 UTC
//! text with millisecond precision, so text ordering equals time ordering and
//! `max()`/`min()` double as greatest/least bounds.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::Result;

/// Handle to the relational store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database file and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn connect(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS identities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        email TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        security TEXT NOT NULL DEFAULT 'tls',
        username TEXT NOT NULL,
        password TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS mailboxes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id INTEGER NOT NULL REFERENCES identities(id),
        owner_id TEXT NOT NULL,
        name TEXT NOT NULL,
        slug TEXT NOT NULL,
        kind TEXT NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0,
        remote_path TEXT,
        delimiter TEXT,
        remote_flags TEXT NOT NULL DEFAULT '[]',
        special_use TEXT,
        selectable INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(identity_id, remote_path),
        UNIQUE(identity_id, slug)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS sync_cursors (
        identity_id INTEGER NOT NULL,
        mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id),
        uid_validity INTEGER,
        last_seen_uid INTEGER NOT NULL DEFAULT 0,
        backfill_cursor_uid INTEGER NOT NULL DEFAULT 0,
        phase TEXT NOT NULL,
        synced_at TEXT,
        updated_at TEXT NOT NULL,
        PRIMARY KEY(identity_id, mailbox_id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS threads (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        identity_id INTEGER NOT NULL,
        mailbox_id INTEGER NOT NULL,
        subject TEXT NOT NULL DEFAULT '',
        last_message_date TEXT,
        created_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        identity_id INTEGER NOT NULL,
        mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id),
        thread_id INTEGER NOT NULL REFERENCES threads(id),
        uid INTEGER,
        mailbox_path TEXT,
        message_id TEXT NOT NULL,
        message_id_synthetic INTEGER NOT NULL DEFAULT 0,
        in_reply_to TEXT,
        references_json TEXT NOT NULL DEFAULT '[]',
        subject TEXT NOT NULL DEFAULT '',
        from_json TEXT NOT NULL DEFAULT '[]',
        to_json TEXT NOT NULL DEFAULT '[]',
        cc_json TEXT NOT NULL DEFAULT '[]',
        bcc_json TEXT NOT NULL DEFAULT '[]',
        date TEXT,
        seen INTEGER NOT NULL DEFAULT 0,
        answered INTEGER NOT NULL DEFAULT 0,
        flagged INTEGER NOT NULL DEFAULT 0,
        draft INTEGER NOT NULL DEFAULT 0,
        has_attachments INTEGER NOT NULL DEFAULT 0,
        text_body TEXT,
        html_body TEXT,
        snippet TEXT NOT NULL DEFAULT '',
        size INTEGER NOT NULL DEFAULT 0,
        raw_storage_key TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(mailbox_id, message_id)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_messages_owner_message_id
    ON messages(owner_id, message_id)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_messages_thread
    ON messages(thread_id, mailbox_id)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_messages_mailbox_uid
    ON messages(mailbox_id, uid)
    ",
    r"
    CREATE TABLE IF NOT EXISTS mailbox_thread_summaries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        identity_id INTEGER NOT NULL,
        thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
        mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id),
        mailbox_slug TEXT NOT NULL,
        subject TEXT NOT NULL DEFAULT '',
        preview TEXT NOT NULL DEFAULT '',
        first_message_at TEXT NOT NULL,
        last_activity_at TEXT NOT NULL,
        message_count INTEGER NOT NULL DEFAULT 0,
        unread_count INTEGER NOT NULL DEFAULT 0,
        has_attachments INTEGER NOT NULL DEFAULT 0,
        starred INTEGER NOT NULL DEFAULT 0,
        participants_json TEXT NOT NULL DEFAULT '{}',
        updated_at TEXT NOT NULL,
        UNIQUE(thread_id, mailbox_id)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_summaries_mailbox_activity
    ON mailbox_thread_summaries(mailbox_id, last_activity_at DESC)
    ",
    r"
    CREATE TABLE IF NOT EXISTS attachments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        bucket TEXT NOT NULL,
        path TEXT NOT NULL,
        filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        size INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        inline INTEGER NOT NULL DEFAULT 0,
        content_id TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(message_id, path)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS counters (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        payload TEXT NOT NULL,
        dedupe_key TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        run_after TEXT NOT NULL,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_jobs_ready
    ON jobs(status, run_after)
    ",
];

/// Formats a timestamp for storage.
#[must_use]
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time formatted for storage.
#[must_use]
pub fn now() -> String {
    timestamp(Utc::now())
}

/// Parses a stored timestamp.
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 11, 2, 3, 4, 5).unwrap();
        assert!(timestamp(early) < timestamp(late));
        assert_eq!(timestamp(early), "2024-01-02T03:04:05.000Z");
        assert_eq!(parse_timestamp(&timestamp(late)), Some(late));
    }
}
