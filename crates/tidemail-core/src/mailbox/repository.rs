//! Mailbox and sync cursor storage repository.

use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};

use super::model::{
    Mailbox, MailboxId, MailboxKind, MailboxStatusView, SyncCursor, SyncPhase,
};
use crate::db::{self, Database};
use crate::identity::IdentityId;
use crate::{Error, Result};

const MAILBOX_COLUMNS: &str = "id, identity_id, owner_id, name, slug, kind, is_default, \
     remote_path, delimiter, remote_flags, special_use, selectable";

/// Repository for mailboxes and their sync cursors.
#[derive(Debug, Clone)]
pub struct MailboxRepository {
    pool: SqlitePool,
}

impl MailboxRepository {
    /// Creates a repository over the shared database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Get all mailboxes of an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, identity_id: IdentityId) -> Result<Vec<Mailbox>> {
        let rows = sqlx::query(&format!(
            "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE identity_id = ? ORDER BY id ASC"
        ))
        .bind(identity_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_mailbox).collect()
    }

    /// Get mailbox by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: MailboxId) -> Result<Option<Mailbox>> {
        let row = sqlx::query(&format!(
            "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_mailbox).transpose()
    }

    /// Get mailbox by ID, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if there is no such mailbox.
    pub async fn require(&self, id: MailboxId) -> Result<Mailbox> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mailbox {id}")))
    }

    /// Slug of a mailbox, on an existing connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if there is no such mailbox.
    pub async fn slug_on(conn: &mut SqliteConnection, id: MailboxId) -> Result<String> {
        sqlx::query_scalar("SELECT slug FROM mailboxes WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mailbox {id}")))
    }

    /// Find the mailbox mirroring a remote folder path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_by_path(
        &self,
        identity_id: IdentityId,
        remote_path: &str,
    ) -> Result<Option<Mailbox>> {
        let row = sqlx::query(&format!(
            "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE identity_id = ? AND remote_path = ?"
        ))
        .bind(identity_id.0)
        .bind(remote_path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_mailbox).transpose()
    }

    /// Find the identity's mailbox of a given kind, preferring the default one.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_by_kind(
        &self,
        identity_id: IdentityId,
        kind: MailboxKind,
    ) -> Result<Option<Mailbox>> {
        let row = sqlx::query(&format!(
            r"
            SELECT {MAILBOX_COLUMNS} FROM mailboxes
            WHERE identity_id = ? AND kind = ?
            ORDER BY is_default DESC, selectable DESC, id ASC
            LIMIT 1
            "
        ))
        .bind(identity_id.0)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_mailbox).transpose()
    }

    /// Returns true if the slug is already used by the identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn slug_exists(&self, identity_id: IdentityId, slug: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM mailboxes WHERE identity_id = ? AND slug = ?")
                .bind(identity_id.0)
                .bind(slug)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Insert a new mailbox, assigning its ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails (including slug or path conflicts).
    pub async fn insert(&self, mailbox: &mut Mailbox) -> Result<()> {
        let now = db::now();
        let result = sqlx::query(
            r"
            INSERT INTO mailboxes
                (identity_id, owner_id, name, slug, kind, is_default, remote_path, delimiter,
                 remote_flags, special_use, selectable, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(mailbox.identity_id.0)
        .bind(&mailbox.owner_id)
        .bind(&mailbox.name)
        .bind(&mailbox.slug)
        .bind(mailbox.kind.as_str())
        .bind(mailbox.is_default)
        .bind(&mailbox.remote_path)
        .bind(&mailbox.delimiter)
        .bind(serde_json::to_string(&mailbox.remote_flags)?)
        .bind(&mailbox.special_use)
        .bind(mailbox.selectable)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        mailbox.id = Some(MailboxId::new(result.last_insert_rowid()));
        Ok(())
    }

    /// Refresh the remote metadata of an existing mailbox.
    ///
    /// Sync cursors are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_metadata(&self, mailbox: &Mailbox) -> Result<()> {
        let id = mailbox
            .id
            .ok_or_else(|| Error::NotFound("unsaved mailbox".into()))?;

        sqlx::query(
            r"
            UPDATE mailboxes SET
                name = ?, delimiter = ?, remote_flags = ?, special_use = ?, selectable = ?,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&mailbox.name)
        .bind(&mailbox.delimiter)
        .bind(serde_json::to_string(&mailbox.remote_flags)?)
        .bind(&mailbox.special_use)
        .bind(mailbox.selectable)
        .bind(db::now())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a mailbox selectable or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_selectable(&self, id: MailboxId, selectable: bool) -> Result<()> {
        sqlx::query("UPDATE mailboxes SET selectable = ?, updated_at = ? WHERE id = ?")
            .bind(selectable)
            .bind(db::now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get the sync cursor of a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_cursor(
        &self,
        identity_id: IdentityId,
        mailbox_id: MailboxId,
    ) -> Result<Option<SyncCursor>> {
        let row = sqlx::query(
            r"
            SELECT identity_id, mailbox_id, uid_validity, last_seen_uid, backfill_cursor_uid,
                   phase, synced_at
            FROM sync_cursors
            WHERE identity_id = ? AND mailbox_id = ?
            ",
        )
        .bind(identity_id.0)
        .bind(mailbox_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_cursor))
    }

    /// Get every sync cursor, optionally restricted to one identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_cursors(&self, identity_id: Option<IdentityId>) -> Result<Vec<SyncCursor>> {
        let rows = sqlx::query(
            r"
            SELECT c.identity_id, c.mailbox_id, c.uid_validity, c.last_seen_uid,
                   c.backfill_cursor_uid, c.phase, c.synced_at
            FROM sync_cursors c
            JOIN mailboxes m ON m.id = c.mailbox_id
            WHERE (?1 IS NULL OR c.identity_id = ?1) AND m.selectable = 1
            ORDER BY c.identity_id, c.mailbox_id
            ",
        )
        .bind(identity_id.map(|id| id.0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_cursor).collect())
    }

    /// Insert a cursor unless one already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn seed_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sync_cursors
                (identity_id, mailbox_id, uid_validity, last_seen_uid, backfill_cursor_uid,
                 phase, synced_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(identity_id, mailbox_id) DO NOTHING
            ",
        )
        .bind(cursor.identity_id.0)
        .bind(cursor.mailbox_id.0)
        .bind(cursor.uid_validity.map(i64::from))
        .bind(i64::from(cursor.last_seen_uid))
        .bind(i64::from(cursor.backfill_cursor_uid))
        .bind(cursor.phase.as_str())
        .bind(cursor.synced_at.map(db::timestamp))
        .bind(db::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a cursor (insert or replace).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sync_cursors
                (identity_id, mailbox_id, uid_validity, last_seen_uid, backfill_cursor_uid,
                 phase, synced_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(identity_id, mailbox_id) DO UPDATE SET
                uid_validity = excluded.uid_validity,
                last_seen_uid = excluded.last_seen_uid,
                backfill_cursor_uid = excluded.backfill_cursor_uid,
                phase = excluded.phase,
                synced_at = excluded.synced_at,
                updated_at = excluded.updated_at
            ",
        )
        .bind(cursor.identity_id.0)
        .bind(cursor.mailbox_id.0)
        .bind(cursor.uid_validity.map(i64::from))
        .bind(i64::from(cursor.last_seen_uid))
        .bind(i64::from(cursor.backfill_cursor_uid))
        .bind(cursor.phase.as_str())
        .bind(cursor.synced_at.map(db::timestamp))
        .bind(db::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sync status of every mailbox of an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn status(&self, identity_id: IdentityId) -> Result<Vec<MailboxStatusView>> {
        let rows = sqlx::query(
            r"
            SELECT m.id, m.name, m.slug, m.kind, m.selectable,
                   c.phase, c.last_seen_uid, c.backfill_cursor_uid, c.synced_at
            FROM mailboxes m
            LEFT JOIN sync_cursors c ON c.mailbox_id = m.id AND c.identity_id = m.identity_id
            WHERE m.identity_id = ?
            ORDER BY m.id ASC
            ",
        )
        .bind(identity_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| MailboxStatusView {
                mailbox_id: MailboxId::new(row.get("id")),
                name: row.get("name"),
                slug: row.get("slug"),
                kind: MailboxKind::parse(row.get("kind")),
                selectable: row.get("selectable"),
                phase: row
                    .get::<Option<String>, _>("phase")
                    .map(|p| SyncPhase::parse(&p)),
                last_seen_uid: to_uid(row.get::<Option<i64>, _>("last_seen_uid").unwrap_or(0)),
                backfill_cursor_uid: to_uid(
                    row.get::<Option<i64>, _>("backfill_cursor_uid").unwrap_or(0),
                ),
                synced_at: row
                    .get::<Option<String>, _>("synced_at")
                    .as_deref()
                    .and_then(db::parse_timestamp),
            })
            .collect())
    }
}

fn to_uid(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn row_to_mailbox(row: &SqliteRow) -> Result<Mailbox> {
    let flags: String = row.get("remote_flags");
    Ok(Mailbox {
        id: Some(MailboxId::new(row.get("id"))),
        identity_id: IdentityId::new(row.get("identity_id")),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        slug: row.get("slug"),
        kind: MailboxKind::parse(row.get("kind")),
        is_default: row.get("is_default"),
        remote_path: row.get("remote_path"),
        delimiter: row.get("delimiter"),
        remote_flags: serde_json::from_str(&flags)?,
        special_use: row.get("special_use"),
        selectable: row.get("selectable"),
    })
}

fn row_to_cursor(row: &SqliteRow) -> SyncCursor {
    SyncCursor {
        identity_id: IdentityId::new(row.get("identity_id")),
        mailbox_id: MailboxId::new(row.get("mailbox_id")),
        uid_validity: row
            .get::<Option<i64>, _>("uid_validity")
            .and_then(|v| u32::try_from(v).ok()),
        last_seen_uid: to_uid(row.get("last_seen_uid")),
        backfill_cursor_uid: to_uid(row.get("backfill_cursor_uid")),
        phase: SyncPhase::parse(row.get("phase")),
        synced_at: row
            .get::<Option<String>, _>("synced_at")
            .as_deref()
            .and_then(db::parse_timestamp),
    }
}
