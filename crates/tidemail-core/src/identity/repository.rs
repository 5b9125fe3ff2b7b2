//! Identity storage repository.

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tidemail_imap::{ImapConfig, Security};

use super::model::{Identity, IdentityId};
use crate::db::{self, Database};
use crate::{Error, Result};

/// Repository for identity storage and retrieval.
#[derive(Debug, Clone)]
pub struct IdentityRepository {
    pool: SqlitePool,
}

impl IdentityRepository {
    /// Creates a repository over the shared database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Get all identities.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self) -> Result<Vec<Identity>> {
        let rows = sqlx::query(
            r"
            SELECT id, owner_id, email, host, port, security, username, password
            FROM identities
            ORDER BY id ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_identity).collect())
    }

    /// Get identity by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: IdentityId) -> Result<Option<Identity>> {
        let row = sqlx::query(
            r"
            SELECT id, owner_id, email, host, port, security, username, password
            FROM identities
            WHERE id = ?
            ",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_identity))
    }

    /// Get identity by ID, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if there is no such identity.
    pub async fn require(&self, id: IdentityId) -> Result<Identity> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("identity {id}")))
    }

    /// Save an identity (insert or update).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn save(&self, identity: &mut Identity) -> Result<()> {
        if let Some(id) = identity.id {
            sqlx::query(
                r"
                UPDATE identities SET
                    owner_id = ?, email = ?, host = ?, port = ?, security = ?,
                    username = ?, password = ?
                WHERE id = ?
                ",
            )
            .bind(&identity.owner_id)
            .bind(&identity.email)
            .bind(&identity.imap.host)
            .bind(i64::from(identity.imap.port))
            .bind(identity.imap.security.as_str())
            .bind(&identity.imap.username)
            .bind(&identity.imap.password)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        } else {
            let result = sqlx::query(
                r"
                INSERT INTO identities
                    (owner_id, email, host, port, security, username, password, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(&identity.owner_id)
            .bind(&identity.email)
            .bind(&identity.imap.host)
            .bind(i64::from(identity.imap.port))
            .bind(identity.imap.security.as_str())
            .bind(&identity.imap.username)
            .bind(&identity.imap.password)
            .bind(db::now())
            .execute(&self.pool)
            .await?;

            identity.id = Some(IdentityId::new(result.last_insert_rowid()));
        }

        Ok(())
    }
}

/// Convert a database row to an Identity.
fn row_to_identity(row: &SqliteRow) -> Identity {
    let security = Security::parse(row.get("security"));
    Identity {
        id: Some(IdentityId::new(row.get("id"))),
        owner_id: row.get("owner_id"),
        email: row.get("email"),
        imap: ImapConfig {
            host: row.get("host"),
            port: u16::try_from(row.get::<i64, _>("port")).unwrap_or_else(|_| security.default_port()),
            security,
            username: row.get("username"),
            password: row.get("password"),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_get_roundtrips() {
        let db = Database::in_memory().await.unwrap();
        let repo = IdentityRepository::new(&db);

        let mut identity = Identity::new(
            "user-1",
            "me@example.com",
            ImapConfig::new("imap.example.com", Security::Tls).credentials("me", "secret"),
        );
        repo.save(&mut identity).await.unwrap();
        let id = identity.id.unwrap();

        let loaded = repo.get(id).await.unwrap().unwrap();
        assert_eq!(loaded, identity);
        assert_eq!(loaded.imap.port, 993);
    }

    #[tokio::test]
    async fn save_updates_existing() {
        let db = Database::in_memory().await.unwrap();
        let repo = IdentityRepository::new(&db);

        let mut identity = Identity::new("user-1", "me@example.com", ImapConfig::default());
        repo.save(&mut identity).await.unwrap();
        identity.email = "other@example.com".into();
        repo.save(&mut identity).await.unwrap();

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].email, "other@example.com");
    }

    #[tokio::test]
    async fn require_missing_is_not_found() {
        let db = Database::in_memory().await.unwrap();
        let repo = IdentityRepository::new(&db);
        let err = repo.require(IdentityId::new(42)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
