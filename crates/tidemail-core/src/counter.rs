//! Shared counter store: small JSON values with an expiry.
//!
//! Only the budget limiter uses it. The `SQLite` implementation lets several
//! worker processes pointed at the same database share one budget.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePool;

use crate::Result;
use crate::db::{self, Database};

/// Get/set of expiring JSON values.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Reads a value; expired values read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Writes a value that expires after `ttl`.
    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()>;
}

/// Process-local counter store.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, (Value, tokio::time::Instant)>>,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Value, tokio::time::Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut entries = self.lock();
        let now = tokio::time::Instant::now();
        match entries.get(key) {
            Some((value, expires)) if *expires > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let expires = tokio::time::Instant::now() + ttl;
        self.lock().insert(key.to_string(), (value.clone(), expires));
        Ok(())
    }
}

/// Counter store backed by the `counters` table.
#[derive(Debug, Clone)]
pub struct SqliteCounterStore {
    pool: SqlitePool,
}

impl SqliteCounterStore {
    /// Creates a store over the shared database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM counters WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(db::now())
                .fetch_optional(&self.pool)
                .await?;

        value
            .map(|v| serde_json::from_str(&v).map_err(Into::into))
            .transpose()
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);

        sqlx::query(
            r"
            INSERT INTO counters (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            ",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(db::timestamp(expires_at))
        .execute(&self.pool)
        .await?;

        // Opportunistic cleanup of expired rows.
        sqlx::query("DELETE FROM counters WHERE expires_at <= ?")
            .bind(db::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
