//! Per-identity byte budget for backfill.
//!
//! Each identity gets `max_bytes` per window. The window opens with the first
//! charge and lasts `window_secs`; when it lapses the counter expires from the
//! store and the next charge opens a fresh window. Delta sync never consults
//! the limiter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;
use crate::config::BudgetConfig;
use crate::counter::CounterStore;
use crate::identity::IdentityId;

/// Stored counter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct BudgetWindow {
    window_start: DateTime<Utc>,
    bytes: u64,
}

/// Outcome of a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Backfill may proceed; `remaining` bytes are left in the window.
    Allowed {
        /// Bytes left.
        remaining: u64,
    },
    /// Budget spent; backfill should pause until `resets_at`.
    Exhausted {
        /// When the window ends.
        resets_at: DateTime<Utc>,
    },
}

impl BudgetDecision {
    /// Returns true if backfill may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Sliding-window byte counter per identity.
#[derive(Clone)]
pub struct BudgetLimiter {
    store: Arc<dyn CounterStore>,
    config: BudgetConfig,
}

impl std::fmt::Debug for BudgetLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BudgetLimiter {
    /// Creates a limiter over a counter store.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, config: BudgetConfig) -> Self {
        Self { store, config }
    }

    fn key(identity_id: IdentityId) -> String {
        format!("budget:backfill:{identity_id}")
    }

    fn resets_at(&self, window: &BudgetWindow) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.window())
            .ok()
            .and_then(|length| window.window_start.checked_add_signed(length))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn current(&self, identity_id: IdentityId) -> Result<Option<BudgetWindow>> {
        let Some(value) = self.store.get(&Self::key(identity_id)).await? else {
            return Ok(None);
        };

        match serde_json::from_value::<BudgetWindow>(value) {
            Ok(window) if self.resets_at(&window) > Utc::now() => Ok(Some(window)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(%identity_id, error = %e, "discarding unreadable budget counter");
                Ok(None)
            }
        }
    }

    /// Checks whether the identity may fetch more history now.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter store fails.
    pub async fn check(&self, identity_id: IdentityId) -> Result<BudgetDecision> {
        let Some(window) = self.current(identity_id).await? else {
            return Ok(BudgetDecision::Allowed {
                remaining: self.config.max_bytes,
            });
        };

        if window.bytes >= self.config.max_bytes {
            return Ok(BudgetDecision::Exhausted {
                resets_at: self.resets_at(&window),
            });
        }

        Ok(BudgetDecision::Allowed {
            remaining: self.config.max_bytes - window.bytes,
        })
    }

    /// Charges fetched bytes to the identity's window.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter store fails.
    pub async fn charge(&self, identity_id: IdentityId, bytes: u64) -> Result<BudgetDecision> {
        let now = Utc::now();
        let mut window = self.current(identity_id).await?.unwrap_or(BudgetWindow {
            window_start: now,
            bytes: 0,
        });
        window.bytes = window.bytes.saturating_add(bytes);

        let resets_at = self.resets_at(&window);
        let ttl = (resets_at - now).to_std().unwrap_or_default();
        self.store
            .set(&Self::key(identity_id), &serde_json::to_value(window)?, ttl)
            .await?;

        debug!(%identity_id, bytes, used = window.bytes, "charged backfill budget");

        if window.bytes >= self.config.max_bytes {
            Ok(BudgetDecision::Exhausted { resets_at })
        } else {
            Ok(BudgetDecision::Allowed {
                remaining: self.config.max_bytes - window.bytes,
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounterStore;

    fn limiter(max_bytes: u64) -> BudgetLimiter {
        BudgetLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            BudgetConfig {
                window_secs: 3600,
                max_bytes,
            },
        )
    }

    #[tokio::test]
    async fn fresh_identity_has_full_budget() {
        let limiter = limiter(1000);
        assert_eq!(
            limiter.check(IdentityId(1)).await.unwrap(),
            BudgetDecision::Allowed { remaining: 1000 }
        );
    }

    #[tokio::test]
    async fn charges_accumulate_until_exhausted() {
        let limiter = limiter(1000);
        let identity = IdentityId(1);

        assert_eq!(
            limiter.charge(identity, 400).await.unwrap(),
            BudgetDecision::Allowed { remaining: 600 }
        );
        assert!(!limiter.charge(identity, 600).await.unwrap().is_allowed());
        assert!(matches!(
            limiter.check(identity).await.unwrap(),
            BudgetDecision::Exhausted { .. }
        ));
    }

    #[tokio::test]
    async fn identities_are_independent() {
        let limiter = limiter(100);
        limiter.charge(IdentityId(1), 500).await.unwrap();
        assert!(limiter.check(IdentityId(2)).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn elapsed_window_resets() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = BudgetLimiter::new(
            store.clone(),
            BudgetConfig {
                window_secs: 3600,
                max_bytes: 10,
            },
        );
        let stale = BudgetWindow {
            window_start: Utc::now() - chrono::Duration::hours(2),
            bytes: 50,
        };
        store
            .set(
                "budget:backfill:1",
                &serde_json::to_value(stale).unwrap(),
                std::time::Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert!(limiter.check(IdentityId(1)).await.unwrap().is_allowed());
    }
}
