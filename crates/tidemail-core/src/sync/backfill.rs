//! Backward history walk, one UID window at a time.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use tidemail_imap::{FolderStatus, UidSet};

use super::{SyncTarget, check_validity, load_target, validity_of};
use crate::budget::{BudgetDecision, BudgetLimiter};
use crate::config::BackfillConfig;
use crate::db::Database;
use crate::identity::{IdentityId, IdentityRepository};
use crate::ingest::{IngestRequest, MessageIngestionPipeline};
use crate::jobs::{Job, JobQueue};
use crate::mailbox::{MailboxId, MailboxRepository, SyncCursor, SyncPhase};
use crate::session::ConnectionManager;
use crate::Result;

/// Inclusive `(low, high)` UID windows walking down from `cursor`, at most
/// `max_windows` of them.
#[must_use]
pub fn plan_windows(cursor: u32, window_size: u32, max_windows: u32) -> Vec<(u32, u32)> {
    let span = window_size.max(1) - 1;
    let mut windows = Vec::new();
    let mut high = cursor;
    while high > 0 && windows.len() < max_windows as usize {
        let low = high.saturating_sub(span).max(1);
        windows.push((low, high));
        high = low - 1;
    }
    windows
}

/// How a backfill run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// Nothing to backfill (idle, local-only or unselectable mailbox).
    Skipped,
    /// Windows were processed and more remain; the job was re-enqueued.
    Progressed {
        /// Next UID to fetch.
        cursor: u32,
    },
    /// The identity's budget is spent; the job was re-enqueued for later.
    Paused {
        /// When the job will run again.
        resets_at: DateTime<Utc>,
    },
    /// The folder's UID epoch changed and the walk starts over.
    Restarted,
    /// History is complete and delta sync takes over.
    Completed {
        /// Delta high-water mark.
        last_seen_uid: u32,
    },
}

/// Walks mailbox history from the head down to UID 1.
#[derive(Debug, Clone)]
pub struct BackfillEngine {
    mailboxes: MailboxRepository,
    identities: IdentityRepository,
    connections: ConnectionManager,
    pipeline: MessageIngestionPipeline,
    budget: BudgetLimiter,
    queue: JobQueue,
    config: BackfillConfig,
}

impl BackfillEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(
        db: &Database,
        connections: ConnectionManager,
        pipeline: MessageIngestionPipeline,
        budget: BudgetLimiter,
        queue: JobQueue,
        config: BackfillConfig,
    ) -> Self {
        Self {
            mailboxes: MailboxRepository::new(db),
            identities: IdentityRepository::new(db),
            connections,
            pipeline,
            budget,
            queue,
            config,
        }
    }

    /// Runs up to `windows_per_job` windows for one mailbox.
    ///
    /// The cursor is saved after every window, so an interrupted run repeats
    /// at most one window.
    ///
    /// # Errors
    ///
    /// Returns an error if the server, the database or the counter store
    /// fails. Progress made before the failure is kept.
    pub async fn run(&self, identity_id: IdentityId, mailbox_id: MailboxId) -> Result<BackfillOutcome> {
        let Some(mut target) = load_target(
            &self.mailboxes,
            &self.identities,
            &self.connections,
            identity_id,
            mailbox_id,
        )
        .await?
        else {
            debug!(%mailbox_id, "mailbox has no remote folder, nothing to backfill");
            return Ok(BackfillOutcome::Skipped);
        };
        if target.cursor.phase == SyncPhase::Idle {
            return Ok(BackfillOutcome::Skipped);
        }

        let job = Job::Backfill {
            identity_id,
            mailbox_id,
        };
        if let BudgetDecision::Exhausted { resets_at } = self.budget.check(identity_id).await? {
            return self.pause(&job, resets_at).await;
        }

        let status = self.status(&target).await?;
        if target.cursor.phase == SyncPhase::Bootstrap {
            target.cursor = SyncCursor::seeded(
                identity_id,
                mailbox_id,
                validity_of(&status),
                status.head_uid(),
            );
            self.mailboxes.save_cursor(&target.cursor).await?;
            info!(%identity_id, %mailbox_id, head = status.head_uid(), "mailbox bootstrapped");
        } else if check_validity(&mut target.cursor, &status) {
            self.mailboxes.save_cursor(&target.cursor).await?;
            self.requeue(&job).await?;
            return Ok(BackfillOutcome::Restarted);
        }

        let windows = plan_windows(
            target.cursor.backfill_cursor_uid,
            self.config.window_size,
            self.config.windows_per_job,
        );
        for (index, (low, high)) in windows.iter().copied().enumerate() {
            if let BudgetDecision::Exhausted { resets_at } = self.budget.check(identity_id).await? {
                return self.pause(&job, resets_at).await;
            }

            let stored = self.ingest_range(&target, low, high).await?;
            target.cursor.backfill_cursor_uid = low - 1;
            self.mailboxes.save_cursor(&target.cursor).await?;
            debug!(
                %mailbox_id,
                low,
                high,
                stored,
                cursor = target.cursor.backfill_cursor_uid,
                "backfill window done"
            );

            if index + 1 < windows.len() {
                tokio::time::sleep(self.config.inter_window_delay()).await;
            }
        }

        if target.cursor.backfill_cursor_uid > 0 {
            self.requeue(&job).await?;
            return Ok(BackfillOutcome::Progressed {
                cursor: target.cursor.backfill_cursor_uid,
            });
        }
        self.complete(&mut target, &job).await
    }

    /// Reopens the folder, picks up mail that arrived during the walk and
    /// hands over to delta sync.
    async fn complete(&self, target: &mut SyncTarget, job: &Job) -> Result<BackfillOutcome> {
        let status = self.status(target).await?;
        if check_validity(&mut target.cursor, &status) {
            self.mailboxes.save_cursor(&target.cursor).await?;
            self.requeue(job).await?;
            return Ok(BackfillOutcome::Restarted);
        }

        let head = status.head_uid();
        let size = self.config.window_size.max(1);
        let mut low = target.cursor.last_seen_uid.saturating_add(1);
        while low <= head {
            let high = low.saturating_add(size - 1).min(head);
            self.ingest_range(target, low, high).await?;
            if high == head {
                break;
            }
            low = high + 1;
        }

        let cursor = &mut target.cursor;
        cursor.last_seen_uid = head;
        cursor.phase = SyncPhase::Idle;
        cursor.synced_at = Some(Utc::now());
        self.mailboxes.save_cursor(cursor).await?;

        info!(
            identity_id = %cursor.identity_id,
            mailbox_id = %cursor.mailbox_id,
            last_seen_uid = head,
            "backfill complete"
        );
        Ok(BackfillOutcome::Completed { last_seen_uid: head })
    }

    async fn status(&self, target: &SyncTarget) -> Result<FolderStatus> {
        let _folder = target.session.lock_folder(&target.path).await;
        target.session.status(&target.path).await
    }

    /// Fetches and ingests `[low, high]`, charging every message to the budget.
    async fn ingest_range(&self, target: &SyncTarget, low: u32, high: u32) -> Result<usize> {
        let Some(uids) = UidSet::range(low, high) else {
            return Ok(0);
        };
        let fetched = {
            let _folder = target.session.lock_folder(&target.path).await;
            target.session.fetch(&target.path, &uids).await?
        };

        let mut stored = 0;
        for message in &fetched {
            self.budget
                .charge(target.cursor.identity_id, u64::from(message.size))
                .await?;
            let outcome = self
                .pipeline
                .ingest(IngestRequest::fetched(&target.mailbox, message))
                .await?;
            if outcome.stored().is_some() {
                stored += 1;
            }
        }
        Ok(stored)
    }

    async fn pause(&self, job: &Job, resets_at: DateTime<Utc>) -> Result<BackfillOutcome> {
        warn!(job = job.name(), %resets_at, "backfill budget exhausted, pausing");
        self.queue.enqueue_at(job, resets_at).await?;
        Ok(BackfillOutcome::Paused { resets_at })
    }

    async fn requeue(&self, job: &Job) -> Result<()> {
        self.queue.enqueue(job).await?;
        Ok(())
    }
}
