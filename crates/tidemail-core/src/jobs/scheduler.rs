//! Periodic production of sync jobs.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use super::{Job, JobQueue};
use crate::Result;
use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::identity::IdentityRepository;
use crate::mailbox::{MailboxRepository, SyncCursor};

/// Queues folder reconciliation per identity and backfill or delta per
/// mailbox on a fixed interval.
///
/// Pending duplicates are collapsed by the queue, so a slow worker never
/// builds up more than one sync job per mailbox.
#[derive(Debug, Clone)]
pub struct Scheduler {
    identities: IdentityRepository,
    mailboxes: MailboxRepository,
    queue: JobQueue,
    interval: Duration,
}

/// Job that advances a mailbox from its current phase.
fn job_for(cursor: &SyncCursor) -> Job {
    if cursor.delta_allowed() {
        Job::DeltaFetch {
            identity_id: cursor.identity_id,
            mailbox_id: cursor.mailbox_id,
        }
    } else {
        Job::Backfill {
            identity_id: cursor.identity_id,
            mailbox_id: cursor.mailbox_id,
        }
    }
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(db: &Database, queue: JobQueue, config: SchedulerConfig) -> Self {
        Self {
            identities: IdentityRepository::new(db),
            mailboxes: MailboxRepository::new(db),
            queue,
            interval: config.interval(),
        }
    }

    /// Runs one scheduling pass, returning how many jobs were newly queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn tick(&self) -> Result<usize> {
        let mut queued = 0;

        for identity in self.identities.list().await? {
            let Some(identity_id) = identity.id else {
                continue;
            };
            if self
                .queue
                .enqueue(&Job::ReconcileMailboxes { identity_id })
                .await?
                .is_some()
            {
                queued += 1;
            }
        }

        for cursor in self.mailboxes.list_cursors(None).await? {
            let job = job_for(&cursor);
            if self.queue.enqueue(&job).await?.is_some() {
                queued += 1;
            }
        }

        debug!(queued, "scheduling pass done");
        Ok(queued)
    }

    /// Ticks every interval until `shutdown` turns true or its sender is
    /// dropped. The first pass runs immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduling pass failed");
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::mailbox::SyncPhase;
    use crate::testing::Fixture;

    fn scheduler(fx: &Fixture) -> Scheduler {
        Scheduler::new(&fx.db, fx.queue(), SchedulerConfig { interval_secs: 1 })
    }

    #[test]
    fn phase_picks_the_job() {
        let mut cursor = SyncCursor::bootstrap(crate::identity::IdentityId(1), crate::mailbox::MailboxId(2));
        assert!(matches!(job_for(&cursor), Job::Backfill { .. }));

        cursor.phase = SyncPhase::Idle;
        assert!(matches!(job_for(&cursor), Job::DeltaFetch { .. }));

        cursor.backfill_cursor_uid = 5;
        assert!(matches!(job_for(&cursor), Job::Backfill { .. }));
    }

    #[tokio::test]
    async fn queues_reconcile_and_sync_jobs_once() {
        let fx = Fixture::new().await;
        let inbox = fx.mailbox("INBOX").await;
        let sent = fx.mailbox("Sent").await;
        let mut idle = SyncCursor::seeded(fx.identity_id, inbox, Some(1), 0);
        idle.phase = SyncPhase::Idle;
        fx.mailboxes.save_cursor(&idle).await.unwrap();
        fx.mailboxes
            .save_cursor(&SyncCursor::seeded(fx.identity_id, sent, Some(1), 30))
            .await
            .unwrap();
        let scheduler = scheduler(&fx);

        assert_eq!(scheduler.tick().await.unwrap(), 3);
        assert_eq!(scheduler.tick().await.unwrap(), 0);

        let pending = fx.queue().list(JobStatus::Pending).await.unwrap();
        assert!(pending.contains(&Job::ReconcileMailboxes {
            identity_id: fx.identity_id
        }));
        assert!(pending.contains(&Job::DeltaFetch {
            identity_id: fx.identity_id,
            mailbox_id: inbox
        }));
        assert!(pending.contains(&Job::Backfill {
            identity_id: fx.identity_id,
            mailbox_id: sent
        }));
    }

    #[tokio::test]
    async fn unselectable_mailboxes_are_not_scheduled() {
        let fx = Fixture::new().await;
        let gone = fx.mailbox("Old").await;
        fx.mailboxes
            .save_cursor(&SyncCursor::seeded(fx.identity_id, gone, Some(1), 3))
            .await
            .unwrap();
        fx.mailboxes.set_selectable(gone, false).await.unwrap();

        assert_eq!(scheduler(&fx).tick().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fx = Fixture::new().await;
        let scheduler = scheduler(&fx);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
