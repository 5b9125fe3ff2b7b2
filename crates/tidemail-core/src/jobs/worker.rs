//! Claims queued jobs and dispatches them to the engines.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{FailOutcome, Job, JobQueue};
use crate::Result;
use crate::actions::{DeleteEngine, FlagSyncEngine, MoveEngine};
use crate::budget::BudgetLimiter;
use crate::config::Config;
use crate::counter::CounterStore;
use crate::db::Database;
use crate::ingest::MessageIngestionPipeline;
use crate::search::{SearchIndex, SearchIndexSync};
use crate::session::ConnectionManager;
use crate::storage::ObjectStore;
use crate::sync::{BackfillEngine, DeltaEngine, MailboxReconciler};

/// Every engine a job can be dispatched to.
#[derive(Debug, Clone)]
pub struct Engines {
    /// Folder list mirroring.
    pub reconciler: MailboxReconciler,
    /// History walk.
    pub backfill: BackfillEngine,
    /// Forward sync.
    pub delta: DeltaEngine,
    /// Flag transitions.
    pub flags: FlagSyncEngine,
    /// Thread moves.
    pub moves: MoveEngine,
    /// Permanent deletes.
    pub deletes: DeleteEngine,
    /// Search projection.
    pub search: SearchIndexSync,
}

impl Engines {
    /// Wires every engine over shared infrastructure.
    #[must_use]
    pub fn new(
        db: &Database,
        config: &Config,
        connections: ConnectionManager,
        storage: Arc<dyn ObjectStore>,
        index: Arc<dyn SearchIndex>,
        counters: Arc<dyn CounterStore>,
    ) -> Self {
        let queue = JobQueue::new(db, config.jobs);
        let pipeline = MessageIngestionPipeline::new(db, Arc::clone(&storage), queue.clone());
        let budget = BudgetLimiter::new(counters, config.budget);

        Self {
            reconciler: MailboxReconciler::new(db, connections.clone()),
            backfill: BackfillEngine::new(
                db,
                connections.clone(),
                pipeline.clone(),
                budget,
                queue.clone(),
                config.backfill,
            ),
            delta: DeltaEngine::new(db, connections.clone(), pipeline, queue.clone(), config.delta),
            flags: FlagSyncEngine::new(db, connections.clone(), queue.clone()),
            moves: MoveEngine::new(db, connections.clone(), queue.clone(), Arc::clone(&storage)),
            deletes: DeleteEngine::new(db, connections, queue, storage),
            search: SearchIndexSync::new(db, index, config.search.rebuild_batch_size),
        }
    }
}

/// Runs queued jobs one at a time.
#[derive(Debug, Clone)]
pub struct Worker {
    queue: JobQueue,
    engines: Engines,
    poll_interval: Duration,
}

impl Worker {
    /// Creates a worker polling `queue` every `poll_interval` when idle.
    #[must_use]
    pub const fn new(queue: JobQueue, engines: Engines, poll_interval: Duration) -> Self {
        Self {
            queue,
            engines,
            poll_interval,
        }
    }

    /// Claims and runs one due job. Returns false when nothing was due.
    ///
    /// A failing job is rescheduled with backoff, or marked failed once it
    /// runs out of attempts; either way the failure is not returned.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself fails.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(claimed) = self.queue.claim().await? else {
            return Ok(false);
        };

        let started = Instant::now();
        match self.dispatch(&claimed.job).await {
            Ok(()) => {
                self.queue.complete(claimed.id).await?;
                debug!(
                    job_id = %claimed.id,
                    job = claimed.job.name(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "job done"
                );
            }
            Err(e) => match self.queue.fail(&claimed, &e.to_string()).await? {
                FailOutcome::Retry { run_after } => warn!(
                    job_id = %claimed.id,
                    job = claimed.job.name(),
                    attempt = claimed.attempts,
                    %run_after,
                    error = %e,
                    "job failed, retrying"
                ),
                FailOutcome::Dead => error!(
                    job_id = %claimed.id,
                    job = claimed.job.name(),
                    attempts = claimed.attempts,
                    error = %e,
                    "job failed permanently"
                ),
            },
        }
        Ok(true)
    }

    /// Runs jobs until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(error = %e, "job queue unavailable"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("worker stopped");
    }

    async fn dispatch(&self, job: &Job) -> Result<()> {
        let engines = &self.engines;
        match job {
            Job::DeltaFetch {
                identity_id,
                mailbox_id,
            } => {
                let outcome = engines.delta.run(*identity_id, *mailbox_id).await?;
                debug!(%mailbox_id, ?outcome, "delta finished");
            }
            Job::Backfill {
                identity_id,
                mailbox_id,
            } => {
                let outcome = engines.backfill.run(*identity_id, *mailbox_id).await?;
                debug!(%mailbox_id, ?outcome, "backfill finished");
            }
            Job::ReconcileMailboxes { identity_id } => {
                engines.reconciler.reconcile(*identity_id).await?;
            }
            Job::Move {
                thread_list_id,
                destination,
            } => {
                engines.moves.move_thread(*thread_list_id, *destination).await?;
            }
            Job::SetFlags {
                thread_list_id,
                operation,
            } => engines.flags.apply(*thread_list_id, *operation).await?,
            Job::DeletePermanent { target } => {
                let report = engines.deletes.delete(target).await?;
                debug!(
                    messages = report.messages.len(),
                    threads = report.threads.len(),
                    "delete finished"
                );
            }
            Job::IndexMessage { message_id } => engines.search.index_message(*message_id).await?,
            Job::DeleteMessageDocument { message_id } => {
                engines.search.delete_message(*message_id).await?;
            }
            Job::RefreshThread { thread_id } => {
                engines.search.refresh_thread(*thread_id).await?;
            }
            Job::RebuildSearch => {
                let documents = engines.search.rebuild().await?;
                info!(documents, "search index rebuilt");
            }
        }
        Ok(())
    }
}
