//! Forward sync above the delta high-water mark.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};

use tidemail_imap::{FetchedMessage, UidSet};

use super::{SyncTarget, check_validity, load_target};
use crate::config::DeltaConfig;
use crate::db::Database;
use crate::identity::{IdentityId, IdentityRepository};
use crate::ingest::{IngestRequest, MessageIngestionPipeline, header_message_id};
use crate::jobs::{Job, JobQueue};
use crate::mailbox::{MailboxId, MailboxRepository};
use crate::message::{Message, MessageRepository};
use crate::projection::ThreadProjectionAggregator;
use crate::session::ConnectionManager;
use crate::storage::delete_objects;
use crate::Result;

/// Inclusive `(low, high)` UID batches covering `(last_seen, head]` in
/// ascending order.
#[must_use]
pub fn plan_batches(last_seen: u32, head: u32, batch_size: u32) -> Vec<(u32, u32)> {
    let span = batch_size.max(1) - 1;
    let mut batches = Vec::new();
    if head <= last_seen {
        return batches;
    }
    let mut low = last_seen + 1;
    loop {
        let high = low.saturating_add(span).min(head);
        batches.push((low, high));
        if high == head {
            return batches;
        }
        low = high + 1;
    }
}

/// How a delta run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Delta is not allowed yet, or the mailbox has no remote folder.
    Skipped,
    /// Nothing above the high-water mark.
    UpToDate,
    /// The folder's UID epoch changed; a backfill was queued.
    Restarted,
    /// New UIDs were processed.
    Synced {
        /// New high-water mark.
        last_seen_uid: u32,
        /// Messages ingested.
        stored: usize,
        /// Messages found to have moved here from another mailbox.
        moved: usize,
        /// Known messages whose UID was refreshed.
        refreshed: usize,
    },
}

/// What happened to one fetched message.
enum Disposition {
    Stored,
    Moved,
    Refreshed,
    Unchanged,
}

/// Fetches mail above `last_seen_uid` for mailboxes whose history is loaded.
#[derive(Debug, Clone)]
pub struct DeltaEngine {
    pool: SqlitePool,
    mailboxes: MailboxRepository,
    identities: IdentityRepository,
    messages: MessageRepository,
    connections: ConnectionManager,
    pipeline: MessageIngestionPipeline,
    queue: JobQueue,
    config: DeltaConfig,
}

impl DeltaEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(
        db: &Database,
        connections: ConnectionManager,
        pipeline: MessageIngestionPipeline,
        queue: JobQueue,
        config: DeltaConfig,
    ) -> Self {
        Self {
            pool: db.pool().clone(),
            mailboxes: MailboxRepository::new(db),
            identities: IdentityRepository::new(db),
            messages: MessageRepository::new(db),
            connections,
            pipeline,
            queue,
            config,
        }
    }

    /// Processes every UID above the mailbox's high-water mark.
    ///
    /// Does not touch the server while backfill is still running for the
    /// mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the server or the database fails. Batches finished
    /// before the failure stay recorded.
    pub async fn run(&self, identity_id: IdentityId, mailbox_id: MailboxId) -> Result<DeltaOutcome> {
        let Some(mut target) = load_target(
            &self.mailboxes,
            &self.identities,
            &self.connections,
            identity_id,
            mailbox_id,
        )
        .await?
        else {
            debug!(%mailbox_id, "mailbox has no remote folder, nothing to fetch");
            return Ok(DeltaOutcome::Skipped);
        };
        if !target.cursor.delta_allowed() {
            debug!(
                %mailbox_id,
                phase = target.cursor.phase.as_str(),
                backfill_cursor_uid = target.cursor.backfill_cursor_uid,
                "backfill in progress, delta skipped"
            );
            return Ok(DeltaOutcome::Skipped);
        }

        let status = {
            let _folder = target.session.lock_folder(&target.path).await;
            target.session.status(&target.path).await?
        };
        if check_validity(&mut target.cursor, &status) {
            self.mailboxes.save_cursor(&target.cursor).await?;
            self.queue
                .enqueue(&Job::Backfill {
                    identity_id,
                    mailbox_id,
                })
                .await?;
            return Ok(DeltaOutcome::Restarted);
        }

        let batches = plan_batches(
            target.cursor.last_seen_uid,
            status.head_uid(),
            self.config.batch_size,
        );
        if batches.is_empty() {
            target.cursor.synced_at = Some(Utc::now());
            self.mailboxes.save_cursor(&target.cursor).await?;
            return Ok(DeltaOutcome::UpToDate);
        }

        let (mut stored, mut moved, mut refreshed) = (0, 0, 0);
        for (index, (low, high)) in batches.iter().copied().enumerate() {
            let Some(uids) = UidSet::range(low, high) else {
                continue;
            };
            let fetched = {
                let _folder = target.session.lock_folder(&target.path).await;
                target.session.fetch(&target.path, &uids).await?
            };

            let mut observed = 0;
            for message in &fetched {
                observed = observed.max(message.uid.get());
                match self.absorb(&target, message).await? {
                    Disposition::Stored => stored += 1,
                    Disposition::Moved => moved += 1,
                    Disposition::Refreshed => refreshed += 1,
                    Disposition::Unchanged => {}
                }
            }

            // Expunged UIDs never come back; step over them.
            target.cursor.last_seen_uid = observed.max(high);
            self.mailboxes.save_cursor(&target.cursor).await?;
            debug!(%mailbox_id, low, high, fetched = fetched.len(), "delta batch done");

            if index + 1 < batches.len() {
                tokio::time::sleep(self.config.inter_batch_delay()).await;
            }
        }

        target.cursor.synced_at = Some(Utc::now());
        self.mailboxes.save_cursor(&target.cursor).await?;

        let last_seen_uid = target.cursor.last_seen_uid;
        info!(%identity_id, %mailbox_id, last_seen_uid, stored, moved, refreshed, "delta sync done");
        Ok(DeltaOutcome::Synced {
            last_seen_uid,
            stored,
            moved,
            refreshed,
        })
    }

    async fn absorb(&self, target: &SyncTarget, fetched: &FetchedMessage) -> Result<Disposition> {
        let uid = fetched.uid.get();
        let Some(mailbox_id) = target.mailbox.id else {
            return Ok(Disposition::Unchanged);
        };
        let Some(message_id) = header_message_id(&fetched.raw) else {
            return self.ingest(target, fetched).await;
        };

        if let Some(known) = self.messages.find_in_mailbox(mailbox_id, &message_id).await? {
            let Some(id) = known.id else {
                return Ok(Disposition::Unchanged);
            };
            if known.uid == Some(uid) && known.mailbox_path.as_deref() == Some(target.path.as_str()) {
                return Ok(Disposition::Unchanged);
            }
            self.messages
                .update_remote_uid(id, Some(uid), Some(&target.path))
                .await?;
            return Ok(Disposition::Refreshed);
        }

        let elsewhere = self
            .messages
            .find_by_message_id(&target.mailbox.owner_id, &message_id)
            .await?
            .into_iter()
            .find(|m| m.identity_id == target.cursor.identity_id && m.mailbox_id != mailbox_id);
        match elsewhere {
            Some(previous) => self.observe_move(target, &previous, uid).await,
            None => self.ingest(target, fetched).await,
        }
    }

    async fn ingest(&self, target: &SyncTarget, fetched: &FetchedMessage) -> Result<Disposition> {
        let outcome = self
            .pipeline
            .ingest(IngestRequest::fetched(&target.mailbox, fetched))
            .await?;
        Ok(if outcome.stored().is_some() {
            Disposition::Stored
        } else {
            Disposition::Unchanged
        })
    }

    /// Relinks the thread of a message that turned up in this folder after
    /// it was moved here by another client.
    async fn observe_move(&self, target: &SyncTarget, previous: &Message, uid: u32) -> Result<Disposition> {
        let Some(id) = previous.id else {
            return Ok(Disposition::Unchanged);
        };
        let thread_id = previous.thread_id;

        let mut tx = self.pool.begin().await?;
        let relocation = ThreadProjectionAggregator::relocate_thread_on(
            &mut tx,
            thread_id,
            previous.mailbox_id,
            &target.mailbox,
            Some((id, uid)),
        )
        .await?;
        tx.commit().await?;

        delete_objects(self.pipeline.storage(), &relocation.attachments).await;
        info!(
            %thread_id,
            message_id = %id,
            from = %previous.mailbox_id,
            to = %target.cursor.mailbox_id,
            uid,
            "observed thread move"
        );

        for message_id in relocation.dropped {
            self.follow_up(Job::DeleteMessageDocument { message_id }).await;
        }
        self.follow_up(Job::RefreshThread { thread_id }).await;
        Ok(Disposition::Moved)
    }

    async fn follow_up(&self, job: Job) {
        if let Err(e) = self.queue.enqueue(&job).await {
            warn!(job = job.name(), error = %e, "failed to queue search update");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tidemail_imap::{MemoryServer, RecordedOp};

    use super::*;
    use crate::jobs::JobStatus;
    use crate::mailbox::{SyncCursor, SyncPhase};
    use crate::testing::{Fixture, raw_email};

    struct Setup {
        fx: Fixture,
        server: MemoryServer,
        mailbox_id: MailboxId,
    }

    async fn setup(path: &str) -> Setup {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        server.add_folder(path, None);
        let mailbox_id = fx.mailbox(path).await;
        Setup {
            fx,
            server,
            mailbox_id,
        }
    }

    impl Setup {
        fn engine(&self, batch_size: u32) -> DeltaEngine {
            DeltaEngine::new(
                &self.fx.db,
                self.fx.connections(&self.server),
                self.fx.pipeline(),
                self.fx.queue(),
                DeltaConfig {
                    batch_size,
                    inter_batch_delay_ms: 0,
                },
            )
        }

        async fn idle_at(&self, path: &str, last_seen_uid: u32) {
            let mut cursor = SyncCursor::seeded(
                self.fx.identity_id,
                self.mailbox_id,
                self.server.uid_validity(path),
                last_seen_uid,
            );
            cursor.backfill_cursor_uid = 0;
            cursor.phase = SyncPhase::Idle;
            self.fx.mailboxes.save_cursor(&cursor).await.unwrap();
        }

        async fn cursor(&self) -> SyncCursor {
            self.fx
                .mailboxes
                .get_cursor(self.fx.identity_id, self.mailbox_id)
                .await
                .unwrap()
                .unwrap()
        }

        async fn run(&self, engine: &DeltaEngine) -> DeltaOutcome {
            engine.run(self.fx.identity_id, self.mailbox_id).await.unwrap()
        }

        fn fetches(&self) -> Vec<String> {
            self.server
                .operations()
                .into_iter()
                .filter_map(|op| match op {
                    RecordedOp::Fetch { uids, .. } => Some(uids),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn batches_walk_upward_to_head() {
        assert_eq!(plan_batches(1990, 2000, 500), vec![(1991, 2000)]);
        assert_eq!(plan_batches(0, 5, 2), vec![(1, 2), (3, 4), (5, 5)]);
        assert!(plan_batches(10, 10, 500).is_empty());
        assert!(plan_batches(10, 3, 500).is_empty());
        assert_eq!(plan_batches(u32::MAX - 1, u32::MAX, 500), vec![(u32::MAX, u32::MAX)]);
    }

    #[tokio::test]
    async fn fetches_everything_above_last_seen() {
        let s = setup("INBOX").await;
        s.server.skip_uids("INBOX", 1990);
        for n in 1991..=2000 {
            s.server
                .append("INBOX", &raw_email(&format!("<{n}@x>"), "new", None), &[])
                .unwrap();
        }
        s.idle_at("INBOX", 1990).await;

        let outcome = s.run(&s.engine(500)).await;

        assert_eq!(
            outcome,
            DeltaOutcome::Synced {
                last_seen_uid: 2000,
                stored: 10,
                moved: 0,
                refreshed: 0,
            }
        );
        assert_eq!(s.fetches(), vec!["1991:2000"]);
        let cursor = s.cursor().await;
        assert_eq!(cursor.last_seen_uid, 2000);
        assert_eq!(cursor.phase, SyncPhase::Idle);
        assert!(cursor.synced_at.is_some());
        assert_eq!(s.fx.messages.count_in_mailbox(s.mailbox_id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn never_fetches_while_backfill_runs() {
        let s = setup("INBOX").await;
        s.server
            .append("INBOX", &raw_email("<a@x>", "hi", None), &[])
            .unwrap();
        let cursor = SyncCursor::seeded(s.fx.identity_id, s.mailbox_id, None, 1);
        s.fx.mailboxes.save_cursor(&cursor).await.unwrap();

        assert_eq!(s.run(&s.engine(500)).await, DeltaOutcome::Skipped);
        assert_eq!(s.server.connect_count(), 0);
        assert!(s.fetches().is_empty());
    }

    #[tokio::test]
    async fn message_seen_in_other_mailbox_moves_its_thread() {
        let s = setup("Archive").await;
        let inbox = s.fx.mailbox("INBOX").await;
        let thread = s.fx.thread(inbox).await;
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let original = s
            .fx
            .store_remote(inbox, thread, "<m@x>", date, "INBOX", 4)
            .await;
        let row = s.fx.summarize(original).await;
        s.server
            .append("Archive", &raw_email("<m@x>", "hi", None), &[])
            .unwrap();
        s.idle_at("Archive", 0).await;

        let outcome = s.run(&s.engine(500)).await;

        assert!(matches!(outcome, DeltaOutcome::Synced { stored: 0, moved: 1, .. }));
        let copies = s
            .fx
            .messages
            .find_by_message_id(crate::testing::OWNER, "<m@x>")
            .await
            .unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].mailbox_id, s.mailbox_id);
        assert_eq!(copies[0].uid, Some(1));
        assert_eq!(copies[0].mailbox_path.as_deref(), Some("Archive"));

        assert_eq!(s.fx.messages.count_in_mailbox(inbox).await.unwrap(), 0);
        assert_eq!(s.fx.summaries.require(row).await.unwrap().mailbox_id, s.mailbox_id);
        assert_eq!(s.fx.threads.get(thread).await.unwrap().unwrap().mailbox_id, s.mailbox_id);
        let pending = s.fx.queue().list(JobStatus::Pending).await.unwrap();
        assert!(pending.contains(&Job::RefreshThread { thread_id: thread }));
    }

    #[tokio::test]
    async fn known_message_gets_its_uid_refreshed() {
        let s = setup("INBOX").await;
        let thread = s.fx.thread(s.mailbox_id).await;
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let known = s
            .fx
            .store_remote(s.mailbox_id, thread, "<k@x>", date, "INBOX", 77)
            .await;
        s.server
            .append("INBOX", &raw_email("<k@x>", "hi", None), &[])
            .unwrap();
        s.idle_at("INBOX", 0).await;

        let outcome = s.run(&s.engine(500)).await;

        assert!(matches!(outcome, DeltaOutcome::Synced { stored: 0, refreshed: 1, .. }));
        assert_eq!(s.fx.messages.require(known).await.unwrap().uid, Some(1));
        assert_eq!(s.fx.messages.count_in_mailbox(s.mailbox_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expunged_gaps_still_advance_the_mark() {
        let s = setup("INBOX").await;
        s.server.skip_uids("INBOX", 5);
        s.server
            .append("INBOX", &raw_email("<six@x>", "hi", None), &[])
            .unwrap();
        s.idle_at("INBOX", 0).await;

        let outcome = s.run(&s.engine(2)).await;

        assert!(matches!(outcome, DeltaOutcome::Synced { last_seen_uid: 6, stored: 1, .. }));
        assert_eq!(s.fetches(), vec!["1:2", "3:4", "5:6"]);

        assert_eq!(s.run(&s.engine(2)).await, DeltaOutcome::UpToDate);
        assert_eq!(s.fetches().len(), 3);
    }

    #[tokio::test]
    async fn message_without_id_is_still_ingested() {
        let s = setup("INBOX").await;
        s.server
            .append("INBOX", b"From: a@example.com\r\nSubject: bare\r\n\r\nbody\r\n", &[])
            .unwrap();
        s.idle_at("INBOX", 0).await;

        let outcome = s.run(&s.engine(500)).await;

        assert!(matches!(outcome, DeltaOutcome::Synced { stored: 1, .. }));
    }

    #[tokio::test]
    async fn up_to_date_mailbox_is_still_stamped() {
        let s = setup("INBOX").await;
        s.idle_at("INBOX", 0).await;

        assert_eq!(s.run(&s.engine(500)).await, DeltaOutcome::UpToDate);
        assert!(s.cursor().await.synced_at.is_some());
        assert!(s.fetches().is_empty());
    }

    #[tokio::test]
    async fn changed_validity_hands_back_to_backfill() {
        let s = setup("INBOX").await;
        s.server
            .append("INBOX", &raw_email("<a@x>", "hi", None), &[])
            .unwrap();
        s.idle_at("INBOX", 0).await;
        s.server.set_uid_validity("INBOX", 7);

        assert_eq!(s.run(&s.engine(500)).await, DeltaOutcome::Restarted);
        let cursor = s.cursor().await;
        assert_eq!(cursor.phase, SyncPhase::Backfill);
        assert_eq!(cursor.backfill_cursor_uid, 1);
        assert!(s.fetches().is_empty());
        let pending = s.fx.queue().list(JobStatus::Pending).await.unwrap();
        assert!(pending.iter().any(|job| matches!(job, Job::Backfill { .. })));
    }
}
