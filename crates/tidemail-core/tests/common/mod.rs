//! Shared harness for end-to-end sync tests against the in-memory server.

#![allow(dead_code, clippy::unwrap_used, clippy::missing_panics_doc)]

use std::sync::Arc;
use std::time::Duration;

use tidemail_core::config::{BackfillConfig, DeltaConfig, JobsConfig, SessionConfig};
use tidemail_core::counter::MemoryCounterStore;
use tidemail_core::identity::{Identity, IdentityId, IdentityRepository};
use tidemail_core::jobs::{Engines, JobQueue, Scheduler, Worker};
use tidemail_core::mailbox::{Mailbox, MailboxRepository, SyncCursor};
use tidemail_core::message::{Message, MessageRepository};
use tidemail_core::search::MemorySearchIndex;
use tidemail_core::session::ConnectionManager;
use tidemail_core::storage::MemoryObjectStore;
use tidemail_core::thread::{MailboxThreadSummary, SummaryRepository, ThreadRepository};
use tidemail_core::{Config, Database};
use tidemail_imap::{Flag, ImapConfig, MemoryServer, SpecialUse};

pub const OWNER: &str = "owner-1";

/// Test configuration: no pauses between windows, quick sessions.
pub fn config() -> Config {
    Config {
        backfill: BackfillConfig {
            window_size: 500,
            inter_window_delay_ms: 0,
            windows_per_job: 10,
        },
        delta: DeltaConfig {
            batch_size: 500,
            inter_batch_delay_ms: 0,
        },
        session: SessionConfig {
            keepalive_secs: 60,
            reconnect_delay_ms: 10,
            max_reconnect_attempts: 2,
            command_timeout_secs: 5,
        },
        jobs: JobsConfig {
            poll_interval_ms: 5,
            max_attempts: 3,
            backoff_base_ms: 60_000,
            backoff_max_secs: 600,
        },
        ..Config::default()
    }
}

/// One identity on an in-memory server holding INBOX, Archive and Trash,
/// with every engine wired the way the binary wires them.
pub struct Harness {
    pub db: Database,
    pub server: MemoryServer,
    pub identity_id: IdentityId,
    pub queue: JobQueue,
    pub engines: Engines,
    pub worker: Worker,
    pub scheduler: Scheduler,
    pub storage: Arc<MemoryObjectStore>,
    pub index: Arc<MemorySearchIndex>,
    pub mailboxes: MailboxRepository,
    pub messages: MessageRepository,
    pub threads: ThreadRepository,
    pub summaries: SummaryRepository,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let server = MemoryServer::new();
        server.add_folder("Archive", Some(SpecialUse::Archive));
        server.add_folder("Trash", Some(SpecialUse::Trash));

        let db = Database::in_memory().await.unwrap();
        let mut identity = Identity::new(OWNER, "me@example.com", ImapConfig::default());
        IdentityRepository::new(&db).save(&mut identity).await.unwrap();

        let storage = Arc::new(MemoryObjectStore::new());
        let index = Arc::new(MemorySearchIndex::new());
        let connections = ConnectionManager::new(server.clone(), config.session);
        let engines = Engines::new(
            &db,
            &config,
            connections,
            storage.clone(),
            index.clone(),
            Arc::new(MemoryCounterStore::new()),
        );
        let queue = JobQueue::new(&db, config.jobs);

        Self {
            worker: Worker::new(queue.clone(), engines.clone(), Duration::from_millis(5)),
            scheduler: Scheduler::new(&db, queue.clone(), config.scheduler),
            identity_id: identity.id.unwrap(),
            mailboxes: MailboxRepository::new(&db),
            messages: MessageRepository::new(&db),
            threads: ThreadRepository::new(&db),
            summaries: SummaryRepository::new(&db),
            server,
            queue,
            engines,
            storage,
            index,
            db,
        }
    }

    /// Runs due jobs until none are left, returning how many ran.
    pub async fn drain(&self) -> usize {
        let mut ran = 0;
        while self.worker.run_once().await.unwrap() {
            ran += 1;
            assert!(ran < 10_000, "queue never drained");
        }
        ran
    }

    /// One scheduler pass followed by a drain.
    pub async fn tick(&self) {
        self.scheduler.tick().await.unwrap();
        self.drain().await;
    }

    /// Mirrors the folder list, then walks every mailbox's history.
    pub async fn initial_sync(&self) {
        self.tick().await;
        self.tick().await;
    }

    pub async fn mailbox(&self, path: &str) -> Mailbox {
        self.mailboxes
            .find_by_path(self.identity_id, path)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no mailbox for {path}"))
    }

    pub async fn cursor(&self, path: &str) -> SyncCursor {
        let id = self.mailbox(path).await.id.unwrap();
        self.mailboxes
            .get_cursor(self.identity_id, id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn stored(&self, path: &str) -> Vec<Message> {
        let id = self.mailbox(path).await.id.unwrap();
        self.messages.list_mailbox(id).await.unwrap()
    }

    pub async fn thread_list(&self, path: &str) -> Vec<MailboxThreadSummary> {
        let id = self.mailbox(path).await.id.unwrap();
        self.summaries.list_mailbox(id, 100, 0).await.unwrap()
    }

    /// Appends a message to a remote folder, returning its UID.
    pub fn deliver(&self, path: &str, raw: &[u8], flags: &[Flag]) -> u32 {
        self.server.append(path, raw, flags).unwrap().get()
    }
}

/// An RFC 822 message sent on the given day of May 2024.
pub fn email(message_id: &str, subject: &str, in_reply_to: Option<&str>, day: u32) -> Vec<u8> {
    let mut raw = format!(
        "Message-ID: {message_id}\r\nFrom: Alice <alice@example.com>\r\nTo: me@example.com\r\n\
         Subject: {subject}\r\nDate: {day} May 2024 09:30:00 +0000\r\n"
    );
    if let Some(parent) = in_reply_to {
        raw.push_str(&format!("In-Reply-To: {parent}\r\nReferences: {parent}\r\n"));
    }
    raw.push_str(&format!("\r\nBody of {subject}.\r\n"));
    raw.into_bytes()
}

/// A multipart message carrying two named attachments.
pub fn email_with_attachments(message_id: &str) -> Vec<u8> {
    format!(
        "Message-ID: {message_id}\r\n\
         From: alice@example.com\r\n\
         To: me@example.com\r\n\
         Subject: quarterly numbers\r\n\
         Date: 2 May 2024 10:00:00 +0000\r\n\
         Content-Type: multipart/mixed; boundary=\"part\"\r\n\
         \r\n\
         --part\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         numbers attached\r\n\
         --part\r\n\
         Content-Type: text/csv; name=\"q1.csv\"\r\n\
         Content-Disposition: attachment; filename=\"q1.csv\"\r\n\
         \r\n\
         a,b\r\n\
         --part\r\n\
         Content-Type: application/pdf; name=\"summary.pdf\"\r\n\
         Content-Disposition: attachment; filename=\"summary.pdf\"\r\n\
         \r\n\
         %PDF-1.4\r\n\
         --part--\r\n"
    )
    .into_bytes()
}
