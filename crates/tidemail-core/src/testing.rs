//! Fixtures shared by unit tests.

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tidemail_imap::{ImapConfig, MemoryServer};

use crate::budget::BudgetLimiter;
use crate::config::{BudgetConfig, JobsConfig, SessionConfig};
use crate::counter::MemoryCounterStore;
use crate::db::Database;
use crate::ingest::MessageIngestionPipeline;
use crate::identity::{Identity, IdentityId, IdentityRepository};
use crate::mailbox::{Mailbox, MailboxId, MailboxKind, MailboxRepository, slugify};
use crate::jobs::JobQueue;
use crate::message::{Message, MessageId, MessageRepository};
use crate::projection::ThreadProjectionAggregator;
use crate::session::ConnectionManager;
use crate::storage::MemoryObjectStore;
use crate::thread::{SummaryRepository, Thread, ThreadId, ThreadListId, ThreadRepository};

pub const OWNER: &str = "owner-1";

/// An unsaved message with every optional field empty.
pub fn message(
    identity_id: IdentityId,
    mailbox_id: MailboxId,
    thread_id: ThreadId,
    message_id: &str,
) -> Message {
    Message {
        id: None,
        owner_id: OWNER.to_string(),
        identity_id,
        mailbox_id,
        thread_id,
        uid: None,
        mailbox_path: None,
        message_id: message_id.to_string(),
        message_id_synthetic: false,
        in_reply_to: None,
        references: Vec::new(),
        subject: String::new(),
        from: Vec::new(),
        to: Vec::new(),
        cc: Vec::new(),
        bcc: Vec::new(),
        date: None,
        seen: false,
        answered: false,
        flagged: false,
        draft: false,
        has_attachments: false,
        text_body: None,
        html_body: None,
        snippet: String::new(),
        size: 0,
        raw_storage_key: String::new(),
        created_at: Utc::now(),
    }
}

/// A minimal RFC 822 message.
pub fn raw_email(message_id: &str, subject: &str, in_reply_to: Option<&str>) -> Vec<u8> {
    let mut raw = format!(
        "Message-ID: {message_id}\r\nFrom: Alice <alice@example.com>\r\nTo: bob@example.com\r\n\
         Subject: {subject}\r\nDate: Wed, 1 May 2024 12:00:00 +0000\r\n"
    );
    if let Some(parent) = in_reply_to {
        raw.push_str(&format!("In-Reply-To: {parent}\r\nReferences: {parent}\r\n"));
    }
    raw.push_str("\r\nHello there.\r\n");
    raw.into_bytes()
}

/// A database with one identity.
pub struct Fixture {
    pub db: Database,
    pub identity: Identity,
    pub identity_id: IdentityId,
    pub mailboxes: MailboxRepository,
    pub messages: MessageRepository,
    pub threads: ThreadRepository,
    pub summaries: SummaryRepository,
}

impl Fixture {
    pub async fn new() -> Self {
        let db = Database::in_memory().await.unwrap();
        let mut identity = Identity::new(OWNER, "me@example.com", ImapConfig::default());
        IdentityRepository::new(&db).save(&mut identity).await.unwrap();

        Self {
            identity_id: identity.id.unwrap(),
            identity,
            mailboxes: MailboxRepository::new(&db),
            messages: MessageRepository::new(&db),
            threads: ThreadRepository::new(&db),
            summaries: SummaryRepository::new(&db),
            db,
        }
    }

    /// Inserts a selectable mailbox mirroring `path`.
    pub async fn mailbox(&self, path: &str) -> MailboxId {
        self.mailbox_record(path).await.id.unwrap()
    }

    /// Inserts a selectable mailbox mirroring `path` and returns the record.
    pub async fn mailbox_record(&self, path: &str) -> Mailbox {
        let kind = match path {
            "INBOX" => MailboxKind::Inbox,
            "Sent" => MailboxKind::Sent,
            "Trash" => MailboxKind::Trash,
            "Archive" => MailboxKind::Archive,
            _ => MailboxKind::Custom,
        };
        let mut mailbox = Mailbox {
            id: None,
            identity_id: self.identity_id,
            owner_id: OWNER.to_string(),
            name: path.to_string(),
            slug: slugify(path),
            kind,
            is_default: kind != MailboxKind::Custom,
            remote_path: Some(path.to_string()),
            delimiter: Some("/".to_string()),
            remote_flags: Vec::new(),
            special_use: None,
            selectable: true,
        };
        self.mailboxes.insert(&mut mailbox).await.unwrap();
        mailbox
    }

    pub async fn thread(&self, mailbox_id: MailboxId) -> ThreadId {
        let mut conn = self.db.pool().acquire().await.unwrap();
        ThreadRepository::insert_on(
            &mut conn,
            &Thread {
                id: None,
                owner_id: OWNER.to_string(),
                identity_id: self.identity_id,
                mailbox_id,
                subject: String::new(),
                last_message_date: None,
            },
        )
        .await
        .unwrap()
    }

    /// Inserts a message row without touching projections.
    pub async fn store(
        &self,
        mailbox_id: MailboxId,
        thread_id: ThreadId,
        message_id: &str,
        date: DateTime<Utc>,
        seen: bool,
    ) -> MessageId {
        let mut m = message(self.identity_id, mailbox_id, thread_id, message_id);
        m.date = Some(date);
        m.seen = seen;
        self.store_message(&m).await
    }

    pub async fn store_message(&self, message: &Message) -> MessageId {
        let mut conn = self.db.pool().acquire().await.unwrap();
        MessageRepository::insert_on(&mut conn, message)
            .await
            .unwrap()
            .unwrap()
    }

    /// Inserts an unread message known to live at `path`/`uid` remotely.
    pub async fn store_remote(
        &self,
        mailbox_id: MailboxId,
        thread_id: ThreadId,
        message_id: &str,
        date: DateTime<Utc>,
        path: &str,
        uid: u32,
    ) -> MessageId {
        let mut m = message(self.identity_id, mailbox_id, thread_id, message_id);
        m.date = Some(date);
        m.mailbox_path = Some(path.to_string());
        m.uid = Some(uid);
        self.store_message(&m).await
    }

    /// Builds the thread-list row for a stored message.
    pub async fn summarize(&self, message_id: MessageId) -> ThreadListId {
        ThreadProjectionAggregator::new(&self.db)
            .upsert_mailbox_thread_item(message_id)
            .await
            .unwrap()
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(&self.db, JobsConfig::default())
    }

    pub fn pipeline(&self) -> MessageIngestionPipeline {
        MessageIngestionPipeline::new(&self.db, Arc::new(MemoryObjectStore::new()), self.queue())
    }

    /// Sessions against an in-memory server, with short timeouts.
    pub fn connections(&self, server: &MemoryServer) -> ConnectionManager {
        ConnectionManager::new(server.clone(), session_config())
    }
}

/// A budget allowing `max_bytes` per hour.
pub fn budget(max_bytes: u64) -> BudgetLimiter {
    BudgetLimiter::new(
        Arc::new(MemoryCounterStore::new()),
        BudgetConfig {
            window_secs: 3600,
            max_bytes,
        },
    )
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        keepalive_secs: 60,
        reconnect_delay_ms: 10,
        max_reconnect_attempts: 2,
        command_timeout_secs: 5,
    }
}
