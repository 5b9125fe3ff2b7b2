//! Thread model types.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::IdentityId;
use crate::mailbox::MailboxId;
use crate::message::{EmailAddress, Message};

/// Participants kept per role in a summary.
pub const PARTICIPANTS_PER_ROLE: usize = 5;

/// Unique identifier for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub i64);

impl ThreadId {
    /// Create a new thread ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a thread-list row (a [`MailboxThreadSummary`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadListId(pub i64);

impl ThreadListId {
    /// Create a new thread-list ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ThreadListId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    /// Unique identifier (None before insertion).
    pub id: Option<ThreadId>,
    /// Owning user.
    pub owner_id: String,
    /// Identity the thread was created through.
    pub identity_id: IdentityId,
    /// Mailbox the thread currently belongs to for linkage.
    pub mailbox_id: MailboxId,
    /// Subject of the first message.
    pub subject: String,
    /// Date of the newest message.
    pub last_message_date: Option<DateTime<Utc>>,
}

/// Up to [`PARTICIPANTS_PER_ROLE`] unique addresses per header role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Participants {
    /// From.
    pub from: Vec<EmailAddress>,
    /// To.
    pub to: Vec<EmailAddress>,
    /// Cc.
    pub cc: Vec<EmailAddress>,
    /// Bcc.
    pub bcc: Vec<EmailAddress>,
}

impl Participants {
    /// First unique addresses per role, scanning `messages` in the order given.
    #[must_use]
    pub fn collect<'a, I>(messages: I) -> Self
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut participants = Self::default();
        for message in messages {
            push_unique(&mut participants.from, &message.from);
            push_unique(&mut participants.to, &message.to);
            push_unique(&mut participants.cc, &message.cc);
            push_unique(&mut participants.bcc, &message.bcc);
        }
        participants
    }

    /// Merges `fresh` into `self`: existing entries are kept, new addresses
    /// are appended until the per-role cap is reached.
    #[must_use]
    pub fn merge(mut self, fresh: &Self) -> Self {
        push_unique(&mut self.from, &fresh.from);
        push_unique(&mut self.to, &fresh.to);
        push_unique(&mut self.cc, &fresh.cc);
        push_unique(&mut self.bcc, &fresh.bcc);
        self
    }

    /// Every address across roles, without duplicates.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.from
            .iter()
            .chain(&self.to)
            .chain(&self.cc)
            .chain(&self.bcc)
            .filter(|a| seen.insert(a.key()))
            .map(|a| a.address.clone())
            .collect()
    }
}

fn push_unique(target: &mut Vec<EmailAddress>, source: &[EmailAddress]) {
    for address in source {
        if target.len() >= PARTICIPANTS_PER_ROLE {
            return;
        }
        let key = address.key();
        if key.is_empty() || target.iter().any(|a| a.key() == key) {
            continue;
        }
        target.push(address.clone());
    }
}

/// Mailbox-scoped rollup of a thread, as shown in a thread list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxThreadSummary {
    /// Row ID (None before insertion).
    pub id: Option<ThreadListId>,
    /// Owning user.
    pub owner_id: String,
    /// Identity.
    pub identity_id: IdentityId,
    /// Thread.
    pub thread_id: ThreadId,
    /// Mailbox the rollup covers.
    pub mailbox_id: MailboxId,
    /// Slug of that mailbox.
    pub mailbox_slug: String,
    /// Subject of the newest message.
    pub subject: String,
    /// Preview of the newest message.
    pub preview: String,
    /// Date of the oldest message.
    pub first_message_at: DateTime<Utc>,
    /// Date of the newest message.
    pub last_activity_at: DateTime<Utc>,
    /// Messages in the mailbox.
    pub message_count: i64,
    /// Unseen messages in the mailbox.
    pub unread_count: i64,
    /// Any message has attachments.
    pub has_attachments: bool,
    /// Any message is flagged.
    pub starred: bool,
    /// Participants per role.
    pub participants: Participants,
}
