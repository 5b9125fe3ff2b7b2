//! Flattened message documents for the full-text index.

use serde::{Deserialize, Serialize};

use crate::message::{EmailAddress, Message, MessageId};
use crate::thread::MailboxThreadSummary;

/// Longest body text sent to the index.
const BODY_LIMIT: usize = 32 * 1024;

/// One indexed message, denormalized with its thread-list row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct SearchDocument {
    /// Message row ID, as a string.
    pub id: String,
    /// Owning user.
    pub owner_id: String,
    /// Identity.
    pub identity_id: i64,
    /// Mailbox.
    pub mailbox_id: i64,
    /// Mailbox slug.
    pub mailbox_slug: String,
    /// Thread.
    pub thread_id: i64,
    /// Thread-list row, if the projection has one.
    pub thread_list_id: Option<i64>,
    /// Subject.
    pub subject: String,
    /// Short preview.
    pub snippet: String,
    /// Plain-text body, truncated.
    pub body: String,
    /// Sender addresses.
    pub from: Vec<String>,
    /// Recipients (To, Cc, Bcc).
    pub recipients: Vec<String>,
    /// Thread participants.
    pub participants: Vec<String>,
    /// Unix seconds of the message date (or ingestion time).
    pub date: i64,
    /// `\Seen`.
    pub seen: bool,
    /// `\Flagged`.
    pub flagged: bool,
    /// Thread is starred in this mailbox.
    pub starred: bool,
    /// Message carries attachments.
    pub has_attachments: bool,
}

impl SearchDocument {
    /// Builds a document from a message and its summary in the same mailbox.
    #[must_use]
    pub fn build(message: &Message, summary: Option<&MailboxThreadSummary>) -> Self {
        let id = message.id.map_or(0, |id| id.0);
        let body = message.text_body.as_deref().unwrap_or_default();

        Self {
            id: id.to_string(),
            owner_id: message.owner_id.clone(),
            identity_id: message.identity_id.0,
            mailbox_id: message.mailbox_id.0,
            mailbox_slug: summary.map(|s| s.mailbox_slug.clone()).unwrap_or_default(),
            thread_id: message.thread_id.0,
            thread_list_id: summary.and_then(|s| s.id).map(|id| id.0),
            subject: message.subject.clone(),
            snippet: message.snippet.clone(),
            body: truncate(body, BODY_LIMIT).to_string(),
            from: addresses(&message.from),
            recipients: addresses(message.to.iter().chain(&message.cc).chain(&message.bcc)),
            participants: summary
                .map(|s| s.participants.addresses())
                .unwrap_or_default(),
            date: message.activity_at().timestamp(),
            seen: message.seen,
            flagged: message.flagged,
            starred: summary.is_some_and(|s| s.starred),
            has_attachments: message.has_attachments,
        }
    }

    /// Index key of a message.
    #[must_use]
    pub fn key(id: MessageId) -> String {
        id.0.to_string()
    }
}

fn addresses<'a, I>(list: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a EmailAddress>,
{
    list.into_iter().map(|a| a.address.clone()).collect()
}

/// Cuts `text` to at most `limit` bytes on a char boundary.
fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("héllo", 3), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
