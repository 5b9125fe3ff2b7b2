//! Message model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::IdentityId;
use crate::mailbox::MailboxId;
use crate::thread::ThreadId;

/// Unique identifier for a stored message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Create a new message ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An address from a From/To/Cc/Bcc header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Address.
    pub address: String,
}

impl EmailAddress {
    /// Creates an address without a display name.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    /// Key used for de-duplication.
    #[must_use]
    pub fn key(&self) -> String {
        self.address.trim().to_lowercase()
    }
}

/// One ingested email in one mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Row ID (None before insertion).
    pub id: Option<MessageId>,
    /// Owning user.
    pub owner_id: String,
    /// Identity the message was synced through.
    pub identity_id: IdentityId,
    /// Mailbox holding the message.
    pub mailbox_id: MailboxId,
    /// Conversation.
    pub thread_id: ThreadId,
    /// Remote UID within `mailbox_path`, if known.
    pub uid: Option<u32>,
    /// Remote folder path the UID belongs to.
    pub mailbox_path: Option<String>,
    /// RFC 822 Message-ID, angle brackets included.
    pub message_id: String,
    /// True when `message_id` was derived from the raw bytes.
    pub message_id_synthetic: bool,
    /// In-Reply-To Message-ID.
    pub in_reply_to: Option<String>,
    /// References Message-IDs, oldest first.
    pub references: Vec<String>,
    /// Decoded subject.
    pub subject: String,
    /// From.
    pub from: Vec<EmailAddress>,
    /// To.
    pub to: Vec<EmailAddress>,
    /// Cc.
    pub cc: Vec<EmailAddress>,
    /// Bcc.
    pub bcc: Vec<EmailAddress>,
    /// Date header, falling back to the server's internal date.
    pub date: Option<DateTime<Utc>>,
    /// `\Seen`.
    pub seen: bool,
    /// `\Answered`.
    pub answered: bool,
    /// `\Flagged`.
    pub flagged: bool,
    /// `\Draft`.
    pub draft: bool,
    /// Whether any attachment was found.
    pub has_attachments: bool,
    /// Plain-text body.
    pub text_body: Option<String>,
    /// HTML body.
    pub html_body: Option<String>,
    /// Short preview.
    pub snippet: String,
    /// Raw size in bytes.
    pub size: u64,
    /// Key of the raw source in object storage.
    pub raw_storage_key: String,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Sort key for "newest": the message date, else the insertion time.
    #[must_use]
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.date.unwrap_or(self.created_at)
    }
}

/// A locally mirrored flag that user actions toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFlag {
    /// `\Seen`.
    Seen,
    /// `\Answered`.
    Answered,
    /// `\Flagged`.
    Flagged,
}

impl MessageFlag {
    /// Column holding the flag.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::Seen => "seen",
            Self::Answered => "answered",
            Self::Flagged => "flagged",
        }
    }

    /// Protocol flag.
    #[must_use]
    pub const fn remote(self) -> tidemail_imap::Flag {
        match self {
            Self::Seen => tidemail_imap::Flag::Seen,
            Self::Answered => tidemail_imap::Flag::Answered,
            Self::Flagged => tidemail_imap::Flag::Flagged,
        }
    }
}

/// Unique identifier for an attachment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentId(pub i64);

/// A stored attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Row ID (None before insertion).
    pub id: Option<AttachmentId>,
    /// Owning user.
    pub owner_id: String,
    /// Message the attachment belongs to.
    pub message_id: MessageId,
    /// Storage bucket.
    pub bucket: String,
    /// Path within the bucket.
    pub path: String,
    /// Original filename.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// Decoded size in bytes.
    pub size: u64,
    /// SHA-256 of the decoded bytes, hex.
    pub checksum: String,
    /// Inline disposition.
    pub inline: bool,
    /// Content-ID, for inline parts.
    pub content_id: Option<String>,
}
