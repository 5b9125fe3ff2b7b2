//! Mailbox model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidemail_imap::{FolderInfo, SpecialUse};

use crate::identity::IdentityId;

/// Unique identifier for a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MailboxId(pub i64);

impl MailboxId {
    /// Create a new mailbox ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MailboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxKind {
    /// Incoming mail.
    Inbox,
    /// Sent mail.
    Sent,
    /// Drafts.
    Drafts,
    /// Archive.
    Archive,
    /// Junk / spam.
    Spam,
    /// Deleted items.
    Trash,
    /// Queued outgoing mail.
    Outbox,
    /// Any other folder.
    Custom,
}

/// Well-known folder names, matched case-insensitively against the leaf name.
const KNOWN_NAMES: &[(&str, MailboxKind)] = &[
    ("inbox", MailboxKind::Inbox),
    ("sent", MailboxKind::Sent),
    ("sent items", MailboxKind::Sent),
    ("sent mail", MailboxKind::Sent),
    ("sent messages", MailboxKind::Sent),
    ("drafts", MailboxKind::Drafts),
    ("draft", MailboxKind::Drafts),
    ("archive", MailboxKind::Archive),
    ("archives", MailboxKind::Archive),
    ("all mail", MailboxKind::Archive),
    ("spam", MailboxKind::Spam),
    ("junk", MailboxKind::Spam),
    ("junk e-mail", MailboxKind::Spam),
    ("bulk mail", MailboxKind::Spam),
    ("trash", MailboxKind::Trash),
    ("deleted", MailboxKind::Trash),
    ("deleted items", MailboxKind::Trash),
    ("deleted messages", MailboxKind::Trash),
    ("bin", MailboxKind::Trash),
    ("outbox", MailboxKind::Outbox),
];

impl MailboxKind {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "inbox" => Self::Inbox,
            "sent" => Self::Sent,
            "drafts" => Self::Drafts,
            "archive" => Self::Archive,
            "spam" => Self::Spam,
            "trash" => Self::Trash,
            "outbox" => Self::Outbox,
            _ => Self::Custom,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Drafts => "drafts",
            Self::Archive => "archive",
            Self::Spam => "spam",
            Self::Trash => "trash",
            Self::Outbox => "outbox",
            Self::Custom => "custom",
        }
    }

    /// Classifies a remote folder: special-use marker first, then the
    /// well-known name list, else [`MailboxKind::Custom`].
    #[must_use]
    pub fn classify(folder: &FolderInfo) -> Self {
        match folder.special_use {
            Some(SpecialUse::Trash) => return Self::Trash,
            Some(SpecialUse::Junk) => return Self::Spam,
            Some(SpecialUse::Sent) => return Self::Sent,
            Some(SpecialUse::Drafts) => return Self::Drafts,
            Some(SpecialUse::Archive) => return Self::Archive,
            Some(SpecialUse::All | SpecialUse::Flagged) | None => {}
        }

        if folder.path.eq_ignore_ascii_case("INBOX") {
            return Self::Inbox;
        }

        let leaf = folder.name().to_lowercase();
        KNOWN_NAMES
            .iter()
            .find(|(name, _)| *name == leaf)
            .map_or(Self::Custom, |(_, kind)| *kind)
    }
}

impl std::fmt::Display for MailboxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local mailbox record mirroring one remote folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    /// Unique identifier (None for unsaved mailboxes).
    pub id: Option<MailboxId>,
    /// Owning identity.
    pub identity_id: IdentityId,
    /// Owning user.
    pub owner_id: String,
    /// Display name (leaf of the remote path).
    pub name: String,
    /// URL-safe name, unique per identity.
    pub slug: String,
    /// Role.
    pub kind: MailboxKind,
    /// Whether this is the identity's default mailbox of its kind.
    pub is_default: bool,
    /// Remote folder path; `None` for local-only mailboxes.
    pub remote_path: Option<String>,
    /// Remote hierarchy delimiter.
    pub delimiter: Option<String>,
    /// Raw LIST attributes.
    pub remote_flags: Vec<String>,
    /// Special-use attribute, if advertised.
    pub special_use: Option<String>,
    /// Whether the folder can currently be selected remotely.
    pub selectable: bool,
}

impl Mailbox {
    /// Returns true if the mailbox has no remote counterpart.
    #[must_use]
    pub const fn is_local_only(&self) -> bool {
        self.remote_path.is_none()
    }
}

/// Progress of a mailbox's synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncPhase {
    /// Folder status not yet read.
    Bootstrap,
    /// Walking history backward.
    Backfill,
    /// History complete; delta sync only.
    Idle,
}

impl SyncPhase {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "BACKFILL" => Self::Backfill,
            "IDLE" => Self::Idle,
            _ => Self::Bootstrap,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "BOOTSTRAP",
            Self::Backfill => "BACKFILL",
            Self::Idle => "IDLE",
        }
    }
}

/// Resumable synchronization state for one identity × mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Identity.
    pub identity_id: IdentityId,
    /// Mailbox.
    pub mailbox_id: MailboxId,
    /// UID numbering epoch the UIDs below belong to.
    pub uid_validity: Option<u32>,
    /// Delta high-water mark.
    pub last_seen_uid: u32,
    /// Next UID to fetch backward; 0 once backfill is complete.
    pub backfill_cursor_uid: u32,
    /// Current phase.
    pub phase: SyncPhase,
    /// Last time a sync run finished.
    pub synced_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// Cursor for a freshly discovered folder whose head is known.
    ///
    /// Delta later resumes above `head_uid`, so mail arriving while history
    /// loads is not skipped.
    #[must_use]
    pub const fn seeded(
        identity_id: IdentityId,
        mailbox_id: MailboxId,
        uid_validity: Option<u32>,
        head_uid: u32,
    ) -> Self {
        Self {
            identity_id,
            mailbox_id,
            uid_validity,
            last_seen_uid: head_uid,
            backfill_cursor_uid: head_uid,
            phase: SyncPhase::Backfill,
            synced_at: None,
        }
    }

    /// Cursor for a folder whose status could not be read yet.
    #[must_use]
    pub const fn bootstrap(identity_id: IdentityId, mailbox_id: MailboxId) -> Self {
        Self {
            identity_id,
            mailbox_id,
            uid_validity: None,
            last_seen_uid: 0,
            backfill_cursor_uid: 0,
            phase: SyncPhase::Bootstrap,
            synced_at: None,
        }
    }

    /// Delta sync may only run once history has finished loading.
    #[must_use]
    pub fn delta_allowed(&self) -> bool {
        self.phase == SyncPhase::Idle && self.backfill_cursor_uid == 0
    }

    /// Restarts synchronization after the folder's UID epoch changed.
    pub const fn reset_for_validity(&mut self, uid_validity: Option<u32>, head_uid: u32) {
        self.uid_validity = uid_validity;
        self.last_seen_uid = head_uid;
        self.backfill_cursor_uid = head_uid;
        self.phase = SyncPhase::Backfill;
    }
}

/// Read-only sync status of a mailbox, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStatusView {
    /// Mailbox.
    pub mailbox_id: MailboxId,
    /// Display name.
    pub name: String,
    /// Slug.
    pub slug: String,
    /// Role.
    pub kind: MailboxKind,
    /// Whether the folder is selectable remotely.
    pub selectable: bool,
    /// Phase, or `None` for mailboxes without a cursor.
    pub phase: Option<SyncPhase>,
    /// Delta high-water mark.
    pub last_seen_uid: u32,
    /// Remaining backfill position.
    pub backfill_cursor_uid: u32,
    /// Last completed sync run.
    pub synced_at: Option<DateTime<Utc>>,
}

impl MailboxStatusView {
    /// True while history is still loading.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        matches!(self.phase, Some(SyncPhase::Bootstrap | SyncPhase::Backfill))
    }
}

/// Lower-cases a folder name into a URL-safe slug.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("folder");
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(path: &str, special_use: Option<SpecialUse>) -> FolderInfo {
        FolderInfo {
            path: path.to_string(),
            delimiter: Some("/".to_string()),
            attributes: Vec::new(),
            special_use,
            selectable: true,
        }
    }

    #[test]
    fn classify_prefers_special_use() {
        assert_eq!(
            MailboxKind::classify(&folder("Papierkorb", Some(SpecialUse::Trash))),
            MailboxKind::Trash
        );
        assert_eq!(
            MailboxKind::classify(&folder("Whatever", Some(SpecialUse::Junk))),
            MailboxKind::Spam
        );
    }

    #[test]
    fn classify_by_known_name() {
        assert_eq!(MailboxKind::classify(&folder("INBOX", None)), MailboxKind::Inbox);
        assert_eq!(
            MailboxKind::classify(&folder("[Gmail]/Sent Mail", None)),
            MailboxKind::Sent
        );
        assert_eq!(
            MailboxKind::classify(&folder("Deleted Items", None)),
            MailboxKind::Trash
        );
        assert_eq!(
            MailboxKind::classify(&folder("Projects/2024", None)),
            MailboxKind::Custom
        );
    }

    #[test]
    fn kind_and_phase_roundtrip() {
        for kind in [
            MailboxKind::Inbox,
            MailboxKind::Sent,
            MailboxKind::Drafts,
            MailboxKind::Archive,
            MailboxKind::Spam,
            MailboxKind::Trash,
            MailboxKind::Outbox,
            MailboxKind::Custom,
        ] {
            assert_eq!(MailboxKind::parse(kind.as_str()), kind);
        }
        for phase in [SyncPhase::Bootstrap, SyncPhase::Backfill, SyncPhase::Idle] {
            assert_eq!(SyncPhase::parse(phase.as_str()), phase);
        }
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("INBOX"), "inbox");
        assert_eq!(slugify("[Gmail]/Sent Mail"), "gmail-sent-mail");
        assert_eq!(slugify("  Projects // 2024 "), "projects-2024");
        assert_eq!(slugify("///"), "folder");
    }

    #[test]
    fn delta_requires_idle_and_finished_backfill() {
        let mut cursor = SyncCursor::seeded(IdentityId(1), MailboxId(1), Some(7), 100);
        assert!(!cursor.delta_allowed());
        cursor.phase = SyncPhase::Idle;
        assert!(!cursor.delta_allowed());
        cursor.backfill_cursor_uid = 0;
        assert!(cursor.delta_allowed());

        cursor.reset_for_validity(Some(8), 40);
        assert_eq!(cursor.phase, SyncPhase::Backfill);
        assert_eq!(cursor.backfill_cursor_uid, 40);
        assert_eq!(cursor.last_seen_uid, 40);
    }
}
