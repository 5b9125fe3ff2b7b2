//! Folder listing and status types.

use chrono::{DateTime, Utc};

use super::{Flag, Uid, UidValidity};

/// Server-advertised role of a folder (RFC 6154), independent of its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialUse {
    /// `\All` virtual folder.
    All,
    /// `\Archive`.
    Archive,
    /// `\Drafts`.
    Drafts,
    /// `\Flagged` virtual folder.
    Flagged,
    /// `\Junk`.
    Junk,
    /// `\Sent`.
    Sent,
    /// `\Trash`.
    Trash,
}

impl SpecialUse {
    /// Parses a LIST attribute, returning `None` for non special-use attributes.
    #[must_use]
    pub fn parse(attr: &str) -> Option<Self> {
        match attr.to_ascii_lowercase().as_str() {
            "\\all" => Some(Self::All),
            "\\archive" => Some(Self::Archive),
            "\\drafts" => Some(Self::Drafts),
            "\\flagged" => Some(Self::Flagged),
            "\\junk" | "\\spam" => Some(Self::Junk),
            "\\sent" => Some(Self::Sent),
            "\\trash" => Some(Self::Trash),
            _ => None,
        }
    }

    /// Returns the attribute as an IMAP string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::All => "\\All",
            Self::Archive => "\\Archive",
            Self::Drafts => "\\Drafts",
            Self::Flagged => "\\Flagged",
            Self::Junk => "\\Junk",
            Self::Sent => "\\Sent",
            Self::Trash => "\\Trash",
        }
    }
}

/// A folder as returned by LIST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderInfo {
    /// Full path including hierarchy.
    pub path: String,
    /// Hierarchy delimiter, if the server reported one.
    pub delimiter: Option<String>,
    /// Raw LIST attributes (e.g. `\HasNoChildren`, `\Trash`).
    pub attributes: Vec<String>,
    /// Special-use role, if advertised.
    pub special_use: Option<SpecialUse>,
    /// Whether the folder can be selected.
    pub selectable: bool,
}

impl FolderInfo {
    /// Leaf name of the folder (last hierarchy component).
    #[must_use]
    pub fn name(&self) -> &str {
        match self.delimiter.as_deref() {
            Some(delim) if !delim.is_empty() => self
                .path
                .rsplit_once(delim)
                .map_or(self.path.as_str(), |(_, leaf)| leaf),
            _ => &self.path,
        }
    }
}

/// Status returned when opening a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderStatus {
    /// Current UIDVALIDITY epoch.
    pub uid_validity: Option<UidValidity>,
    /// Next UID the server will assign.
    pub uid_next: u32,
    /// Number of messages in the folder.
    pub exists: u32,
}

impl FolderStatus {
    /// Highest UID that can currently exist (`UIDNEXT - 1`, 0 for an empty folder).
    #[must_use]
    pub const fn head_uid(&self) -> u32 {
        self.uid_next.saturating_sub(1)
    }
}

/// A message fetched by UID with its full raw source.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    /// UID in the selected folder.
    pub uid: Uid,
    /// Flags at fetch time.
    pub flags: Vec<Flag>,
    /// Server INTERNALDATE.
    pub internal_date: Option<DateTime<Utc>>,
    /// RFC822.SIZE as reported by the server.
    pub size: u32,
    /// Raw RFC822 source.
    pub raw: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(path: &str, delimiter: Option<&str>) -> FolderInfo {
        FolderInfo {
            path: path.to_string(),
            delimiter: delimiter.map(str::to_string),
            attributes: Vec::new(),
            special_use: None,
            selectable: true,
        }
    }

    #[test]
    fn leaf_name_uses_delimiter() {
        assert_eq!(folder("[Gmail]/Trash", Some("/")).name(), "Trash");
        assert_eq!(folder("INBOX.Receipts", Some(".")).name(), "Receipts");
        assert_eq!(folder("INBOX", None).name(), "INBOX");
    }

    #[test]
    fn special_use_parse() {
        assert_eq!(SpecialUse::parse("\\Trash"), Some(SpecialUse::Trash));
        assert_eq!(SpecialUse::parse("\\Spam"), Some(SpecialUse::Junk));
        assert_eq!(SpecialUse::parse("\\HasNoChildren"), None);
    }

    #[test]
    fn head_uid_of_empty_folder_is_zero() {
        let status = FolderStatus {
            uid_validity: None,
            uid_next: 1,
            exists: 0,
        };
        assert_eq!(status.head_uid(), 0);

        let status = FolderStatus {
            uid_validity: None,
            uid_next: 0,
            exists: 0,
        };
        assert_eq!(status.head_uid(), 0);
    }
}
