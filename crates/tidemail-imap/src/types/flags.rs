//! Message flags.

/// A system or keyword flag on a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Message has been read.
    Seen,
    /// Message has been answered.
    Answered,
    /// Message is flagged for special attention.
    Flagged,
    /// Message is marked for deletion.
    Deleted,
    /// Message is a draft.
    Draft,
    /// Custom keyword flag.
    Keyword(String),
}

impl Flag {
    /// Parses a flag string.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "\\SEEN" => Self::Seen,
            "\\ANSWERED" => Self::Answered,
            "\\FLAGGED" => Self::Flagged,
            "\\DELETED" => Self::Deleted,
            "\\DRAFT" => Self::Draft,
            _ => Self::Keyword(s.to_string()),
        }
    }

    /// Returns the flag as an IMAP string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Seen => "\\Seen",
            Self::Answered => "\\Answered",
            Self::Flagged => "\\Flagged",
            Self::Deleted => "\\Deleted",
            Self::Draft => "\\Draft",
            Self::Keyword(s) => s,
        }
    }
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The four system flags the sync engine mirrors locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct MessageFlags {
    /// `\Seen`.
    pub seen: bool,
    /// `\Answered`.
    pub answered: bool,
    /// `\Flagged`.
    pub flagged: bool,
    /// `\Draft`.
    pub draft: bool,
}

impl MessageFlags {
    /// Collapses a flag list into the mirrored system flags.
    #[must_use]
    pub fn from_flags<'a, I>(flags: I) -> Self
    where
        I: IntoIterator<Item = &'a Flag>,
    {
        let mut out = Self::default();
        for flag in flags {
            match flag {
                Flag::Seen => out.seen = true,
                Flag::Answered => out.answered = true,
                Flag::Flagged => out.flagged = true,
                Flag::Draft => out.draft = true,
                Flag::Deleted | Flag::Keyword(_) => {}
            }
        }
        out
    }
}

/// Flag mutation applied with UID STORE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAction {
    /// Add flags (`+FLAGS`).
    Add(Vec<Flag>),
    /// Remove flags (`-FLAGS`).
    Remove(Vec<Flag>),
}

impl StoreAction {
    /// Renders the STORE data item, silenced so the server skips untagged FETCH replies.
    #[must_use]
    pub fn to_query(&self) -> String {
        let (sign, flags) = match self {
            Self::Add(flags) => ('+', flags),
            Self::Remove(flags) => ('-', flags),
        };
        let list: Vec<&str> = flags.iter().map(Flag::as_str).collect();
        format!("{sign}FLAGS.SILENT ({})", list.join(" "))
    }

    /// The flags this action touches.
    #[must_use]
    pub fn flags(&self) -> &[Flag] {
        match self {
            Self::Add(flags) | Self::Remove(flags) => flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Flag::parse("\\seen"), Flag::Seen);
        assert_eq!(Flag::parse("\\FLAGGED"), Flag::Flagged);
        assert_eq!(Flag::parse("$Forwarded"), Flag::Keyword("$Forwarded".into()));
    }

    #[test]
    fn store_query_rendering() {
        let add = StoreAction::Add(vec![Flag::Flagged]);
        assert_eq!(add.to_query(), "+FLAGS.SILENT (\\Flagged)");

        let remove = StoreAction::Remove(vec![Flag::Seen, Flag::Answered]);
        assert_eq!(remove.to_query(), "-FLAGS.SILENT (\\Seen \\Answered)");
    }

    #[test]
    fn message_flags_ignore_deleted_and_keywords() {
        let flags = [
            Flag::Seen,
            Flag::Deleted,
            Flag::Keyword("$Junk".into()),
            Flag::Flagged,
        ];
        let mirrored = MessageFlags::from_flags(&flags);
        assert!(mirrored.seen);
        assert!(mirrored.flagged);
        assert!(!mirrored.answered);
        assert!(!mirrored.draft);
    }
}
