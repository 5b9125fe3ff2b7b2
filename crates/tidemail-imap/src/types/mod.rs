//! Core protocol types.

mod flags;
mod identifiers;
mod mailbox;
mod sequence;

pub use flags::{Flag, MessageFlags, StoreAction};
pub use identifiers::{Uid, UidValidity};
pub use mailbox::{FetchedMessage, FolderInfo, FolderStatus, SpecialUse};
pub use sequence::UidSet;
