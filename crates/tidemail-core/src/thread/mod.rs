//! Conversations and their mailbox-scoped rollups.
//!
//! A [`Thread`] groups messages linked by In-Reply-To/References. The same
//! thread can show up in several mailboxes, so the list view reads
//! [`MailboxThreadSummary`] rows, one per thread × mailbox.

mod model;
mod repository;

pub use model::{MailboxThreadSummary, PARTICIPANTS_PER_ROLE, Participants, Thread, ThreadId, ThreadListId};
pub use repository::{SummaryRepository, ThreadRepository};
