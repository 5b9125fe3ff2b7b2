//! Mailboxes (folders) and their synchronization cursors.
//!
//! Mailbox rows are written only by the reconciler. Each synced mailbox has
//! one [`SyncCursor`] recording how far backfill and delta have progressed.

mod model;
mod repository;

pub use model::{Mailbox, MailboxId, MailboxKind, MailboxStatusView, SyncCursor, SyncPhase, slugify};
pub use repository::MailboxRepository;
