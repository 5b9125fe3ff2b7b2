//! # tidemail-core
//!
//! Mailbox synchronization engine for tidemail.
//!
//! This crate provides:
//! - Mailbox reconciliation against the remote folder list
//! - Resumable history backfill under a per-identity byte budget
//! - Delta sync above the high-water mark, with observed-move detection
//! - Message ingestion with reply threading and attachment storage
//! - Per-mailbox thread rollups for thread-list views
//! - Flag, move and permanent-delete actions (remote best-effort, local
//!   transactional)
//! - Search index projection
//! - A durable job queue, worker and scheduler
//!
//! Everything is persisted in `SQLite` through [`db::Database`]; servers are
//! reached through the session actors of [`session::ConnectionManager`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod actions;
pub mod budget;
pub mod config;
pub mod counter;
pub mod db;
mod error;
pub mod identity;
pub mod ingest;
pub mod jobs;
pub mod mailbox;
pub mod message;
pub mod projection;
pub mod search;
pub mod session;
pub mod storage;
pub mod sync;
pub mod thread;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
