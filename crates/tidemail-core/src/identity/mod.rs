//! Connected mailbox accounts.
//!
//! An identity carries the endpoint and credentials used to open its
//! protocol session, and owns the mailboxes discovered on that server.

mod model;
mod repository;

pub use model::{Identity, IdentityId};
pub use repository::IdentityRepository;
