//! Ingested messages and their attachments.

mod model;
mod repository;

pub use model::{Attachment, AttachmentId, EmailAddress, Message, MessageFlag, MessageId};
pub use repository::MessageRepository;
