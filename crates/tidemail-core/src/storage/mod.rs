//! Object storage for raw messages and attachments.

mod fs;
mod memory;

use async_trait::async_trait;
use tracing::warn;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

use crate::Result;

/// Bucket holding raw RFC 822 sources.
pub const RAW_BUCKET: &str = "raw";

/// Bucket holding decoded attachment bodies.
pub const ATTACHMENT_BUCKET: &str = "attachments";

/// Blob storage addressed by bucket and key. Writes overwrite.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `bucket`/`key`, replacing any previous object.
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()>;

    /// Reads an object, `None` if absent.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removes an object; removing a missing object succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Deletes stored objects by `(bucket, path)`, logging the ones that could
/// not be removed.
pub async fn delete_objects(storage: &dyn ObjectStore, locations: &[(String, String)]) {
    for (bucket, path) in locations {
        if let Err(e) = storage.delete(bucket, path).await {
            warn!(%bucket, %path, error = %e, "failed to delete stored object");
        }
    }
}

/// Key of a raw message within [`RAW_BUCKET`].
#[must_use]
pub fn raw_key(owner_id: &str, raw_storage_key: &str) -> String {
    format!("{owner_id}/{raw_storage_key}.eml")
}

/// Path of an attachment within [`ATTACHMENT_BUCKET`]. `upload_id` is
/// unique to one ingest of one message.
#[must_use]
pub fn attachment_path(owner_id: &str, upload_id: &str, index: usize, filename: &str) -> String {
    format!("{owner_id}/{upload_id}/{index}-{}", sanitize_filename(filename))
}

/// Reduces a filename to characters safe in a storage path.
#[must_use]
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.chars().take(128).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_tricks() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("report 2024.pdf"), "report_2024.pdf");
        assert_eq!(sanitize_filename("..."), "attachment");
        assert_eq!(sanitize_filename(""), "attachment");
    }

    #[test]
    fn keys_are_owner_scoped() {
        assert_eq!(raw_key("u1", "abc"), "u1/abc.eml");
        assert_eq!(
            attachment_path("u1", "9f2c-1", 0, "a b.txt"),
            "u1/9f2c-1/0-a_b.txt"
        );
    }
}
