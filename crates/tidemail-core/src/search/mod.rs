//! Full-text search projection.
//!
//! The index is never authoritative: every document is derived from a
//! message row and its thread-list row, and the whole collection can be
//! rebuilt from the database at any time.

mod document;
mod memory;
mod typesense;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

pub use document::SearchDocument;
pub use memory::MemorySearchIndex;
pub use typesense::TypesenseIndex;

use crate::{Error, Result};
use crate::db::Database;
use crate::mailbox::MailboxId;
use crate::message::{Message, MessageId, MessageRepository};
use crate::thread::{MailboxThreadSummary, SummaryRepository, ThreadId};

/// An external document index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates the collection if it does not exist.
    async fn ensure_collection(&self) -> Result<()>;

    /// Inserts or replaces one document.
    async fn upsert(&self, document: &SearchDocument) -> Result<()>;

    /// Removes a document; a missing document is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Inserts or replaces many documents.
    async fn import(&self, documents: &[SearchDocument]) -> Result<()>;

    /// Removes the whole collection.
    async fn drop_collection(&self) -> Result<()>;
}

/// Keeps the search index in line with the message table.
#[derive(Clone)]
pub struct SearchIndexSync {
    index: Arc<dyn SearchIndex>,
    messages: MessageRepository,
    summaries: SummaryRepository,
    batch_size: u32,
}

impl std::fmt::Debug for SearchIndexSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndexSync")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl SearchIndexSync {
    /// Creates a projector over the database and an index.
    #[must_use]
    pub fn new(db: &Database, index: Arc<dyn SearchIndex>, batch_size: u32) -> Self {
        Self {
            index,
            messages: MessageRepository::new(db),
            summaries: SummaryRepository::new(db),
            batch_size: batch_size.max(1),
        }
    }

    async fn document(
        &self,
        message: &Message,
        cache: &mut HashMap<(ThreadId, MailboxId), Option<MailboxThreadSummary>>,
    ) -> Result<SearchDocument> {
        let key = (message.thread_id, message.mailbox_id);
        if !cache.contains_key(&key) {
            let summary = self.summaries.find(key.0, key.1).await?;
            cache.insert(key, summary);
        }
        let summary = cache.get(&key).and_then(Option::as_ref);
        Ok(SearchDocument::build(message, summary))
    }

    /// Upserts the document of one message. A message that no longer
    /// exists is removed from the index instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or the index fails.
    pub async fn index_message(&self, id: MessageId) -> Result<()> {
        let Some(message) = self.messages.get(id).await? else {
            debug!(message_id = %id, "message gone, dropping from index");
            return self.delete_message(id).await;
        };

        let document = self.document(&message, &mut HashMap::new()).await?;
        self.index.upsert(&document).await
    }

    /// Removes the document of one message. A document the index does
    /// not have counts as removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the index fails.
    pub async fn delete_message(&self, id: MessageId) -> Result<()> {
        match self.index.delete(&SearchDocument::key(id)).await {
            Err(Error::NotFound(_)) => {
                debug!(message_id = %id, "search document already absent");
                Ok(())
            }
            other => other,
        }
    }

    /// Re-derives every document of a thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or the index fails.
    pub async fn refresh_thread(&self, thread_id: ThreadId) -> Result<usize> {
        let messages = self.messages.list_thread(thread_id).await?;
        let mut cache = HashMap::new();
        let mut documents = Vec::with_capacity(messages.len());
        for message in &messages {
            documents.push(self.document(message, &mut cache).await?);
        }

        self.index.import(&documents).await?;
        debug!(%thread_id, documents = documents.len(), "refreshed thread documents");
        Ok(documents.len())
    }

    /// Recreates the collection from scratch and re-indexes every message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or the index fails.
    pub async fn rebuild(&self) -> Result<usize> {
        self.index.drop_collection().await?;
        self.index.ensure_collection().await?;

        let mut cache = HashMap::new();
        let mut after = None;
        let mut total = 0;

        loop {
            let ids = self.messages.ids_after(after, self.batch_size).await?;
            let Some(&last) = ids.last() else { break };

            let mut documents = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(message) = self.messages.get(id).await? {
                    documents.push(self.document(&message, &mut cache).await?);
                }
            }
            self.index.import(&documents).await?;

            total += documents.len();
            after = Some(last);
            cache.clear();
            debug!(indexed = total, "rebuild batch done");
        }

        info!(documents = total, "search index rebuilt");
        Ok(total)
    }
}
