use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{SearchDocument, SearchIndex};
use crate::Result;

/// In-process index. Matches by case-insensitive substring.
#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    documents: Mutex<BTreeMap<String, SearchDocument>>,
}

impl MemorySearchIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SearchDocument>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a document by key.
    #[must_use]
    pub fn document(&self, id: &str) -> Option<SearchDocument> {
        self.lock().get(id).cloned()
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Keys of documents whose subject, body or addresses contain `query`.
    #[must_use]
    pub fn search(&self, owner_id: &str, query: &str) -> Vec<String> {
        let needle = query.to_lowercase();
        self.lock()
            .values()
            .filter(|doc| doc.owner_id == owner_id)
            .filter(|doc| {
                doc.subject.to_lowercase().contains(&needle)
                    || doc.body.to_lowercase().contains(&needle)
                    || doc
                        .from
                        .iter()
                        .chain(&doc.recipients)
                        .any(|a| a.to_lowercase().contains(&needle))
            })
            .map(|doc| doc.id.clone())
            .collect()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, document: &SearchDocument) -> Result<()> {
        self.lock().insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.lock().remove(id);
        Ok(())
    }

    async fn import(&self, documents: &[SearchDocument]) -> Result<()> {
        let mut index = self.lock();
        for document in documents {
            index.insert(document.id.clone(), document.clone());
        }
        Ok(())
    }

    async fn drop_collection(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
}
