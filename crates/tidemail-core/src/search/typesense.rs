//! Typesense HTTP client.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{SearchDocument, SearchIndex};
use crate::config::SearchConfig;
use crate::{Error, Result};

const API_KEY_HEADER: &str = "X-TYPESENSE-API-KEY";

/// One line of an import response.
#[derive(Debug, Deserialize)]
struct ImportResult {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Index backed by a Typesense collection.
#[derive(Debug)]
pub struct TypesenseIndex {
    http_client: Client,
    base_url: String,
    api_key: String,
    collection: String,
    ready: AtomicBool,
}

impl TypesenseIndex {
    /// Creates a client for `base_url` (e.g. `http://localhost:8108`).
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            collection: collection.into(),
            ready: AtomicBool::new(false),
        }
    }

    /// Creates a client from configuration, `None` when no URL is set.
    #[must_use]
    pub fn from_config(config: &SearchConfig) -> Option<Self> {
        config
            .url
            .as_ref()
            .map(|url| Self::new(url, &config.api_key, &config.collection))
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(API_KEY_HEADER, &self.api_key)
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "name": self.collection,
            "default_sorting_field": "date",
            "fields": [
                { "name": "owner_id", "type": "string", "facet": true },
                { "name": "identity_id", "type": "int64", "facet": true },
                { "name": "mailbox_id", "type": "int64", "facet": true },
                { "name": "mailbox_slug", "type": "string", "facet": true },
                { "name": "thread_id", "type": "int64" },
                { "name": "thread_list_id", "type": "int64", "optional": true },
                { "name": "subject", "type": "string" },
                { "name": "snippet", "type": "string" },
                { "name": "body", "type": "string" },
                { "name": "from", "type": "string[]" },
                { "name": "recipients", "type": "string[]" },
                { "name": "participants", "type": "string[]" },
                { "name": "date", "type": "int64" },
                { "name": "seen", "type": "bool", "facet": true },
                { "name": "flagged", "type": "bool", "facet": true },
                { "name": "starred", "type": "bool", "facet": true },
                { "name": "has_attachments", "type": "bool", "facet": true }
            ]
        })
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Search(format!("{status}: {body}")))
}

#[async_trait]
impl SearchIndex for TypesenseIndex {
    async fn ensure_collection(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let response = self
            .authorized(self.http_client.get(self.collection_url()))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            let response = self
                .authorized(
                    self.http_client
                        .post(format!("{}/collections", self.base_url)),
                )
                .json(&self.schema())
                .send()
                .await?;
            // A concurrent creator wins the race with 409; the collection exists either way.
            if response.status() != StatusCode::CONFLICT {
                check(response).await?;
            }
            info!(collection = %self.collection, "created search collection");
        } else {
            check(response).await?;
        }

        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn upsert(&self, document: &SearchDocument) -> Result<()> {
        self.ensure_collection().await?;
        let response = self
            .authorized(
                self.http_client
                    .post(format!("{}/documents", self.collection_url())),
            )
            .query(&[("action", "upsert")])
            .json(document)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .authorized(
                self.http_client
                    .delete(format!("{}/documents/{id}", self.collection_url())),
            )
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(id, "search document already absent");
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    async fn import(&self, documents: &[SearchDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        self.ensure_collection().await?;

        let mut body = String::new();
        for document in documents {
            body.push_str(&serde_json::to_string(document)?);
            body.push('\n');
        }

        let response = self
            .authorized(
                self.http_client
                    .post(format!("{}/documents/import", self.collection_url())),
            )
            .query(&[("action", "upsert")])
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await?;
        let text = check(response).await?.text().await?;

        let failures: Vec<String> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<ImportResult>(line).ok())
            .filter(|result| !result.success)
            .map(|result| result.error.unwrap_or_default())
            .collect();

        if let Some(first) = failures.first() {
            return Err(Error::Search(format!(
                "{} of {} documents failed to import: {first}",
                failures.len(),
                documents.len()
            )));
        }
        Ok(())
    }

    async fn drop_collection(&self) -> Result<()> {
        self.ready.store(false, Ordering::Release);
        let response = self
            .authorized(self.http_client.delete(self.collection_url()))
            .send()
            .await?;
        if response.status() != StatusCode::NOT_FOUND {
            check(response).await?;
        }
        Ok(())
    }
}
