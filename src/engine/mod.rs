pub mod http;
pub mod memory;
pub mod response;

use crate::error::Result;
use crate::schema::SearchDocument;
use crate::types::IndexName;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub use http::HttpGateway;
pub use memory::MemoryGateway;
pub use response::{Bucket, BucketAgg, EngineResponse, Hit, RawEngineResponse};

/// Document count and on-disk size of an index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub doc_count: u64,
    pub size_in_bytes: u64,
}

/// Everything the search and harvest layers need from the document search engine
#[async_trait]
pub trait SearchGateway: Send + Sync {
    /// Run a query body against one or more indexes and return the raw response.
    async fn search(&self, indices: &[IndexName], body: &Value) -> Result<Value>;

    /// Index (upsert) a batch of documents in one request.
    async fn bulk(&self, index: IndexName, documents: &[SearchDocument]) -> Result<()>;

    async fn index_exists(&self, index: IndexName) -> Result<bool>;

    async fn create_index(&self, index: IndexName, body: &Value) -> Result<()>;

    async fn delete_index(&self, index: IndexName) -> Result<()>;

    async fn put_settings(&self, index: IndexName, settings: &Value) -> Result<()>;

    async fn put_mapping(&self, index: IndexName, mappings: &Value) -> Result<()>;

    async fn open_index(&self, index: IndexName) -> Result<()>;

    async fn close_index(&self, index: IndexName) -> Result<()>;

    async fn refresh(&self, index: IndexName) -> Result<()>;

    async fn force_merge(&self, index: IndexName) -> Result<()>;

    async fn stats(&self, index: IndexName) -> Result<IndexStats>;

    /// Number of searchable documents in an index.
    async fn count(&self, index: IndexName) -> Result<u64>;
}

pub type SharedGateway = Arc<dyn SearchGateway>;

/// Run a search and decode it; returns the raw value alongside the typed view.
pub async fn execute(
    gateway: &dyn SearchGateway,
    indices: &[IndexName],
    body: &Value,
) -> Result<(Value, EngineResponse)> {
    let raw = gateway.search(indices, body).await?;
    let response = EngineResponse::from_raw(&raw)?;
    tracing::debug!(took_ms = response.took, "Search completed");
    Ok((raw, response))
}
