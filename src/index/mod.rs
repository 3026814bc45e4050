use crate::config::AppConfig;
use crate::engine::{IndexStats, SharedGateway};
use crate::error::Result;
use crate::schema::IndexSchema;
use crate::types::IndexName;
use serde_json::{Value, json};
use std::future::Future;

/// Index lifecycle on the search engine: creation, reset, settings and bulk-load tuning
#[derive(Clone)]
pub struct IndexManager {
    gateway: SharedGateway,
    shards: u32,
    replicas: u32,
}

impl IndexManager {
    pub fn new(gateway: SharedGateway, shards: u32, replicas: u32) -> Self {
        Self {
            gateway,
            shards,
            replicas,
        }
    }

    /// Shard and replica counts for the configured environment
    pub fn from_config(gateway: SharedGateway, config: &AppConfig) -> Self {
        Self::new(
            gateway,
            config.index.shards(config.environment),
            config.index.replicas(config.environment),
        )
    }

    pub fn gateway(&self) -> &SharedGateway {
        &self.gateway
    }

    pub fn replicas(&self) -> u32 {
        self.replicas
    }

    /// Create the index with its mapping unless it already exists.
    ///
    /// Returns `true` when the index was created.
    pub async fn ensure(&self, index: IndexName) -> Result<bool> {
        if self.gateway.index_exists(index).await? {
            return Ok(false);
        }
        let body = IndexSchema::for_index(index).create_body(self.shards, self.replicas);
        self.gateway.create_index(index, &body).await?;
        Ok(true)
    }

    /// Delete and recreate the index. Destroys every document in it.
    pub async fn reset(&self, index: IndexName) -> Result<()> {
        if self.gateway.index_exists(index).await? {
            tracing::warn!("Resetting index: {}", index);
            self.gateway.delete_index(index).await?;
        }
        self.ensure(index).await?;
        Ok(())
    }

    /// Re-apply analysis settings and mappings to an existing index.
    ///
    /// Analysis settings can only change while the index is closed, so the
    /// index is closed first and reopened even when the update fails.
    pub async fn apply_settings(&self, index: IndexName) -> Result<()> {
        if self.ensure(index).await? {
            return Ok(());
        }
        let schema = IndexSchema::for_index(index);
        self.gateway.close_index(index).await?;
        let updated = async {
            self.gateway
                .put_settings(index, &json!({ "analysis": IndexSchema::analysis() }))
                .await?;
            self.gateway.put_mapping(index, &schema.mappings()).await
        }
        .await;
        self.gateway.open_index(index).await?;
        updated?;
        tracing::info!("Applied settings and mappings to index: {}", index);
        Ok(())
    }

    /// Run `work` with refresh disabled and no replicas on `index`.
    ///
    /// Normal settings are restored on every exit path; an error from `work`
    /// wins over an error from the restore.
    pub async fn with_relaxed_write_settings<F, Fut, T>(&self, index: IndexName, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.gateway
            .put_settings(index, &relaxed_settings())
            .await?;
        tracing::info!("Relaxed write settings on index: {}", index);

        let outcome = work().await;

        let restored = self
            .gateway
            .put_settings(index, &restored_settings(self.replicas))
            .await;
        match (outcome, restored) {
            (Ok(value), Ok(())) => {
                tracing::info!("Restored write settings on index: {}", index);
                Ok(value)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), restored) => {
                if let Err(restore_err) = restored {
                    tracing::error!(
                        "Failed to restore settings on index {}: {}",
                        index,
                        restore_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Refresh and merge after a bulk load, then report the index size.
    pub async fn finish_bulk_load(&self, index: IndexName) -> Result<IndexStats> {
        self.gateway.refresh(index).await?;
        self.gateway.force_merge(index).await?;
        self.gateway.stats(index).await
    }

    /// Highest value of a numeric field in the index, `None` when empty.
    pub async fn max_value(&self, index: IndexName, field: &str) -> Result<Option<f64>> {
        let body = json!({
            "size": 0,
            "aggs": { "max_value": { "max": { "field": field } } }
        });
        let (_, response) = crate::engine::execute(self.gateway.as_ref(), &[index], &body).await?;
        response.metric("max_value")
    }
}

fn relaxed_settings() -> Value {
    json!({ "refresh_interval": "-1", "number_of_replicas": 0 })
}

/// `null` resets the refresh interval to the engine default.
fn restored_settings(replicas: u32) -> Value {
    json!({ "refresh_interval": null, "number_of_replicas": replicas })
}
