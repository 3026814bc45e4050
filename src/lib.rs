//! # spinsearch
//!
//! Music metadata search on top of an Elasticsearch-compatible engine:
//! - Typing suggestions grouped by normalized value, fuzzy and prefix tolerant
//! - Related suggestions for the fields still empty given the chosen ones
//! - Chart browsing of songs, artists and releases with offset or cursor paging
//! - Concurrent batched harvesting of spin logs and the EPF dump into the indexes

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod harvest;
pub mod index;
pub mod query;
pub mod schema;
pub mod search;
pub mod types;

// Re-export commonly used types
pub use config::{AppConfig, EngineConfig, Environment};
pub use engine::{HttpGateway, MemoryGateway, SearchGateway, SharedGateway};
pub use error::{Result, SearchEngineError};
pub use harvest::{HarvestOptions, HarvestReport, Harvester};
pub use index::IndexManager;
pub use schema::{IndexSchema, SearchDocument};
pub use search::{ChartRequest, ChartType, RelatedRequest, SearchService, TypingRequest};
pub use types::{AcField, IndexName, SelectionState, SortOrder, SortSpec, SuggestionGroup, TotalHits};

use std::sync::Arc;

/// Convenience function to connect a gateway to the configured engine
pub fn create_gateway(config: &EngineConfig) -> Result<SharedGateway> {
    Ok(Arc::new(HttpGateway::new(config.clone())?))
}

/// Convenience function to create a search service over the configured engine
pub fn create_search_service(config: &EngineConfig) -> Result<SearchService> {
    Ok(SearchService::new(create_gateway(config)?, config.timeout_secs))
}

/// Builder pattern for creating engine configurations
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.config.timeout_secs = timeout_secs;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
