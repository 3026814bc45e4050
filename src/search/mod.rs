pub mod chart;
pub mod related;
pub mod typing;

use crate::engine::{self, Bucket, EngineResponse, RawEngineResponse, SharedGateway};
use crate::error::Result;
use crate::query::TOP_HIT_AGG;
use crate::types::{AcField, IndexName, SuggestionGroup};
use serde_json::Value;

pub use chart::{ChartPage, ChartRequest, ChartRow, ChartType, GroupRow, Pagination, SongRow};
pub use related::{FieldSuggestions, RawRelatedResponse, RelatedRequest, RelatedResponse};
pub use typing::{TypingRequest, TypingResponse};

/// Entry point for the typing, related and chart searches
///
/// Each search comes in two flavours: a shaped method returning typed rows and
/// a `*_raw` method returning the engine response untouched for debugging.
#[derive(Clone)]
pub struct SearchService {
    gateway: SharedGateway,
    timeout: String,
}

impl SearchService {
    pub fn new(gateway: SharedGateway, timeout_secs: u64) -> Self {
        Self {
            gateway,
            timeout: format!("{}s", timeout_secs),
        }
    }

    pub fn gateway(&self) -> &SharedGateway {
        &self.gateway
    }

    /// Run `body` with the engine-side timeout applied.
    async fn run(&self, indices: &[IndexName], mut body: Value) -> Result<(Value, EngineResponse)> {
        body["timeout"] = Value::String(self.timeout.clone());
        engine::execute(self.gateway.as_ref(), indices, &body).await
    }

    async fn run_raw(&self, indices: &[IndexName], body: Value) -> Result<RawEngineResponse> {
        let (raw, _) = self.run(indices, body).await?;
        Ok(RawEngineResponse(raw))
    }
}

/// Shape one `groupByName` bucket into a suggestion.
///
/// The display value comes from the exemplar document so the original
/// spelling survives; the bucket key is the lowercased form.
pub(crate) fn suggestion(bucket: &Bucket, field: AcField, score: f64) -> Result<SuggestionGroup> {
    let hit = bucket.top_hit(TOP_HIT_AGG)?;
    let value = hit
        .as_ref()
        .and_then(|h| h.source_str(field.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| bucket.key_str());
    let (exemplar_id, exemplar_index) = hit
        .map(|h| (h.id, h.index))
        .unwrap_or_default();
    Ok(SuggestionGroup {
        value,
        score,
        count: bucket.doc_count,
        exemplar_id,
        exemplar_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_suggestion_prefers_exemplar_spelling() {
        let bucket: Bucket = serde_json::from_value(json!({
            "key": "ac/dc",
            "doc_count": 3,
            "topHits": {"hits": {"hits": [
                {"_id": "9", "_index": "spins", "_score": 1.0, "_source": {"artist_name": "AC/DC"}}
            ]}}
        }))
        .unwrap();
        let group = suggestion(&bucket, AcField::ArtistName, 1.5).unwrap();
        assert_eq!(group.value, "AC/DC");
        assert_eq!(group.count, 3);
        assert_eq!(group.exemplar_id, "9");
        assert_eq!(group.exemplar_index, "spins");
    }

    #[test]
    fn test_suggestion_without_exemplar() {
        let bucket: Bucket = serde_json::from_value(json!({"key": "abba", "doc_count": 1})).unwrap();
        let group = suggestion(&bucket, AcField::ArtistName, 0.0).unwrap();
        assert_eq!(group.value, "abba");
        assert!(group.exemplar_id.is_empty());
    }
}
