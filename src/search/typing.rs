use crate::engine::RawEngineResponse;
use crate::error::{Result, SearchEngineError};
use crate::query::{self, DISTINCT_AGG, GROUP_AGG, MAX_SCORE_AGG, TOP_HIT_AGG, TYPING_GROUP_SIZE};
use crate::search::{SearchService, suggestion};
use crate::types::{AcField, IndexName, SelectionState, SuggestionGroup, TotalHits};
use serde::Serialize;
use serde_json::{Value, json};

/// Autocomplete request for one field
#[derive(Debug, Clone, PartialEq)]
pub struct TypingRequest {
    pub field: AcField,
    pub query: String,
    pub selection: SelectionState,
    pub index: Option<IndexName>,
}

impl TypingRequest {
    /// Validates the field name and query before anything reaches the engine.
    pub fn new(
        field: &str,
        query: impl Into<String>,
        selection: SelectionState,
        index: Option<IndexName>,
    ) -> Result<Self> {
        let field = AcField::parse(field)?;
        let query = query.into();
        if query.trim().is_empty() {
            return Err(SearchEngineError::argument("\"query\" is required"));
        }
        Ok(Self {
            field,
            query,
            selection,
            index,
        })
    }

    pub fn body(&self) -> Value {
        let filter = query::selection_filter(&self.selection);
        let norm = self.field.norm_field();
        json!({
            "query": query::bool_query(vec![query::full_text(self.field, &self.query)], filter),
            "size": 0,
            "aggs": {
                GROUP_AGG: {
                    "terms": {
                        "field": norm,
                        "size": TYPING_GROUP_SIZE,
                        "order": [
                            { MAX_SCORE_AGG: "desc" },
                            { "_count": "desc" },
                            { "_key": "asc" }
                        ]
                    },
                    "aggs": {
                        MAX_SCORE_AGG: { "max": { "script": { "source": "_score" } } },
                        TOP_HIT_AGG: { "top_hits": { "size": 1 } }
                    }
                },
                DISTINCT_AGG: query::cardinality(&norm)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingResponse {
    pub took: u64,
    /// Matching documents
    pub total: TotalHits,
    /// Approximate number of distinct values matching
    pub distinct: u64,
    pub max_score: f64,
    pub suggestions: Vec<SuggestionGroup>,
}

impl SearchService {
    pub async fn typing(&self, request: &TypingRequest) -> Result<TypingResponse> {
        let (_, response) = self
            .run(&IndexName::targets(request.index), request.body())
            .await?;

        let suggestions = response
            .buckets(GROUP_AGG)?
            .buckets
            .iter()
            .map(|bucket| {
                let score = bucket.metric(MAX_SCORE_AGG)?.unwrap_or(0.0);
                suggestion(bucket, request.field, score)
            })
            .collect::<Result<Vec<_>>>()?;
        let max_score = suggestions.iter().map(|s| s.score).fold(0.0, f64::max);

        Ok(TypingResponse {
            took: response.took,
            total: response.total(),
            distinct: response.metric(DISTINCT_AGG)?.unwrap_or(0.0) as u64,
            max_score,
            suggestions,
        })
    }

    pub async fn typing_raw(&self, request: &TypingRequest) -> Result<RawEngineResponse> {
        self.run_raw(&IndexName::targets(request.index), request.body())
            .await
    }
}
