use crate::engine::{Hit, RawEngineResponse};
use crate::error::{Result, SearchEngineError};
use crate::query::{self, GROUP_AGG, RELATED_GROUP_SIZE, SAMPLE_SIZE, TOP_HIT_AGG};
use crate::schema::UID_FIELD;
use crate::search::{SearchService, suggestion};
use crate::types::{AcField, IndexName, SelectionState, SuggestionGroup, TotalHits};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Suggestions for the still-empty fields given the fields already chosen
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedRequest {
    pub empty: Vec<AcField>,
    pub selection: SelectionState,
    pub index: Option<IndexName>,
}

impl RelatedRequest {
    pub fn new(
        empty: &[&str],
        selection: SelectionState,
        index: Option<IndexName>,
    ) -> Result<Self> {
        let mut fields = Vec::with_capacity(empty.len());
        for name in empty.iter().filter(|name| !name.is_empty()) {
            let field = AcField::parse(name)?;
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        if selection.is_empty() {
            return Err(SearchEngineError::argument(
                "\"selected\" needs at least one field with a value",
            ));
        }
        Ok(Self {
            empty: fields,
            selection,
            index,
        })
    }

    /// Parse the colon-joined `empty` parameter.
    pub fn parse(empty: &str, selection: SelectionState, index: Option<IndexName>) -> Result<Self> {
        let names: Vec<&str> = empty.split(':').map(str::trim).collect();
        Self::new(&names, selection, index)
    }

    /// A sample of matching documents is worth fetching once the selection
    /// pins down more than one field, or when nothing is left to suggest.
    pub fn wants_sample(&self) -> bool {
        self.selection.len() >= 2 || self.empty.is_empty()
    }

    fn filter_query(&self) -> Value {
        query::bool_query(Vec::new(), query::selection_filter(&self.selection))
    }

    pub fn field_body(&self, field: AcField) -> Value {
        json!({
            "query": self.filter_query(),
            "size": 0,
            "aggs": {
                GROUP_AGG: {
                    "terms": {
                        "field": field.norm_field(),
                        "size": RELATED_GROUP_SIZE,
                        "order": [{ "_count": "desc" }, { "_key": "asc" }]
                    },
                    "aggs": {
                        TOP_HIT_AGG: { "top_hits": { "size": 1 } }
                    }
                }
            }
        })
    }

    pub fn sample_body(&self) -> Value {
        json!({
            "query": self.filter_query(),
            "size": SAMPLE_SIZE,
            "sort": [{ UID_FIELD: { "order": "desc" } }]
        })
    }

    /// Indexes tried in turn for the sample: primary first unless restricted.
    fn sample_indices(&self) -> Vec<IndexName> {
        IndexName::targets(self.index)
    }
}

/// Suggestions for one empty field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSuggestions {
    pub total: TotalHits,
    pub suggestions: Vec<SuggestionGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedResponse {
    pub fields: BTreeMap<AcField, FieldSuggestions>,
    pub data: Vec<Hit>,
}

/// Unshaped engine responses, one per empty field plus the sample lookup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRelatedResponse {
    pub fields: BTreeMap<AcField, RawEngineResponse>,
    pub data: Option<RawEngineResponse>,
}

impl SearchService {
    pub async fn related(&self, request: &RelatedRequest) -> Result<RelatedResponse> {
        let indices = IndexName::targets(request.index);
        let lookups = request.empty.iter().map(|&field| {
            let indices = &indices;
            async move {
                let (_, response) = self.run(indices, request.field_body(field)).await?;
                let suggestions = response
                    .buckets(GROUP_AGG)?
                    .buckets
                    .iter()
                    .map(|bucket| suggestion(bucket, field, 0.0))
                    .collect::<Result<Vec<_>>>()?;
                Ok::<_, SearchEngineError>((
                    field,
                    FieldSuggestions {
                        total: response.total(),
                        suggestions,
                    },
                ))
            }
        });
        let fields = try_join_all(lookups).await?.into_iter().collect();

        let data = if request.wants_sample() {
            self.sample(request).await?
        } else {
            Vec::new()
        };
        Ok(RelatedResponse { fields, data })
    }

    pub async fn related_raw(&self, request: &RelatedRequest) -> Result<RawRelatedResponse> {
        let indices = IndexName::targets(request.index);
        let lookups = request.empty.iter().map(|&field| {
            let indices = &indices;
            async move {
                let raw = self.run_raw(indices, request.field_body(field)).await?;
                Ok::<_, SearchEngineError>((field, raw))
            }
        });
        let fields = try_join_all(lookups).await?.into_iter().collect();

        let data = if request.wants_sample() {
            let (first, _) = self.sample_lookup(request).await?;
            first
        } else {
            None
        };
        Ok(RawRelatedResponse { fields, data })
    }

    async fn sample(&self, request: &RelatedRequest) -> Result<Vec<Hit>> {
        Ok(self.sample_lookup(request).await?.1)
    }

    /// Try each index in turn until one returns documents.
    async fn sample_lookup(&self, request: &RelatedRequest) -> Result<(Option<RawEngineResponse>, Vec<Hit>)> {
        let mut last = None;
        for index in request.sample_indices() {
            let (raw, response) = self.run(&[index], request.sample_body()).await?;
            let hits = response.hits.hits;
            if !hits.is_empty() {
                return Ok((Some(RawEngineResponse(raw)), hits));
            }
            last = Some(RawEngineResponse(raw));
        }
        Ok((last, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queen() -> SelectionState {
        SelectionState::new().with(AcField::ArtistName, "Queen")
    }

    #[test]
    fn test_parse_empty_fields() {
        let request = RelatedRequest::parse("song_name:release_title:song_name", queen(), None).unwrap();
        assert_eq!(request.empty, vec![AcField::SongName, AcField::ReleaseTitle]);
        assert!(!request.wants_sample());

        let request = RelatedRequest::parse("", queen(), None).unwrap();
        assert!(request.empty.is_empty());
        assert!(request.wants_sample());
    }

    #[test]
    fn test_requires_selection() {
        let err = RelatedRequest::parse("song_name", SelectionState::new(), None).unwrap_err();
        assert!(err.is_caller_error());
        let err = RelatedRequest::parse("composer", queen(), None).unwrap_err();
        assert!(matches!(err, SearchEngineError::InvalidField(_)));
    }

    #[test]
    fn test_field_body_orders_by_count() {
        let request = RelatedRequest::parse("release_title", queen(), None).unwrap();
        let body = request.field_body(AcField::ReleaseTitle);
        let terms = &body["aggs"][GROUP_AGG]["terms"];
        assert_eq!(terms["field"], "release_title.norm");
        assert_eq!(terms["order"][0], json!({"_count": "desc"}));
        assert_eq!(body["query"]["bool"]["filter"][0]["term"]["artist_name.norm"], "Queen");
    }

    #[test]
    fn test_sample_indices_primary_first() {
        let request = RelatedRequest::parse("", queen(), None).unwrap();
        assert_eq!(request.sample_indices(), vec![IndexName::Epf, IndexName::Spins]);
        let request = RelatedRequest::parse("", queen(), Some(IndexName::Spins)).unwrap();
        assert_eq!(request.sample_indices(), vec![IndexName::Spins]);
        assert_eq!(request.sample_body()["size"], SAMPLE_SIZE);
    }
}
