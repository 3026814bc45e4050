//! Pure builders turning logical search requests into engine query DSL.

use crate::error::{Result, SearchEngineError};
use crate::schema::range::{parse_date_range, parse_numeric_range, render_date};
use crate::schema::{self, FilterKind};
use crate::types::{AcField, SelectionState, SortOrder};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value, json};

/// Distinct suggestions returned per typing request
pub const TYPING_GROUP_SIZE: usize = 50;
/// Distinct suggestions returned per empty field in related search
pub const RELATED_GROUP_SIZE: usize = 100;
/// Matching documents previewed by related search
pub const SAMPLE_SIZE: usize = 50;
/// Distinct side-attribute values collected per chart group
pub const ATTRIBUTE_SIZE: usize = 1000;
/// Deepest window a top-N terms aggregation may request
pub const MAX_TERMS_WINDOW: usize = 10_000;

pub const GROUP_AGG: &str = "groupByName";
pub const MAX_SCORE_AGG: &str = "maxScore";
pub const TOP_HIT_AGG: &str = "topHits";
pub const DISTINCT_AGG: &str = "distinct";

/// Exact, case-insensitive match of every selected field on its `.norm` form.
pub fn selection_filter(selection: &SelectionState) -> Vec<Value> {
    selection
        .iter()
        .map(|(field, value)| json!({ "term": { field.norm_field(): value } }))
        .collect()
}

/// Typo-tolerant match on an autocomplete field.
///
/// `AUTO` fuzziness allows no edits below three characters, one edit up to
/// five and two above; every query token must match.
pub fn fuzzy_match(field: AcField, text: &str) -> Value {
    json!({
        "match": {
            field.as_str(): {
                "query": text,
                "fuzziness": "AUTO",
                "operator": "and",
                "prefix_length": 2
            }
        }
    })
}

/// Non-fuzzy twin of [`fuzzy_match`] lifting verbatim matches above typo matches.
pub fn exact_booster(field: AcField, text: &str) -> Value {
    json!({
        "match": {
            field.as_str(): {
                "query": text,
                "operator": "and",
                "boost": 2
            }
        }
    })
}

pub fn full_text(field: AcField, text: &str) -> Value {
    json!({
        "bool": {
            "must": [fuzzy_match(field, text)],
            "should": [exact_booster(field, text)]
        }
    })
}

/// Combine scoring and non-scoring clauses; no clauses at all matches everything.
pub fn bool_query(must: Vec<Value>, filter: Vec<Value>) -> Value {
    if must.is_empty() && filter.is_empty() {
        return json!({ "match_all": {} });
    }
    let mut clauses = Map::new();
    if !must.is_empty() {
        clauses.insert("must".to_string(), Value::Array(must));
    }
    if !filter.is_empty() {
        clauses.insert("filter".to_string(), Value::Array(filter));
    }
    json!({ "bool": clauses })
}

/// Clause derived from one free-text field filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldClause {
    /// Scoring clause for autocomplete fields
    pub full_text: Option<Value>,
    /// Non-scoring clause for attribute fields
    pub filter: Option<Value>,
}

impl FieldClause {
    pub fn is_empty(&self) -> bool {
        self.full_text.is_none() && self.filter.is_none()
    }
}

/// Turn `value` typed into the filter box of `field` into an engine clause.
///
/// Unknown or unsearchable fields are an `InvalidField` error; a malformed
/// range, date or flag value produces an empty clause instead.
pub fn full_text_or_filter(field: &str, value: &str) -> Result<FieldClause> {
    let value = value.trim();
    let field_type = schema::field_type(field).ok_or_else(|| SearchEngineError::invalid_field(field))?;
    if value.is_empty() {
        return Ok(FieldClause::default());
    }
    let clause = match field_type.filter_kind() {
        FilterKind::FullText => FieldClause {
            full_text: Some(full_text(AcField::parse(field)?, value)),
            filter: None,
        },
        FilterKind::Range => FieldClause {
            full_text: None,
            filter: parse_numeric_range(value).map(|range| range.to_clause(field, |v| json!(v))),
        },
        FilterKind::DateRange => FieldClause {
            full_text: None,
            filter: parse_date_range(value).map(|range| range.to_clause(field, render_date)),
        },
        FilterKind::Prefix => FieldClause {
            full_text: None,
            filter: Some(json!({
                "prefix": { field: { "value": value, "case_insensitive": true } }
            })),
        },
        FilterKind::Flag => FieldClause {
            full_text: None,
            filter: parse_flag(value).map(|flag| json!({ "term": { field: flag } })),
        },
        FilterKind::Unsupported => return Err(SearchEngineError::invalid_field(field)),
    };
    if clause.is_empty() {
        tracing::debug!("Dropping malformed filter {}={:?}", field, value);
    }
    Ok(clause)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn cardinality(field: &str) -> Value {
    json!({ "cardinality": { "field": field } })
}

/// How grouped chart rows are ordered and paged
#[derive(Debug, Clone, PartialEq)]
pub enum GroupStrategy {
    /// Most documents first; page `page` is cut from a window of `page_size * (page + 1)` groups.
    TopN { page: usize, page_size: usize },
    /// Ordered by the grouped value, resuming after a composite key.
    Cursor {
        page_size: usize,
        order: SortOrder,
        after: Option<Map<String, Value>>,
    },
}

impl GroupStrategy {
    /// Number of groups the engine has to return for this page.
    pub fn window(&self) -> usize {
        match self {
            GroupStrategy::TopN { page, page_size } => page_size.saturating_mul(page.saturating_add(1)),
            GroupStrategy::Cursor { page_size, .. } => *page_size,
        }
    }
}

/// Grouping aggregation on `field.norm` with an exemplar document and the
/// distinct values of each `attributes` field per group.
pub fn group_aggregation(field: AcField, strategy: &GroupStrategy, attributes: &[&str]) -> Result<Value> {
    let mut sub = Map::new();
    sub.insert(TOP_HIT_AGG.to_string(), json!({ "top_hits": { "size": 1 } }));
    for attribute in attributes {
        sub.insert(
            attribute.to_string(),
            json!({ "terms": { "field": attribute, "size": ATTRIBUTE_SIZE } }),
        );
    }

    let group = match strategy {
        GroupStrategy::TopN { .. } => {
            let window = strategy.window();
            if window > MAX_TERMS_WINDOW {
                return Err(SearchEngineError::argument(format!(
                    "Page too deep for count ordering: {} groups requested, at most {}",
                    window, MAX_TERMS_WINDOW
                )));
            }
            json!({
                "terms": {
                    "field": field.norm_field(),
                    "size": window,
                    "order": [{ "_count": "desc" }, { "_key": "asc" }]
                },
                "aggs": sub
            })
        }
        GroupStrategy::Cursor {
            page_size,
            order,
            after,
        } => {
            let mut composite = json!({
                "size": page_size,
                "sources": [{
                    field.as_str(): { "terms": { "field": field.norm_field(), "order": order.as_str() } }
                }]
            });
            if let Some(after) = after {
                composite["after"] = Value::Object(after.clone());
            }
            json!({ "composite": composite, "aggs": sub })
        }
    };
    Ok(group)
}

/// Opaque page token wrapping a composite `after_key`.
pub fn encode_cursor(after_key: &Value) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(after_key)?))
}

/// Decode a page token, checking it was issued for grouping on `field`.
pub fn decode_cursor(token: &str, field: AcField) -> Result<Map<String, Value>> {
    let invalid = || SearchEngineError::argument(format!("Invalid cursor '{}'", token));
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|_| invalid())?;
    let key: Map<String, Value> = serde_json::from_slice(&bytes).map_err(|_| invalid())?;
    match key.get(field.as_str()) {
        Some(Value::String(_)) if key.len() == 1 => Ok(key),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_selection_filter_uses_norm() {
        let selection = SelectionState::new()
            .with(AcField::ArtistName, "Queen")
            .with(AcField::SongName, "Innuendo");
        let filter = selection_filter(&selection);
        assert_eq!(filter.len(), 2);
        assert_eq!(filter[0], json!({"term": {"artist_name.norm": "Queen"}}));
        assert_eq!(filter[1], json!({"term": {"song_name.norm": "Innuendo"}}));
    }

    #[test]
    fn test_full_text_has_booster() {
        let query = full_text(AcField::SongName, "amen co");
        let fuzzy = &query["bool"]["must"][0]["match"]["song_name"];
        assert_eq!(fuzzy["fuzziness"], "AUTO");
        assert_eq!(fuzzy["operator"], "and");
        assert_eq!(fuzzy["prefix_length"], 2);
        let booster = &query["bool"]["should"][0]["match"]["song_name"];
        assert_eq!(booster["boost"], 2);
        assert!(booster.get("fuzziness").is_none());
    }

    #[rstest]
    #[case("1990", Some(json!({"range": {"release_year_released": {"gte": 1990, "lte": 1990}}})))]
    #[case("1990-1995", Some(json!({"range": {"release_year_released": {"gte": 1990, "lte": 1995}}})))]
    #[case("abc", None)]
    #[case("1995-1990", None)]
    fn test_year_filter(#[case] raw: &str, #[case] expected: Option<Value>) {
        let clause = full_text_or_filter("release_year_released", raw).unwrap();
        assert_eq!(clause.filter, expected);
        assert!(clause.full_text.is_none());
    }

    #[test]
    fn test_date_filter_dropped_when_unparsable() {
        let clause = full_text_or_filter("spin_timestamp", "last tuesday").unwrap();
        assert!(clause.is_empty());

        let clause = full_text_or_filter("spin_timestamp", "2020-01-05").unwrap();
        let range = &clause.filter.unwrap()["range"]["spin_timestamp"];
        assert_eq!(range["gte"], "2020-01-05 00:00:00");
    }

    #[test]
    fn test_filter_kinds() {
        let clause = full_text_or_filter("label_name", "Parlo").unwrap();
        assert_eq!(
            clause.filter,
            Some(json!({"prefix": {"label_name": {"value": "Parlo", "case_insensitive": true}}}))
        );
        let clause = full_text_or_filter("artist_name", "queen").unwrap();
        assert!(clause.full_text.is_some());
        let clause = full_text_or_filter("release_classical", "yes").unwrap();
        assert_eq!(clause.filter, Some(json!({"term": {"release_classical": true}})));
    }

    #[test]
    fn test_unknown_filter_field() {
        assert!(full_text_or_filter("p_line", "1999").unwrap_err().is_caller_error());
        assert!(full_text_or_filter("cover_art_url", "http").unwrap_err().is_caller_error());
    }

    #[test]
    fn test_top_n_window() {
        let strategy = GroupStrategy::TopN { page: 2, page_size: 10 };
        let agg = group_aggregation(AcField::ArtistName, &strategy, &["label_name"]).unwrap();
        assert_eq!(agg["terms"]["size"], 30);
        assert_eq!(agg["terms"]["field"], "artist_name.norm");
        assert_eq!(agg["aggs"]["label_name"]["terms"]["size"], ATTRIBUTE_SIZE);

        let too_deep = GroupStrategy::TopN { page: 1000, page_size: 50 };
        assert!(group_aggregation(AcField::ArtistName, &too_deep, &[]).is_err());
    }

    #[test]
    fn test_cursor_roundtrip() {
        let after = json!({"release_title": "abbey road"});
        let token = encode_cursor(&after).unwrap();
        let decoded = decode_cursor(&token, AcField::ReleaseTitle).unwrap();
        assert_eq!(Value::Object(decoded.clone()), after);

        assert!(decode_cursor(&token, AcField::ArtistName).is_err());
        assert!(decode_cursor("not base64!", AcField::ReleaseTitle).is_err());

        let strategy = GroupStrategy::Cursor {
            page_size: 20,
            order: SortOrder::Desc,
            after: Some(decoded),
        };
        let agg = group_aggregation(AcField::ReleaseTitle, &strategy, &[]).unwrap();
        assert_eq!(agg["composite"]["after"], after);
        assert_eq!(agg["composite"]["sources"][0]["release_title"]["terms"]["order"], "desc");
    }
}
