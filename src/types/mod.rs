use crate::error::{Result, SearchEngineError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumString};

/// Document indexes populated by the harvester
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IndexName {
    /// Commercial metadata dump
    Epf,
    /// Radio spin logs
    Spins,
}

impl IndexName {
    /// Primary index first; sample lookups fall back in this order.
    pub const ALL: [IndexName; 2] = [IndexName::Epf, IndexName::Spins];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexName::Epf => "epf",
            IndexName::Spins => "spins",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        IndexName::from_str(name)
            .map_err(|_| SearchEngineError::argument(format!("Unknown index '{}'", name)))
    }

    /// Indexes to query: the restricted one, or all of them.
    pub fn targets(restrict: Option<IndexName>) -> Vec<IndexName> {
        match restrict {
            Some(index) => vec![index],
            None => Self::ALL.to_vec(),
        }
    }
}

/// The three canonical text fields indexed for autocomplete
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AcField {
    ArtistName,
    SongName,
    ReleaseTitle,
}

impl AcField {
    pub const ALL: [AcField; 3] = [AcField::ArtistName, AcField::SongName, AcField::ReleaseTitle];

    pub fn as_str(&self) -> &'static str {
        match self {
            AcField::ArtistName => "artist_name",
            AcField::SongName => "song_name",
            AcField::ReleaseTitle => "release_title",
        }
    }

    /// Parse a field name, failing with `InvalidField` outside the autocomplete set.
    pub fn parse(name: &str) -> Result<Self> {
        AcField::from_str(name).map_err(|_| SearchEngineError::invalid_field(name))
    }

    /// Case-insensitive exact-match sub-field used for grouping and filtering
    pub fn norm_field(&self) -> String {
        format!("{}.norm", self.as_str())
    }

    /// Locale-aware sort key sub-field
    pub fn sort_field(&self) -> String {
        format!("{}.sort", self.as_str())
    }
}

/// Field -> chosen exact value, scoped to one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SelectionState {
    values: BTreeMap<AcField, String>,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: AcField, value: impl Into<String>) -> Self {
        self.select(field, value);
        self
    }

    pub fn select(&mut self, field: AcField, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.values.remove(&field);
        } else {
            self.values.insert(field, value);
        }
    }

    /// Parse the `selected` request parameter.
    ///
    /// Keys must be autocomplete field names. Values may be strings, `null`
    /// (field not chosen) or suggestion objects carrying a `value` key.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let parsed: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
            SearchEngineError::argument(format!("\"selected\" is not valid JSON: {}", e))
        })?;
        match parsed {
            serde_json::Value::Object(map) => Self::from_map(&map),
            serde_json::Value::Null => Ok(Self::default()),
            _ => Err(SearchEngineError::argument(
                "\"selected\" must be a JSON object of field => value pairs",
            )),
        }
    }

    pub fn from_map(map: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let mut state = Self::default();
        for (name, value) in map {
            let field = AcField::parse(name)?;
            let chosen = match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Object(obj) => {
                    obj.get("value").and_then(|v| v.as_str()).map(str::to_string)
                }
                other => {
                    return Err(SearchEngineError::argument(format!(
                        "Selected value for '{}' must be a string, got {}",
                        name, other
                    )));
                }
            };
            if let Some(v) = chosen {
                state.select(field, v);
            }
        }
        Ok(state)
    }

    pub fn get(&self, field: AcField) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }

    pub fn contains(&self, field: AcField) -> bool {
        self.values.contains_key(&field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (AcField, &str)> {
        self.values.iter().map(|(f, v)| (*f, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One distinct normalized value with its best match and an exemplar document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionGroup {
    pub value: String,
    pub score: f64,
    pub count: u64,
    pub exemplar_id: String,
    pub exemplar_index: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TotalRelation {
    #[default]
    Eq,
    Gte,
}

/// Hit count as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TotalHits {
    pub value: u64,
    #[serde(default)]
    pub relation: TotalRelation,
}

impl TotalHits {
    pub fn exact(value: u64) -> Self {
        Self {
            value,
            relation: TotalRelation::Eq,
        }
    }
}

/// Sort order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Sort specification parsed from `field`, `field:asc`, `field:desc` or `-field`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(field) = raw.strip_prefix('-') {
            return Self::checked(field, SortOrder::Desc, raw);
        }
        match raw.split_once(':') {
            Some((field, dir)) => {
                let order = match dir.to_ascii_lowercase().as_str() {
                    "asc" => SortOrder::Asc,
                    "desc" => SortOrder::Desc,
                    _ => {
                        return Err(SearchEngineError::argument(format!(
                            "Invalid sort direction in '{}'",
                            raw
                        )));
                    }
                };
                Self::checked(field, order, raw)
            }
            None => Self::checked(raw, SortOrder::Asc, raw),
        }
    }

    fn checked(field: &str, order: SortOrder, raw: &str) -> Result<Self> {
        if field.is_empty() {
            return Err(SearchEngineError::argument(format!("Invalid sort '{}'", raw)));
        }
        Ok(Self::new(field, order))
    }
}

impl std::fmt::Display for SortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.field, self.order.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_ac_field_parse() {
        assert_eq!(AcField::parse("song_name").unwrap(), AcField::SongName);
        assert!(matches!(
            AcField::parse("composer"),
            Err(SearchEngineError::InvalidField(_))
        ));
        assert_eq!(AcField::ArtistName.norm_field(), "artist_name.norm");
        assert_eq!(AcField::ReleaseTitle.sort_field(), "release_title.sort");
    }

    #[test]
    fn test_selection_skips_nulls() {
        let state =
            SelectionState::from_json(r#"{"artist_name": "Queen", "song_name": null}"#).unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state.get(AcField::ArtistName), Some("Queen"));
        assert!(!state.contains(AcField::SongName));
    }

    #[test]
    fn test_selection_accepts_suggestion_objects() {
        let state =
            SelectionState::from_json(r#"{"release_title": {"value": "Jazz", "count": 3}}"#)
                .unwrap();
        assert_eq!(state.get(AcField::ReleaseTitle), Some("Jazz"));
    }

    #[test]
    fn test_selection_rejects_unknown_field() {
        let err = SelectionState::from_json(r#"{"composer": "Bach"}"#).unwrap_err();
        assert!(err.is_caller_error());
        assert!(SelectionState::from_json("[1, 2]").is_err());
        assert!(SelectionState::from_json("").unwrap().is_empty());
    }

    #[rstest]
    #[case("song_name", "song_name", SortOrder::Asc)]
    #[case("song_name:desc", "song_name", SortOrder::Desc)]
    #[case("-spin_timestamp", "spin_timestamp", SortOrder::Desc)]
    #[case("count:ASC", "count", SortOrder::Asc)]
    fn test_sort_spec_parse(#[case] raw: &str, #[case] field: &str, #[case] order: SortOrder) {
        let spec = SortSpec::parse(raw).unwrap();
        assert_eq!(spec.field, field);
        assert_eq!(spec.order, order);
    }

    #[test]
    fn test_sort_spec_invalid() {
        assert!(SortSpec::parse("name:sideways").is_err());
        assert!(SortSpec::parse("-").is_err());
    }

    #[test]
    fn test_index_targets() {
        assert_eq!(IndexName::targets(None), vec![IndexName::Epf, IndexName::Spins]);
        assert_eq!(IndexName::targets(Some(IndexName::Spins)), vec![IndexName::Spins]);
        assert_eq!(IndexName::parse("epf").unwrap(), IndexName::Epf);
        assert!(IndexName::parse("songs").is_err());
    }
}
