//! HTTP boundary for the autocomplete UI

pub mod handlers;
pub mod routes;

use crate::error::{Result, SearchEngineError};
use crate::search::SearchService;
use crate::types::{IndexName, SelectionState};
use std::collections::HashMap;

pub use routes::build_router;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub search: SearchService,
}

impl AppState {
    pub fn new(search: SearchService) -> Self {
        Self { search }
    }
}

/// Prefix of chart filter parameters: `query[<field>]=<value>`
const FILTER_PREFIX: &str = "query[";

/// Query-string view with the parsing rules shared by all endpoints
#[derive(Debug, Clone, Default)]
pub struct Params(HashMap<String, String>);

impl Params {
    pub fn new(raw: HashMap<String, String>) -> Self {
        Self(raw)
    }

    /// Value of `key`, `None` when absent or blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Present, possibly empty.
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn required(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| SearchEngineError::argument(format!("\"{}\" is required", key)))
    }

    /// `meta` or `debug` set to `1`/`true` asks for the raw engine response.
    pub fn wants_raw(&self) -> bool {
        ["meta", "debug"].iter().any(|key| {
            self.get(key)
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        })
    }

    pub fn index(&self) -> Result<Option<IndexName>> {
        self.get("index").map(IndexName::parse).transpose()
    }

    pub fn selection(&self) -> Result<SelectionState> {
        match self.get("selected") {
            Some(raw) => SelectionState::from_json(raw),
            None => Ok(SelectionState::default()),
        }
    }

    pub fn number(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|_| {
                SearchEngineError::argument(format!("\"{}\" must be a non-negative integer", key))
            }),
            None => Ok(default),
        }
    }

    /// Chart filters from `query[<field>]` keys, blank values skipped.
    pub fn filters(&self) -> Vec<(String, String)> {
        let mut filters: Vec<(String, String)> = self
            .0
            .iter()
            .filter_map(|(key, value)| {
                let field = key.strip_prefix(FILTER_PREFIX)?.strip_suffix(']')?;
                let value = value.trim();
                (!field.is_empty() && !value.is_empty()).then(|| (field.to_string(), value.to_string()))
            })
            .collect();
        filters.sort();
        filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        Params::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_filters_from_bracket_keys() {
        let p = params(&[
            ("query[artist_name]", "queen"),
            ("query[release_year_released]", " 1970-1980 "),
            ("query[label_name]", ""),
            ("query", "ignored"),
            ("type", "songs"),
        ]);
        assert_eq!(
            p.filters(),
            vec![
                ("artist_name".to_string(), "queen".to_string()),
                ("release_year_released".to_string(), "1970-1980".to_string()),
            ]
        );
    }

    #[test]
    fn test_flags_and_numbers() {
        let p = params(&[("meta", "true"), ("page", "2"), ("pageSize", "x"), ("empty", "")]);
        assert!(p.wants_raw());
        assert_eq!(p.number("page", 0).unwrap(), 2);
        assert!(p.number("pageSize", 50).is_err());
        assert_eq!(p.raw("empty"), Some(""));
        assert!(p.get("empty").is_none());
        assert!(!params(&[("debug", "0")]).wants_raw());
    }

    #[test]
    fn test_index_and_selection() {
        let p = params(&[("index", "spins"), ("selected", r#"{"artist_name":"Queen"}"#)]);
        assert_eq!(p.index().unwrap(), Some(IndexName::Spins));
        assert_eq!(p.selection().unwrap().len(), 1);
        assert!(params(&[("index", "nope")]).index().is_err());
        assert_eq!(params(&[]).index().unwrap(), None);
    }
}
