pub mod document;
pub mod range;

use crate::types::{AcField, IndexName};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

pub use document::SearchDocument;

/// Analyzer producing prefix-friendly tokens for autocomplete fields
pub const AUTOCOMPLETE_ANALYZER: &str = "autocomplete";
/// Query-time analyzer for autocomplete fields (no edge n-grams)
pub const AUTOCOMPLETE_SEARCH_ANALYZER: &str = "autocomplete_search";
/// Case-insensitive, spelling-preserving normalizer for `.norm` sub-fields
pub const NORM_NORMALIZER: &str = "lowercase_norm";

/// Field type definitions for index mappings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FieldType {
    /// Full-text + `.norm` exact form + `.sort` collation key, all from one value
    Autocomplete,
    Keyword { indexed: bool },
    Text { indexed: bool },
    Integer { indexed: bool },
    Long { indexed: bool },
    Boolean { indexed: bool },
    Date { indexed: bool },
}

impl FieldType {
    pub fn is_indexed(&self) -> bool {
        match self {
            FieldType::Autocomplete => true,
            FieldType::Keyword { indexed }
            | FieldType::Text { indexed }
            | FieldType::Integer { indexed }
            | FieldType::Long { indexed }
            | FieldType::Boolean { indexed }
            | FieldType::Date { indexed } => *indexed,
        }
    }

    /// How a free-text filter value on this field is turned into a clause
    pub fn filter_kind(&self) -> FilterKind {
        if !self.is_indexed() {
            return FilterKind::Unsupported;
        }
        match self {
            FieldType::Autocomplete => FilterKind::FullText,
            FieldType::Keyword { .. } => FilterKind::Prefix,
            FieldType::Integer { .. } | FieldType::Long { .. } => FilterKind::Range,
            FieldType::Date { .. } => FilterKind::DateRange,
            FieldType::Boolean { .. } => FilterKind::Flag,
            FieldType::Text { .. } => FilterKind::Unsupported,
        }
    }

    fn mapping(&self) -> Value {
        match self {
            FieldType::Autocomplete => json!({
                "type": "text",
                "analyzer": AUTOCOMPLETE_ANALYZER,
                "search_analyzer": AUTOCOMPLETE_SEARCH_ANALYZER,
                "fields": {
                    "norm": { "type": "keyword", "normalizer": NORM_NORMALIZER },
                    "sort": {
                        "type": "icu_collation_keyword",
                        "index": false,
                        "language": "en",
                        "strength": "secondary"
                    }
                }
            }),
            FieldType::Keyword { indexed } => json!({ "type": "keyword", "index": indexed }),
            FieldType::Text { indexed } => json!({ "type": "text", "index": indexed }),
            FieldType::Integer { indexed } => json!({ "type": "integer", "index": indexed }),
            FieldType::Long { indexed } => json!({ "type": "long", "index": indexed }),
            FieldType::Boolean { indexed } => json!({ "type": "boolean", "index": indexed }),
            FieldType::Date { indexed } => json!({
                "type": "date",
                "index": indexed,
                "format": "yyyy-MM-dd HH:mm:ss||yyyy-MM-dd||strict_date_optional_time||epoch_millis"
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    FullText,
    Range,
    DateRange,
    Prefix,
    Flag,
    Unsupported,
}

/// Field set and settings payload of one index
#[derive(Debug, Clone)]
pub struct IndexSchema {
    index: IndexName,
    fields: BTreeMap<&'static str, FieldType>,
}

const COMMON_FIELDS: &[(&str, FieldType)] = &[
    ("uid", FieldType::Keyword { indexed: true }),
    ("artist_name", FieldType::Autocomplete),
    ("song_name", FieldType::Autocomplete),
    ("release_title", FieldType::Autocomplete),
    ("label_name", FieldType::Keyword { indexed: true }),
    ("release_year_released", FieldType::Integer { indexed: true }),
    ("release_upc", FieldType::Keyword { indexed: true }),
    ("release_various_artists", FieldType::Boolean { indexed: true }),
    ("song_isrc", FieldType::Keyword { indexed: true }),
    ("cover_art_url", FieldType::Keyword { indexed: false }),
];

const SPINS_FIELDS: &[(&str, FieldType)] = &[
    ("id", FieldType::Long { indexed: true }),
    ("artist_conductor", FieldType::Text { indexed: false }),
    ("artist_performers", FieldType::Text { indexed: false }),
    ("artist_ensemble", FieldType::Text { indexed: false }),
    ("song_genre", FieldType::Keyword { indexed: true }),
    ("reference_genre", FieldType::Keyword { indexed: true }),
    ("release_medium", FieldType::Keyword { indexed: true }),
    ("release_date_added", FieldType::Date { indexed: true }),
    ("release_classical", FieldType::Boolean { indexed: true }),
    ("release_catalog_number", FieldType::Keyword { indexed: true }),
    ("song_work", FieldType::Text { indexed: false }),
    ("song_composer", FieldType::Keyword { indexed: true }),
    ("song_iswc", FieldType::Keyword { indexed: true }),
    ("spin_duration", FieldType::Integer { indexed: true }),
    ("spin_timestamp", FieldType::Date { indexed: true }),
];

const EPF_FIELDS: &[(&str, FieldType)] = &[
    ("artist_id", FieldType::Long { indexed: true }),
    ("collection_id", FieldType::Long { indexed: true }),
    ("song_id", FieldType::Long { indexed: true }),
    ("release_genre", FieldType::Keyword { indexed: true }),
    ("song_duration", FieldType::Integer { indexed: true }),
];

/// Genre-carrying attributes across both indexes
pub const GENRE_FIELDS: [&str; 2] = ["release_genre", "song_genre"];
pub const LABEL_FIELD: &str = "label_name";
pub const YEAR_FIELD: &str = "release_year_released";
pub const UID_FIELD: &str = "uid";

impl IndexSchema {
    pub fn for_index(index: IndexName) -> Self {
        let specific = match index {
            IndexName::Spins => SPINS_FIELDS,
            IndexName::Epf => EPF_FIELDS,
        };
        let fields = COMMON_FIELDS
            .iter()
            .chain(specific.iter())
            .map(|(name, ty)| (*name, *ty))
            .collect();
        Self { index, fields }
    }

    pub fn index(&self) -> IndexName {
        self.index
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Analyzers, normalizers and token filters shared by both indexes
    pub fn analysis() -> Value {
        json!({
            "filter": {
                "autocomplete_edge": {
                    "type": "edge_ngram",
                    "min_gram": 1,
                    "max_gram": 20
                }
            },
            "analyzer": {
                AUTOCOMPLETE_ANALYZER: {
                    "type": "custom",
                    "tokenizer": "standard",
                    "filter": ["lowercase", "asciifolding", "autocomplete_edge"]
                },
                AUTOCOMPLETE_SEARCH_ANALYZER: {
                    "type": "custom",
                    "tokenizer": "standard",
                    "filter": ["lowercase", "asciifolding"]
                }
            },
            "normalizer": {
                NORM_NORMALIZER: {
                    "type": "custom",
                    "filter": ["lowercase"]
                }
            }
        })
    }

    pub fn mappings(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, ty)| (name.to_string(), ty.mapping()))
            .collect();
        json!({ "dynamic": false, "properties": properties })
    }

    /// Body for index creation
    pub fn create_body(&self, shards: u32, replicas: u32) -> Value {
        json!({
            "settings": {
                "number_of_shards": shards,
                "number_of_replicas": replicas,
                "analysis": Self::analysis()
            },
            "mappings": self.mappings()
        })
    }
}

/// Type of `field` in whichever index declares it.
pub fn field_type(field: &str) -> Option<FieldType> {
    IndexName::ALL
        .iter()
        .find_map(|index| IndexSchema::for_index(*index).field_type(field))
}

/// Sort key for a sortable field, `None` for stored-only or text fields.
pub fn sort_key(field: &str) -> Option<String> {
    if let Ok(ac) = AcField::parse(field) {
        return Some(ac.sort_field());
    }
    match field_type(field)? {
        FieldType::Text { .. } => None,
        ty if ty.is_indexed() => Some(field.to_string()),
        _ => None,
    }
}
