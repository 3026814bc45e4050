use derive_more::Deref;
use serde_json::{Map, Value};

use crate::schema::UID_FIELD;
use crate::types::AcField;

/// One document ready for bulk indexing
///
/// Autocomplete fields hold only the canonical value; the `.norm` and `.sort`
/// forms are derived by the index mapping.
#[derive(Debug, Clone, PartialEq, Default, Deref)]
pub struct SearchDocument {
    #[deref]
    fields: Map<String, Value>,
    id: Option<String>,
}

impl SearchDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document with a deterministic id, mirrored into the `uid` field.
    pub fn with_id(id: impl Into<String>) -> Self {
        let mut doc = Self::default();
        doc.set_id(id);
        doc
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.fields
            .insert(UID_FIELD.to_string(), Value::String(id.clone()));
        self.id = Some(id);
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    #[inline(always)]
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if key.ends_with(".norm") || key.ends_with(".sort") {
            tracing::warn!("Ignoring derived sub-field '{}' on document", key);
            return;
        }
        self.fields.insert(key, value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Fold line breaks in string values into single spaces.
    ///
    /// The whitespace run around a break collapses with it, so `"A\r\nB"`
    /// and `"A B"` share one normalized key.
    pub fn sanitize(&mut self) {
        for value in self.fields.values_mut() {
            if let Value::String(s) = value {
                if s.contains(['\n', '\r']) {
                    *s = s.split_whitespace().collect::<Vec<_>>().join(" ");
                }
            }
        }
    }

    /// All required autocomplete fields carry a non-blank value.
    pub fn has_fields(&self, required: &[AcField]) -> bool {
        required.iter().all(|field| {
            self.get_str(field.as_str())
                .is_some_and(|v| !v.trim().is_empty())
        })
    }

    pub fn source(&self) -> &Map<String, Value> {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_id_mirrors_uid() {
        let doc = SearchDocument::with_id("spins-42");
        assert_eq!(doc.id(), Some("spins-42"));
        assert_eq!(doc.get_str("uid"), Some("spins-42"));
    }

    #[test]
    fn test_derived_fields_rejected() {
        let mut doc = SearchDocument::new();
        doc.insert("artist_name", "Queen");
        doc.insert("artist_name.norm", "queen");
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn test_sanitize_strips_newlines() {
        let mut doc = SearchDocument::new();
        doc.insert("song_name", "Bohemian\nRhapsody\r\n");
        doc.insert("release_year_released", 1975);
        doc.sanitize();
        assert_eq!(doc.get_str("song_name"), Some("Bohemian Rhapsody"));
        assert_eq!(doc.get("release_year_released"), Some(&json!(1975)));
    }

    #[rstest]
    #[case("A\r\nB", "A B")]
    #[case("A \n B", "A B")]
    #[case("A\n\n\nB\r", "A B")]
    #[case("Amen\tCorner\n", "Amen Corner")]
    #[case("Killer  Queen", "Killer  Queen")]
    fn test_sanitize_collapses_breaks(#[case] raw: &str, #[case] expected: &str) {
        let mut doc = SearchDocument::new();
        doc.insert("song_name", raw);
        doc.sanitize();
        assert_eq!(doc.get_str("song_name"), Some(expected));
    }

    #[test]
    fn test_required_fields() {
        let mut doc = SearchDocument::new();
        doc.insert("artist_name", "Queen");
        doc.insert("song_name", "  ");
        assert!(doc.has_fields(&[AcField::ArtistName]));
        assert!(!doc.has_fields(&[AcField::ArtistName, AcField::SongName]));
    }
}
