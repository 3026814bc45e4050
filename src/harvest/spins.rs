use crate::error::Result;
use crate::harvest::source::{Connector, HarvestSource, RowSource, SourceRow, as_i64};
use crate::schema::SearchDocument;
use crate::types::IndexName;
use async_trait::async_trait;
use std::sync::Arc;

/// Spin columns copied into the index; everything else in the row is dropped.
const INDEXED_COLUMNS: &[&str] = &[
    "id",
    "artist_name",
    "song_name",
    "release_title",
    "artist_conductor",
    "artist_performers",
    "artist_ensemble",
    "song_genre",
    "reference_genre",
    "release_medium",
    "release_various_artists",
    "release_date_added",
    "release_classical",
    "release_catalog_number",
    "release_year_released",
    "release_upc",
    "song_work",
    "song_composer",
    "song_isrc",
    "song_iswc",
    "spin_duration",
    "spin_timestamp",
    "label_name",
    "cover_art_url",
];

/// Radio spin log source. Documents are keyed by spin id.
pub struct SpinsSource {
    connector: Arc<dyn Connector>,
    batch_size: u64,
}

impl SpinsSource {
    pub fn new(connector: Arc<dyn Connector>, batch_size: u64) -> Self {
        Self {
            connector,
            batch_size,
        }
    }
}

#[async_trait]
impl HarvestSource for SpinsSource {
    fn index(&self) -> IndexName {
        IndexName::Spins
    }

    fn batch_size(&self) -> u64 {
        self.batch_size
    }

    fn bounds_query(&self) -> &str {
        "SELECT MIN(id) AS min_id, MAX(id) AS max_id FROM spins"
    }

    fn range_query(&self) -> &str {
        "SELECT * FROM spins WHERE id BETWEEN ? AND ?"
    }

    fn resume_field(&self) -> Option<&'static str> {
        Some("id")
    }

    async fn connect(&self) -> Result<Arc<dyn RowSource>> {
        self.connector.connect().await
    }

    fn map_row(&self, mut row: SourceRow) -> Option<SearchDocument> {
        let id = as_i64(row.get("id"))?;
        let mut doc = SearchDocument::with_id(id.to_string());
        for column in INDEXED_COLUMNS {
            if let Some(value) = row.remove(*column) {
                if !value.is_null() {
                    doc.insert(*column, value);
                }
            }
        }
        Some(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::source::MySqlConnector;
    use serde_json::json;

    fn source() -> SpinsSource {
        SpinsSource::new(Arc::new(MySqlConnector::new("mysql://localhost/spins")), 2_000)
    }

    #[test]
    fn test_map_row_keeps_whitelisted_columns() {
        let row = json!({
            "id": 881,
            "artist_name": "Nina Simone",
            "song_name": "Sinnerman",
            "spin_timestamp": "2019-04-01 10:00:00",
            "station_secret": "xyz",
            "song_work": null
        });
        let doc = source()
            .map_row(row.as_object().cloned().unwrap())
            .unwrap();
        assert_eq!(doc.id(), Some("881"));
        assert_eq!(doc.get("id"), Some(&json!(881)));
        assert_eq!(doc.get_str("spin_timestamp"), Some("2019-04-01 10:00:00"));
        assert!(doc.get("station_secret").is_none());
        assert!(doc.get("song_work").is_none());
    }

    #[test]
    fn test_map_row_requires_id() {
        let row = json!({"artist_name": "Nina Simone"});
        assert!(source().map_row(row.as_object().cloned().unwrap()).is_none());
    }
}
