use crate::error::Result;
use crate::harvest::source::{Connector, HarvestSource, RowSource, SourceRow, as_i64};
use crate::schema::{LABEL_FIELD, SearchDocument, YEAR_FIELD};
use crate::types::IndexName;
use async_trait::async_trait;
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

/// Copyright line: a four digit year, optionally followed by the label.
static P_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})(\s.+)?").unwrap());

const P_LINE_COLUMN: &str = "p_line";
const GENRE_COLUMN: &str = "release_genre";

const SONG_QUERY: &str = "\
SELECT
    a.artist_id AS artist_id,
    a.name AS artist_name,
    c.collection_id AS collection_id,
    c.name AS release_title,
    gc.genre_id AS release_genre,
    (SELECT COUNT(artist_id) FROM artist_collection ac_1 WHERE ac_1.collection_id = c.collection_id) > 1 AS release_various_artists,
    cm.upc AS release_upc,
    c.artwork_url AS cover_art_url,
    c.label_studio AS label_name,
    c.p_line,
    s.song_id AS song_id,
    s.name AS song_name,
    s.track_length AS song_duration,
    sm.isrc AS song_isrc
FROM song s
    INNER JOIN artist_song ag ON ag.song_id = s.song_id
    INNER JOIN artist a ON a.artist_id = ag.artist_id
    INNER JOIN collection_song cs ON cs.song_id = s.song_id
    INNER JOIN collection c ON c.collection_id = cs.collection_id
    INNER JOIN collection_match cm ON cm.collection_id = c.collection_id
    INNER JOIN artist_collection ac
        ON ac.artist_id = a.artist_id AND ac.collection_id = c.collection_id AND ac.role_id IN (1, 7)
    INNER JOIN genre_collection gc ON gc.collection_id = c.collection_id AND gc.is_primary = 1
    INNER JOIN song_match sm ON sm.song_id = s.song_id
WHERE s.is_indexable = 1
    AND s.song_id BETWEEN ? AND ?";

pub const GENRE_QUERY: &str = "SELECT genre_id, name FROM genre";

/// Commercial metadata dump source
///
/// One document per (song, release, artist) triple. The id is built from the
/// three source keys so a re-harvest overwrites instead of duplicating.
pub struct EpfSource {
    connector: Arc<dyn Connector>,
    batch_size: u64,
    genres: OnceCell<FxHashMap<i64, String>>,
}

impl EpfSource {
    pub fn new(connector: Arc<dyn Connector>, batch_size: u64) -> Self {
        Self {
            connector,
            batch_size,
            genres: OnceCell::new(),
        }
    }

    /// Preload the genre map instead of reading it from the source.
    pub fn with_genres(self, genres: FxHashMap<i64, String>) -> Self {
        let _ = self.genres.set(genres);
        self
    }

    fn genre_name(&self, id: Option<i64>) -> String {
        id.and_then(|id| self.genres.get().and_then(|map| map.get(&id)))
            .cloned()
            .unwrap_or_default()
    }
}

/// Release year and label parsed from a copyright line like `"1975 EMI Records"`.
pub fn parse_p_line(p_line: &str) -> Option<(i64, Option<String>)> {
    let caps = P_LINE.captures(p_line)?;
    let year = caps.get(1)?.as_str().parse().ok()?;
    let label = caps
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .filter(|label| !label.is_empty());
    Some((year, label))
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

#[async_trait]
impl HarvestSource for EpfSource {
    fn index(&self) -> IndexName {
        IndexName::Epf
    }

    fn batch_size(&self) -> u64 {
        self.batch_size
    }

    fn bounds_query(&self) -> &str {
        "SELECT MIN(song_id) AS min_id, MAX(song_id) AS max_id FROM song"
    }

    fn range_query(&self) -> &str {
        SONG_QUERY
    }

    async fn connect(&self) -> Result<Arc<dyn RowSource>> {
        self.connector.connect().await
    }

    async fn prepare(&self, rows: &dyn RowSource) -> Result<()> {
        if self.genres.get().is_some() {
            return Ok(());
        }
        let genres: FxHashMap<i64, String> = rows
            .fetch(GENRE_QUERY, &[])
            .await?
            .into_iter()
            .filter_map(|row| {
                let id = as_i64(row.get("genre_id"))?;
                let name = row.get("name")?.as_str()?.to_string();
                Some((id, name))
            })
            .collect();
        tracing::info!(genres = genres.len(), "Loaded genre map");
        let _ = self.genres.set(genres);
        Ok(())
    }

    fn map_row(&self, mut row: SourceRow) -> Option<SearchDocument> {
        let song_id = as_i64(row.get("song_id"))?;
        let collection_id = as_i64(row.get("collection_id"))?;
        let artist_id = as_i64(row.get("artist_id"))?;

        if let Some(p_line) = row.remove(P_LINE_COLUMN) {
            if let Some((year, label)) = p_line.as_str().and_then(parse_p_line) {
                row.insert(YEAR_FIELD.to_string(), Value::from(year));
                if let Some(label) = label {
                    if is_blank(row.get(LABEL_FIELD)) {
                        row.insert(LABEL_FIELD.to_string(), Value::String(label));
                    }
                }
            }
        }

        let genre = self.genre_name(as_i64(row.get(GENRE_COLUMN)));
        row.insert(GENRE_COLUMN.to_string(), Value::String(genre));

        let mut doc = SearchDocument::with_id(format!("{}-{}-{}", song_id, collection_id, artist_id));
        for (column, value) in row {
            if !value.is_null() {
                doc.insert(column, value);
            }
        }
        Some(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::source::MySqlConnector;
    use rstest::rstest;
    use serde_json::json;

    fn source() -> EpfSource {
        let genres = [(14, "Pop".to_string()), (21, "Rock".to_string())]
            .into_iter()
            .collect();
        EpfSource::new(Arc::new(MySqlConnector::new("mysql://localhost/epf")), 5_000)
            .with_genres(genres)
    }

    #[rstest]
    #[case("1975 EMI Records", Some((1975, Some("EMI Records"))))]
    #[case("℗ 2004 Parlophone  ", Some((2004, Some("Parlophone"))))]
    #[case("2011", Some((2011, None)))]
    #[case("All rights reserved", None)]
    fn test_parse_p_line(#[case] raw: &str, #[case] expected: Option<(i64, Option<&str>)>) {
        let parsed = parse_p_line(raw);
        let expected = expected.map(|(y, l)| (y, l.map(str::to_string)));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_map_row() {
        let row = json!({
            "artist_id": 3,
            "artist_name": "Queen",
            "collection_id": 77,
            "release_title": "A Night at the Opera",
            "release_genre": 21,
            "release_various_artists": 0,
            "label_name": "",
            "p_line": "1975 EMI Records",
            "song_id": 1001,
            "song_name": "Bohemian Rhapsody",
            "song_duration": 354000
        });
        let doc = source().map_row(row.as_object().cloned().unwrap()).unwrap();
        assert_eq!(doc.id(), Some("1001-77-3"));
        assert_eq!(doc.get_str("uid"), Some("1001-77-3"));
        assert_eq!(doc.get(YEAR_FIELD), Some(&json!(1975)));
        assert_eq!(doc.get_str(LABEL_FIELD), Some("EMI Records"));
        assert_eq!(doc.get_str("release_genre"), Some("Rock"));
        assert!(doc.get("p_line").is_none());
    }

    #[test]
    fn test_existing_label_kept_and_unknown_genre_blank() {
        let row = json!({
            "artist_id": 3, "collection_id": 8, "song_id": 9,
            "label_name": "Hollywood",
            "release_genre": 99,
            "p_line": "1991 Queen Productions Ltd"
        });
        let doc = source().map_row(row.as_object().cloned().unwrap()).unwrap();
        assert_eq!(doc.get_str(LABEL_FIELD), Some("Hollywood"));
        assert_eq!(doc.get_str("release_genre"), Some(""));
    }

    #[test]
    fn test_map_row_requires_keys() {
        let row = json!({"artist_id": 3, "song_id": 9});
        assert!(source().map_row(row.as_object().cloned().unwrap()).is_none());
    }
}
