#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use spinsearch::engine::{MemoryGateway, SearchGateway};
use spinsearch::harvest::source::{Connector, MAX_ID_COLUMN, MIN_ID_COLUMN, RowSource, SourceRow};
use spinsearch::{IndexName, Result, SearchDocument};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Song document for the `spins` index.
pub fn spin(id: u64, artist: &str, song: &str, release: Option<&str>) -> SearchDocument {
    let mut doc = SearchDocument::with_id(id.to_string());
    doc.insert("id", id);
    doc.insert("artist_name", artist);
    doc.insert("song_name", song);
    if let Some(release) = release {
        doc.insert("release_title", release);
    }
    doc
}

pub async fn gateway_with(docs: &[SearchDocument]) -> Arc<MemoryGateway> {
    let gateway = Arc::new(MemoryGateway::with_schemas());
    gateway.bulk(IndexName::Spins, docs).await.unwrap();
    gateway
}

/// A relational table held in memory
///
/// Answers the range query by filtering on `id_column`, the bounds query
/// (no parameters) with the column's min and max, and the genre lookup.
pub struct TableRows {
    rows: Vec<SourceRow>,
    id_column: String,
    genres: Vec<SourceRow>,
}

impl TableRows {
    pub fn new(id_column: &str, rows: Vec<Value>) -> Self {
        Self {
            rows: rows
                .into_iter()
                .filter_map(|row| row.as_object().cloned())
                .collect(),
            id_column: id_column.to_string(),
            genres: Vec::new(),
        }
    }

    pub fn with_genres(mut self, genres: &[(i64, &str)]) -> Self {
        self.genres = genres
            .iter()
            .filter_map(|(id, name)| json!({"genre_id": id, "name": name}).as_object().cloned())
            .collect();
        self
    }

    fn id(&self, row: &SourceRow) -> Option<i64> {
        row.get(&self.id_column).and_then(Value::as_i64)
    }
}

#[async_trait]
impl RowSource for TableRows {
    async fn fetch(&self, sql: &str, params: &[i64]) -> Result<Vec<SourceRow>> {
        if sql.contains("FROM genre") {
            return Ok(self.genres.clone());
        }
        match params {
            [] => {
                let ids: Vec<i64> = self.rows.iter().filter_map(|row| self.id(row)).collect();
                let mut bounds = SourceRow::new();
                bounds.insert(MIN_ID_COLUMN.to_string(), json!(ids.iter().min()));
                bounds.insert(MAX_ID_COLUMN.to_string(), json!(ids.iter().max()));
                Ok(vec![bounds])
            }
            [from, to] => Ok(self
                .rows
                .iter()
                .filter(|row| self.id(row).is_some_and(|id| id >= *from && id <= *to))
                .cloned()
                .collect()),
            _ => panic!("unexpected parameters {:?}", params),
        }
    }
}

/// Hands out the same table to every caller and counts connections.
pub struct TableConnector {
    table: Arc<TableRows>,
    connections: AtomicUsize,
}

impl TableConnector {
    pub fn new(table: TableRows) -> Self {
        Self {
            table: Arc::new(table),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for TableConnector {
    async fn connect(&self) -> Result<Arc<dyn RowSource>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(self.table.clone())
    }
}

/// `count` spin rows with ids `first..first+count`.
pub fn spin_rows(first: i64, count: i64) -> Vec<Value> {
    (first..first + count)
        .map(|id| {
            json!({
                "id": id,
                "artist_name": format!("Artist {}", id % 7),
                "song_name": format!("Song {}", id),
                "release_title": format!("Release {}", id % 5),
                "release_classical": id % 2,
                "station_id": 12
            })
        })
        .collect()
}
