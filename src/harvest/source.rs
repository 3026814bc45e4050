use crate::error::Result;
use crate::schema::SearchDocument;
use crate::schema::range::DATE_FORMAT;
use crate::types::{AcField, IndexName};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row, TypeInfo};
use std::sync::Arc;

/// One relational row keyed by column name
pub type SourceRow = Map<String, Value>;

/// Columns `bounds_query` must return
pub const MIN_ID_COLUMN: &str = "min_id";
pub const MAX_ID_COLUMN: &str = "max_id";

/// Read access to a relational source
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Run `sql` with positional integer parameters.
    async fn fetch(&self, sql: &str, params: &[i64]) -> Result<Vec<SourceRow>>;
}

/// Opens a fresh connection per caller; workers never share one.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RowSource>>;
}

/// What the generic harvest loop needs from one data source
#[async_trait]
pub trait HarvestSource: Send + Sync {
    fn index(&self) -> IndexName;

    fn batch_size(&self) -> u64;

    /// Query returning one row with `min_id` and `max_id`.
    fn bounds_query(&self) -> &str;

    /// Query taking an inclusive `[from, to]` id range as its two parameters.
    fn range_query(&self) -> &str;

    /// Numeric index field holding the source id, when harvesting can resume
    /// after the highest id already indexed.
    fn resume_field(&self) -> Option<&'static str> {
        None
    }

    /// Autocomplete fields a document needs to be worth indexing.
    fn required_fields(&self) -> &[AcField] {
        &[AcField::ArtistName, AcField::SongName]
    }

    async fn connect(&self) -> Result<Arc<dyn RowSource>>;

    /// Load lookup data once on the coordinator, before workers start.
    async fn prepare(&self, _rows: &dyn RowSource) -> Result<()> {
        Ok(())
    }

    /// Turn a source row into a document, `None` to skip it.
    fn map_row(&self, row: SourceRow) -> Option<SearchDocument>;
}

/// Smallest and largest source id, `None` for an empty source.
pub async fn id_bounds(source: &dyn HarvestSource, rows: &dyn RowSource) -> Result<Option<(i64, i64)>> {
    let found = rows.fetch(source.bounds_query(), &[]).await?;
    let Some(row) = found.first() else {
        return Ok(None);
    };
    match (as_i64(row.get(MIN_ID_COLUMN)), as_i64(row.get(MAX_ID_COLUMN))) {
        (Some(min), Some(max)) => Ok(Some((min, max))),
        _ => Ok(None),
    }
}

/// Integer view of a column that may arrive as a number or a numeric string.
pub fn as_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// MySQL-backed source connector
pub struct MySqlConnector {
    url: String,
    max_connections: u32,
}

impl MySqlConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 2,
        }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> Result<Arc<dyn RowSource>> {
        let pool = MySqlPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.url)
            .await?;
        Ok(Arc::new(MySqlRowSource { pool }))
    }
}

pub struct MySqlRowSource {
    pool: MySqlPool,
}

#[async_trait]
impl RowSource for MySqlRowSource {
    async fn fetch(&self, sql: &str, params: &[i64]) -> Result<Vec<SourceRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(*param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_map).collect()
    }
}

/// Decode strategy chosen from the MySQL column type name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Signed,
    Unsigned,
    Flag,
    Float,
    DateTime,
    Date,
    Time,
    Text,
    Binary,
    Other,
}

impl ColumnKind {
    fn of(type_name: &str) -> Self {
        let upper = type_name.to_ascii_uppercase();
        let base = upper.split_whitespace().next().unwrap_or_default();
        match base {
            "BOOLEAN" => ColumnKind::Flag,
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
                if upper.contains("UNSIGNED") {
                    ColumnKind::Unsigned
                } else {
                    ColumnKind::Signed
                }
            }
            "FLOAT" | "DOUBLE" => ColumnKind::Float,
            "DATETIME" | "TIMESTAMP" => ColumnKind::DateTime,
            "DATE" => ColumnKind::Date,
            "TIME" => ColumnKind::Time,
            "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" => {
                ColumnKind::Text
            }
            "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
                ColumnKind::Binary
            }
            _ => ColumnKind::Other,
        }
    }
}

fn row_to_map(row: &MySqlRow) -> Result<SourceRow> {
    let mut map = SourceRow::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, i, column.name(), column.type_info().name())?;
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

fn decode_column(row: &MySqlRow, i: usize, name: &str, type_name: &str) -> Result<Value> {
    let value = match ColumnKind::of(type_name) {
        ColumnKind::Signed => row.try_get::<Option<i64>, _>(i)?.map(Value::from),
        ColumnKind::Unsigned => row.try_get::<Option<u64>, _>(i)?.map(Value::from),
        ColumnKind::Flag => row.try_get::<Option<bool>, _>(i)?.map(Value::from),
        ColumnKind::Float => row.try_get::<Option<f64>, _>(i)?.map(Value::from),
        ColumnKind::DateTime => row
            .try_get::<Option<NaiveDateTime>, _>(i)?
            .map(|dt| Value::String(dt.format(DATE_FORMAT).to_string())),
        ColumnKind::Date => row
            .try_get::<Option<NaiveDate>, _>(i)?
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
        ColumnKind::Time => row
            .try_get::<Option<NaiveTime>, _>(i)?
            .map(|t| Value::String(t.format("%H:%M:%S").to_string())),
        ColumnKind::Text => row.try_get::<Option<String>, _>(i)?.map(Value::from),
        ColumnKind::Binary => row
            .try_get::<Option<Vec<u8>>, _>(i)?
            .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
        // DECIMAL and friends come over the wire as text
        ColumnKind::Other => {
            text_or_null(name, type_name, row.try_get_unchecked::<Option<String>, _>(i))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Columns of an unrecognized type are read as text; one that cannot be is
/// indexed as null and reported.
fn text_or_null(
    name: &str,
    type_name: &str,
    decoded: std::result::Result<Option<String>, sqlx::Error>,
) -> Option<Value> {
    match decoded {
        Ok(text) => text.map(Value::from),
        Err(e) => {
            tracing::warn!(column = name, column_type = type_name, error = %e, "Failed to decode column");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use tracing_test::traced_test;

    #[rstest]
    #[case("BIGINT", ColumnKind::Signed)]
    #[case("INT UNSIGNED", ColumnKind::Unsigned)]
    #[case("boolean", ColumnKind::Flag)]
    #[case("DOUBLE", ColumnKind::Float)]
    #[case("TIMESTAMP", ColumnKind::DateTime)]
    #[case("DATE", ColumnKind::Date)]
    #[case("TIME", ColumnKind::Time)]
    #[case("VARCHAR", ColumnKind::Text)]
    #[case("MEDIUMBLOB", ColumnKind::Binary)]
    #[case("DECIMAL", ColumnKind::Other)]
    fn test_column_kind(#[case] name: &str, #[case] kind: ColumnKind) {
        assert_eq!(ColumnKind::of(name), kind);
    }

    #[test]
    #[traced_test]
    fn test_undecodable_column_is_logged() {
        let missing = sqlx::Error::ColumnNotFound("duration".into());
        let decoded = text_or_null("duration", "GEOMETRY", Err(missing));
        assert_eq!(decoded, None);
        assert!(logs_contain("Failed to decode column"));
        assert!(logs_contain("GEOMETRY"));

        assert_eq!(text_or_null("price", "DECIMAL", Ok(Some("9.99".into()))), Some(json!("9.99")));
        assert_eq!(text_or_null("price", "DECIMAL", Ok(None)), None);
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(as_i64(Some(&json!(42))), Some(42));
        assert_eq!(as_i64(Some(&json!("17"))), Some(17));
        assert_eq!(as_i64(Some(&json!(null))), None);
        assert_eq!(as_i64(None), None);
    }
}
