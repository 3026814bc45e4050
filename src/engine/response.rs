use crate::error::{Result, SearchEngineError};
use crate::types::TotalHits;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unshaped engine response, returned verbatim to debug callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_more::From, derive_more::Deref)]
#[serde(transparent)]
pub struct RawEngineResponse(pub Value);

/// Typed view over a query response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineResponse {
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub hits: HitsEnvelope,
    #[serde(default)]
    pub aggregations: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HitsEnvelope {
    #[serde(default)]
    pub total: Option<TotalHits>,
    #[serde(default)]
    pub max_score: Option<f64>,
    #[serde(default)]
    pub hits: Vec<Hit>,
}

/// A single matching document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_score", default)]
    pub score: Option<f64>,
    #[serde(rename = "_source", default)]
    pub source: Map<String, Value>,
}

impl Hit {
    pub fn source_str(&self, field: &str) -> Option<&str> {
        self.source.get(field).and_then(Value::as_str)
    }
}

/// Bucket of a `terms` or `composite` aggregation
#[derive(Debug, Clone, Deserialize)]
pub struct Bucket {
    pub key: Value,
    pub doc_count: u64,
    #[serde(flatten)]
    pub sub: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketAgg {
    #[serde(default)]
    pub buckets: Vec<Bucket>,
    #[serde(default)]
    pub after_key: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MetricAgg {
    value: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TopHitsAgg {
    hits: HitsEnvelope,
}

fn decode<T: DeserializeOwned + Default>(value: Option<&Value>) -> Result<T> {
    match value {
        Some(v) => Ok(serde_json::from_value(v.clone())?),
        None => Ok(T::default()),
    }
}

impl EngineResponse {
    /// Parse a raw response, turning an engine-side timeout into an error.
    pub fn from_raw(raw: &Value) -> Result<Self> {
        let response: EngineResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            SearchEngineError::engine(format!("Unexpected search response: {}", e))
        })?;
        if response.timed_out {
            return Err(SearchEngineError::Timeout(format!(
                "query timed out after {}ms",
                response.took
            )));
        }
        Ok(response)
    }

    pub fn total(&self) -> TotalHits {
        self.hits.total.unwrap_or_default()
    }

    pub fn buckets(&self, name: &str) -> Result<BucketAgg> {
        decode(self.aggregations.get(name))
    }

    pub fn metric(&self, name: &str) -> Result<Option<f64>> {
        Ok(decode::<MetricAgg>(self.aggregations.get(name))?.value)
    }
}

impl Bucket {
    pub fn key_str(&self) -> String {
        match &self.key {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn metric(&self, name: &str) -> Result<Option<f64>> {
        Ok(decode::<MetricAgg>(self.sub.get(name))?.value)
    }

    pub fn top_hit(&self, name: &str) -> Result<Option<Hit>> {
        let top: TopHitsAgg = decode(self.sub.get(name))?;
        Ok(top.hits.hits.into_iter().next())
    }

    pub fn buckets(&self, name: &str) -> Result<Vec<Bucket>> {
        Ok(decode::<BucketAgg>(self.sub.get(name))?.buckets)
    }

    /// Keys of a nested terms aggregation, in bucket order.
    pub fn distinct_values(&self, name: &str) -> Result<Vec<Value>> {
        Ok(self.buckets(name)?.into_iter().map(|b| b.key).collect())
    }
}
