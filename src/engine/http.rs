use crate::config::EngineConfig;
use crate::engine::{IndexStats, SearchGateway};
use crate::error::{Result, SearchEngineError};
use crate::schema::SearchDocument;
use crate::types::IndexName;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use std::time::Duration;

/// Extra client-side slack on top of the engine-side query timeout
const CLIENT_TIMEOUT_GRACE_SECS: u64 = 2;

/// Elasticsearch-compatible gateway over the REST API
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    config: EngineConfig,
    base_url: String,
}

impl HttpGateway {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                SearchEngineError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;
        let base_url = config.url.trim_end_matches('/').to_string();
        tracing::info!("Search engine host: {}", base_url);

        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.config.username {
            Some(user) => builder.basic_auth(user, self.config.password.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SearchEngineError::engine(format!(
                "{}: {}",
                status,
                error_reason(&body)
            )));
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Pull `error.reason` out of an engine error body when present.
fn error_reason(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/reason")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(500).collect())
}

pub(crate) fn index_path(indices: &[IndexName]) -> String {
    indices
        .iter()
        .map(|i| i.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// NDJSON body: one action descriptor followed by the document source.
pub(crate) fn bulk_body(index: IndexName, documents: &[SearchDocument]) -> Result<String> {
    let mut body = String::new();
    for doc in documents {
        let action = match doc.id() {
            Some(id) => json!({ "index": { "_index": index.as_str(), "_id": id } }),
            None => json!({ "index": { "_index": index.as_str() } }),
        };
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(doc.source())?);
        body.push('\n');
    }
    Ok(body)
}

#[async_trait]
impl SearchGateway for HttpGateway {
    async fn search(&self, indices: &[IndexName], body: &Value) -> Result<Value> {
        let path = format!("{}/_search", index_path(indices));
        let timeout = Duration::from_secs(self.config.timeout_secs + CLIENT_TIMEOUT_GRACE_SECS);
        let builder = self
            .request(Method::POST, &path)
            .timeout(timeout)
            .json(body);
        self.send(builder).await.map_err(|e| {
            if e.is_timeout() {
                SearchEngineError::Timeout(format!("no response within {:?}", timeout))
            } else {
                e
            }
        })
    }

    async fn bulk(&self, index: IndexName, documents: &[SearchDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let builder = self
            .request(Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(index, documents)?);
        let response = self.send(builder).await?;
        if response.get("errors").and_then(Value::as_bool) == Some(true) {
            let failed = response["items"]
                .as_array()
                .map(|items| items.iter().filter(|i| i["index"]["error"].is_object()).count())
                .unwrap_or(0);
            let reason = response
                .pointer("/items/0/index/error/reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(SearchEngineError::engine(format!(
                "bulk request rejected {} of {} documents: {}",
                failed,
                documents.len(),
                reason
            )));
        }
        Ok(())
    }

    async fn index_exists(&self, index: IndexName) -> Result<bool> {
        let response = self.request(Method::HEAD, index.as_str()).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(SearchEngineError::engine(format!(
                "unexpected status {} checking index '{}'",
                status, index
            ))),
        }
    }

    async fn create_index(&self, index: IndexName, body: &Value) -> Result<()> {
        self.send(self.request(Method::PUT, index.as_str()).json(body))
            .await?;
        tracing::info!("Created index: {}", index);
        Ok(())
    }

    async fn delete_index(&self, index: IndexName) -> Result<()> {
        self.send(self.request(Method::DELETE, index.as_str()))
            .await?;
        tracing::info!("Deleted index: {}", index);
        Ok(())
    }

    async fn put_settings(&self, index: IndexName, settings: &Value) -> Result<()> {
        let path = format!("{}/_settings", index);
        self.send(self.request(Method::PUT, &path).json(&json!({ "index": settings })))
            .await?;
        Ok(())
    }

    async fn put_mapping(&self, index: IndexName, mappings: &Value) -> Result<()> {
        let path = format!("{}/_mapping", index);
        self.send(self.request(Method::PUT, &path).json(mappings))
            .await?;
        Ok(())
    }

    async fn open_index(&self, index: IndexName) -> Result<()> {
        self.send(self.request(Method::POST, &format!("{}/_open", index)))
            .await?;
        Ok(())
    }

    async fn close_index(&self, index: IndexName) -> Result<()> {
        self.send(self.request(Method::POST, &format!("{}/_close", index)))
            .await?;
        Ok(())
    }

    async fn refresh(&self, index: IndexName) -> Result<()> {
        self.send(self.request(Method::POST, &format!("{}/_refresh", index)))
            .await?;
        Ok(())
    }

    async fn force_merge(&self, index: IndexName) -> Result<()> {
        self.send(self.request(Method::POST, &format!("{}/_forcemerge", index)))
            .await?;
        Ok(())
    }

    async fn stats(&self, index: IndexName) -> Result<IndexStats> {
        let response = self
            .send(self.request(Method::GET, &format!("{}/_stats", index)))
            .await?;
        let primaries = response
            .pointer("/_all/primaries")
            .ok_or_else(|| SearchEngineError::engine("stats response without primaries"))?;
        Ok(IndexStats {
            doc_count: primaries["docs"]["count"].as_u64().unwrap_or(0),
            size_in_bytes: primaries["store"]["size_in_bytes"].as_u64().unwrap_or(0),
        })
    }

    async fn count(&self, index: IndexName) -> Result<u64> {
        let response = self
            .send(self.request(Method::GET, &format!("{}/_count", index)))
            .await?;
        response["count"]
            .as_u64()
            .ok_or_else(|| SearchEngineError::engine("count response without a count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_body_pairs() {
        let mut with_id = SearchDocument::with_id("17");
        with_id.insert("song_name", "Amen Corner");
        let mut without_id = SearchDocument::new();
        without_id.insert("song_name", "Other");

        let body = bulk_body(IndexName::Spins, &[with_id, without_id]).unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], json!({"index": {"_index": "spins", "_id": "17"}}));
        assert_eq!(lines[1]["song_name"], "Amen Corner");
        assert_eq!(lines[2], json!({"index": {"_index": "spins"}}));
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn test_index_path_and_urls() {
        assert_eq!(index_path(&IndexName::ALL), "epf,spins");
        let gateway = HttpGateway::new(EngineConfig {
            url: "http://es01:9200/".to_string(),
            ..EngineConfig::default()
        })
        .unwrap();
        assert_eq!(gateway.url("/epf/_search"), "http://es01:9200/epf/_search");
    }

    #[test]
    fn test_error_reason() {
        let body = r#"{"error": {"reason": "no such index [epf]"}, "status": 404}"#;
        assert_eq!(error_reason(body), "no such index [epf]");
        assert_eq!(error_reason("plain failure"), "plain failure");
    }
}
