use crate::error::{Result, SearchEngineError};
use crate::types::IndexName;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "app.toml";

/// Deployment environment; production lifts the harvest dev cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
}

impl Environment {
    /// `ENV=production` selects production, anything else is development.
    pub fn from_env_value(value: &str) -> Self {
        if value.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Search engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            timeout_secs: 10,
            username: None,
            password: None,
        }
    }
}

/// Shard/replica layout per environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexSettingsConfig {
    pub production_shards: u32,
    pub production_replicas: u32,
    pub development_shards: u32,
    pub development_replicas: u32,
}

impl Default for IndexSettingsConfig {
    fn default() -> Self {
        Self {
            production_shards: 3,
            production_replicas: 1,
            development_shards: 1,
            development_replicas: 0,
        }
    }
}

impl IndexSettingsConfig {
    pub fn shards(&self, env: Environment) -> u32 {
        if env.is_production() {
            self.production_shards
        } else {
            self.development_shards
        }
    }

    pub fn replicas(&self, env: Environment) -> u32 {
        if env.is_production() {
            self.production_replicas
        } else {
            self.development_replicas
        }
    }
}

/// Relational source connection strings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SourcesConfig {
    pub spins_url: Option<String>,
    pub epf_url: Option<String>,
}

impl SourcesConfig {
    pub fn url_for(&self, index: IndexName) -> Option<&str> {
        match index {
            IndexName::Spins => self.spins_url.as_deref(),
            IndexName::Epf => self.epf_url.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarvestConfig {
    pub forks: usize,
    /// Per-worker document cap outside production
    pub dev_limit: u64,
    pub spins_batch_size: u64,
    pub epf_batch_size: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            forks: 3,
            dev_limit: 200_000,
            spins_batch_size: 2_000,
            epf_batch_size: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub environment: Environment,
    pub engine: EngineConfig,
    pub index: IndexSettingsConfig,
    pub sources: SourcesConfig,
    pub harvest: HarvestConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// With `path == None` the default `app.toml` is used if present, otherwise
    /// defaults apply. An explicitly named file that cannot be read is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_PATH);
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SearchEngineError::ConfigError(format!(
                "Failed to read config '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&raw).map_err(|e| match e {
            SearchEngineError::ConfigError(msg) => {
                SearchEngineError::ConfigError(format!("{} ('{}')", msg, path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| SearchEngineError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Overlay the environment variables the deployment scripts set.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup("ENV") {
            self.environment = Environment::from_env_value(&env);
        }
        if let Some(host) = lookup("ES_HOST") {
            self.engine.url = if host.contains("://") {
                host
            } else {
                format!("http://{}", host)
            };
        }
        if let Some(url) = lookup("SPINS_DATABASE_URL") {
            self.sources.spins_url = Some(url);
        }
        if let Some(url) = lookup("EPF_DATABASE_URL") {
            self.sources.epf_url = Some(url);
        }
        if let Some(bind) = lookup("BIND_ADDR") {
            self.server.bind = bind;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.url.trim().is_empty() {
            return Err(SearchEngineError::ConfigError(
                "Search engine URL is required".to_string(),
            ));
        }
        let url = reqwest::Url::parse(&self.engine.url).map_err(|e| {
            SearchEngineError::ConfigError(format!(
                "Invalid search engine URL '{}': {}",
                self.engine.url, e
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SearchEngineError::ConfigError(format!(
                "Search engine URL must be http(s), got '{}'",
                self.engine.url
            )));
        }
        if self.engine.timeout_secs == 0 {
            return Err(SearchEngineError::ConfigError(
                "engine.timeout_secs must be positive".to_string(),
            ));
        }
        if self.harvest.forks == 0 {
            return Err(SearchEngineError::ConfigError(
                "harvest.forks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The database URL for a harvest source, required before harvesting it.
    pub fn source_url(&self, index: IndexName) -> Result<&str> {
        self.sources.url_for(index).ok_or_else(|| {
            SearchEngineError::ConfigError(format!(
                "No database URL configured for the '{}' source",
                index
            ))
        })
    }

    pub fn batch_size(&self, index: IndexName) -> u64 {
        match index {
            IndexName::Spins => self.harvest.spins_batch_size,
            IndexName::Epf => self.harvest.epf_batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.index.shards(config.environment), 1);
        assert_eq!(config.batch_size(IndexName::Epf), 5_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
environment = "production"

[engine]
url = "http://es01:9200"
timeout_secs = 5

[harvest]
forks = 6
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert!(config.environment.is_production());
        assert_eq!(config.engine.url, "http://es01:9200");
        assert_eq!(config.engine.timeout_secs, 5);
        assert_eq!(config.harvest.forks, 6);
        assert_eq!(config.harvest.dev_limit, 200_000);
        assert_eq!(config.index.replicas(config.environment), 1);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = AppConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, SearchEngineError::ConfigError(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ENV", "production"),
            ("ES_HOST", "es01:9200"),
            ("SPINS_DATABASE_URL", "mysql://root@db/spins"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert!(config.environment.is_production());
        assert_eq!(config.engine.url, "http://es01:9200");
        assert_eq!(config.source_url(IndexName::Spins).unwrap(), "mysql://root@db/spins");
        assert!(config.source_url(IndexName::Epf).is_err());
    }

    #[test]
    fn test_invalid_engine_url_fails_fast() {
        let mut config = AppConfig::default();
        config.engine.url = String::new();
        assert!(config.validate().is_err());

        config.engine.url = "ftp://es01".to_string();
        assert!(config.validate().is_err());
    }
}
