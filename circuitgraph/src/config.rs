//! Configuration
//!
//! A JSON document with three sections. Every field has a default, so an
//! empty object is a valid configuration:
//!
//! ```json
//! {
//!   "log_level": "info",
//!   "pipeline": { "component_buffer": 64, "connection_buffer": 64, "unsupported": "drop" },
//!   "store": { "type": "sqlite", "path": "circuits.db" }
//! }
//! ```
//!
//! Environment variables prefixed `CIRCUITGRAPH_` override the file.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::pipeline::PipelineOptions;
use crate::store::{GraphStore, MemoryGraphStore, Neo4jConfig, Neo4jStore, SqliteGraphStore, StoreError};

const ENV_PREFIX: &str = "CIRCUITGRAPH_";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SQLITE_PATH: &str = "circuitgraph.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("store setup failed: {0}")]
    Store(#[from] StoreError),
}

/// Which graph store to commit to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory,
    Sqlite { path: PathBuf },
    Neo4j(Neo4jConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub pipeline: PipelineOptions,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            pipeline: PipelineOptions::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    pub fn from_reader(reader: impl Read) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Apply `CIRCUITGRAPH_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any variable source.
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());

        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(kind) = var("STORE") {
            self.store = match kind.to_ascii_lowercase().as_str() {
                "memory" => StoreConfig::Memory,
                "sqlite" => match &self.store {
                    StoreConfig::Sqlite { path } => StoreConfig::Sqlite { path: path.clone() },
                    _ => StoreConfig::Sqlite {
                        path: PathBuf::from(DEFAULT_SQLITE_PATH),
                    },
                },
                "neo4j" => match &self.store {
                    StoreConfig::Neo4j(neo4j) => StoreConfig::Neo4j(neo4j.clone()),
                    _ => StoreConfig::Neo4j(Neo4jConfig::default()),
                },
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unknown store {other:?} (expected memory, sqlite or neo4j)"
                    )))
                }
            };
        }

        if let StoreConfig::Sqlite { path } = &mut self.store {
            if let Some(p) = var("SQLITE_PATH") {
                *path = PathBuf::from(p);
            }
        }

        if let StoreConfig::Neo4j(neo4j) = &mut self.store {
            if let Some(endpoint) = var("NEO4J_ENDPOINT") {
                neo4j.endpoint = endpoint;
            }
            if let Some(user) = var("NEO4J_USER") {
                neo4j.user = user;
            }
            if let Some(password) = var("NEO4J_PASSWORD") {
                neo4j.password = password;
            }
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.level()?;
        if self.pipeline.component_buffer == 0 {
            return Err(ConfigError::Invalid("pipeline.component_buffer must be at least 1".into()));
        }
        if self.pipeline.connection_buffer == 0 {
            return Err(ConfigError::Invalid("pipeline.connection_buffer must be at least 1".into()));
        }
        if let StoreConfig::Sqlite { path } = &self.store {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("store.path must not be empty".into()));
            }
        }
        Ok(())
    }

    /// The configured log level as a `tracing` level.
    pub fn level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse::<Level>()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level {:?}", self.log_level)))
    }

    /// Construct the configured store.
    pub fn build_store(&self) -> Result<Arc<dyn GraphStore>, ConfigError> {
        let store: Arc<dyn GraphStore> = match &self.store {
            StoreConfig::Memory => Arc::new(MemoryGraphStore::new()),
            StoreConfig::Sqlite { path } => Arc::new(SqliteGraphStore::open(path)?),
            StoreConfig::Neo4j(neo4j) => Arc::new(Neo4jStore::new(neo4j.clone())?),
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::UnsupportedPolicy;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_object_is_default() {
        let config = Config::from_reader("{}".as_bytes()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.level().unwrap(), Level::INFO);
    }

    #[test]
    fn test_full_document() {
        let json = r#"{
            "log_level": "debug",
            "pipeline": { "component_buffer": 8, "unsupported": "report" },
            "store": { "type": "sqlite", "path": "/tmp/graph.db" }
        }"#;
        let config = Config::from_reader(json.as_bytes()).unwrap();
        assert_eq!(config.pipeline.component_buffer, 8);
        assert_eq!(config.pipeline.connection_buffer, 64);
        assert_eq!(config.pipeline.unsupported, UnsupportedPolicy::Report);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("/tmp/graph.db")
            }
        );
    }

    #[test]
    fn test_neo4j_section_defaults() {
        let json = r#"{ "store": { "type": "neo4j", "password": "secret" } }"#;
        let config = Config::from_reader(json.as_bytes()).unwrap();
        match config.store {
            StoreConfig::Neo4j(neo4j) => {
                assert_eq!(neo4j.endpoint, "http://localhost:7474");
                assert_eq!(neo4j.password, "secret");
                assert_eq!(neo4j.database, "neo4j");
            }
            other => panic!("unexpected store {other:?}"),
        }
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let json = r#"{ "pipeline": { "connection_buffer": 0 } }"#;
        assert!(matches!(
            Config::from_reader(json.as_bytes()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let json = r#"{ "log_level": "chatty" }"#;
        assert!(matches!(
            Config::from_reader(json.as_bytes()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_env_switches_store() {
        let mut config = Config::default();
        config
            .apply_vars(vars(&[
                ("CIRCUITGRAPH_STORE", "sqlite"),
                ("CIRCUITGRAPH_SQLITE_PATH", "/data/c.db"),
                ("CIRCUITGRAPH_LOG_LEVEL", "warn"),
            ]))
            .unwrap();

        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("/data/c.db")
            }
        );
        assert_eq!(config.level().unwrap(), Level::WARN);
    }

    #[test]
    fn test_env_overrides_neo4j_credentials() {
        let mut config = Config {
            store: StoreConfig::Neo4j(Neo4jConfig::default()),
            ..Config::default()
        };
        config
            .apply_vars(vars(&[
                ("CIRCUITGRAPH_NEO4J_ENDPOINT", "http://graph:7474"),
                ("CIRCUITGRAPH_NEO4J_USER", "ingest"),
                ("CIRCUITGRAPH_NEO4J_PASSWORD", "pw"),
            ]))
            .unwrap();

        let StoreConfig::Neo4j(neo4j) = config.store else {
            panic!("store changed");
        };
        assert_eq!(neo4j.endpoint, "http://graph:7474");
        assert_eq!(neo4j.user, "ingest");
        assert_eq!(neo4j.password, "pw");
    }

    #[test]
    fn test_env_unknown_store() {
        let mut config = Config::default();
        assert!(config.apply_vars(vars(&[("CIRCUITGRAPH_STORE", "redis")])).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_path("/definitely/not/here.json"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_build_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            store: StoreConfig::Sqlite {
                path: dir.path().join("g.db"),
            },
            ..Config::default()
        };
        assert_eq!(config.build_store().unwrap().name(), "sqlite");
    }
}
