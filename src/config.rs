//! Server configuration: defaults, `GRAPH_MEMORY_*` environment variables,
//! then a TOML file (`<binary>.toml` next to the executable or `--config`).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::memory::embedding::{DisabledEmbedder, Embedder, HttpEmbedder, HttpEmbedderConfig};
use crate::memory::import::ImportMode;

pub const DEFAULT_DB_PATH: &str = "graph-memory.db";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Keys understood in the TOML file; same names as the environment variables.
const CONFIG_KEYS: [&str; 7] = [
    "GRAPH_MEMORY_DB_PATH",
    "GRAPH_MEMORY_EMBEDDING_ENDPOINT",
    "GRAPH_MEMORY_EMBEDDING_MODEL",
    "GRAPH_MEMORY_EMBEDDING_API_KEY",
    "GRAPH_MEMORY_EMBEDDING_TIMEOUT_SECS",
    "GRAPH_MEMORY_SEARCH_LIMIT",
    "GRAPH_MEMORY_IMPORT_MODE",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub embedding_endpoint: Option<String>,
    pub embedding_model: String,
    pub embedding_api_key: Option<String>,
    pub embedding_timeout_secs: u64,
    pub search_limit: usize,
    pub import_mode: ImportMode,
}

impl Config {
    pub fn defaults() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            embedding_endpoint: None,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_api_key: None,
            embedding_timeout_secs: 30,
            search_limit: 20,
            import_mode: ImportMode::BestEffort,
        }
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var("GRAPH_MEMORY_DB_PATH").filter(|v| !v.trim().is_empty()) {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = var("GRAPH_MEMORY_EMBEDDING_ENDPOINT") {
            self.embedding_endpoint = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = var("GRAPH_MEMORY_EMBEDDING_MODEL").filter(|v| !v.trim().is_empty()) {
            self.embedding_model = value;
        }
        if let Some(value) = var("GRAPH_MEMORY_EMBEDDING_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.embedding_api_key = Some(value);
        }
        if self.embedding_api_key.is_none()
            && let Some(value) = var("OPENAI_API_KEY").filter(|v| !v.trim().is_empty())
        {
            self.embedding_api_key = Some(value);
        }
        if let Some(value) = var("GRAPH_MEMORY_EMBEDDING_TIMEOUT_SECS")
            && let Ok(parsed) = value.trim().parse()
        {
            self.embedding_timeout_secs = parsed;
        }
        if let Some(value) = var("GRAPH_MEMORY_SEARCH_LIMIT")
            && let Ok(parsed) = value.trim().parse()
        {
            self.search_limit = parsed;
        }
        if let Some(value) = var("GRAPH_MEMORY_IMPORT_MODE") {
            match value.parse() {
                Ok(mode) => self.import_mode = mode,
                Err(err) => warn!("Ignoring GRAPH_MEMORY_IMPORT_MODE: {}", err),
            }
        }
    }

    fn apply_toml_overrides(&mut self, config: ConfigToml) {
        if let Some(value) = config.db_path {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = config.embedding_endpoint {
            self.embedding_endpoint = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = config.embedding_model {
            self.embedding_model = value;
        }
        if let Some(value) = config.embedding_api_key {
            self.embedding_api_key = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = config.embedding_timeout_secs {
            self.embedding_timeout_secs = value;
        }
        if let Some(value) = config.search_limit {
            self.search_limit = value;
        }
        if let Some(value) = config.import_mode {
            match value.parse() {
                Ok(mode) => self.import_mode = mode,
                Err(err) => warn!("Ignoring GRAPH_MEMORY_IMPORT_MODE in config file: {}", err),
            }
        }
    }

    pub fn vector_enabled(&self) -> bool {
        self.embedding_endpoint.is_some()
    }

    /// Embedder matching this configuration; disabled without an endpoint.
    pub fn build_embedder(&self) -> Arc<dyn Embedder> {
        match &self.embedding_endpoint {
            Some(endpoint) => {
                info!(endpoint = %endpoint, model = %self.embedding_model, "Semantic search enabled");
                Arc::new(HttpEmbedder::new(HttpEmbedderConfig {
                    endpoint: endpoint.clone(),
                    model: self.embedding_model.clone(),
                    api_key: self.embedding_api_key.clone(),
                    timeout: Duration::from_secs(self.embedding_timeout_secs),
                }))
            }
            None => {
                info!("No embedding endpoint configured; semantic search disabled");
                Arc::new(DisabledEmbedder)
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
struct ConfigToml {
    #[serde(rename = "GRAPH_MEMORY_DB_PATH")]
    db_path: Option<String>,
    #[serde(rename = "GRAPH_MEMORY_EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,
    #[serde(rename = "GRAPH_MEMORY_EMBEDDING_MODEL")]
    embedding_model: Option<String>,
    #[serde(rename = "GRAPH_MEMORY_EMBEDDING_API_KEY")]
    embedding_api_key: Option<String>,
    #[serde(rename = "GRAPH_MEMORY_EMBEDDING_TIMEOUT_SECS")]
    embedding_timeout_secs: Option<u64>,
    #[serde(rename = "GRAPH_MEMORY_SEARCH_LIMIT")]
    search_limit: Option<usize>,
    #[serde(rename = "GRAPH_MEMORY_IMPORT_MODE")]
    import_mode: Option<String>,
}

/// `<binary>.toml` in the executable's directory.
pub fn config_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate binary path")?;
    let dir = exe.parent().context("Failed to resolve binary directory")?;
    let stem = exe
        .file_stem()
        .and_then(|s| s.to_str())
        .context("Failed to determine binary name")?;
    Ok(dir.join(format!("{}.toml", stem)))
}

/// File keys that no setting reads, sorted.
fn unknown_keys(keys: &HashSet<String>) -> Vec<&str> {
    let mut unknown: Vec<&str> = keys
        .iter()
        .map(String::as_str)
        .filter(|key| !CONFIG_KEYS.contains(key))
        .collect();
    unknown.sort_unstable();
    unknown
}

enum ConfigReadOutcome {
    Parsed(ConfigToml, HashSet<String>),
    MissingOrEmpty,
    Invalid,
}

fn read_config_file(path: &Path) -> Result<ConfigReadOutcome> {
    if !path.exists() {
        debug!("config: no file at {}", path.display());
        return Ok(ConfigReadOutcome::MissingOrEmpty);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    if content.trim().is_empty() {
        debug!("config: file {} is empty", path.display());
        return Ok(ConfigReadOutcome::MissingOrEmpty);
    }
    let value: toml::Value = match toml::from_str(&content) {
        Ok(value) => value,
        Err(err) => {
            warn!("Invalid config TOML at {}: {}", path.display(), err);
            return Ok(ConfigReadOutcome::Invalid);
        }
    };
    let keys = value
        .as_table()
        .map(|table| table.keys().cloned().collect::<HashSet<_>>())
        .unwrap_or_default();
    match value.try_into::<ConfigToml>() {
        Ok(parsed) => Ok(ConfigReadOutcome::Parsed(parsed, keys)),
        Err(err) => {
            warn!("Invalid config TOML at {}: {}", path.display(), err);
            Ok(ConfigReadOutcome::Invalid)
        }
    }
}

/// Resolve the configuration. An explicit path that does not exist is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::defaults();
    config.apply_env_overrides();

    let path = match explicit {
        Some(path) => {
            anyhow::ensure!(path.exists(), "Config file {} does not exist", path.display());
            path.to_path_buf()
        }
        None => config_path()?,
    };

    match read_config_file(&path)? {
        ConfigReadOutcome::Parsed(parsed, keys) => {
            info!("config: loaded {} keys from {}", keys.len(), path.display());
            for key in unknown_keys(&keys) {
                warn!("config: ignoring unknown key {} in {}", key, path.display());
            }
            config.apply_toml_overrides(parsed);
        }
        ConfigReadOutcome::MissingOrEmpty => {
            info!("config: not found at {} (using defaults)", path.display());
        }
        ConfigReadOutcome::Invalid => {
            info!("config: invalid TOML at {}, using defaults", path.display());
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_overrides_from_vars() {
        let vars = HashMap::from([
            ("GRAPH_MEMORY_DB_PATH", "/tmp/kg.db"),
            ("GRAPH_MEMORY_EMBEDDING_ENDPOINT", "http://localhost:8080/v1/embeddings"),
            ("GRAPH_MEMORY_SEARCH_LIMIT", "5"),
            ("GRAPH_MEMORY_IMPORT_MODE", "atomic"),
            ("GRAPH_MEMORY_EMBEDDING_TIMEOUT_SECS", "not a number"),
            ("OPENAI_API_KEY", "sk-test"),
        ]);
        let mut config = Config::defaults();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.db_path, PathBuf::from("/tmp/kg.db"));
        assert!(config.vector_enabled());
        assert_eq!(config.search_limit, 5);
        assert_eq!(config.import_mode, ImportMode::Atomic);
        assert_eq!(config.embedding_timeout_secs, 30);
        assert_eq!(config.embedding_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_toml_file_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("graph-memory-mcp.toml");
        fs::write(
            &path,
            r#"
GRAPH_MEMORY_DB_PATH = "memory.db"
GRAPH_MEMORY_EMBEDDING_MODEL = "nomic-embed-text"
GRAPH_MEMORY_IMPORT_MODE = "best_effort"
GRAPH_MEMORY_SEARCH_LIMIT = 50
"#,
        )
        .unwrap();

        let ConfigReadOutcome::Parsed(parsed, keys) = read_config_file(&path).unwrap() else {
            panic!("expected parsed config");
        };
        assert_eq!(keys.len(), 4);
        assert!(unknown_keys(&keys).is_empty());

        let mut config = Config::defaults();
        config.apply_toml_overrides(parsed);
        assert_eq!(config.db_path, PathBuf::from("memory.db"));
        assert_eq!(config.embedding_model, "nomic-embed-text");
        assert_eq!(config.search_limit, 50);
        assert!(!config.vector_enabled());
    }

    #[test]
    fn test_unknown_keys_are_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("typo.toml");
        fs::write(
            &path,
            "GRAPH_MEMORY_SEARCH_LIMT = 5\nGRAPH_MEMORY_SEARCH_LIMIT = 7\nDB = \"x.db\"\n",
        )
        .unwrap();

        let ConfigReadOutcome::Parsed(parsed, keys) = read_config_file(&path).unwrap() else {
            panic!("expected parsed config");
        };
        assert_eq!(unknown_keys(&keys), vec!["DB", "GRAPH_MEMORY_SEARCH_LIMT"]);

        let mut config = Config::defaults();
        config.apply_toml_overrides(parsed);
        assert_eq!(config.search_limit, 7);
    }

    #[test]
    fn test_invalid_and_missing_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "GRAPH_MEMORY_SEARCH_LIMIT = [").unwrap();
        assert!(matches!(read_config_file(&path).unwrap(), ConfigReadOutcome::Invalid));
        assert!(matches!(
            read_config_file(&dir.path().join("absent.toml")).unwrap(),
            ConfigReadOutcome::MissingOrEmpty
        ));
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_build_embedder_follows_endpoint() {
        let mut config = Config::defaults();
        assert!(!config.build_embedder().vector_enabled());
        config.embedding_endpoint = Some("http://localhost:1/v1/embeddings".to_string());
        assert!(config.build_embedder().vector_enabled());
    }
}
