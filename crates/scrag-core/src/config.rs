//! Persisted config in the app data directory, plus layered loading from a config
//! directory (`default.*` overridden by `<environment>.*`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app_data;
use crate::chunks::ChunkingConfig;
use crate::embed::EmbeddingsConfig;
use crate::logging::LogConfig;
use crate::query::RetrievalConfig;
use crate::store::StorageConfig;

const CONFIG_FILENAME: &str = "config.toml";
const INDEX_DIRNAME: &str = "indices";
pub const DEFAULT_INDEX_FILENAME: &str = "default_index.json";

/// Extensions tried, in order, for each layer.
const LAYER_EXTENSIONS: [&str; 3] = ["toml", "yaml", "yml"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where indices live. Defaults to `indices/` under the app data directory.
    pub index_dir: Option<PathBuf>,
    pub chunking: ChunkingConfig,
    pub embeddings: EmbeddingsConfig,
    pub storage: StorageConfig,
    pub retrieval: RetrievalConfig,
    pub logging: LogConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunking
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid("retrieval.top_k must be positive".into()));
        }
        if !(-1.0..=1.0).contains(&self.retrieval.threshold) {
            return Err(ConfigError::Invalid(format!(
                "retrieval.threshold must be within [-1, 1], got {}",
                self.retrieval.threshold
            )));
        }
        let openai = &self.embeddings.openai;
        if openai.batch_size == 0 {
            return Err(ConfigError::Invalid("embeddings.openai.batch_size must be positive".into()));
        }
        if openai.max_concurrent_batches == 0 {
            return Err(ConfigError::Invalid(
                "embeddings.openai.max_concurrent_batches must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Path of the config file in the app data directory, if that directory is available.
pub fn config_path() -> Option<PathBuf> {
    app_data::app_data_dir().map(|dir| dir.join(CONFIG_FILENAME))
}

/// Load config from the app data directory. Returns default config if missing or invalid.
pub fn load_config() -> Config {
    let Some(path) = config_path() else {
        return Config::default();
    };
    let Ok(s) = std::fs::read_to_string(&path) else {
        return Config::default();
    };
    match toml::from_str::<Config>(&s) {
        Ok(config) if config.validate().is_ok() => config,
        _ => {
            tracing::warn!(path = %path.display(), "ignoring invalid config file");
            Config::default()
        }
    }
}

/// Save config to the app data directory.
pub fn save_config(config: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path().ok_or(ConfigError::NoDataDir)?;
    let s = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;
    std::fs::write(&path, s).map_err(|e| ConfigError::Write(path.clone(), e))?;
    Ok(path)
}

/// Load a single TOML or YAML file, chosen by extension.
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let value = read_layer(path)?.ok_or_else(|| ConfigError::Missing(path.to_path_buf()))?;
    into_config(value)
}

/// Load `default.{toml,yaml,yml}` from `dir` and deep-merge `{environment}.*` over it.
/// Either layer may be absent; with neither, the result is the default config.
pub fn load_layered(dir: &Path, environment: &str) -> Result<Config, ConfigError> {
    let mut merged = find_layer(dir, "default")?.unwrap_or_else(|| Value::Object(Default::default()));
    if let Some(overrides) = find_layer(dir, environment)? {
        merge_values(&mut merged, overrides);
    }
    tracing::debug!(dir = %dir.display(), environment, "loaded layered config");
    into_config(merged)
}

/// Index file used when none is given: `<index_dir>/default_index.json`.
pub fn default_index_path(config: &Config) -> Result<PathBuf, ConfigError> {
    let dir = match &config.index_dir {
        Some(dir) => dir.clone(),
        None => app_data::app_data_dir().ok_or(ConfigError::NoDataDir)?.join(INDEX_DIRNAME),
    };
    Ok(dir.join(DEFAULT_INDEX_FILENAME))
}

fn into_config(value: Value) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_value(value).map_err(ConfigError::Shape)?;
    config.validate()?;
    Ok(config)
}

fn find_layer(dir: &Path, stem: &str) -> Result<Option<Value>, ConfigError> {
    for ext in LAYER_EXTENSIONS {
        if let Some(value) = read_layer(&dir.join(format!("{stem}.{ext}")))? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// `Ok(None)` when the file does not exist.
fn read_layer(path: &Path) -> Result<Option<Value>, ConfigError> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let value = match ext {
        "toml" => toml::from_str::<Value>(&raw).map_err(|e| ConfigError::Toml(path.to_path_buf(), e))?,
        "yaml" | "yml" => serde_yaml::from_str::<Value>(&raw).map_err(|e| ConfigError::Yaml(path.to_path_buf(), e))?,
        _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    };
    match value {
        Value::Null => Ok(Some(Value::Object(Default::default()))),
        Value::Object(_) => Ok(Some(value)),
        _ => Err(ConfigError::NotAMapping(path.to_path_buf())),
    }
}

/// Tables merge key by key; anything else in `overrides` replaces the base value.
fn merge_values(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine app data directory")]
    NoDataDir,
    #[error("failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("failed to write config {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to read config {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("config file not found: {0}")]
    Missing(PathBuf),
    #[error("unsupported config format (expected .toml, .yaml or .yml): {0}")]
    UnsupportedFormat(PathBuf),
    #[error("invalid TOML in {0}: {1}")]
    Toml(PathBuf, toml::de::Error),
    #[error("invalid YAML in {0}: {1}")]
    Yaml(PathBuf, serde_yaml::Error),
    #[error("config file {0} must contain a mapping at the top level")]
    NotAMapping(PathBuf),
    #[error("config has the wrong shape: {0}")]
    Shape(serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.embeddings.default_backend, "ollama");
        assert_eq!(config.storage.backend, "file");
        assert_eq!(config.retrieval.top_k, 10);
    }

    #[test]
    fn toml_round_trip_keeps_sections() {
        let mut config = Config::default();
        config.index_dir = Some(PathBuf::from("/tmp/scrag"));
        config.embeddings.openai.dimension = Some(256);
        let s = toml::to_string_pretty(&config).unwrap();
        assert_eq!(toml::from_str::<Config>(&s).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrag.toml");
        fs::write(&path, "[chunking]\nchunk_size = 128\n").unwrap();
        let config = load_config_file(&path).unwrap();
        assert_eq!(config.chunking.chunk_size, 128);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.retrieval, RetrievalConfig::default());
    }

    #[test]
    fn layered_yaml_overrides_toml_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[embeddings]\ndefault_backend = \"ollama\"\n[embeddings.ollama]\nmodel = \"all-minilm\"\ntimeout_secs = 10\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("production.yml"),
            "embeddings:\n  ollama:\n    timeout_secs: 60\nretrieval:\n  top_k: 3\n",
        )
        .unwrap();

        let config = load_layered(dir.path(), "production").unwrap();
        assert_eq!(config.embeddings.ollama.model, "all-minilm");
        assert_eq!(config.embeddings.ollama.timeout_secs, 60);
        assert_eq!(config.retrieval.top_k, 3);

        let config = load_layered(dir.path(), "staging").unwrap();
        assert_eq!(config.embeddings.ollama.timeout_secs, 10);
        assert_eq!(config.retrieval.top_k, 10);
    }

    #[test]
    fn empty_dir_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_layered(dir.path(), "dev").unwrap(), Config::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "retrieval:\n  threshold: 2.5\n").unwrap();
        assert!(matches!(load_config_file(&path), Err(ConfigError::Invalid(_))));

        fs::write(&path, "- just\n- a list\n").unwrap();
        assert!(matches!(load_config_file(&path), Err(ConfigError::NotAMapping(_))));

        let path = dir.path().join("zero.toml");
        fs::write(&path, "[chunking]\nchunk_size = 0\n").unwrap();
        assert!(matches!(load_config_file(&path), Err(ConfigError::Invalid(_))));

        let path = dir.path().join("config.ini");
        fs::write(&path, "x=1").unwrap();
        assert!(matches!(load_config_file(&path), Err(ConfigError::UnsupportedFormat(_))));
        assert!(matches!(
            load_config_file(&dir.path().join("absent.toml")),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn merge_replaces_scalars_and_merges_tables() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": [1, 2]});
        merge_values(&mut base, json!({"a": {"y": 3, "z": 4}, "b": [9]}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": [9]}));
    }

    #[test]
    fn index_path_uses_configured_dir() {
        let config = Config {
            index_dir: Some(PathBuf::from("/data/indices")),
            ..Default::default()
        };
        assert_eq!(
            default_index_path(&config).unwrap(),
            PathBuf::from("/data/indices/default_index.json")
        );
    }
}
