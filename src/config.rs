use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BranchlineConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub classifier: ClassifierConfig,
    pub embedding: EmbeddingConfig,
    pub routing: RoutingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Provider id: `"openai"` (any chat-completions-compatible endpoint).
    pub provider: String,
    pub base_url: String,
    pub model: String,
    /// Env var holding the API key, read at provider construction.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider id: `"hash"` (deterministic feature hashing) or `"none"`.
    pub provider: String,
    pub dimensions: usize,
}

/// Tunables for the routing pipeline itself.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RoutingConfig {
    /// Maximum number of branch summaries offered to the classifier.
    pub max_candidate_branches: usize,
    /// How many recent same-role messages accompany the decision request.
    pub recent_message_window: usize,
    /// Topic label substituted when the classifier branches without one.
    pub fallback_topic: String,
    /// Prefix length used to derive a topic from message content on the
    /// first-message safety override.
    pub topic_prefix_chars: usize,
    /// Overall pipeline timeout budget.
    pub pipeline_timeout_secs: u64,
}

impl Default for BranchlineConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            classifier: ClassifierConfig::default(),
            embedding: EmbeddingConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8460,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_branchline_dir()
            .join("routing.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "BRANCHLINE_API_KEY".into(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".into(),
            dimensions: 256,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_candidate_branches: 10,
            recent_message_window: 5,
            fallback_topic: "New Topic".into(),
            topic_prefix_chars: 100,
            pipeline_timeout_secs: 30,
        }
    }
}

/// Returns `~/.branchline/`
pub fn default_branchline_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".branchline")
}

/// Returns the default config file path: `~/.branchline/config.toml`
pub fn default_config_path() -> PathBuf {
    default_branchline_dir().join("config.toml")
}

impl BranchlineConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            BranchlineConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (BRANCHLINE_DB,
    /// BRANCHLINE_LOG_LEVEL, BRANCHLINE_CLASSIFIER_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("BRANCHLINE_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("BRANCHLINE_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("BRANCHLINE_CLASSIFIER_URL") {
            self.classifier.base_url = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
