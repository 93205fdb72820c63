use serde::Deserialize;

use crate::error::{ProxyError, Result};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub read_timeout: u64,
    pub write_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: 30,
            write_timeout: 120,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    Google,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub exact: ExactCacheConfig,
    #[serde(default)]
    pub semantic: SemanticCacheConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExactCacheConfig {
    pub enabled: bool,
    /// Seconds.
    pub ttl: u64,
    pub max_entries: usize,
}

impl Default for ExactCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: 3600,
            max_entries: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SemanticCacheConfig {
    pub enabled: bool,
    pub threshold: f32,
    pub embedding_model: String,
    pub embedding_url: String,
    pub embedding_key: String,
    pub qdrant_url: String,
    pub qdrant_api_key: String,
    pub qdrant_collection: String,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.95,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_url: "https://api.openai.com/v1".to_string(),
            embedding_key: String::new(),
            qdrant_url: String::new(),
            qdrant_api_key: String::new(),
            qdrant_collection: "quiver_cache".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(raw)
            .map_err(|err| ProxyError::Config(format!("parsing config: {err}")))?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        // Zero values from explicit `key: 0` entries fall back to defaults,
        // matching the serde defaults for absent keys.
        if self.cache.semantic.threshold <= 0.0 {
            self.cache.semantic.threshold = 0.95;
        }
        if self.cache.exact.ttl == 0 {
            self.cache.exact.ttl = 3600;
        }
        if self.cache.exact.max_entries == 0 {
            self.cache.exact.max_entries = 10_000;
        }
        if self.cache.semantic.qdrant_collection.is_empty() {
            self.cache.semantic.qdrant_collection = "quiver_cache".to_string();
        }
        if self.cache.semantic.embedding_model.is_empty() {
            self.cache.semantic.embedding_model = "text-embedding-3-small".to_string();
        }
        if self.cache.semantic.embedding_url.is_empty() {
            self.cache.semantic.embedding_url = "https://api.openai.com/v1".to_string();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(ProxyError::Config("server.port must be non-zero".to_string()));
        }
        if self.providers.is_empty() {
            return Err(ProxyError::Config(
                "at least one provider must be configured".to_string(),
            ));
        }
        for (i, provider) in self.providers.iter().enumerate() {
            if provider.name.is_empty() {
                return Err(ProxyError::Config(format!("providers[{i}].name is required")));
            }
            if provider.base_url.is_empty() {
                return Err(ProxyError::Config(format!(
                    "providers[{i}].base_url is required"
                )));
            }
            if provider.models.is_empty() {
                return Err(ProxyError::Config(format!(
                    "providers[{i}].models must have at least one model"
                )));
            }
        }
        if self.cache.semantic.enabled {
            if self.cache.semantic.qdrant_url.is_empty() {
                return Err(ProxyError::Config(
                    "cache.semantic.qdrant_url is required when semantic cache is enabled"
                        .to_string(),
                ));
            }
            if self.cache.semantic.embedding_key.is_empty() {
                return Err(ProxyError::Config(
                    "cache.semantic.embedding_key is required when semantic cache is enabled"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}
