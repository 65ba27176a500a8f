//! This module provides functionality for loading and validating the application's configuration.
//!
//! It defines the [`RagConfig`] struct, which holds the configuration parameters,
//! and [`load_config`] to read it from a YAML file. Secrets and endpoints can be
//! supplied through the environment instead of the file (see
//! [`RagConfig::apply_env_overrides`]); [`RagConfig::validate`] runs once at
//! startup and any failure there is fatal.
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use awful_rag::config::RagConfig;
//!
//! let config = RagConfig::load("/path/to/config.yaml".as_ref()).unwrap();
//! println!("{:?}", config);
//! ```

use std::path::{Path, PathBuf};
use std::{fs, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::ProviderKind;
use crate::error::{RagError, Result};
use crate::remote::RemoteMetric;
use crate::retriever::RetrievalBackend;

/// Suffix some deployments include in `OLLAMA_API_URL`.
const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Represents the application's configuration.
///
/// Every section falls back to its defaults, so an empty mapping (`{}`) is a
/// valid file as long as the environment supplies what validation needs.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(default)]
pub struct RagConfig {
    /// Directory holding the per-user index/document pairs.
    /// Defaults to `<data_dir>/user_indices`.
    pub index_dir: Option<PathBuf>,

    pub embedding: EmbeddingConfig,

    pub retrieval: RetrievalConfig,

    pub generation: GenerationConfig,

    /// Optional remote mirror of every user's vectors.
    pub remote: Option<RemoteConfig>,

    pub server: ServerConfig,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    /// all-MiniLM-L6-v2 through Candle.
    Minilm,
    /// Lexical hashing embedder, no model download.
    Hashing,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub kind: EmbeddingKind,

    /// Hugging Face model id for [`EmbeddingKind::Minilm`].
    pub model: String,

    /// Bucket count for [`EmbeddingKind::Hashing`].
    pub hashing_dimension: usize,

    pub timeout_secs: u64,

    /// Embed only newly added documents instead of the whole corpus.
    pub incremental: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            kind: EmbeddingKind::Minilm,
            model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            hashing_dimension: 512,
            timeout_secs: 120,
            incremental: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub default_backend: RetrievalBackend,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 2,
            default_backend: RetrievalBackend::Local,
        }
    }
}

/// A model name and the provider that serves it.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ModelRoute {
    pub name: String,
    pub provider: ProviderKind,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct OllamaConfig {
    /// OpenAI compatible base URL, `/chat/completions` is appended.
    pub api_base: String,
    pub api_key: Option<String>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:11434/v1".to_string(),
            api_key: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct GeminiConfig {
    pub api_base: String,
    pub api_key: Option<String>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://generativelanguage.googleapis.com".to_string(),
            api_key: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    /// Model used when a request does not name one.
    pub default_model: String,

    pub summary_model: String,

    pub timeout_secs: u64,

    pub max_tokens: u32,

    pub summary_max_tokens: u32,

    pub ollama: OllamaConfig,

    pub gemini: GeminiConfig,

    /// Exact model names and their providers.
    pub models: Vec<ModelRoute>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_model: "llama3.2:1b".to_string(),
            summary_model: "llama3.2:1b".to_string(),
            timeout_secs: 40,
            max_tokens: 200,
            summary_max_tokens: 150,
            ollama: OllamaConfig::default(),
            gemini: GeminiConfig::default(),
            models: vec![
                ModelRoute {
                    name: "llama3.2:1b".to_string(),
                    provider: ProviderKind::Ollama,
                },
                ModelRoute {
                    name: "gemini-2.5-flash".to_string(),
                    provider: ProviderKind::Gemini,
                },
            ],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct RemoteConfig {
    /// Index host, e.g. `https://my-index-abc123.svc.us-east-1.pinecone.io`.
    pub host: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Namespace for all users; defaults to the index's default namespace.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Metric the remote index was created with.
    #[serde(default)]
    pub metric: RemoteMetric,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// User whose corpus backs `GET /rag/` when no `user_id` is given.
    pub default_user: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            default_user: "default".to_string(),
        }
    }
}

impl RagConfig {
    /// Read `path`, apply the process environment, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = load_config(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus the process environment, for running without a config file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Built-in defaults under `lookup`. The default gemini route is dropped
    /// when no key is available instead of failing validation.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RagConfig::default();
        config.apply_env_overrides(lookup);
        if config.gemini_key().is_none() {
            config
                .generation
                .models
                .retain(|route| route.provider != ProviderKind::Gemini);
        }
        config.validate()?;
        Ok(config)
    }

    /// Overlay endpoint and secret settings from the environment.
    ///
    /// `lookup` is `std::env::var` in production and a map in tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup("OLLAMA_API_URL") {
            let url = url.trim_end_matches('/');
            self.generation.ollama.api_base = url
                .strip_suffix(CHAT_COMPLETIONS_PATH)
                .unwrap_or(url)
                .to_string();
        }
        if let Some(key) = lookup("GEMINI_API_KEY") {
            self.generation.gemini.api_key = Some(key);
        }
        if let Some(dir) = lookup("AWFUL_RAG_INDEX_DIR") {
            self.index_dir = Some(PathBuf::from(dir));
        }

        if let Some(host) = lookup("PINECONE_INDEX_HOST") {
            match self.remote.as_mut() {
                Some(remote) => remote.host = host,
                None => {
                    self.remote = Some(RemoteConfig {
                        host,
                        api_key: None,
                        namespace: None,
                        metric: RemoteMetric::default(),
                    })
                }
            }
        }
        if let Some(remote) = self.remote.as_mut() {
            if let Some(key) = lookup("PINECONE_API_KEY") {
                remote.api_key = Some(key);
            }
            if let Some(namespace) = lookup("PINECONE_NAMESPACE") {
                remote.namespace = Some(namespace);
            }
        }
    }

    /// Reject configurations that cannot serve requests.
    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.generation.ollama.api_base).map_err(|e| {
            RagError::Config(format!(
                "generation.ollama.api_base '{}' is not a URL: {e}",
                self.generation.ollama.api_base
            ))
        })?;

        if self.gemini_key().is_none() {
            if let Some(route) = self
                .generation
                .models
                .iter()
                .find(|r| r.provider == ProviderKind::Gemini)
            {
                return Err(RagError::Config(format!(
                    "model '{}' is routed to gemini but no API key is set \
                     (set GEMINI_API_KEY or remove the route)",
                    route.name
                )));
            }
        }

        if let Some(remote) = &self.remote {
            reqwest::Url::parse(&remote.host).map_err(|e| {
                RagError::Config(format!("remote.host '{}' is not a URL: {e}", remote.host))
            })?;
            if remote.api_key.as_deref().is_none_or(str::is_empty) {
                return Err(RagError::Config(
                    "remote vector store configured without an API key (set PINECONE_API_KEY)"
                        .into(),
                ));
            }
        }

        if self.retrieval.top_k == 0 {
            return Err(RagError::Config("retrieval.top_k must be at least 1".into()));
        }
        if self.generation.timeout_secs == 0 || self.embedding.timeout_secs == 0 {
            return Err(RagError::Config("timeouts must be greater than zero".into()));
        }
        if self.embedding.kind == EmbeddingKind::Hashing && self.embedding.hashing_dimension == 0 {
            return Err(RagError::Config(
                "embedding.hashing_dimension must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn gemini_key(&self) -> Option<&str> {
        self.generation
            .gemini
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
    }

    /// Directory for the per-user index files.
    pub fn index_dir(&self) -> Result<PathBuf> {
        match &self.index_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(crate::data_dir()?.join("user_indices")),
        }
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding.timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation.timeout_secs)
    }
}

/// Loads the application's configuration from a YAML file.
///
/// Environment overrides and validation are **not** applied here; see
/// [`RagConfig::load`].
///
/// # Examples
///
/// ```no_run
/// use awful_rag::config::load_config;
///
/// match load_config("/path/to/config.yaml".as_ref()) {
///     Ok(config) => println!("{:?}", config),
///     Err(err) => eprintln!("Error loading config: {}", err),
/// }
/// ```
pub fn load_config(file: &Path) -> Result<RagConfig> {
    debug!("Loading config from {}", file.display());
    let content = fs::read_to_string(file)?;
    let config: RagConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Contents written by `arag init`.
pub const DEFAULT_CONFIG_YAML: &str = r#"# Awful RAG configuration
#
# Secrets may also come from the environment:
#   OLLAMA_API_URL, GEMINI_API_KEY, PINECONE_API_KEY, PINECONE_INDEX_HOST,
#   PINECONE_NAMESPACE, AWFUL_RAG_INDEX_DIR

# index_dir: /var/lib/arag/user_indices

embedding:
  kind: minilm            # or: hashing
  model: sentence-transformers/all-MiniLM-L6-v2
  timeout_secs: 120
  incremental: false

retrieval:
  top_k: 2
  default_backend: local  # or: remote

generation:
  default_model: llama3.2:1b
  summary_model: llama3.2:1b
  timeout_secs: 40
  max_tokens: 200
  summary_max_tokens: 150
  ollama:
    api_base: http://localhost:11434/v1
  models:
    - name: llama3.2:1b
      provider: ollama
    # requires GEMINI_API_KEY
    # - name: gemini-2.5-flash
    #   provider: gemini

# remote:
#   host: https://my-index.svc.us-east-1.pinecone.io
#   namespace: users
#   metric: euclidean

server:
  host: 127.0.0.1
  port: 5000
  default_user: default
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn ollama_only() -> RagConfig {
        let mut config = RagConfig::default();
        config.generation.models.retain(|r| r.provider == ProviderKind::Ollama);
        config
    }

    #[test]
    fn test_load_config_valid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
index_dir: "/tmp/arag-indices"
embedding:
  kind: hashing
  hashing_dimension: 128
retrieval:
  top_k: 3
generation:
  default_model: "mistral:7b"
  ollama:
    api_base: "http://example.com/v1"
  models:
    - name: "mistral:7b"
      provider: ollama
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.index_dir, Some(PathBuf::from("/tmp/arag-indices")));
        assert_eq!(config.embedding.kind, EmbeddingKind::Hashing);
        assert_eq!(config.embedding.hashing_dimension, 128);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.generation.default_model, "mistral:7b");
        assert_eq!(config.generation.max_tokens, 200, "unset fields keep defaults");
        assert_eq!(config.generation.models.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_invalid_file() {
        let config = load_config(Path::new("non/existent/path"));
        assert!(config.is_err());
    }

    #[test]
    fn test_load_config_invalid_format() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"invalid: config: format"#).unwrap();

        let config = load_config(temp_file.path());
        assert!(config.is_err());
    }

    #[test]
    fn test_default_config_yaml_parses() {
        let config: RagConfig = serde_yaml::from_str(DEFAULT_CONFIG_YAML).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.generation.models.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_strip_chat_completions_suffix() {
        let mut config = ollama_only();
        config.apply_env_overrides(env(&[(
            "OLLAMA_API_URL",
            "http://gpu-box:11434/v1/chat/completions",
        )]));
        assert_eq!(config.generation.ollama.api_base, "http://gpu-box:11434/v1");
    }

    #[test]
    fn test_env_overrides_build_remote_section() {
        let mut config = ollama_only();
        config.apply_env_overrides(env(&[
            ("PINECONE_INDEX_HOST", "https://idx.example.io"),
            ("PINECONE_API_KEY", "pc-secret"),
            ("PINECONE_NAMESPACE", "users"),
        ]));
        let remote = config.remote.as_ref().unwrap();
        assert_eq!(remote.host, "https://idx.example.io");
        assert_eq!(remote.api_key.as_deref(), Some("pc-secret"));
        assert_eq!(remote.namespace.as_deref(), Some("users"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gemini_route_requires_key() {
        let config = RagConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
        assert!(err.to_string().contains("gemini-2.5-flash"));

        let mut config = RagConfig::default();
        config.apply_env_overrides(env(&[("GEMINI_API_KEY", "g-secret")]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_without_gemini_key_drop_the_route() {
        let config = RagConfig::from_lookup(env(&[])).unwrap();
        assert!(
            config
                .generation
                .models
                .iter()
                .all(|r| r.provider == ProviderKind::Ollama)
        );

        let config = RagConfig::from_lookup(env(&[("GEMINI_API_KEY", "g-secret")])).unwrap();
        assert_eq!(config.generation.models.len(), 2);
    }

    #[test]
    fn test_remote_requires_api_key() {
        let mut config = ollama_only();
        config.remote = Some(RemoteConfig {
            host: "https://idx.example.io".into(),
            api_key: None,
            namespace: None,
            metric: RemoteMetric::Euclidean,
        });
        assert!(matches!(config.validate(), Err(RagError::Config(_))));
    }

    #[test]
    fn test_bad_ollama_url_is_fatal() {
        let mut config = ollama_only();
        config.generation.ollama.api_base = "not a url".into();
        assert!(matches!(config.validate(), Err(RagError::Config(_))));
    }

    #[test]
    fn test_zero_top_k_is_fatal() {
        let mut config = ollama_only();
        config.retrieval.top_k = 0;
        assert!(matches!(config.validate(), Err(RagError::Config(_))));
    }
}
