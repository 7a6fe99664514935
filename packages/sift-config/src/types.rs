use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub providers: Providers,
	#[serde(default)]
	pub retrieve: Retrieve,
	#[serde(default)]
	pub embedding_cache: EmbeddingCache,
	pub indexes: Vec<IndexConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
	pub postgres: Postgres,
	/// Dimension of the `embedding` column in every chunk table.
	pub vector_dim: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub rerank: Option<ProviderConfig>,
	pub llm: Option<LlmProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

/// Request defaults applied when a caller leaves a field unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Retrieve {
	pub top_k: u32,
	pub search_top_k: u32,
	pub use_cache: bool,
}
impl Default for Retrieve {
	fn default() -> Self {
		Self { top_k: 10, search_top_k: 100, use_cache: true }
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingCache {
	pub enabled: bool,
	/// One of `postgres` or `memory`.
	pub backend: String,
}
impl Default for EmbeddingCache {
	fn default() -> Self {
		Self { enabled: true, backend: "postgres".to_string() }
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
	pub name: String,
	/// Backend tag. Retrieval refuses to run against an index whose tag is not `pgvector`.
	pub provider: String,
	pub metadata_filter: Option<MetadataFilterConfig>,
	pub reranker: Option<RerankerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataFilterConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_filter_strategy")]
	pub strategy: String,
	#[serde(default)]
	pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RerankerConfig {
	pub provider: String,
	/// Accepts `model` for either provider and `temperature` for `llm`.
	#[serde(default)]
	pub options: Map<String, Value>,
}
impl RerankerConfig {
	/// Reads `options` into typed overrides, rejecting keys the provider does not use.
	pub fn overrides(&self) -> Result<RerankOverrides> {
		let mut overrides = RerankOverrides::default();

		for (key, value) in &self.options {
			match (key.as_str(), value) {
				(_, Value::Null) => {},
				("model", Value::String(model)) if !model.trim().is_empty() => {
					overrides.model = Some(model.trim().to_string());
				},
				("model", _) => {
					return Err(Error::Validation {
						message: "reranker.options.model must be a non-empty string.".to_string(),
					});
				},
				("temperature", value) if self.provider == "llm" => {
					let temperature = value.as_f64().ok_or_else(|| Error::Validation {
						message: "reranker.options.temperature must be a number.".to_string(),
					})?;

					overrides.temperature = Some(temperature as f32);
				},
				(other, _) => {
					return Err(Error::Validation {
						message: format!(
							"reranker.options.{other} is not supported by reranker provider {}.",
							self.provider
						),
					});
				},
			}
		}

		Ok(overrides)
	}
}

/// Per-index settings a reranker applies on top of its provider config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RerankOverrides {
	pub model: Option<String>,
	pub temperature: Option<f32>,
}

fn default_true() -> bool {
	true
}

fn default_filter_strategy() -> String {
	"static".to_string()
}
