mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Config, EmbeddingCache, EmbeddingProviderConfig, IndexConfig, LlmProviderConfig,
	MetadataFilterConfig, Postgres, ProviderConfig, Providers, RerankOverrides, RerankerConfig,
	Retrieve, Service, Storage,
};

use std::{collections::HashSet, fs, path::Path};

pub const FILTER_STRATEGIES: [&str; 2] = ["static", "llm"];
pub const RERANKER_PROVIDERS: [&str; 2] = ["http", "llm"];
pub const CACHE_BACKENDS: [&str; 2] = ["postgres", "memory"];

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.log_level.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.log_level must be non-empty.".to_string(),
		});
	}
	if cfg.storage.postgres.dsn.trim().is_empty() {
		return Err(Error::Validation {
			message: "storage.postgres.dsn must be non-empty.".to_string(),
		});
	}
	if cfg.storage.postgres.pool_max_conns == 0 {
		return Err(Error::Validation {
			message: "storage.postgres.pool_max_conns must be greater than zero.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions == 0 {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must be greater than zero.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions != cfg.storage.vector_dim {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must match storage.vector_dim.".to_string(),
		});
	}
	if cfg.providers.embedding.api_key.trim().is_empty() {
		return Err(Error::Validation {
			message: "Provider embedding api_key must be non-empty.".to_string(),
		});
	}
	if cfg.retrieve.top_k == 0 {
		return Err(Error::Validation {
			message: "retrieve.top_k must be greater than zero.".to_string(),
		});
	}
	if cfg.retrieve.search_top_k < cfg.retrieve.top_k {
		return Err(Error::Validation {
			message: "retrieve.search_top_k must be greater than or equal to retrieve.top_k."
				.to_string(),
		});
	}
	if !CACHE_BACKENDS.contains(&cfg.embedding_cache.backend.as_str()) {
		return Err(Error::Validation {
			message: "embedding_cache.backend must be one of postgres or memory.".to_string(),
		});
	}
	if cfg.indexes.is_empty() {
		return Err(Error::Validation {
			message: "At least one [[indexes]] entry is required.".to_string(),
		});
	}

	let mut seen = HashSet::new();

	for index in &cfg.indexes {
		if !is_identifier(&index.name) {
			return Err(Error::Validation {
				message: format!(
					"indexes.name {:?} must contain only lowercase ASCII letters, digits, or underscores.",
					index.name
				),
			});
		}
		if !seen.insert(index.name.as_str()) {
			return Err(Error::Validation {
				message: format!("indexes.name {:?} is declared more than once.", index.name),
			});
		}
		if index.provider.trim().is_empty() {
			return Err(Error::Validation {
				message: format!("indexes.{}.provider must be non-empty.", index.name),
			});
		}

		if let Some(filter) = index.metadata_filter.as_ref() {
			if !FILTER_STRATEGIES.contains(&filter.strategy.as_str()) {
				return Err(Error::Validation {
					message: format!(
						"indexes.{}.metadata_filter.strategy must be one of static or llm.",
						index.name
					),
				});
			}
			if let Some(filters) = filter.options.get("filters")
				&& !filters.is_object()
			{
				return Err(Error::Validation {
					message: format!(
						"indexes.{}.metadata_filter.options.filters must be a table.",
						index.name
					),
				});
			}
			if filter.strategy == "llm" && cfg.providers.llm.is_none() {
				return Err(Error::Validation {
					message: format!(
						"indexes.{}.metadata_filter.strategy llm requires [providers.llm].",
						index.name
					),
				});
			}
		}
		if let Some(reranker) = index.reranker.as_ref() {
			if !RERANKER_PROVIDERS.contains(&reranker.provider.as_str()) {
				return Err(Error::Validation {
					message: format!(
						"indexes.{}.reranker.provider must be one of http or llm.",
						index.name
					),
				});
			}
			if reranker.provider == "http" && cfg.providers.rerank.is_none() {
				return Err(Error::Validation {
					message: format!(
						"indexes.{}.reranker.provider http requires [providers.rerank].",
						index.name
					),
				});
			}
			if reranker.provider == "llm" && cfg.providers.llm.is_none() {
				return Err(Error::Validation {
					message: format!(
						"indexes.{}.reranker.provider llm requires [providers.llm].",
						index.name
					),
				});
			}

			reranker.overrides().map_err(|err| Error::Validation {
				message: format!("indexes.{}.{err}", index.name),
			})?;
		}
	}

	for (label, key) in [
		("rerank", cfg.providers.rerank.as_ref().map(|p| &p.api_key)),
		("llm", cfg.providers.llm.as_ref().map(|p| &p.api_key)),
	] {
		if let Some(key) = key
			&& key.trim().is_empty()
		{
			return Err(Error::Validation {
				message: format!("Provider {label} api_key must be non-empty."),
			});
		}
	}

	Ok(())
}

impl Config {
	pub fn index(&self, name: &str) -> Option<&IndexConfig> {
		self.indexes.iter().find(|index| index.name == name)
	}
}

/// Index names end up inside SQL identifiers, so they are restricted to `[a-z0-9_]+`.
pub fn is_identifier(name: &str) -> bool {
	!name.is_empty()
		&& name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

fn normalize(cfg: &mut Config) {
	for index in &mut cfg.indexes {
		index.name = index.name.trim().to_string();
		index.provider = index.provider.trim().to_string();

		if index.metadata_filter.as_ref().map(|filter| !filter.enabled).unwrap_or(false) {
			index.metadata_filter = None;
		}
		if index
			.reranker
			.as_ref()
			.map(|reranker| reranker.provider.trim().is_empty())
			.unwrap_or(false)
		{
			index.reranker = None;
		}
	}
}
