pub mod cache;
pub mod chunk;
pub mod details;
pub mod events;
pub mod filter;
pub mod rerank;
pub mod retrieve;
pub mod search;

mod error;

pub use cache::{EmbeddingCache, MemoryEmbeddingCache, PgEmbeddingCache};
pub use chunk::{Chunk, ChunkReference, ChunkView, Relationship, ScoredChunkView};
pub use details::{BoundRetriever, DetailedChunk, NodeWithScore, TextNode};
pub use error::{Error, ErrorKind, Result};
pub use events::{ChannelSink, EventSink, NoopSink, RetrieveEvent, RetrieveEventKind, TracingSink};
pub use filter::{LlmMetadataFilter, MetadataFilter, StaticMetadataFilter};
pub use rerank::{HttpReranker, LlmReranker, Reranker};
pub use retrieve::{EXPECTED_PROVIDER, RetrieveRequest, RetrieveResponse, RetrieveState};
pub use sift_providers::rerank::RerankHit;

use std::{future::Future, pin::Pin, sync::Arc};

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use sift_config::{
	Config, EmbeddingProviderConfig, LlmProviderConfig, MetadataFilterConfig, ProviderConfig,
	RerankerConfig,
};
use sift_providers::{embedding, extractor, rerank as rerank_api};
use sift_storage::{
	db::Db,
	models::{ChunkRow, DocumentRow},
	queries,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>>;
}

pub trait RerankProvider
where
	Self: Send + Sync,
{
	fn rerank<'a>(
		&'a self,
		cfg: &'a ProviderConfig,
		query: &'a str,
		docs: &'a [String],
		top_n: usize,
	) -> BoxFuture<'a, Result<Vec<RerankHit>>>;
}

pub trait ExtractorProvider
where
	Self: Send + Sync,
{
	fn extract<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [Value],
	) -> BoxFuture<'a, Result<Value>>;
}

/// Read-only query surface over the embedded corpus.
pub trait ChunkStore
where
	Self: Send + Sync,
{
	/// At most `limit` rows ordered by ascending cosine distance, ties by chunk id.
	fn search_chunks<'a>(
		&'a self,
		index_name: &'a str,
		query_vec: &'a [f32],
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ChunkRow>>>;

	fn fetch_documents<'a>(
		&'a self,
		document_ids: &'a [Uuid],
	) -> BoxFuture<'a, Result<Vec<DocumentRow>>>;
}

/// Builds the pluggable stages an index is configured with.
pub trait PostprocessorFactory
where
	Self: Send + Sync,
{
	fn metadata_filter(&self, cfg: &MetadataFilterConfig) -> Result<Arc<dyn MetadataFilter>>;

	fn reranker(&self, cfg: &RerankerConfig, top_k: u32) -> Result<Arc<dyn Reranker>>;
}

#[derive(Clone)]
pub struct Providers {
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub rerank: Arc<dyn RerankProvider>,
	pub extractor: Arc<dyn ExtractorProvider>,
}
impl Providers {
	pub fn new(
		embedding: Arc<dyn EmbeddingProvider>,
		rerank: Arc<dyn RerankProvider>,
		extractor: Arc<dyn ExtractorProvider>,
	) -> Self {
		Self { embedding, rerank, extractor }
	}
}
impl Default for Providers {
	fn default() -> Self {
		let provider = Arc::new(DefaultProviders);

		Self { embedding: provider.clone(), rerank: provider.clone(), extractor: provider }
	}
}

/// Selects filter and reranker strategies by name from the index configuration.
pub struct DefaultPostprocessors {
	providers: Providers,
	rerank_cfg: Option<ProviderConfig>,
	llm_cfg: Option<LlmProviderConfig>,
}
impl DefaultPostprocessors {
	pub fn new(cfg: &Config, providers: Providers) -> Self {
		Self {
			providers,
			rerank_cfg: cfg.providers.rerank.clone(),
			llm_cfg: cfg.providers.llm.clone(),
		}
	}

	fn llm_cfg(&self, what: &str) -> Result<LlmProviderConfig> {
		self.llm_cfg.clone().ok_or_else(|| Error::Configuration {
			message: format!("{what} requires [providers.llm]."),
		})
	}
}
impl PostprocessorFactory for DefaultPostprocessors {
	fn metadata_filter(&self, cfg: &MetadataFilterConfig) -> Result<Arc<dyn MetadataFilter>> {
		match cfg.strategy.as_str() {
			"static" => Ok(Arc::new(StaticMetadataFilter)),
			"llm" => Ok(Arc::new(LlmMetadataFilter::new(
				self.llm_cfg("Metadata filter strategy llm")?,
				self.providers.extractor.clone(),
			))),
			other => Err(Error::Configuration {
				message: format!("Unknown metadata filter strategy {other:?}."),
			}),
		}
	}

	fn reranker(&self, cfg: &RerankerConfig, top_k: u32) -> Result<Arc<dyn Reranker>> {
		let overrides =
			cfg.overrides().map_err(|err| Error::Configuration { message: err.to_string() })?;

		match cfg.provider.as_str() {
			"http" => {
				let mut rerank_cfg =
					self.rerank_cfg.clone().ok_or_else(|| Error::Configuration {
						message: "Reranker provider http requires [providers.rerank].".to_string(),
					})?;

				if let Some(model) = overrides.model {
					rerank_cfg.model = model;
				}

				Ok(Arc::new(HttpReranker::new(rerank_cfg, self.providers.rerank.clone(), top_k)))
			},
			"llm" => {
				let mut llm_cfg = self.llm_cfg("Reranker provider llm")?;

				if let Some(model) = overrides.model {
					llm_cfg.model = model;
				}
				if let Some(temperature) = overrides.temperature {
					llm_cfg.temperature = temperature;
				}

				Ok(Arc::new(LlmReranker::new(llm_cfg, self.providers.extractor.clone(), top_k)))
			},
			other => Err(Error::Configuration {
				message: format!("Unknown reranker provider {other:?}."),
			}),
		}
	}
}

pub struct PgChunkStore {
	pool: PgPool,
}
impl PgChunkStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}
}
impl ChunkStore for PgChunkStore {
	fn search_chunks<'a>(
		&'a self,
		index_name: &'a str,
		query_vec: &'a [f32],
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ChunkRow>>> {
		Box::pin(async move {
			Ok(queries::search_chunks(&self.pool, index_name, query_vec, limit).await?)
		})
	}

	fn fetch_documents<'a>(
		&'a self,
		document_ids: &'a [Uuid],
	) -> BoxFuture<'a, Result<Vec<DocumentRow>>> {
		Box::pin(async move { Ok(queries::fetch_documents(&self.pool, document_ids).await?) })
	}
}

pub struct SiftService {
	pub cfg: Config,
	pub store: Arc<dyn ChunkStore>,
	pub cache: Arc<dyn EmbeddingCache>,
	pub providers: Providers,
	pub postprocessors: Arc<dyn PostprocessorFactory>,
}
impl SiftService {
	pub fn new(cfg: Config, db: Db) -> Self {
		Self::with_providers(cfg, db, Providers::default())
	}

	pub fn with_providers(cfg: Config, db: Db, providers: Providers) -> Self {
		let cache: Arc<dyn EmbeddingCache> = match cfg.embedding_cache.backend.as_str() {
			"memory" => Arc::new(MemoryEmbeddingCache::default()),
			_ => Arc::new(PgEmbeddingCache::new(db.pool.clone())),
		};
		let store = Arc::new(PgChunkStore::new(db.pool));
		let postprocessors = Arc::new(DefaultPostprocessors::new(&cfg, providers.clone()));

		Self { cfg, store, cache, providers, postprocessors }
	}

	pub fn from_parts(
		cfg: Config,
		store: Arc<dyn ChunkStore>,
		cache: Arc<dyn EmbeddingCache>,
		providers: Providers,
		postprocessors: Arc<dyn PostprocessorFactory>,
	) -> Self {
		Self { cfg, store, cache, providers, postprocessors }
	}
}

struct DefaultProviders;
impl EmbeddingProvider for DefaultProviders {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
		Box::pin(async move { Ok(embedding::embed(cfg, texts).await?) })
	}
}
impl RerankProvider for DefaultProviders {
	fn rerank<'a>(
		&'a self,
		cfg: &'a ProviderConfig,
		query: &'a str,
		docs: &'a [String],
		top_n: usize,
	) -> BoxFuture<'a, Result<Vec<RerankHit>>> {
		Box::pin(async move { Ok(rerank_api::rerank(cfg, query, docs, top_n).await?) })
	}
}
impl ExtractorProvider for DefaultProviders {
	fn extract<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [Value],
	) -> BoxFuture<'a, Result<Value>> {
		Box::pin(async move { Ok(extractor::extract(cfg, messages).await?) })
	}
}

/// Identity of the embedding model, used to key cached query vectors.
pub(crate) fn embedding_version(cfg: &Config) -> String {
	format!(
		"{}:{}:{}",
		cfg.providers.embedding.provider_id,
		cfg.providers.embedding.model,
		cfg.providers.embedding.dimensions
	)
}
