use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
	Error, EventSink, Result, SiftService,
	cache::{build_query_embedding_cache_key, cache_key_prefix},
	chunk::Chunk,
	embedding_version,
	events::{RetrieveEvent, RetrieveEventKind},
	filter, rerank, search,
};

/// Backend tag an index must carry to be served by this service.
pub const EXPECTED_PROVIDER: &str = "pgvector";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrieveRequest {
	pub index: String,
	pub query: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_k: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub search_top_k: Option<u32>,
	/// Merged key-wise into the index's configured `options.filters`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filters: Option<Map<String, Value>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub use_cache: Option<bool>,
}
impl RetrieveRequest {
	pub fn new(index: impl Into<String>, query: impl Into<String>) -> Self {
		Self { index: index.into(), query: query.into(), ..Default::default() }
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveResponse {
	pub retrieve_id: Uuid,
	pub chunks: Vec<Chunk>,
}

/// Pipeline progress of a single request. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RetrieveState {
	Idle,
	Embedding,
	Searching,
	Filtering,
	Reranking,
	Done,
}
impl RetrieveState {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Idle => "idle",
			Self::Embedding => "embedding",
			Self::Searching => "searching",
			Self::Filtering => "filtering",
			Self::Reranking => "reranking",
			Self::Done => "done",
		}
	}
}

struct RetrieveRun<'a> {
	retrieve_id: Uuid,
	state: RetrieveState,
	sink: &'a dyn EventSink,
}
impl RetrieveRun<'_> {
	fn enter(&mut self, next: RetrieveState) {
		debug_assert!(next > self.state, "Retrieval state must move forward.");

		tracing::debug!(
			retrieve_id = %self.retrieve_id,
			from = self.state.as_str(),
			to = next.as_str(),
			"Retrieval state changed."
		);

		self.state = next;
	}

	fn emit(&self, kind: RetrieveEventKind) {
		self.sink.emit(RetrieveEvent { retrieve_id: self.retrieve_id, kind });
	}
}

impl SiftService {
	/// Runs the full pipeline for one query against one index.
	///
	/// Returns at most `top_k` chunks with unique identifiers. Any stage failure aborts the
	/// request.
	pub async fn retrieve(
		&self,
		req: RetrieveRequest,
		sink: &dyn EventSink,
	) -> Result<RetrieveResponse> {
		let mut run = RetrieveRun { retrieve_id: Uuid::new_v4(), state: RetrieveState::Idle, sink };
		let retrieve_id = run.retrieve_id;
		let index = self.cfg.index(&req.index).ok_or_else(|| Error::Configuration {
			message: format!("Unknown index {:?}.", req.index),
		})?;

		if index.provider != EXPECTED_PROVIDER {
			return Err(Error::Configuration {
				message: format!(
					"Index {:?} uses provider {:?}; only {EXPECTED_PROVIDER:?} is supported.",
					index.name, index.provider
				),
			});
		}

		let query = normalize_query(&req.query);

		if query.is_empty() {
			return Err(Error::InvalidRequest { message: "query must not be empty.".to_string() });
		}

		let top_k = req.top_k.unwrap_or(self.cfg.retrieve.top_k).max(1);
		let search_top_k = req.search_top_k.unwrap_or(self.cfg.retrieve.search_top_k);

		if search_top_k < top_k {
			tracing::warn!(
				retrieve_id = %retrieve_id,
				top_k,
				search_top_k,
				"search_top_k is smaller than top_k; results may be fewer than requested."
			);
		}

		let metadata_filter = match index.metadata_filter.as_ref().filter(|cfg| cfg.enabled) {
			Some(cfg) => Some((
				self.postprocessors.metadata_filter(cfg)?,
				filter::merge_filter_options(&cfg.options, req.filters.as_ref()),
			)),
			None => {
				if req.filters.as_ref().is_some_and(|filters| !filters.is_empty()) {
					tracing::debug!(
						retrieve_id = %retrieve_id,
						index = %index.name,
						"Ignoring request filters; index has no metadata filter."
					);
				}

				None
			},
		};
		let reranker = match index.reranker.as_ref().filter(|cfg| !cfg.provider.is_empty()) {
			Some(cfg) => Some(self.postprocessors.reranker(cfg, top_k)?),
			None => None,
		};
		let use_cache = self.cfg.embedding_cache.enabled
			&& req.use_cache.unwrap_or(self.cfg.retrieve.use_cache);

		tracing::info!(
			retrieve_id = %retrieve_id,
			index = %index.name,
			top_k,
			search_top_k,
			filter = metadata_filter.is_some(),
			rerank = reranker.is_some(),
			"Retrieval started."
		);

		run.enter(RetrieveState::Embedding);

		let started = Instant::now();
		let query_vec = self.embed_query(retrieve_id, &query, use_cache).await?;

		tracing::debug!(
			retrieve_id = %retrieve_id,
			elapsed_ms = started.elapsed().as_millis() as u64,
			"Query embedded."
		);

		run.emit(RetrieveEventKind::StartSearch { query: query.clone() });
		run.enter(RetrieveState::Searching);

		let started = Instant::now();
		let mut chunks =
			search::vector_search(self.store.as_ref(), &index.name, &query_vec, search_top_k)
				.await?;

		tracing::debug!(
			retrieve_id = %retrieve_id,
			candidates = chunks.len(),
			elapsed_ms = started.elapsed().as_millis() as u64,
			"Vector search finished."
		);

		let filter_limit = (top_k as usize).saturating_mul(2);

		match metadata_filter {
			Some((capability, options)) => {
				chunks.truncate(filter_limit);
				run.emit(RetrieveEventKind::StartFilter { candidates: chunks.len() });
				run.enter(RetrieveState::Filtering);

				let started = Instant::now();

				chunks = filter::metadata_filter_stage(
					capability.as_ref(),
					chunks,
					&query,
					&options,
					filter_limit,
				)
				.await?;

				tracing::debug!(
					retrieve_id = %retrieve_id,
					kept = chunks.len(),
					elapsed_ms = started.elapsed().as_millis() as u64,
					"Metadata filter finished."
				);
			},
			None => chunks.truncate(filter_limit),
		}

		match reranker {
			Some(capability) => {
				run.emit(RetrieveEventKind::StartRerank {
					chunk_ids: chunks.iter().map(|chunk| chunk.document_chunk_id).collect(),
				});
				run.enter(RetrieveState::Reranking);

				let started = Instant::now();

				chunks = rerank::rerank_stage(capability.as_ref(), chunks, &query, top_k).await?;

				tracing::debug!(
					retrieve_id = %retrieve_id,
					returned = chunks.len(),
					elapsed_ms = started.elapsed().as_millis() as u64,
					"Rerank finished."
				);
			},
			None => chunks.truncate(top_k as usize),
		}

		run.enter(RetrieveState::Done);
		run.emit(RetrieveEventKind::Finish { returned: chunks.len() });

		Ok(RetrieveResponse { retrieve_id, chunks })
	}

	/// Drops every cached query embedding and returns how many were removed.
	pub async fn clear_embedding_cache(&self) -> Result<u64> {
		self.cache.clear().await
	}

	async fn embed_query(
		&self,
		retrieve_id: Uuid,
		query: &str,
		use_cache: bool,
	) -> Result<Vec<f32>> {
		let model = embedding_version(&self.cfg);
		let expected_dim = self.cfg.storage.vector_dim as usize;
		let cache_key = if use_cache {
			match build_query_embedding_cache_key(query, &model) {
				Ok(key) => Some(key),
				Err(err) => {
					tracing::warn!(
						retrieve_id = %retrieve_id,
						error = %err,
						"Cache key build failed."
					);

					None
				},
			}
		} else {
			None
		};

		if let Some(key) = cache_key.as_ref() {
			match self.cache.get(key).await {
				Ok(Some(vector)) if vector.len() == expected_dim => {
					tracing::debug!(
						retrieve_id = %retrieve_id,
						cache_key_prefix = cache_key_prefix(key),
						hit = true,
						"Query embedding cache hit."
					);

					return Ok(vector);
				},
				Ok(Some(vector)) => {
					tracing::warn!(
						retrieve_id = %retrieve_id,
						cache_key_prefix = cache_key_prefix(key),
						cached_dim = vector.len(),
						expected_dim,
						"Cached query embedding has the wrong dimension; ignoring it."
					);
				},
				Ok(None) => {
					tracing::debug!(
						retrieve_id = %retrieve_id,
						cache_key_prefix = cache_key_prefix(key),
						hit = false,
						"Query embedding cache miss."
					);
				},
				Err(err) => {
					tracing::warn!(
						retrieve_id = %retrieve_id,
						cache_key_prefix = cache_key_prefix(key),
						error = %err,
						"Query embedding cache read failed."
					);
				},
			}
		}

		let texts = [query.to_string()];
		let vector = self
			.providers
			.embedding
			.embed(&self.cfg.providers.embedding, &texts)
			.await?
			.into_iter()
			.next()
			.ok_or_else(|| Error::Provider {
				message: "Embedding provider returned no vectors.".to_string(),
			})?;

		if vector.len() != expected_dim {
			return Err(Error::Provider {
				message: format!(
					"Embedding provider returned {} dimensions; expected {expected_dim}.",
					vector.len()
				),
			});
		}

		if let Some(key) = cache_key.as_ref()
			&& let Err(err) = self.cache.put(key, &model, &vector).await
		{
			tracing::warn!(
				retrieve_id = %retrieve_id,
				cache_key_prefix = cache_key_prefix(key),
				error = %err,
				"Query embedding cache write failed."
			);
		}

		Ok(vector)
	}
}

/// Trims the query and collapses internal whitespace runs to one space.
pub fn normalize_query(raw: &str) -> String {
	raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
