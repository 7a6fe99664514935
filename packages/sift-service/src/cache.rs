use std::{collections::HashMap, sync::Mutex};

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::{BoxFuture, Error, Result};
use sift_storage::queries;

/// Query vectors keyed by a hash of the normalized query and the embedding model identity.
///
/// Entries never expire; `clear` is the only way to invalidate them.
pub trait EmbeddingCache
where
	Self: Send + Sync,
{
	fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<f32>>>>;

	fn put<'a>(
		&'a self,
		key: &'a str,
		model: &'a str,
		vector: &'a [f32],
	) -> BoxFuture<'a, Result<()>>;

	/// Returns the number of dropped entries.
	fn clear(&self) -> BoxFuture<'_, Result<u64>>;
}

pub struct PgEmbeddingCache {
	pool: PgPool,
}
impl PgEmbeddingCache {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}
}
impl EmbeddingCache for PgEmbeddingCache {
	fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<f32>>>> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();

			Ok(queries::fetch_cached_embedding(&self.pool, key, now).await?)
		})
	}

	fn put<'a>(
		&'a self,
		key: &'a str,
		model: &'a str,
		vector: &'a [f32],
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();

			Ok(queries::store_cached_embedding(&self.pool, key, model, vector, now).await?)
		})
	}

	fn clear(&self) -> BoxFuture<'_, Result<u64>> {
		Box::pin(async move { Ok(queries::clear_embedding_cache(&self.pool).await?) })
	}
}

/// Process-local cache. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryEmbeddingCache {
	entries: Mutex<HashMap<String, Vec<f32>>>,
}
impl MemoryEmbeddingCache {
	pub fn len(&self) -> usize {
		self.entries.lock().map(|entries| entries.len()).unwrap_or_default()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn poisoned() -> Error {
		Error::Storage { message: "Embedding cache lock is poisoned.".to_string() }
	}
}
impl EmbeddingCache for MemoryEmbeddingCache {
	fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<f32>>>> {
		Box::pin(async move {
			let entries = self.entries.lock().map_err(|_| Self::poisoned())?;

			Ok(entries.get(key).cloned())
		})
	}

	fn put<'a>(
		&'a self,
		key: &'a str,
		_model: &'a str,
		vector: &'a [f32],
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;

			entries.insert(key.to_string(), vector.to_vec());

			Ok(())
		})
	}

	fn clear(&self) -> BoxFuture<'_, Result<u64>> {
		Box::pin(async move {
			let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
			let dropped = entries.len() as u64;

			entries.clear();

			Ok(dropped)
		})
	}
}

pub(crate) fn build_query_embedding_cache_key(query: &str, model: &str) -> Result<String> {
	let payload = serde_json::json!({
		"kind": "query_embedding",
		"query": query,
		"model": model,
	});
	let raw = serde_json::to_vec(&payload).map_err(|err| Error::Storage {
		message: format!("Failed to encode cache key payload: {err}"),
	})?;

	Ok(blake3::hash(&raw).to_hex().to_string())
}

pub(crate) fn cache_key_prefix(key: &str) -> &str {
	let len = key.len().min(12);

	&key[..len]
}
