use serde_json::Value;
use sqlx::{PgExecutor, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
	Error, Result,
	models::{ChunkRow, DocumentRow},
};

pub fn chunk_table(index_name: &str) -> Result<String> {
	if !sift_config::is_identifier(index_name) {
		return Err(Error::InvalidArgument(format!("{index_name:?} is not a valid index name.")));
	}

	Ok(format!("chunk_nodes_{index_name}"))
}

pub fn vector_to_pg(vec: &[f32]) -> String {
	let mut out = String::with_capacity(vec.len() * 8);

	out.push('[');

	for (i, value) in vec.iter().enumerate() {
		if i > 0 {
			out.push(',');
		}

		out.push_str(&value.to_string());
	}

	out.push(']');

	out
}

/// Returns at most `limit` chunks of `index_name` ordered by ascending cosine distance to
/// `query_vec`, each joined with its document node. Equal distances are ordered by chunk id.
pub async fn search_chunks<'e, E>(
	executor: E,
	index_name: &str,
	query_vec: &[f32],
	limit: u32,
) -> Result<Vec<ChunkRow>>
where
	E: PgExecutor<'e>,
{
	let table = chunk_table(index_name)?;
	let sql = format!(
		"\
WITH candidates AS (
	SELECT
		chunk_id,
		document_id,
		text,
		metadata,
		(embedding <=> $1::text::vector) AS cosine_distance
	FROM {table}
	ORDER BY embedding <=> $1::text::vector ASC, chunk_id ASC
	LIMIT $2
)
SELECT
	c.chunk_id,
	c.document_id,
	n.node_id AS document_node_id,
	c.text,
	c.metadata AS chunk_metadata,
	n.metadata AS document_metadata,
	c.cosine_distance::real AS cosine_distance
FROM candidates c
JOIN document_nodes n ON n.document_id = c.document_id
ORDER BY c.cosine_distance ASC, c.chunk_id ASC, n.node_id ASC"
	);
	let rows = sqlx::query_as::<_, ChunkRow>(&sql)
		.bind(vector_to_pg(query_vec))
		.bind(i64::from(limit))
		.fetch_all(executor)
		.await?;

	Ok(rows)
}

pub async fn fetch_documents<'e, E>(executor: E, document_ids: &[Uuid]) -> Result<Vec<DocumentRow>>
where
	E: PgExecutor<'e>,
{
	if document_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, DocumentRow>(
		"\
SELECT document_id, name, source_uri
FROM documents
WHERE document_id = ANY($1)",
	)
	.bind(document_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

/// Reads a cached embedding and records the hit. Entries never expire on their own.
pub async fn fetch_cached_embedding(
	pool: &sqlx::PgPool,
	cache_key: &str,
	now: OffsetDateTime,
) -> Result<Option<Vec<f32>>> {
	let row = sqlx::query("SELECT payload FROM embedding_cache WHERE cache_key = $1")
		.bind(cache_key)
		.fetch_optional(pool)
		.await?;
	let Some(row) = row else {
		return Ok(None);
	};
	let payload: Value = row.try_get("payload")?;
	let vector = decode_vector(&payload)?;

	sqlx::query(
		"\
UPDATE embedding_cache
SET last_accessed_at = $1, hit_count = hit_count + 1
WHERE cache_key = $2",
	)
	.bind(now)
	.bind(cache_key)
	.execute(pool)
	.await?;

	Ok(Some(vector))
}

pub async fn store_cached_embedding(
	pool: &sqlx::PgPool,
	cache_key: &str,
	model: &str,
	vector: &[f32],
	now: OffsetDateTime,
) -> Result<()> {
	let payload = serde_json::json!(vector);

	sqlx::query(
		"\
INSERT INTO embedding_cache (cache_key, model, payload, created_at, last_accessed_at, hit_count)
VALUES ($1, $2, $3, $4, $4, 0)
ON CONFLICT (cache_key) DO UPDATE
SET
	payload = EXCLUDED.payload,
	last_accessed_at = EXCLUDED.last_accessed_at",
	)
	.bind(cache_key)
	.bind(model)
	.bind(payload)
	.bind(now)
	.execute(pool)
	.await?;

	Ok(())
}

pub async fn clear_embedding_cache(pool: &sqlx::PgPool) -> Result<u64> {
	let result = sqlx::query("DELETE FROM embedding_cache").execute(pool).await?;

	Ok(result.rows_affected())
}

fn decode_vector(payload: &Value) -> Result<Vec<f32>> {
	let values = payload
		.as_array()
		.ok_or_else(|| Error::CorruptRow("Cached embedding payload is not an array.".to_string()))?;
	let mut out = Vec::with_capacity(values.len());

	for value in values {
		let number = value.as_f64().ok_or_else(|| {
			Error::CorruptRow("Cached embedding payload contains a non-numeric value.".to_string())
		})?;

		out.push(number as f32);
	}

	Ok(out)
}
