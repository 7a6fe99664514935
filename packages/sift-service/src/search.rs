use std::{
	cmp::Ordering,
	collections::{BTreeMap, HashSet},
};

use serde_json::{Map, Value};

use crate::{ChunkStore, Result, chunk::Chunk};
use sift_storage::models::ChunkRow;

/// Nearest-neighbour candidates for `query_vec`, best first.
///
/// The result holds at most `search_top_k` chunks with unique identifiers. Scores are
/// `1 - cosine_distance`.
pub async fn vector_search(
	store: &dyn ChunkStore,
	index_name: &str,
	query_vec: &[f32],
	search_top_k: u32,
) -> Result<Vec<Chunk>> {
	let rows = store.search_chunks(index_name, query_vec, search_top_k).await?;
	let mut seen = HashSet::with_capacity(rows.len());
	let mut chunks = Vec::with_capacity(rows.len());

	for row in rows {
		if !seen.insert(row.chunk_id) {
			continue;
		}

		chunks.push(assemble(index_name, row));
	}

	rank_chunks(&mut chunks);
	chunks.truncate(search_top_k as usize);

	Ok(chunks)
}

/// Maps a store row into a chunk. Lineage is resolved elsewhere, so relationships start empty.
pub fn assemble(index_name: &str, row: ChunkRow) -> Chunk {
	let chunk_metadata = metadata_object(row.chunk_id, "chunk", row.chunk_metadata);
	let document_metadata = metadata_object(row.chunk_id, "document", row.document_metadata);

	Chunk {
		index_name: index_name.to_string(),
		document_chunk_id: row.chunk_id,
		document_id: row.document_id,
		document_node_id: row.document_node_id,
		text: row.text,
		chunk_metadata,
		document_metadata,
		relevance_score: 1.0 - row.cosine_distance,
		relationships: BTreeMap::new(),
	}
}

/// Relevance descending, chunk id ascending on ties.
pub fn rank_chunks(chunks: &mut [Chunk]) {
	chunks.sort_by(|a, b| {
		b.relevance_score
			.partial_cmp(&a.relevance_score)
			.unwrap_or(Ordering::Equal)
			.then_with(|| a.document_chunk_id.cmp(&b.document_chunk_id))
	});
}

/// `1 - cos(a, b)`, matching pgvector's `<=>`. Zero vectors are treated as maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
	let mut dot = 0.0_f32;
	let mut norm_a = 0.0_f32;
	let mut norm_b = 0.0_f32;

	for (x, y) in a.iter().zip(b.iter()) {
		dot += x * y;
		norm_a += x * x;
		norm_b += y * y;
	}

	if norm_a == 0.0 || norm_b == 0.0 {
		return 1.0;
	}

	1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn metadata_object(chunk_id: uuid::Uuid, source: &str, value: Value) -> Map<String, Value> {
	match value {
		Value::Object(map) => map,
		Value::Null => Map::new(),
		other => {
			tracing::warn!(
				chunk_id = %chunk_id,
				source,
				kind = value_kind(&other),
				"Metadata is not an object; using an empty map."
			);

			Map::new()
		},
	}
}

fn value_kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "bool",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
