use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Error, Result};

/// Metadata keys produced by ingestion-time extractors. They help embedding but only bloat
/// prompts, so LLM-facing renderings skip them.
pub const LLM_EXCLUDED_METADATA_KEYS: [&str; 3] =
	["sectionSummary", "questionsThisExcerptCanAnswer", "excerptKeywords"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
	Previous,
	Next,
	Parent,
}

/// A lineage edge to another chunk. Never implies ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReference {
	pub chunk_id: Uuid,
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
	pub index_name: String,
	pub document_chunk_id: Uuid,
	pub document_id: Uuid,
	pub document_node_id: Uuid,
	pub text: String,
	pub chunk_metadata: Map<String, Value>,
	pub document_metadata: Map<String, Value>,
	/// Only comparable with scores produced by the same stage.
	pub relevance_score: f32,
	pub relationships: BTreeMap<Relationship, ChunkReference>,
}
impl Chunk {
	/// Chunk metadata overlaid with document metadata; document keys win.
	pub fn merged_metadata(&self) -> Map<String, Value> {
		let mut merged = self.chunk_metadata.clone();

		for (key, value) in &self.document_metadata {
			merged.insert(key.clone(), value.clone());
		}

		merged
	}

	pub fn view(&self) -> ChunkView {
		ChunkView {
			id: self.document_chunk_id,
			text: self.text.clone(),
			metadata: self.merged_metadata(),
		}
	}
}

/// What pluggable filters and rerankers get to see of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkView {
	pub id: Uuid,
	pub text: String,
	pub metadata: Map<String, Value>,
}
impl ChunkView {
	pub fn llm_metadata(&self) -> Map<String, Value> {
		self.metadata
			.iter()
			.filter(|(key, _)| !LLM_EXCLUDED_METADATA_KEYS.contains(&key.as_str()))
			.map(|(key, value)| (key.clone(), value.clone()))
			.collect()
	}

	/// `key: value` lines followed by a blank line and the chunk text.
	pub fn render_for_llm(&self) -> String {
		let metadata = self.llm_metadata();

		if metadata.is_empty() {
			return self.text.clone();
		}

		let mut out = String::new();

		for (key, value) in &metadata {
			match value {
				Value::String(raw) => out.push_str(&format!("{key}: {raw}\n")),
				other => out.push_str(&format!("{key}: {other}\n")),
			}
		}

		out.push('\n');
		out.push_str(&self.text);

		out
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunkView {
	pub score: Option<f32>,
	pub chunk: ChunkView,
}

pub(crate) struct Correlated {
	pub(crate) chunk: Chunk,
	pub(crate) score: Option<f32>,
	/// Position of the chunk in the stage input.
	pub(crate) input_rank: usize,
}

pub(crate) fn project(chunks: &[Chunk]) -> Vec<ScoredChunkView> {
	chunks
		.iter()
		.map(|chunk| ScoredChunkView { score: Some(chunk.relevance_score), chunk: chunk.view() })
		.collect()
}

/// Maps the items a pluggable stage returned back onto the full chunk records it was given.
///
/// Any identifier that was not part of the input, or that comes back twice, is a contract
/// violation by the plugged component.
pub(crate) fn correlate(
	stage: &str,
	candidates: Vec<Chunk>,
	returned: Vec<ScoredChunkView>,
) -> Result<Vec<Correlated>> {
	let mut by_id: HashMap<Uuid, (usize, Chunk)> = candidates
		.into_iter()
		.enumerate()
		.map(|(rank, chunk)| (chunk.document_chunk_id, (rank, chunk)))
		.collect();
	let mut emitted = HashSet::with_capacity(returned.len());
	let mut out = Vec::with_capacity(returned.len());

	for item in returned {
		let id = item.chunk.id;
		let Some((input_rank, chunk)) = by_id.remove(&id) else {
			let message = if emitted.contains(&id) {
				format!("{stage} returned chunk {id} more than once.")
			} else {
				format!("{stage} returned chunk {id} which was not among its candidates.")
			};

			return Err(Error::Consistency { message });
		};

		emitted.insert(id);
		out.push(Correlated { chunk, score: item.score, input_rank });
	}

	Ok(out)
}
