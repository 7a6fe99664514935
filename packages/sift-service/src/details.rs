use std::{
	collections::{BTreeMap, HashMap},
	sync::Arc,
};

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
	EventSink, Result, RetrieveRequest, SiftService,
	chunk::{Chunk, ChunkReference, Relationship},
};

/// A retrieved chunk together with its parent document's display details.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedChunk {
	#[serde(flatten)]
	pub chunk: Chunk,
	pub document_name: Option<String>,
	pub document_uri: Option<String>,
}

/// Node shape handed to a generation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextNode {
	pub id: Uuid,
	pub text: String,
	pub metadata: Map<String, Value>,
	pub relationships: BTreeMap<Relationship, ChunkReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeWithScore {
	pub node: TextNode,
	pub score: f32,
}
impl From<DetailedChunk> for NodeWithScore {
	fn from(detailed: DetailedChunk) -> Self {
		let mut metadata = Map::new();

		if let Some(uri) = detailed.document_uri {
			metadata.insert("sourceUri".to_string(), Value::String(uri));
		}

		Self {
			score: detailed.chunk.relevance_score,
			node: TextNode {
				id: detailed.chunk.document_chunk_id,
				text: detailed.chunk.text,
				metadata,
				relationships: detailed.chunk.relationships,
			},
		}
	}
}

impl SiftService {
	/// Attaches document name and source URI to each chunk with one store lookup.
	///
	/// Order and relationships are kept. A chunk whose document row is gone gets no details.
	pub async fn extend_result_details(&self, chunks: Vec<Chunk>) -> Result<Vec<DetailedChunk>> {
		let mut document_ids: Vec<Uuid> = chunks.iter().map(|chunk| chunk.document_id).collect();

		document_ids.sort_unstable();
		document_ids.dedup();

		let documents: HashMap<Uuid, _> = self
			.store
			.fetch_documents(&document_ids)
			.await?
			.into_iter()
			.map(|row| (row.document_id, row))
			.collect();

		Ok(chunks
			.into_iter()
			.map(|chunk| match documents.get(&chunk.document_id) {
				Some(document) => DetailedChunk {
					document_name: Some(document.name.clone()),
					document_uri: document.source_uri.clone(),
					chunk,
				},
				None => {
					tracing::warn!(
						chunk_id = %chunk.document_chunk_id,
						document_id = %chunk.document_id,
						"Document for retrieved chunk was not found."
					);

					DetailedChunk { chunk, document_name: None, document_uri: None }
				},
			})
			.collect())
	}
}

/// A retriever fixed to one index and option set, queried with text alone.
pub struct BoundRetriever {
	service: Arc<SiftService>,
	template: RetrieveRequest,
	sink: Arc<dyn EventSink>,
}
impl BoundRetriever {
	/// `template.query` is ignored; each call supplies its own.
	pub fn new(
		service: Arc<SiftService>,
		template: RetrieveRequest,
		sink: Arc<dyn EventSink>,
	) -> Self {
		Self { service, template, sink }
	}

	pub fn index(&self) -> &str {
		&self.template.index
	}

	pub async fn retrieve(&self, query: &str) -> Result<Vec<NodeWithScore>> {
		let req = RetrieveRequest { query: query.to_string(), ..self.template.clone() };
		let response = self.service.retrieve(req, self.sink.as_ref()).await?;
		let detailed = self.service.extend_result_details(response.chunks).await?;

		Ok(detailed.into_iter().map(NodeWithScore::from).collect())
	}
}
