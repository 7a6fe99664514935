use serde_json::Value;
use uuid::Uuid;

/// One chunk joined with its document node, as returned by a nearest-neighbour query.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkRow {
	pub chunk_id: Uuid,
	pub document_id: Uuid,
	pub document_node_id: Uuid,
	pub text: String,
	pub chunk_metadata: Value,
	pub document_metadata: Value,
	pub cosine_distance: f32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentRow {
	pub document_id: Uuid,
	pub name: String,
	pub source_uri: Option<String>,
}
