use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrieveEvent {
	pub retrieve_id: Uuid,
	#[serde(flatten)]
	pub kind: RetrieveEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RetrieveEventKind {
	StartSearch { query: String },
	StartFilter { candidates: usize },
	StartRerank { chunk_ids: Vec<Uuid> },
	Finish { returned: usize },
}
impl RetrieveEventKind {
	pub fn name(&self) -> &'static str {
		match self {
			Self::StartSearch { .. } => "start-search",
			Self::StartFilter { .. } => "start-filter",
			Self::StartRerank { .. } => "start-rerank",
			Self::Finish { .. } => "finish",
		}
	}
}

/// Receives lifecycle notifications. Emitting must not block or fail the request.
pub trait EventSink
where
	Self: Send + Sync,
{
	fn emit(&self, event: RetrieveEvent);
}

pub struct TracingSink;
impl EventSink for TracingSink {
	fn emit(&self, event: RetrieveEvent) {
		match &event.kind {
			RetrieveEventKind::StartSearch { query } => {
				tracing::info!(
					retrieve_id = %event.retrieve_id,
					query = %query,
					"Retrieval search started."
				);
			},
			RetrieveEventKind::StartFilter { candidates } => {
				tracing::info!(
					retrieve_id = %event.retrieve_id,
					candidates = *candidates,
					"Retrieval metadata filter started."
				);
			},
			RetrieveEventKind::StartRerank { chunk_ids } => {
				tracing::info!(
					retrieve_id = %event.retrieve_id,
					candidates = chunk_ids.len(),
					"Retrieval rerank started."
				);
			},
			RetrieveEventKind::Finish { returned } => {
				tracing::info!(
					retrieve_id = %event.retrieve_id,
					returned = *returned,
					"Retrieval finished."
				);
			},
		}
	}
}

/// Forwards events to a channel. A dropped receiver silently discards them.
pub struct ChannelSink {
	tx: UnboundedSender<RetrieveEvent>,
}
impl ChannelSink {
	pub fn new(tx: UnboundedSender<RetrieveEvent>) -> Self {
		Self { tx }
	}
}
impl EventSink for ChannelSink {
	fn emit(&self, event: RetrieveEvent) {
		let _ = self.tx.send(event);
	}
}

pub struct NoopSink;
impl EventSink for NoopSink {
	fn emit(&self, _event: RetrieveEvent) {}
}
