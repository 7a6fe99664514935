use std::{collections::BTreeSet, sync::Arc};

use serde_json::{Map, Value};

use crate::{
	BoxFuture, Error, ExtractorProvider, Result,
	chunk::{self, Chunk, ScoredChunkView},
	search,
};
use sift_config::LlmProviderConfig;

const FILTER_INFERENCE_SYSTEM_PROMPT: &str = "\
You narrow down search results by metadata. Given a user query and the metadata keys present on \
the candidate excerpts, return a JSON object of the form {\"filters\": {\"<key>\": <value>}}. Only \
use keys from the provided list. A value may be a list to accept any of several values. Return \
{\"filters\": {}} when the query does not constrain any key. Output JSON only.";

/// Narrows candidates by metadata. Implementations may drop and reorder items but must only
/// return items they were given, each at most once.
pub trait MetadataFilter
where
	Self: Send + Sync,
{
	fn postprocess<'a>(
		&'a self,
		candidates: Vec<ScoredChunkView>,
		query: &'a str,
		options: &'a Map<String, Value>,
	) -> BoxFuture<'a, Result<Vec<ScoredChunkView>>>;
}

/// Keeps candidates whose metadata matches every entry of `options.filters`.
pub struct StaticMetadataFilter;
impl MetadataFilter for StaticMetadataFilter {
	fn postprocess<'a>(
		&'a self,
		candidates: Vec<ScoredChunkView>,
		_query: &'a str,
		options: &'a Map<String, Value>,
	) -> BoxFuture<'a, Result<Vec<ScoredChunkView>>> {
		Box::pin(async move {
			let filters = configured_filters(options)?;

			Ok(apply_filters(candidates, &filters))
		})
	}
}

/// Asks the LLM which metadata constraints the query implies, then filters like
/// [`StaticMetadataFilter`]. Explicit `options.filters` entries win over inferred ones.
pub struct LlmMetadataFilter {
	cfg: LlmProviderConfig,
	extractor: Arc<dyn ExtractorProvider>,
}
impl LlmMetadataFilter {
	pub fn new(cfg: LlmProviderConfig, extractor: Arc<dyn ExtractorProvider>) -> Self {
		Self { cfg, extractor }
	}
}
impl MetadataFilter for LlmMetadataFilter {
	fn postprocess<'a>(
		&'a self,
		candidates: Vec<ScoredChunkView>,
		query: &'a str,
		options: &'a Map<String, Value>,
	) -> BoxFuture<'a, Result<Vec<ScoredChunkView>>> {
		Box::pin(async move {
			let explicit = configured_filters(options)?;

			if candidates.is_empty() {
				return Ok(candidates);
			}

			let messages = build_filter_messages(query, &candidates);
			let raw = self.extractor.extract(&self.cfg, &messages).await?;
			let mut filters = parse_inferred_filters(raw)?;

			tracing::debug!(
				inferred = filters.len(),
				explicit = explicit.len(),
				"Inferred metadata filters."
			);

			for (key, value) in explicit {
				filters.insert(key, value);
			}

			Ok(apply_filters(candidates, &filters))
		})
	}
}

/// Overlays caller filters onto a copy of the configured options; caller keys win.
pub fn merge_filter_options(
	configured: &Map<String, Value>,
	caller: Option<&Map<String, Value>>,
) -> Map<String, Value> {
	let mut options = configured.clone();
	let Some(caller) = caller else {
		return options;
	};
	let mut filters = match options.remove("filters") {
		Some(Value::Object(map)) => map,
		_ => Map::new(),
	};

	for (key, value) in caller {
		filters.insert(key.clone(), value.clone());
	}

	options.insert("filters".to_string(), Value::Object(filters));

	options
}

/// Every filter entry must match. An array filter value accepts any of its elements.
pub fn matches_filters(metadata: &Map<String, Value>, filters: &Map<String, Value>) -> bool {
	filters.iter().all(|(key, expected)| {
		let Some(actual) = metadata.get(key) else {
			return false;
		};

		match expected {
			Value::Array(choices) => choices.iter().any(|choice| choice == actual),
			other => other == actual,
		}
	})
}

/// Runs `filter` over at most `limit` leading candidates and maps the survivors back onto
/// their full records, ranked by the scores the filter assigned.
pub(crate) async fn metadata_filter_stage(
	filter: &dyn MetadataFilter,
	mut candidates: Vec<Chunk>,
	query: &str,
	options: &Map<String, Value>,
	limit: usize,
) -> Result<Vec<Chunk>> {
	candidates.truncate(limit);

	let views = chunk::project(&candidates);
	let returned = filter.postprocess(views, query, options).await?;
	let correlated = chunk::correlate("Metadata filter", candidates, returned)?;
	let mut out: Vec<Chunk> = correlated
		.into_iter()
		.map(|item| {
			let mut chunk = item.chunk;

			chunk.relevance_score = item.score.unwrap_or(0.0);

			chunk
		})
		.collect();

	search::rank_chunks(&mut out);

	Ok(out)
}

fn configured_filters(options: &Map<String, Value>) -> Result<Map<String, Value>> {
	match options.get("filters") {
		None | Some(Value::Null) => Ok(Map::new()),
		Some(Value::Object(map)) => Ok(map.clone()),
		Some(_) => Err(Error::Configuration {
			message: "metadata_filter.options.filters must be a table.".to_string(),
		}),
	}
}

fn apply_filters(
	candidates: Vec<ScoredChunkView>,
	filters: &Map<String, Value>,
) -> Vec<ScoredChunkView> {
	if filters.is_empty() {
		return candidates;
	}

	candidates.into_iter().filter(|item| matches_filters(&item.chunk.metadata, filters)).collect()
}

fn build_filter_messages(query: &str, candidates: &[ScoredChunkView]) -> Vec<Value> {
	let mut keys = BTreeSet::new();

	for item in candidates {
		for key in item.chunk.llm_metadata().keys() {
			keys.insert(key.clone());
		}
	}

	let user = serde_json::json!({
		"query": query,
		"metadata_keys": keys.into_iter().collect::<Vec<_>>(),
	});

	vec![
		serde_json::json!({ "role": "system", "content": FILTER_INFERENCE_SYSTEM_PROMPT }),
		serde_json::json!({ "role": "user", "content": user.to_string() }),
	]
}

fn parse_inferred_filters(raw: Value) -> Result<Map<String, Value>> {
	match raw {
		Value::Object(mut root) => match root.remove("filters") {
			None | Some(Value::Null) => Ok(Map::new()),
			Some(Value::Object(map)) => Ok(map),
			Some(_) => Err(Error::Provider {
				message: "Metadata filter inference returned non-object filters.".to_string(),
			}),
		},
		_ => Err(Error::Provider {
			message: "Metadata filter inference must return a JSON object.".to_string(),
		}),
	}
}
