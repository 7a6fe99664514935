use std::{cmp::Ordering, collections::HashSet, sync::Arc};

use serde_json::Value;

use crate::{
	BoxFuture, Error, ExtractorProvider, RerankProvider, Result,
	chunk::{self, Chunk, ScoredChunkView},
};
use sift_config::{LlmProviderConfig, ProviderConfig};

const RERANK_SYSTEM_PROMPT: &str = "\
You grade how well each numbered excerpt answers the user query. Return a JSON object of the \
form {\"scores\": [{\"index\": <number>, \"score\": <0.0 to 1.0>}]}. Use the excerpt numbers \
exactly as given. Excerpts that are irrelevant may be omitted. Output JSON only.";

/// Reorders candidates by relevance to the query. Implementations may drop items and leave
/// scores unset, but must only return items they were given, each at most once.
pub trait Reranker
where
	Self: Send + Sync,
{
	fn postprocess<'a>(
		&'a self,
		candidates: Vec<ScoredChunkView>,
		query: &'a str,
	) -> BoxFuture<'a, Result<Vec<ScoredChunkView>>>;
}

/// Calls a Cohere or Jina compatible rerank endpoint.
pub struct HttpReranker {
	cfg: ProviderConfig,
	provider: Arc<dyn RerankProvider>,
	top_k: u32,
}
impl HttpReranker {
	pub fn new(cfg: ProviderConfig, provider: Arc<dyn RerankProvider>, top_k: u32) -> Self {
		Self { cfg, provider, top_k }
	}
}
impl Reranker for HttpReranker {
	fn postprocess<'a>(
		&'a self,
		candidates: Vec<ScoredChunkView>,
		query: &'a str,
	) -> BoxFuture<'a, Result<Vec<ScoredChunkView>>> {
		Box::pin(async move {
			if candidates.is_empty() {
				return Ok(candidates);
			}

			let docs: Vec<String> =
				candidates.iter().map(|item| item.chunk.render_for_llm()).collect();
			let hits =
				self.provider.rerank(&self.cfg, query, &docs, self.top_k as usize).await?;
			let mut out = Vec::with_capacity(hits.len());

			for hit in hits {
				let item = candidates.get(hit.index).ok_or_else(|| Error::Provider {
					message: format!(
						"Rerank provider returned index {} for {} documents.",
						hit.index,
						candidates.len()
					),
				})?;

				out.push(ScoredChunkView { score: Some(hit.score), chunk: item.chunk.clone() });
			}

			Ok(out)
		})
	}
}

/// Has the LLM grade each candidate. Graded items come first by score; the rest follow in
/// their original order without a score.
pub struct LlmReranker {
	cfg: LlmProviderConfig,
	extractor: Arc<dyn ExtractorProvider>,
	top_k: u32,
}
impl LlmReranker {
	pub fn new(cfg: LlmProviderConfig, extractor: Arc<dyn ExtractorProvider>, top_k: u32) -> Self {
		Self { cfg, extractor, top_k }
	}
}
impl Reranker for LlmReranker {
	fn postprocess<'a>(
		&'a self,
		candidates: Vec<ScoredChunkView>,
		query: &'a str,
	) -> BoxFuture<'a, Result<Vec<ScoredChunkView>>> {
		Box::pin(async move {
			if candidates.is_empty() {
				return Ok(candidates);
			}

			let messages = build_rerank_messages(query, &candidates, self.top_k);
			let raw = self.extractor.extract(&self.cfg, &messages).await?;
			let grades = parse_grades(&raw, candidates.len())?;

			Ok(order_by_grades(candidates, grades))
		})
	}
}

/// Score given to an item the reranker returned without one. Always above any normalized
/// provider score and higher for items that ranked better before reranking. It does not move
/// the item; output keeps the reranker's order.
pub fn fallback_score(total_count: usize, input_rank: usize, top_k: u32) -> f32 {
	total_count as f32 - input_rank as f32 + top_k as f32 * 10.0
}

/// Runs `reranker` and maps its output back onto the full records, capped at `top_k`.
pub(crate) async fn rerank_stage(
	reranker: &dyn Reranker,
	candidates: Vec<Chunk>,
	query: &str,
	top_k: u32,
) -> Result<Vec<Chunk>> {
	let total_count = candidates.len();
	let views = chunk::project(&candidates);
	let returned = reranker.postprocess(views, query).await?;
	let correlated = chunk::correlate("Reranker", candidates, returned)?;
	let mut out: Vec<Chunk> = correlated
		.into_iter()
		.map(|item| {
			let mut chunk = item.chunk;

			chunk.relevance_score = item
				.score
				.unwrap_or_else(|| fallback_score(total_count, item.input_rank, top_k));

			chunk
		})
		.collect();

	out.truncate(top_k as usize);

	Ok(out)
}

fn build_rerank_messages(query: &str, candidates: &[ScoredChunkView], top_k: u32) -> Vec<Value> {
	let mut excerpts = String::new();

	for (index, item) in candidates.iter().enumerate() {
		excerpts.push_str(&format!("[{index}]\n{}\n\n", item.chunk.render_for_llm()));
	}

	let user = format!(
		"Query: {query}\nReturn scores for at most {top_k} excerpts.\n\nExcerpts:\n\n{excerpts}"
	);

	vec![
		serde_json::json!({ "role": "system", "content": RERANK_SYSTEM_PROMPT }),
		serde_json::json!({ "role": "user", "content": user }),
	]
}

fn parse_grades(raw: &Value, len: usize) -> Result<Vec<(usize, f32)>> {
	let entries = raw.get("scores").and_then(Value::as_array).ok_or_else(|| Error::Provider {
		message: "LLM reranker response is missing a scores array.".to_string(),
	})?;
	let mut seen = HashSet::with_capacity(entries.len());
	let mut grades = Vec::with_capacity(entries.len());

	for entry in entries {
		let index = entry.get("index").and_then(Value::as_u64).ok_or_else(|| Error::Provider {
			message: "LLM reranker score entry is missing an index.".to_string(),
		})? as usize;
		let score = entry.get("score").and_then(Value::as_f64).ok_or_else(|| Error::Provider {
			message: format!("LLM reranker score entry {index} is missing a score."),
		})? as f32;

		if index >= len {
			return Err(Error::Provider {
				message: format!("LLM reranker graded index {index} for {len} excerpts."),
			});
		}
		if !seen.insert(index) {
			return Err(Error::Provider {
				message: format!("LLM reranker graded index {index} more than once."),
			});
		}

		grades.push((index, score));
	}

	Ok(grades)
}

fn order_by_grades(
	candidates: Vec<ScoredChunkView>,
	mut grades: Vec<(usize, f32)>,
) -> Vec<ScoredChunkView> {
	grades.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));

	let graded: HashSet<usize> = grades.iter().map(|(index, _)| *index).collect();
	let mut out = Vec::with_capacity(candidates.len());

	for (index, score) in &grades {
		out.push(ScoredChunkView { score: Some(*score), chunk: candidates[*index].chunk.clone() });
	}
	for (index, item) in candidates.into_iter().enumerate() {
		if !graded.contains(&index) {
			out.push(ScoredChunkView { score: None, chunk: item.chunk });
		}
	}

	out
}
