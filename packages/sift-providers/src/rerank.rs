use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::{Error, Result};

/// One scored document, `index` points into the `docs` slice sent to the provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankHit {
	pub index: usize,
	pub score: f32,
}

/// Calls a Cohere/Jina compatible rerank endpoint.
///
/// Hits come back ordered by descending score. Providers may return fewer than `top_n` hits.
pub async fn rerank(
	cfg: &sift_config::ProviderConfig,
	query: &str,
	docs: &[String],
	top_n: usize,
) -> Result<Vec<RerankHit>> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = format!("{}{}", cfg.api_base, cfg.path);
	let body = serde_json::json!({
		"model": cfg.model,
		"query": query,
		"documents": docs,
		"top_n": top_n,
	});
	let res = client
		.post(url)
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&body)
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;

	parse_rerank_response(json, docs.len())
}

fn parse_rerank_response(json: Value, doc_count: usize) -> Result<Vec<RerankHit>> {
	let results = json
		.get("results")
		.or_else(|| json.get("data"))
		.and_then(|v| v.as_array())
		.ok_or_else(|| Error::InvalidResponse {
			message: "Rerank response is missing results array.".to_string(),
		})?;
	let mut hits = Vec::with_capacity(results.len());
	let mut seen = vec![false; doc_count];

	for item in results {
		let index = item.get("index").and_then(|v| v.as_u64()).ok_or_else(|| {
			Error::InvalidResponse { message: "Rerank result missing index.".to_string() }
		})? as usize;
		let score = item
			.get("relevance_score")
			.or_else(|| item.get("score"))
			.and_then(|v| v.as_f64())
			.ok_or_else(|| Error::InvalidResponse {
				message: "Rerank result missing score.".to_string(),
			})? as f32;

		if index >= doc_count {
			return Err(Error::InvalidResponse {
				message: format!("Rerank result index {index} is out of range."),
			});
		}
		if seen[index] {
			return Err(Error::InvalidResponse {
				message: format!("Rerank result index {index} is duplicated."),
			});
		}

		seen[index] = true;

		hits.push(RerankHit { index, score });
	}

	hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));

	Ok(hits)
}
