use std::sync::{
	Arc, Mutex,
	atomic::{AtomicUsize, Ordering},
};

use serde_json::{Value, json};

use sift_config::{Config, IndexConfig};
use sift_service::{
	DefaultPostprocessors, ErrorKind, MemoryEmbeddingCache, NoopSink, Providers, RetrieveRequest,
	SiftService,
};

use super::{
	FixedExtractor, MemoryStore, ReversingRerank, SpyEmbedding, document_id, fanned_store,
	filtered_index, ids, object, reranked_index, test_config,
};

struct StrategyHarness {
	service: SiftService,
	rerank_top_n: Arc<Mutex<Option<usize>>>,
	rerank_model: Arc<Mutex<Option<String>>>,
	extractor_calls: Arc<AtomicUsize>,
	extractor_cfgs: Arc<Mutex<Vec<(String, f32)>>>,
}

fn strategy_harness(cfg: Config, store: MemoryStore, extractor_payload: Value) -> StrategyHarness {
	let rerank = ReversingRerank::default();
	let rerank_top_n = rerank.top_n.clone();
	let rerank_model = rerank.model.clone();
	let extractor = FixedExtractor::new(extractor_payload);
	let extractor_calls = extractor.calls.clone();
	let extractor_cfgs = extractor.seen_cfgs.clone();
	let providers = Providers::new(
		Arc::new(SpyEmbedding::new(vec![1.0, 0.0, 0.0])),
		Arc::new(rerank),
		Arc::new(extractor),
	);
	let postprocessors = Arc::new(DefaultPostprocessors::new(&cfg, providers.clone()));
	let service = SiftService::from_parts(
		cfg,
		Arc::new(store),
		Arc::new(MemoryEmbeddingCache::default()),
		providers,
		postprocessors,
	);

	StrategyHarness { service, rerank_top_n, rerank_model, extractor_calls, extractor_cfgs }
}

fn request(top_k: u32) -> RetrieveRequest {
	RetrieveRequest {
		top_k: Some(top_k),
		search_top_k: Some(20),
		..RetrieveRequest::new("docs", "where is the german guide")
	}
}

#[tokio::test]
async fn static_filter_matches_merged_metadata() {
	let mut store = fanned_store("docs", 20);

	store.set_document_metadata(document_id(1), json!({ "kind": "guide" }));

	let cfg = test_config(vec![filtered_index(
		"docs",
		"static",
		json!({ "filters": { "kind": "guide", "lang": ["en", "de"] } }),
	)]);
	let h = strategy_harness(cfg, store, json!({}));
	let response = h.service.retrieve(request(5), &NoopSink).await.expect("Retrieve.");

	// Only chunks of document 1 (n % 3 == 1) among the first ten candidates carry kind=guide.
	assert_eq!(ids(&response.chunks), vec![1, 4, 7, 10]);
}

#[tokio::test]
async fn llm_filter_applies_inferred_filters_under_explicit_ones() {
	let cfg = test_config(vec![filtered_index(
		"docs",
		"llm",
		json!({ "filters": { "lang": "de" } }),
	)]);
	let h = strategy_harness(cfg, fanned_store("docs", 20), json!({ "filters": { "lang": "en" } }));
	let response = h.service.retrieve(request(3), &NoopSink).await.expect("Retrieve.");

	assert_eq!(h.extractor_calls.load(Ordering::SeqCst), 1);
	assert_eq!(ids(&response.chunks), vec![2, 4, 6]);
}

#[tokio::test]
async fn llm_filter_rejects_non_object_output() {
	let cfg = test_config(vec![filtered_index("docs", "llm", json!({}))]);
	let h = strategy_harness(cfg, fanned_store("docs", 10), json!(["lang"]));
	let err = h.service.retrieve(request(3), &NoopSink).await.expect_err("Expected an upstream error.");

	assert_eq!(err.kind(), ErrorKind::Upstream);
}

#[tokio::test]
async fn http_reranker_orders_by_provider_relevance() {
	let cfg = test_config(vec![reranked_index("docs", "http")]);
	let h = strategy_harness(cfg, fanned_store("docs", 20), json!({}));
	let response = h.service.retrieve(request(3), &NoopSink).await.expect("Retrieve.");

	assert_eq!(*h.rerank_top_n.lock().expect("Lock."), Some(3));
	assert_eq!(ids(&response.chunks), vec![6, 5, 4]);
	assert_eq!(response.chunks[0].relevance_score, 1.0);
}

#[tokio::test]
async fn http_reranker_uses_the_index_model_override() {
	let mut index = reranked_index("docs", "http");

	if let Some(reranker) = index.reranker.as_mut() {
		reranker.options = object(json!({ "model": "rerank-multilingual" }));
	}

	let h = strategy_harness(test_config(vec![index]), fanned_store("docs", 10), json!({}));

	h.service.retrieve(request(3), &NoopSink).await.expect("Retrieve.");

	assert_eq!(h.rerank_model.lock().expect("Lock.").as_deref(), Some("rerank-multilingual"));
}

#[tokio::test]
async fn llm_reranker_uses_index_model_and_temperature() {
	let mut index = reranked_index("docs", "llm");

	if let Some(reranker) = index.reranker.as_mut() {
		reranker.options = object(json!({ "model": "grader", "temperature": 0.5 }));
	}

	let h = strategy_harness(test_config(vec![index]), fanned_store("docs", 10), json!({ "scores": [] }));

	h.service.retrieve(request(3), &NoopSink).await.expect("Retrieve.");

	assert_eq!(
		h.extractor_cfgs.lock().expect("Lock.").as_slice(),
		&[("grader".to_string(), 0.5)]
	);
}

#[tokio::test]
async fn reranker_rejects_unsupported_options() {
	let mut index = reranked_index("docs", "http");

	if let Some(reranker) = index.reranker.as_mut() {
		reranker.options = object(json!({ "temperature": 0.2 }));
	}

	let h = strategy_harness(test_config(vec![index]), fanned_store("docs", 10), json!({}));
	let err = h.service.retrieve(request(3), &NoopSink).await.expect_err("Expected a configuration error.");

	assert_eq!(err.kind(), ErrorKind::Configuration);
	assert!(err.to_string().contains("temperature"));
	assert_eq!(*h.rerank_top_n.lock().expect("Lock."), None);
}

#[tokio::test]
async fn llm_reranker_appends_ungraded_candidates_with_fallback_scores() {
	let cfg = test_config(vec![reranked_index("docs", "llm")]);
	let h = strategy_harness(
		cfg,
		fanned_store("docs", 20),
		json!({ "scores": [{ "index": 4, "score": 0.7 }, { "index": 1, "score": 0.9 }] }),
	);
	let response = h.service.retrieve(request(3), &NoopSink).await.expect("Retrieve.");

	assert_eq!(ids(&response.chunks), vec![2, 5, 1]);
	assert_eq!(response.chunks[0].relevance_score, 0.9);
	assert_eq!(response.chunks[1].relevance_score, 0.7);
	// Six candidates reached the reranker; chunk 1 was first among them.
	assert_eq!(response.chunks[2].relevance_score, 6.0 - 0.0 + 30.0);
}

#[tokio::test]
async fn llm_strategies_need_an_llm_provider() {
	let mut cfg = test_config(vec![reranked_index("docs", "llm")]);

	cfg.providers.llm = None;

	let h = strategy_harness(cfg, fanned_store("docs", 5), json!({}));
	let err = h.service.retrieve(request(3), &NoopSink).await.expect_err("Expected a configuration error.");

	assert_eq!(err.kind(), ErrorKind::Configuration);
	assert_eq!(h.extractor_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disabled_filter_passes_candidates_through() {
	let mut index: IndexConfig = filtered_index("docs", "static", json!({ "filters": { "lang": "de" } }));

	if let Some(filter) = index.metadata_filter.as_mut() {
		filter.enabled = false;
	}

	let h = strategy_harness(test_config(vec![index]), fanned_store("docs", 10), json!({}));
	let response = h.service.retrieve(request(3), &NoopSink).await.expect("Retrieve.");

	assert_eq!(ids(&response.chunks), vec![1, 2, 3]);
}
