use std::{
	collections::HashSet,
	sync::{Arc, atomic::Ordering},
};

use serde_json::json;

use sift_service::{
	ChannelSink, Error, ErrorKind, NoopSink, RetrieveEventKind, RetrieveRequest, ScoredChunkView,
};

use super::{
	FixedPostprocessors, PassThroughFilter, ScriptedFilter, ScriptedReranker, chunk_id,
	fanned_store, filtered_index, harness, ids, object, plain_index, reranked_index, test_config,
};

fn request(index: &str, top_k: u32, search_top_k: u32) -> RetrieveRequest {
	RetrieveRequest {
		top_k: Some(top_k),
		search_top_k: Some(search_top_k),
		..RetrieveRequest::new(index, "how do I configure the index?")
	}
}

#[tokio::test]
async fn search_output_is_unique_sorted_and_bounded() {
	let mut store = fanned_store("docs", 30);

	store.fan_out = true;

	let h = harness(test_config(vec![plain_index("docs")]), store, Arc::new(FixedPostprocessors::default()));
	let response = h.service.retrieve(request("docs", 5, 20), &NoopSink).await.expect("Retrieve.");
	let unique: HashSet<_> = response.chunks.iter().map(|chunk| chunk.document_chunk_id).collect();

	assert_eq!(response.chunks.len(), 5);
	assert_eq!(unique.len(), 5);
	assert_eq!(ids(&response.chunks), vec![1, 2, 3, 4, 5]);

	for pair in response.chunks.windows(2) {
		assert!(pair[0].relevance_score >= pair[1].relevance_score);
	}
}

#[tokio::test]
async fn scores_are_one_minus_cosine_distance() {
	let h = harness(
		test_config(vec![plain_index("docs")]),
		fanned_store("docs", 3),
		Arc::new(FixedPostprocessors::default()),
	);
	let response = h.service.retrieve(request("docs", 3, 3), &NoopSink).await.expect("Retrieve.");

	for chunk in &response.chunks {
		let n = chunk.document_chunk_id.as_u128() as f32;
		let expected = n.to_radians().cos();

		assert!((chunk.relevance_score - expected).abs() < 1e-5, "chunk {n}");
	}
}

#[tokio::test]
async fn fewer_stored_chunks_than_requested_returns_all() {
	let h = harness(
		test_config(vec![plain_index("docs")]),
		fanned_store("docs", 2),
		Arc::new(FixedPostprocessors::default()),
	);
	let response = h.service.retrieve(request("docs", 10, 100), &NoopSink).await.expect("Retrieve.");

	assert_eq!(ids(&response.chunks), vec![1, 2]);
}

#[tokio::test]
async fn empty_index_returns_no_chunks() {
	let h = harness(
		test_config(vec![plain_index("docs")]),
		fanned_store("other", 4),
		Arc::new(FixedPostprocessors::default()),
	);
	let response = h.service.retrieve(request("docs", 3, 10), &NoopSink).await.expect("Retrieve.");

	assert!(response.chunks.is_empty());
}

#[tokio::test]
async fn small_search_top_k_still_succeeds() {
	let h = harness(
		test_config(vec![plain_index("docs")]),
		fanned_store("docs", 20),
		Arc::new(FixedPostprocessors::default()),
	);
	let response = h.service.retrieve(request("docs", 10, 4), &NoopSink).await.expect("Retrieve.");

	assert_eq!(ids(&response.chunks), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn zero_top_k_is_raised_to_one() {
	let h = harness(
		test_config(vec![plain_index("docs")]),
		fanned_store("docs", 5),
		Arc::new(FixedPostprocessors::default()),
	);
	let response = h.service.retrieve(request("docs", 0, 5), &NoopSink).await.expect("Retrieve.");

	assert_eq!(ids(&response.chunks), vec![1]);
}

#[tokio::test]
async fn unknown_index_is_a_configuration_error() {
	let h = harness(
		test_config(vec![plain_index("docs")]),
		fanned_store("docs", 5),
		Arc::new(FixedPostprocessors::default()),
	);
	let err = h
		.service
		.retrieve(request("missing", 3, 5), &NoopSink)
		.await
		.expect_err("Expected an unknown index error.");

	assert_eq!(err.kind(), ErrorKind::Configuration);
	assert_eq!(h.store.search_count(), 0);
	assert_eq!(h.embedding_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn blank_query_is_rejected() {
	let h = harness(
		test_config(vec![plain_index("docs")]),
		fanned_store("docs", 5),
		Arc::new(FixedPostprocessors::default()),
	);
	let err = h
		.service
		.retrieve(RetrieveRequest::new("docs", "  \n\t "), &NoopSink)
		.await
		.expect_err("Expected an invalid request.");

	assert!(matches!(err, Error::InvalidRequest { .. }));
	assert_eq!(h.embedding_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeated_queries_hit_the_embedding_cache() {
	let h = harness(
		test_config(vec![plain_index("docs")]),
		fanned_store("docs", 5),
		Arc::new(FixedPostprocessors::default()),
	);
	let first = h
		.service
		.retrieve(RetrieveRequest::new("docs", "what   is sift"), &NoopSink)
		.await
		.expect("Retrieve.");
	let second = h
		.service
		.retrieve(RetrieveRequest::new("docs", " what is sift "), &NoopSink)
		.await
		.expect("Retrieve.");

	assert_eq!(h.embedding_calls.load(Ordering::SeqCst), 1);
	assert_eq!(ids(&first.chunks), ids(&second.chunks));
	assert_ne!(first.retrieve_id, second.retrieve_id);

	let bypass = RetrieveRequest { use_cache: Some(false), ..RetrieveRequest::new("docs", "what is sift") };

	h.service.retrieve(bypass, &NoopSink).await.expect("Retrieve.");

	assert_eq!(h.embedding_calls.load(Ordering::SeqCst), 2);
	assert_eq!(h.service.clear_embedding_cache().await.expect("Clear."), 1);
}

#[tokio::test]
async fn repeated_requests_are_deterministic() {
	let h = harness(
		test_config(vec![plain_index("docs")]),
		fanned_store("docs", 40),
		Arc::new(FixedPostprocessors::default()),
	);
	let a = h.service.retrieve(request("docs", 8, 40), &NoopSink).await.expect("Retrieve.");
	let b = h.service.retrieve(request("docs", 8, 40), &NoopSink).await.expect("Retrieve.");

	assert_eq!(a.chunks, b.chunks);
}

#[tokio::test]
async fn filter_sees_at_most_twice_top_k_and_keeps_membership() {
	let filter = Arc::new(ScriptedFilter::new(|candidates| {
		candidates.into_iter().filter(|item| item.chunk.metadata["lang"] == "en").collect()
	}));
	let postprocessors =
		FixedPostprocessors { filter: Some(filter.clone()), ..FixedPostprocessors::default() };
	let h = harness(
		test_config(vec![filtered_index("docs", "static", json!({}))]),
		fanned_store("docs", 50),
		Arc::new(postprocessors),
	);
	let response = h.service.retrieve(request("docs", 4, 50), &NoopSink).await.expect("Retrieve.");

	assert_eq!(filter.seen_inputs.lock().expect("Lock.").as_slice(), &[8]);
	assert_eq!(ids(&response.chunks), vec![1, 3, 5, 7]);
}

#[tokio::test]
async fn filter_results_without_score_get_zero() {
	let filter = Arc::new(ScriptedFilter::new(|candidates| {
		candidates.into_iter().map(|item| ScoredChunkView { score: None, ..item }).collect()
	}));
	let postprocessors = FixedPostprocessors { filter: Some(filter), ..FixedPostprocessors::default() };
	let h = harness(
		test_config(vec![filtered_index("docs", "static", json!({}))]),
		fanned_store("docs", 6),
		Arc::new(postprocessors),
	);
	let response = h.service.retrieve(request("docs", 3, 6), &NoopSink).await.expect("Retrieve.");

	assert_eq!(response.chunks.len(), 3);
	assert!(response.chunks.iter().all(|chunk| chunk.relevance_score == 0.0));
}

#[tokio::test]
async fn filter_output_is_ranked_by_filter_scores() {
	// Scores candidates 0, 1, 2, ... in input order, so the best vector hits score lowest.
	let filter = Arc::new(ScriptedFilter::new(|candidates| {
		candidates
			.into_iter()
			.enumerate()
			.map(|(i, item)| ScoredChunkView { score: Some(i as f32), ..item })
			.collect()
	}));
	let postprocessors = FixedPostprocessors { filter: Some(filter), ..FixedPostprocessors::default() };
	let h = harness(
		test_config(vec![filtered_index("docs", "static", json!({}))]),
		fanned_store("docs", 10),
		Arc::new(postprocessors),
	);
	let response = h.service.retrieve(request("docs", 3, 10), &NoopSink).await.expect("Retrieve.");

	assert_eq!(ids(&response.chunks), vec![6, 5, 4]);
	assert_eq!(
		response.chunks.iter().map(|chunk| chunk.relevance_score).collect::<Vec<_>>(),
		vec![5.0, 4.0, 3.0]
	);
}

#[tokio::test]
async fn caller_filters_reach_the_filter_without_touching_config() {
	let filter = Arc::new(ScriptedFilter::new(|candidates| candidates));
	let postprocessors =
		FixedPostprocessors { filter: Some(filter.clone()), ..FixedPostprocessors::default() };
	let h = harness(
		test_config(vec![filtered_index(
			"docs",
			"static",
			json!({ "filters": { "lang": "en", "kind": "guide" } }),
		)]),
		fanned_store("docs", 6),
		Arc::new(postprocessors),
	);
	let req = RetrieveRequest {
		filters: Some(object(json!({ "lang": "de" }))),
		..request("docs", 3, 6)
	};

	h.service.retrieve(req, &NoopSink).await.expect("Retrieve.");
	h.service.retrieve(request("docs", 3, 6), &NoopSink).await.expect("Retrieve.");

	let seen = filter.seen_options.lock().expect("Lock.");

	assert_eq!(seen[0]["filters"], json!({ "lang": "de", "kind": "guide" }));
	assert_eq!(seen[1]["filters"], json!({ "lang": "en", "kind": "guide" }));

	let configured = h.service.cfg.index("docs").and_then(|index| index.metadata_filter.as_ref());

	assert_eq!(
		configured.map(|cfg| cfg.options["filters"]["lang"].clone()),
		Some(json!("en"))
	);
}

#[tokio::test]
async fn filter_returning_unknown_chunk_is_a_consistency_error() {
	let filter = Arc::new(ScriptedFilter::new(|mut candidates| {
		if let Some(first) = candidates.first_mut() {
			first.chunk.id = uuid::Uuid::from_u128(999_999);
		}

		candidates
	}));
	let postprocessors = FixedPostprocessors { filter: Some(filter), ..FixedPostprocessors::default() };
	let h = harness(
		test_config(vec![filtered_index("docs", "static", json!({}))]),
		fanned_store("docs", 6),
		Arc::new(postprocessors),
	);
	let err = h
		.service
		.retrieve(request("docs", 3, 6), &NoopSink)
		.await
		.expect_err("Expected a consistency error.");

	assert_eq!(err.kind(), ErrorKind::Consistency);
}

#[tokio::test]
async fn reranker_duplicating_a_chunk_is_a_consistency_error() {
	let reranker = Arc::new(ScriptedReranker {
		script: |mut candidates| {
			if let Some(first) = candidates.first().cloned() {
				candidates.push(first);
			}

			candidates
		},
	});
	let postprocessors =
		FixedPostprocessors { reranker: Some(reranker), ..FixedPostprocessors::default() };
	let h = harness(
		test_config(vec![reranked_index("docs", "http")]),
		fanned_store("docs", 6),
		Arc::new(postprocessors),
	);
	let err = h
		.service
		.retrieve(request("docs", 3, 6), &NoopSink)
		.await
		.expect_err("Expected a consistency error.");

	assert!(matches!(err, Error::Consistency { .. }));
	assert!(err.to_string().contains("more than once"));
}

#[tokio::test]
async fn reranker_is_built_for_the_request_top_k() {
	let reranker = Arc::new(ScriptedReranker { script: |candidates| candidates });
	let postprocessors = Arc::new(FixedPostprocessors {
		reranker: Some(reranker),
		..FixedPostprocessors::default()
	});
	let h = harness(
		test_config(vec![reranked_index("docs", "http")]),
		fanned_store("docs", 10),
		postprocessors.clone(),
	);
	let response = h.service.retrieve(request("docs", 4, 10), &NoopSink).await.expect("Retrieve.");

	assert_eq!(*postprocessors.reranker_top_k.lock().expect("Lock."), Some(4));
	assert_eq!(ids(&response.chunks), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn lifecycle_events_follow_stage_order() {
	let reranker = Arc::new(ScriptedReranker { script: |candidates| candidates });
	let postprocessors = FixedPostprocessors {
		filter: Some(Arc::new(PassThroughFilter)),
		reranker: Some(reranker),
		..FixedPostprocessors::default()
	};
	let mut index = filtered_index("docs", "static", json!({}));

	index.reranker = reranked_index("docs", "http").reranker;

	let h = harness(test_config(vec![index]), fanned_store("docs", 10), Arc::new(postprocessors));
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	let sink = ChannelSink::new(tx);
	let response = h.service.retrieve(request("docs", 2, 10), &sink).await.expect("Retrieve.");

	drop(sink);

	let mut events = Vec::new();

	while let Some(event) = rx.recv().await {
		assert_eq!(event.retrieve_id, response.retrieve_id);

		events.push(event.kind);
	}

	assert_eq!(
		events.iter().map(RetrieveEventKind::name).collect::<Vec<_>>(),
		vec!["start-search", "start-filter", "start-rerank", "finish"]
	);
	assert_eq!(events[0], RetrieveEventKind::StartSearch {
		query: "how do I configure the index?".to_string()
	});
	assert_eq!(events[1], RetrieveEventKind::StartFilter { candidates: 4 });
	assert_eq!(events[2], RetrieveEventKind::StartRerank {
		chunk_ids: (1..=4).map(chunk_id).collect()
	});
	assert_eq!(events[3], RetrieveEventKind::Finish { returned: 2 });
}

#[tokio::test]
async fn request_filters_are_ignored_without_a_filter_stage() {
	let h = harness(
		test_config(vec![plain_index("docs")]),
		fanned_store("docs", 6),
		Arc::new(FixedPostprocessors::default()),
	);
	let req = RetrieveRequest {
		filters: Some(object(json!({ "lang": "de" }))),
		..request("docs", 3, 6)
	};
	let response = h.service.retrieve(req, &NoopSink).await.expect("Retrieve.");

	assert_eq!(ids(&response.chunks), vec![1, 2, 3]);
}
