//! Access tracking feeding predictive prefetch, end to end.

use blueprint_core::{
    PrefetchConfig, QueryConfig, QueryRequest, TokioScheduler, TrackerConfig,
};
use blueprint_query::{PredictivePrefetcher, QueryCacheManager, QueryClient, QueryOptions};
use blueprint_storage::AccessTracker;
use blueprint_test_utils::{assertions, fixtures, init_test_tracing, MockTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn component_request(id: &str) -> QueryRequest {
    QueryRequest::new("componentById", json!({ "id": id }))
}

#[tokio::test(start_paused = true)]
async fn test_frequent_entities_are_prefetched() {
    init_test_tracing();
    let transport = Arc::new(MockTransport::new());
    transport
        .respond("componentA", fixtures::component_payload("a", &[]))
        .respond("componentB", fixtures::component_payload("b", &[]))
        .respond("componentById", fixtures::component_payload("a", &[]));

    let tracker = Arc::new(AccessTracker::new(TrackerConfig::default()).unwrap());
    let scheduler = TokioScheduler::shared();
    let client = QueryClient::new(
        transport.clone(),
        fixtures::catalogue_store(),
        &QueryConfig::default(),
    )
    .unwrap();
    let manager = QueryCacheManager::new(
        client.clone(),
        Arc::clone(&tracker),
        Arc::clone(&scheduler),
        QueryConfig::default(),
    );

    // cache hits count as accesses too
    let mut subs = Vec::new();
    for _ in 0..3 {
        subs.push(
            manager
                .start(QueryOptions::new(QueryRequest::named("componentA")))
                .await,
        );
    }
    subs.push(
        manager
            .start(QueryOptions::new(QueryRequest::named("componentB")))
            .await,
    );
    assert_eq!(transport.call_count("componentA"), 1);
    assertions::assert_ranking(&tracker.top_n(5), &["Component:a", "Component:b"]);

    let prefetcher = PredictivePrefetcher::new(
        client,
        Arc::clone(&tracker),
        scheduler,
        PrefetchConfig::default().with_limit(1),
    )
    .unwrap()
    .with_builder("Component", component_request);

    assert_eq!(prefetcher.run_cycle().await, 1);
    let calls = transport.calls();
    let last = calls.last().unwrap();
    assert_eq!(last.query, "componentById");
    assert_eq!(last.variables, json!({"id": "a"}));

    // prefetches warm the store without feeding the access log
    assert_eq!(tracker.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_loop_survives_failures() {
    init_test_tracing();
    let transport = Arc::new(MockTransport::new());
    transport.fail("componentById", "timeout upstream");

    let tracker = Arc::new(AccessTracker::default());
    tracker.record("Component", "a");
    let client = QueryClient::new(
        transport.clone(),
        fixtures::catalogue_store(),
        &QueryConfig::default(),
    )
    .unwrap();
    let prefetcher = Arc::new(
        PredictivePrefetcher::new(
            client,
            tracker,
            TokioScheduler::shared(),
            PrefetchConfig::default().with_interval(Duration::from_secs(10)),
        )
        .unwrap()
        .with_builder("Component", component_request),
    );

    let controller = prefetcher.start();
    tokio::time::sleep(Duration::from_secs(25)).await;
    controller.stop();

    let metrics = prefetcher.metrics().snapshot();
    assert_eq!(metrics.cycles, 3);
    assert_eq!(metrics.failed, 3);
    assert_eq!(metrics.fetched, 0);
    assert_eq!(transport.call_count("componentById"), 3);
}
