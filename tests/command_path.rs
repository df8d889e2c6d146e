mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{telemetry, temp_store, text};
use meshbridge::bridge::queries::NodeReport;
use meshbridge::bridge::{
    CommandCooldown, CommandError, Ingestor, LiveBuffer, Query, QueryResult, QueryService,
};
use meshbridge::config::BridgeConfig;
use meshbridge::metrics::Metrics;

#[test]
fn cooldown_rejects_inside_interval_only() {
    let cooldown = CommandCooldown::new(Duration::from_secs(2));
    let t0 = Instant::now();
    assert!(cooldown.allow("alice", t0));
    assert!(!cooldown.allow("alice", t0 + Duration::from_secs(1)));
    assert!(cooldown.allow("alice", t0 + Duration::from_secs(3)));
    assert!(cooldown.allow("bob", t0 + Duration::from_secs(1)));
}

#[tokio::test]
async fn queries_reflect_ingested_traffic() {
    let (_tmp, store) = temp_store();
    let config = BridgeConfig::default();
    let metrics = Arc::new(Metrics::new());
    let live = Arc::new(LiveBuffer::new(64));
    let ingestor = Ingestor::new(store.clone(), &config, live, Arc::clone(&metrics));
    let now = chrono::Utc::now().timestamp();
    ingestor.ingest(common::node_info("!00000011", "Ridge Runner", now)).await;
    ingestor.ingest(telemetry("!00000011", 64.0, now)).await;
    ingestor.ingest(text("!00000011", "summit reached")).await;
    ingestor.ingest(text("!00000011", "heading down")).await;
    ingestor.ingest(text("!00000012", "copy that")).await;

    let service = QueryService::new(
        store.clone(),
        Arc::new(CommandCooldown::new(config.command_cooldown())),
        &config,
        metrics,
    );

    match service.query(Query::ActiveNodes { minutes: None }).await.unwrap() {
        QueryResult::Nodes(nodes) => assert_eq!(nodes.len(), 2),
        other => panic!("unexpected {:?}", other),
    }

    match service.query(Query::Node { name: "ridge".into() }).await.unwrap() {
        QueryResult::Node(report) => {
            let NodeReport { node, recent_telemetry, .. } = *report;
            assert_eq!(node.node_id, "!00000011");
            assert_eq!(recent_telemetry.len(), 1);
            assert_eq!(recent_telemetry[0].metrics.battery_level, Some(64.0));
        }
        other => panic!("unexpected {:?}", other),
    }

    match service.query(Query::SearchMessages { text: "SUMMIT".into(), limit: 5 }).await.unwrap() {
        QueryResult::Messages(found) => assert_eq!(found.len(), 1),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        service.query(Query::SearchMessages { text: "nothing like this".into(), limit: 5 }).await,
        Err(CommandError::NotFound(_))
    ));

    match service.query(Query::TopTalkers { hours: 1, limit: 5 }).await.unwrap() {
        QueryResult::Talkers(talkers) => {
            assert_eq!(talkers[0].display_name, "Ridge Runner");
            assert_eq!(talkers[0].messages, 2);
        }
        other => panic!("unexpected {:?}", other),
    }

    match service.query(Query::Stats { hours: 24 }).await.unwrap() {
        QueryResult::Stats(stats) => {
            assert_eq!(stats.messages.total, 3);
            assert_eq!(stats.new_nodes, 2);
        }
        other => panic!("unexpected {:?}", other),
    }
    store.close().unwrap();
}

#[tokio::test]
async fn concurrent_identical_queries_compute_once() {
    let (_tmp, store) = temp_store();
    let service = Arc::new(QueryService::new(
        store.clone(),
        Arc::new(CommandCooldown::new(Duration::from_secs(2))),
        &BridgeConfig::default(),
        Arc::new(Metrics::new()),
    ));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let svc = Arc::clone(&service);
            tokio::spawn(async move { svc.query(Query::AllNodes).await })
        })
        .collect();
    for t in tasks {
        assert_eq!(t.await.unwrap().unwrap(), QueryResult::Nodes(vec![]));
    }
    let stats = service.cache_stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.requests, 8);
    store.close().unwrap();
}

#[tokio::test]
async fn cooldown_rejection_reports_remaining_time() {
    let (_tmp, store) = temp_store();
    let metrics = Arc::new(Metrics::new());
    let service = QueryService::new(
        store.clone(),
        Arc::new(CommandCooldown::new(Duration::from_secs(5))),
        &BridgeConfig::default(),
        Arc::clone(&metrics),
    );
    service.run("carol", Query::AllNodes).await.unwrap();
    match service.run("carol", Query::RecentMessages { limit: 3 }).await {
        Err(CommandError::Cooldown { remaining }) => {
            assert!(remaining > Duration::from_secs(3) && remaining <= Duration::from_secs(5));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(metrics.snapshot().cooldown_rejections, 1);
    store.close().unwrap();
}

#[test]
fn query_service_can_be_driven_from_sync_code() {
    let (_tmp, store) = temp_store();
    let service = QueryService::new(
        store.clone(),
        Arc::new(CommandCooldown::new(Duration::from_secs(2))),
        &BridgeConfig::default(),
        Arc::new(Metrics::new()),
    );
    let result = tokio_test::block_on(service.query(Query::RecentMessages { limit: 3 })).unwrap();
    assert_eq!(result, QueryResult::Messages(vec![]));
    store.close().unwrap();
}
