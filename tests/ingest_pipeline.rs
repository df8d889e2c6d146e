mod common;

use std::io::Cursor;
use std::sync::Arc;

use common::{node_info, position, telemetry, temp_store, text, ts};
use meshbridge::bridge::ingest::channel;
use meshbridge::bridge::{Ingestor, LiveBuffer, Notice, RelayReason};
use meshbridge::config::BridgeConfig;
use meshbridge::meshtastic::{reader, PacketKind};
use meshbridge::metrics::Metrics;
use meshbridge::storage::Store;
use serde_json::json;

const T0: i64 = 1_700_000_000;

fn ingestor(store: &Store, config: BridgeConfig) -> (Ingestor, Arc<Metrics>, Arc<LiveBuffer>) {
    let metrics = Arc::new(Metrics::new());
    let live = Arc::new(LiveBuffer::new(config.live_buffer_cap));
    let ing = Ingestor::new(store.clone(), &config, Arc::clone(&live), Arc::clone(&metrics));
    (ing, metrics, live)
}

#[tokio::test]
async fn identical_texts_inside_window_relay_once() {
    let (_tmp, store) = temp_store();
    let (ing, metrics, _live) = ingestor(&store, BridgeConfig::default());

    let first = ing.ingest(text("!a1b2c3d4", "hello mesh")).await;
    let second = ing.ingest(text("!a1b2c3d4", "hello mesh")).await;
    assert!(first.admit);
    assert!(!second.admit);
    assert!(matches!(second.reason, RelayReason::Duplicate { .. }));

    // a different sender with the same text is its own message
    assert!(ing.ingest(text("!0badc0de", "hello mesh")).await.admit);

    // both copies are still stored
    assert_eq!(store.search_messages("hello mesh", 10).unwrap().len(), 3);
    let snap = metrics.snapshot();
    assert_eq!(snap.relayed, 2);
    assert_eq!(snap.duplicates, 1);
    store.close().unwrap();
}

#[tokio::test]
async fn relay_rate_limit_caps_admissions() {
    let (_tmp, store) = temp_store();
    let config = BridgeConfig {
        relay_rate_per_minute: 2,
        ..BridgeConfig::default()
    };
    let (ing, metrics, _live) = ingestor(&store, config);
    for n in 0..4 {
        ing.ingest(text("!00000001", &format!("msg {}", n))).await;
    }
    let snap = metrics.snapshot();
    assert_eq!(snap.relayed, 2);
    assert_eq!(snap.rate_limited, 2);
    store.close().unwrap();
}

#[tokio::test]
async fn first_packet_from_a_node_emits_new_node_notice() {
    let (_tmp, store) = temp_store();
    let (ing, metrics, live) = ingestor(&store, BridgeConfig::default());

    let d = ing.ingest(telemetry("!00000007", 87.0, T0)).await;
    assert!(!d.admit);
    assert_eq!(d.reason, RelayReason::NotRelayable { kind: PacketKind::Telemetry });
    assert!(matches!(
        d.notices.as_slice(),
        [Notice::NewNode { node_id, .. }] if node_id == "!00000007"
    ));

    let d = ing.ingest(telemetry("!00000007", 86.0, T0 + 60)).await;
    assert!(d.notices.is_empty());

    let samples = store.telemetry_history("!00000007", ts(T0 - 1), 10).unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(metrics.snapshot().new_nodes, 1);
    assert_eq!(live.len(), 2);
    store.close().unwrap();
}

#[tokio::test]
async fn movement_notice_only_beyond_threshold() {
    let (_tmp, store) = temp_store();
    let (ing, metrics, _live) = ingestor(&store, BridgeConfig::default());

    ing.ingest(position("!00000003", 50.0, 14.0, T0)).await;
    // ~50 m north
    let near = ing.ingest(position("!00000003", 50.00045, 14.0, T0 + 60)).await;
    assert!(!near.notices.iter().any(|n| matches!(n, Notice::Movement { .. })));
    // ~150 m further north of the last fix
    let far = ing.ingest(position("!00000003", 50.00180, 14.0, T0 + 120)).await;
    let moved = far
        .notices
        .iter()
        .find_map(|n| match n {
            Notice::Movement { event, .. } => Some(event.distance_m),
            _ => None,
        })
        .expect("movement notice");
    assert!(moved > 100.0 && moved < 200.0, "distance {}", moved);

    assert_eq!(metrics.snapshot().movement_events, 1);
    assert_eq!(store.position_history("!00000003", 10).unwrap().len(), 3);
    store.close().unwrap();
}

#[tokio::test]
async fn node_info_names_the_sender_of_later_relays() {
    let (_tmp, store) = temp_store();
    let (ing, _metrics, _live) = ingestor(&store, BridgeConfig::default());
    ing.ingest(node_info("!00000009", "Base Camp", T0)).await;
    let d = ing.ingest(text("!00000009", "anyone there?")).await;
    let record = d.record.expect("relayed");
    assert_eq!(record.sender_name, "Base Camp");
    assert!(!record.ping);
    store.close().unwrap();
}

#[tokio::test]
async fn own_messages_are_stored_but_not_relayed() {
    let (_tmp, store) = temp_store();
    let config = BridgeConfig {
        node_id: "!0000beef".into(),
        ..BridgeConfig::default()
    };
    let (ing, _metrics, _live) = ingestor(&store, config);
    let d = ing.ingest(text("!0000beef", "echo")).await;
    assert_eq!(d.reason, RelayReason::OwnMessage);
    assert_eq!(store.search_messages("echo", 5).unwrap().len(), 1);
    store.close().unwrap();
}

#[tokio::test]
async fn malformed_events_are_counted_and_dropped() {
    let (_tmp, store) = temp_store();
    let (ing, metrics, live) = ingestor(&store, BridgeConfig::default());
    let no_sender = json!({"decoded": {"portnum": "TEXT_MESSAGE_APP", "text": "x"}});
    let d = ing.ingest(common::raw(no_sender)).await;
    assert!(matches!(d.reason, RelayReason::Malformed { .. }));
    let d = ing.ingest(common::raw(json!({"fromId": "!00000001"}))).await;
    assert!(matches!(d.reason, RelayReason::Malformed { .. }));

    assert_eq!(metrics.snapshot().malformed, 2);
    assert!(live.is_empty());
    assert_eq!(store.node_count().unwrap(), 0);
    store.close().unwrap();
}

#[tokio::test]
async fn reader_submits_lines_and_counts_garbage() {
    let metrics = Arc::new(Metrics::new());
    let (handle, queue) = channel(2, Arc::clone(&metrics));
    let input = concat!(
        "{\"fromId\":\"!00000001\",\"decoded\":{\"portnum\":\"TEXT_MESSAGE_APP\",\"text\":\"a\"}}\n",
        "\n",
        "not json\n",
        "{\"fromId\":\"!00000002\",\"decoded\":{\"portnum\":\"TEXT_MESSAGE_APP\",\"text\":\"b\"}}\n",
        "{\"fromId\":\"!00000003\",\"decoded\":{\"portnum\":\"TEXT_MESSAGE_APP\",\"text\":\"c\"}}\n",
    );
    let stats = reader::read_events(Cursor::new(input), &handle);
    assert_eq!(stats.lines, 4);
    assert_eq!(stats.unparsable, 1);
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.dropped, 1);

    let snap = metrics.snapshot();
    assert_eq!(snap.malformed, 1);
    assert_eq!(snap.queue_overflow, 1);

    // the first event made room for the newest two
    handle.close();
    let mut senders = Vec::new();
    while let Some(next) = queue.recv().await {
        senders.push(next.event.payload["fromId"].as_str().unwrap().to_string());
    }
    assert_eq!(senders, ["!00000002", "!00000003"]);
}
