mod common;

use std::io::{BufRead, Cursor};
use std::time::Duration;

use chrono::Utc;
use common::{temp_store, text, ts};
use meshbridge::bridge::{Bridge, ChatEvent, Notice};
use meshbridge::config::{Config, MaintenanceConfig};
use meshbridge::meshtastic::reader;
use meshbridge::storage::maintenance::{run_once, MaintenanceScheduler};
use meshbridge::storage::{Direction, Message, NodeSighting, Position};

fn config_in(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.storage.db_path = dir.path().join("mesh.db").to_string_lossy().into_owned();
    config.maintenance.enabled = false;
    config
}

#[test]
fn maintenance_prunes_only_expired_rows() {
    let (_tmp, store) = temp_store();
    let old = Utc::now() - chrono::Duration::days(40);
    let recent = Utc::now() - chrono::Duration::days(1);
    store.record_node(&NodeSighting::new("!00000001", old)).unwrap();
    for at in [old, recent] {
        store.record_position(&Position::new("!00000001", at, 50.0, 14.0)).unwrap();
        store
            .record_message(&Message {
                id: None,
                direction: Direction::MeshToChat,
                from_node_id: "!00000001".into(),
                to_node_id: None,
                timestamp: at,
                text: "status".into(),
                port_num: None,
                channel: None,
                hops_away: None,
                snr: None,
                rssi: None,
            })
            .unwrap();
    }

    let report = run_once(&store, &MaintenanceConfig::default()).unwrap();
    assert_eq!(report.positions_deleted, 1);
    assert_eq!(report.messages_deleted, 1);
    assert_eq!(report.telemetry_deleted, 0);
    // nodes are never pruned
    assert_eq!(store.node_count().unwrap(), 1);
    assert_eq!(store.position_history("!00000001", 10).unwrap().len(), 1);
    store.close().unwrap();
}

#[test]
fn scheduler_runs_passes_and_stops_promptly() {
    let (_tmp, store) = temp_store();
    store.record_node(&NodeSighting::new("!00000001", ts(1_700_000_000))).unwrap();
    let mut scheduler = MaintenanceScheduler::new(
        store.clone(),
        MaintenanceConfig {
            interval_seconds: 1,
            join_timeout_seconds: 5,
            ..MaintenanceConfig::default()
        },
    );
    scheduler.start().unwrap();
    assert!(scheduler.is_running());
    std::thread::sleep(Duration::from_millis(2500));

    let status = scheduler.status();
    assert!(status.passes >= 1, "no pass ran: {:?}", status);
    assert_eq!(status.failures, 0);
    assert!(status.last_report.is_some());

    assert!(scheduler.stop());
    assert!(!scheduler.is_running());
    assert!(!scheduler.status().running);
    store.close().unwrap();
}

#[test]
fn disabled_scheduler_never_starts() {
    let (_tmp, store) = temp_store();
    let mut scheduler = MaintenanceScheduler::new(
        store.clone(),
        MaintenanceConfig {
            enabled: false,
            ..MaintenanceConfig::default()
        },
    );
    scheduler.start().unwrap();
    assert!(!scheduler.is_running());
    assert!(scheduler.stop());
    store.close().unwrap();
}

#[tokio::test]
async fn bridge_relays_from_reader_thread_until_eof() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(&dir);
    // one worker keeps the node-info ahead of the texts
    config.bridge.ingest_workers = 1;
    let mut bridge = Bridge::new(config).await.unwrap();
    let mut chat = bridge.take_chat_events().unwrap();

    let lines = [
        r#"{"fromId":"!00000001","decoded":{"portnum":"NODEINFO_APP","user":{"longName":"Trailhead"}}}"#,
        r#"{"fromId":"!00000001","decoded":{"portnum":"TEXT_MESSAGE_APP","text":"ping"}}"#,
        r#"{"fromId":"!00000001","decoded":{"portnum":"TEXT_MESSAGE_APP","text":"ping"}}"#,
        r#"garbage"#,
    ]
    .join("\n");
    let input: Box<dyn BufRead + Send> = Box::new(Cursor::new(lines));
    let radio = reader::spawn(input, bridge.ingest_handle()).unwrap();

    tokio::time::timeout(Duration::from_secs(10), bridge.run())
        .await
        .unwrap()
        .unwrap();
    let stats = radio.join().unwrap();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.unparsable, 1);

    let mut relays = Vec::new();
    let mut new_nodes = 0;
    while let Ok(ev) = chat.try_recv() {
        match ev {
            ChatEvent::Relay(r) => relays.push(r),
            ChatEvent::Notice(Notice::NewNode { .. }) => new_nodes += 1,
            ChatEvent::Notice(_) => {}
        }
    }
    assert_eq!(new_nodes, 1);
    assert_eq!(relays.len(), 1, "second identical ping is a duplicate");
    assert!(relays[0].ping);
    assert_eq!(relays[0].sender_name, "Trailhead");

    let m = bridge.metrics();
    assert_eq!(m.received, 3);
    assert_eq!(m.malformed, 1);
    assert_eq!(m.duplicates, 1);
    assert!(bridge.store().is_closed());
}

#[tokio::test]
async fn live_session_sees_only_new_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let mut bridge = Bridge::new(config_in(&dir)).await.unwrap();
    let ingestor = bridge.ingestor();
    ingestor.ingest(text("!00000001", "before")).await;

    let mut session = bridge.start_live_session(Some(Duration::from_millis(300)));
    ingestor.ingest(text("!00000002", "during")).await;
    let update = tokio::time::timeout(Duration::from_secs(2), session.next_update())
        .await
        .unwrap()
        .expect("an update");
    assert_eq!(update.records.len(), 1);
    assert_eq!(update.records[0].entry.from, "!00000002");

    let report = session.finish().await;
    assert_eq!(report.records_seen, 1);
    assert!(!report.stopped_early);
    bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut bridge = Bridge::new(config_in(&dir)).await.unwrap();
    bridge.shutdown().await.unwrap();
    bridge.shutdown().await.unwrap();
    assert!(bridge.store().is_closed());
}
