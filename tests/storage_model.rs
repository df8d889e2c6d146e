mod common;

use chrono::Duration;
use common::{temp_store, ts};
use meshbridge::storage::{Direction, Message, NodeSighting, Position, Store, StoreOptions};

const T0: i64 = 1_700_000_000;

fn mesh_text(from: &str, at: i64, text: &str) -> Message {
    Message {
        id: None,
        direction: Direction::MeshToChat,
        from_node_id: from.to_string(),
        to_node_id: None,
        timestamp: ts(at),
        text: text.to_string(),
        port_num: Some("TEXT_MESSAGE_APP".into()),
        channel: Some(0),
        hops_away: Some(1),
        snr: Some(5.0),
        rssi: Some(-95),
    }
}

#[test]
fn node_upsert_is_idempotent_and_last_heard_never_regresses() {
    let (_tmp, store) = temp_store();
    let mut s = NodeSighting::new("!0000abcd", ts(T0 + 600));
    s.long_name = Some("Hilltop".into());
    assert!(store.record_node(&s).unwrap(), "first sighting creates the node");
    assert!(!store.record_node(&s).unwrap());
    assert_eq!(store.node_count().unwrap(), 1);

    // older node-info renames but must not move last_heard back
    let mut older = NodeSighting::new("!0000abcd", ts(T0));
    older.long_name = Some("Hilltop Relay".into());
    store.record_node(&older).unwrap();

    let node = store.get_node("!0000abcd").unwrap().unwrap();
    assert_eq!(node.long_name.as_deref(), Some("Hilltop Relay"));
    assert_eq!(node.last_heard, Some(ts(T0 + 600)));
    assert_eq!(node.first_seen, ts(T0));
    store.close().unwrap();
}

#[test]
fn display_name_prefers_long_then_short_then_id() {
    let (_tmp, store) = temp_store();
    let mut full = NodeSighting::new("!00000001", ts(T0));
    full.long_name = Some("Ridge Relay".into());
    full.short_name = Some("RR".into());
    let mut short_only = NodeSighting::new("!00000002", ts(T0));
    short_only.short_name = Some("BC".into());
    store.record_node(&full).unwrap();
    store.record_node(&short_only).unwrap();
    store.record_node(&NodeSighting::new("!00000003", ts(T0))).unwrap();

    assert_eq!(store.node_display_name("!00000001").unwrap(), "Ridge Relay");
    assert_eq!(store.node_display_name("!00000002").unwrap(), "BC");
    assert_eq!(store.node_display_name("!00000003").unwrap(), "!00000003");
    assert_eq!(store.node_display_name("!0000ffff").unwrap(), "!0000ffff");
    store.close().unwrap();
}

#[test]
fn active_nodes_respects_threshold() {
    let (_tmp, store) = temp_store();
    store.record_node(&NodeSighting::new("!00000001", ts(T0))).unwrap();

    let ten_later = ts(T0) + Duration::minutes(10);
    let ninety_later = ts(T0) + Duration::minutes(90);
    assert_eq!(store.active_nodes_at(60, ten_later).unwrap().len(), 1);
    assert!(store.active_nodes_at(60, ninety_later).unwrap().is_empty());
    store.close().unwrap();
}

#[test]
fn search_is_case_insensitive_and_literal() {
    let (_tmp, store) = temp_store();
    store.record_message(&mesh_text("!00000001", T0, "Weather is FINE")).unwrap();
    store.record_message(&mesh_text("!00000002", T0 + 1, "100% charged")).unwrap();
    store.record_message(&mesh_text("!00000002", T0 + 2, "10 charged")).unwrap();

    let hits = store.search_messages("fine", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].from_node_id, "!00000001");

    let pct = store.search_messages("0%", 10).unwrap();
    assert_eq!(pct.len(), 1);
    assert_eq!(pct[0].text, "100% charged");
    store.close().unwrap();
}

#[test]
fn top_talkers_ranked_by_count() {
    let (_tmp, store) = temp_store();
    let mut s = NodeSighting::new("!00000002", ts(T0));
    s.long_name = Some("Chatty".into());
    store.record_node(&s).unwrap();
    for i in 0..3 {
        store.record_message(&mesh_text("!00000002", T0 + i, "hi")).unwrap();
    }
    store.record_message(&mesh_text("!00000001", T0, "hey")).unwrap();

    let talkers = store.top_talkers_since(ts(T0 - 60), 5).unwrap();
    assert_eq!(talkers.len(), 2);
    assert_eq!(talkers[0].node_id, "!00000002");
    assert_eq!(talkers[0].display_name, "Chatty");
    assert_eq!(talkers[0].messages, 3);
    assert_eq!(talkers[1].display_name, "!00000001");
    store.close().unwrap();
}

#[test]
fn equal_timestamps_resolve_to_latest_insert() {
    let (_tmp, store) = temp_store();
    store.record_position(&Position::new("!00000001", ts(T0), 50.0, 14.0)).unwrap();
    store.record_position(&Position::new("!00000001", ts(T0), 50.5, 14.5)).unwrap();
    let last = store.last_position("!00000001").unwrap().unwrap();
    assert_eq!(last.latitude, 50.5);

    let history = store.position_history("!00000001", 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].latitude, 50.5);
    store.close().unwrap();
}

#[test]
fn reopening_keeps_data_and_schema() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("mesh.db");
    {
        let store = Store::open(&path, StoreOptions::default()).unwrap();
        store.record_node(&NodeSighting::new("!00000001", ts(T0))).unwrap();
        store.close().unwrap();
    }
    let store = Store::open(&path, StoreOptions::default()).unwrap();
    assert_eq!(store.node_count().unwrap(), 1);
    store.close().unwrap();
}

#[test]
fn closed_store_rejects_operations() {
    let (_tmp, store) = temp_store();
    store.close().unwrap();
    assert!(store.is_closed());
    assert!(store.node_count().is_err());
    // closing twice is harmless
    store.close().unwrap();
}

#[test]
fn second_open_of_a_locked_database_fails() {
    let (tmp, store) = temp_store();
    let err = Store::open(tmp.path().join("mesh.db"), StoreOptions::default()).unwrap_err();
    assert!(matches!(err, meshbridge::storage::StorageError::AlreadyLocked(_)));
    store.close().unwrap();
    // the lock is released on close
    let reopened = Store::open(tmp.path().join("mesh.db"), StoreOptions::default()).unwrap();
    reopened.close().unwrap();
}
