//! Schema creation, additive migration and startup validation.
//!
//! `migrate` is idempotent: every statement is `IF NOT EXISTS` or guarded by
//! a column check, so it is safe against a store that is already current.
//! Validation runs before any index (or query) touches the columns and a
//! missing column is fatal.

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;

use super::StorageError;

pub const SCHEMA_VERSION: i64 = 2;

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS nodes (
    node_id    TEXT PRIMARY KEY,
    node_num   INTEGER,
    long_name  TEXT,
    short_name TEXT,
    hw_model   TEXT,
    first_seen INTEGER NOT NULL,
    last_heard INTEGER
);
CREATE TABLE IF NOT EXISTS telemetry (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id             TEXT NOT NULL,
    timestamp           INTEGER NOT NULL,
    battery_level       REAL,
    voltage             REAL,
    channel_utilization REAL,
    air_util_tx         REAL,
    uptime_seconds      INTEGER,
    temperature         REAL,
    humidity            REAL,
    pressure            REAL,
    snr                 REAL,
    rssi                INTEGER
);
CREATE TABLE IF NOT EXISTS positions (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id   TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    latitude  REAL NOT NULL,
    longitude REAL NOT NULL,
    altitude  REAL,
    speed     REAL,
    heading   REAL,
    accuracy  REAL,
    hops_away INTEGER,
    snr       REAL,
    rssi      INTEGER
);
CREATE TABLE IF NOT EXISTS messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    from_node_id TEXT NOT NULL,
    to_node_id   TEXT,
    timestamp    INTEGER NOT NULL,
    message_text TEXT NOT NULL,
    port_num     TEXT,
    hops_away    INTEGER,
    snr          REAL,
    rssi         INTEGER
);
";

/// Columns added after the first release: (table, column, declaration).
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("nodes", "hops_away", "INTEGER"),
    ("telemetry", "gas_resistance", "REAL"),
    ("telemetry", "iaq", "REAL"),
    ("telemetry", "pm10", "REAL"),
    ("telemetry", "pm25", "REAL"),
    ("telemetry", "pm100", "REAL"),
    ("positions", "source", "TEXT"),
    ("messages", "direction", "TEXT NOT NULL DEFAULT 'mesh_to_chat'"),
    ("messages", "channel", "INTEGER"),
];

/// Columns queries depend on. Checked after migration.
const EXPECTED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "nodes",
        &[
            "node_id", "node_num", "long_name", "short_name", "hw_model", "first_seen",
            "last_heard", "hops_away",
        ],
    ),
    (
        "telemetry",
        &[
            "id", "node_id", "timestamp", "battery_level", "voltage", "channel_utilization",
            "air_util_tx", "uptime_seconds", "temperature", "humidity", "pressure",
            "gas_resistance", "iaq", "pm10", "pm25", "pm100", "snr", "rssi",
        ],
    ),
    (
        "positions",
        &[
            "id", "node_id", "timestamp", "latitude", "longitude", "altitude", "speed",
            "heading", "accuracy", "hops_away", "snr", "rssi", "source",
        ],
    ),
    (
        "messages",
        &[
            "id", "direction", "from_node_id", "to_node_id", "timestamp", "message_text",
            "port_num", "channel", "hops_away", "snr", "rssi",
        ],
    ),
];

const CREATE_INDEXES: &str = "
CREATE INDEX IF NOT EXISTS idx_nodes_last_heard ON nodes(last_heard);
CREATE INDEX IF NOT EXISTS idx_nodes_first_seen ON nodes(first_seen);
CREATE INDEX IF NOT EXISTS idx_nodes_long_name ON nodes(long_name);
CREATE INDEX IF NOT EXISTS idx_telemetry_timestamp ON telemetry(timestamp);
CREATE INDEX IF NOT EXISTS idx_telemetry_node_ts ON telemetry(node_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_positions_timestamp ON positions(timestamp);
CREATE INDEX IF NOT EXISTS idx_positions_node_ts ON positions(node_id, timestamp, id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_from_ts ON messages(from_node_id, timestamp);
";

/// Bring the database up to the current schema and validate it.
pub fn migrate(conn: &mut Connection) -> Result<(), StorageError> {
    let tx = conn.transaction()?;
    tx.execute_batch(CREATE_TABLES)?;

    for (table, column, decl) in ADDED_COLUMNS {
        if !table_columns(&tx, table)?.contains(*column) {
            info!("Migrating schema: adding {}.{}", table, column);
            tx.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {};", table, column, decl))?;
        }
    }

    validate(&tx)?;
    tx.execute_batch(CREATE_INDEXES)?;

    let version: Option<i64> = tx
        .query_row("SELECT version FROM schema_meta LIMIT 1", [], |r| r.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute("INSERT INTO schema_meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
        }
        Some(v) if v < SCHEMA_VERSION => {
            tx.execute("UPDATE schema_meta SET version = ?1", params![SCHEMA_VERSION])?;
            info!("Schema upgraded from v{} to v{}", v, SCHEMA_VERSION);
        }
        Some(_) => debug!("Schema already at v{}", SCHEMA_VERSION),
    }
    tx.commit()?;
    Ok(())
}

/// Fail if any expected column is missing.
pub fn validate(conn: &Connection) -> Result<(), StorageError> {
    for (table, expected) in EXPECTED_COLUMNS {
        let present = table_columns(conn, table)?;
        let missing: Vec<String> = expected
            .iter()
            .filter(|c| !present.contains(**c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(StorageError::SchemaValidation {
                table: table.to_string(),
                missing,
            });
        }
    }
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, StorageError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}
