//! Position reports. Append-only; the latest row per node is the baseline
//! for movement detection.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{from_millis, opt_u32, to_millis, StorageError, Store};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub hops_away: Option<u32>,
    pub snr: Option<f64>,
    pub rssi: Option<i32>,
    /// Where the fix came from (e.g. "gps", "manual"), when reported
    pub source: Option<String>,
}

impl Position {
    pub fn new(
        node_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp,
            latitude,
            longitude,
            altitude: None,
            speed: None,
            heading: None,
            accuracy: None,
            hops_away: None,
            snr: None,
            rssi: None,
            source: None,
        }
    }

    /// (0, 0) is what radios report before they have a fix.
    pub fn is_null_island(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }
}

const POSITION_COLUMNS: &str = "node_id, timestamp, latitude, longitude, altitude, speed, heading, \
     accuracy, hops_away, snr, rssi, source";

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        node_id: row.get(0)?,
        timestamp: from_millis(row.get(1)?),
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        altitude: row.get(4)?,
        speed: row.get(5)?,
        heading: row.get(6)?,
        accuracy: row.get(7)?,
        hops_away: opt_u32(row.get(8)?),
        snr: row.get(9)?,
        rssi: row.get(10)?,
        source: row.get(11)?,
    })
}

pub(crate) fn insert(conn: &Connection, p: &Position) -> Result<i64, StorageError> {
    conn.execute(
        &format!(
            "INSERT INTO positions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            POSITION_COLUMNS
        ),
        params![
            p.node_id,
            to_millis(p.timestamp),
            p.latitude,
            p.longitude,
            p.altitude,
            p.speed,
            p.heading,
            p.accuracy,
            p.hops_away,
            p.snr,
            p.rssi,
            p.source,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent position; equal timestamps resolve to the later insert.
pub(crate) fn last(conn: &Connection, node_id: &str) -> Result<Option<Position>, StorageError> {
    let pos = conn
        .query_row(
            &format!(
                "SELECT {} FROM positions WHERE node_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
                POSITION_COLUMNS
            ),
            params![node_id],
            position_from_row,
        )
        .optional()?;
    Ok(pos)
}

impl Store {
    pub fn record_position(&self, position: &Position) -> Result<i64, StorageError> {
        self.with_write(|tx| insert(tx, position))
    }

    pub fn last_position(&self, node_id: &str) -> Result<Option<Position>, StorageError> {
        self.with_read(|conn| last(conn, node_id))
    }

    /// Latest `limit` positions for a node in ascending timestamp order.
    pub fn position_history(
        &self,
        node_id: &str,
        limit: usize,
    ) -> Result<Vec<Position>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM positions WHERE node_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
                POSITION_COLUMNS
            ))?;
            let mut out = stmt
                .query_map(params![node_id, limit], position_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            out.reverse();
            Ok(out)
        })
    }
}
