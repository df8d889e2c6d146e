//! Node records: upsert on every sighting, lookups by id and name.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{from_millis, like_contains, opt_u32, to_millis, StorageError, Store};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub node_id: String,
    pub node_num: Option<u32>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_heard: Option<DateTime<Utc>>,
    pub hops_away: Option<u32>,
}

impl Node {
    /// Long name, then short name, then the id itself.
    pub fn display_name(&self) -> &str {
        self.long_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.short_name.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or(&self.node_id)
    }
}

/// Anything that proves a node exists: node-info, telemetry, a position or a
/// message it sent. Names and hardware model are only present on node-info.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSighting {
    pub node_id: String,
    pub node_num: Option<u32>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub heard_at: DateTime<Utc>,
    pub hops_away: Option<u32>,
}

impl NodeSighting {
    pub fn new(node_id: impl Into<String>, heard_at: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            node_num: None,
            long_name: None,
            short_name: None,
            hw_model: None,
            heard_at,
            hops_away: None,
        }
    }
}

const NODE_COLUMNS: &str =
    "node_id, node_num, long_name, short_name, hw_model, first_seen, last_heard, hops_away";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        node_id: row.get(0)?,
        node_num: opt_u32(row.get(1)?),
        long_name: row.get(2)?,
        short_name: row.get(3)?,
        hw_model: row.get(4)?,
        first_seen: from_millis(row.get(5)?),
        last_heard: row.get::<_, Option<i64>>(6)?.map(from_millis),
        hops_away: opt_u32(row.get(7)?),
    })
}

/// Insert or update a node inside an open transaction. Returns `true` when the
/// node did not exist before.
///
/// `last_heard` never moves backwards. Names, hardware model and hop count
/// take the incoming value whenever one is supplied, even from an older
/// packet, because node-info can arrive out of order with liveness traffic.
pub(crate) fn upsert(conn: &Connection, s: &NodeSighting) -> Result<bool, StorageError> {
    let existed = conn
        .query_row(
            "SELECT 1 FROM nodes WHERE node_id = ?1",
            params![s.node_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    let heard = to_millis(s.heard_at);
    conn.execute(
        "INSERT INTO nodes (node_id, node_num, long_name, short_name, hw_model, first_seen, last_heard, hops_away)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
         ON CONFLICT(node_id) DO UPDATE SET
            node_num   = COALESCE(excluded.node_num, nodes.node_num),
            long_name  = COALESCE(excluded.long_name, nodes.long_name),
            short_name = COALESCE(excluded.short_name, nodes.short_name),
            hw_model   = COALESCE(excluded.hw_model, nodes.hw_model),
            hops_away  = COALESCE(excluded.hops_away, nodes.hops_away),
            first_seen = MIN(nodes.first_seen, excluded.first_seen),
            last_heard = CASE
                WHEN nodes.last_heard IS NULL OR excluded.last_heard > nodes.last_heard
                THEN excluded.last_heard
                ELSE nodes.last_heard
            END",
        params![
            s.node_id,
            s.node_num,
            s.long_name,
            s.short_name,
            s.hw_model,
            heard,
            s.hops_away,
        ],
    )?;
    Ok(!existed)
}

pub(crate) fn get(conn: &Connection, node_id: &str) -> Result<Option<Node>, StorageError> {
    let node = conn
        .query_row(
            &format!("SELECT {} FROM nodes WHERE node_id = ?1", NODE_COLUMNS),
            params![node_id],
            node_from_row,
        )
        .optional()?;
    Ok(node)
}

fn collect(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Node>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, node_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

impl Store {
    /// Record a sighting in its own transaction. Returns `true` for a new node.
    pub fn record_node(&self, sighting: &NodeSighting) -> Result<bool, StorageError> {
        self.with_write(|tx| upsert(tx, sighting))
    }

    pub fn get_node(&self, node_id: &str) -> Result<Option<Node>, StorageError> {
        self.with_read(|conn| get(conn, node_id))
    }

    /// Exact (case-insensitive) match on long name, short name or id first;
    /// otherwise the best substring match, preferring prefix matches on the
    /// long name, then the short name, then the most recently heard.
    pub fn find_node_by_name(&self, name: &str) -> Result<Option<Node>, StorageError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        self.with_read(|conn| {
            let exact = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM nodes
                         WHERE long_name = ?1 COLLATE NOCASE
                            OR short_name = ?1 COLLATE NOCASE
                            OR node_id = ?1 COLLATE NOCASE
                         ORDER BY last_heard DESC
                         LIMIT 1",
                        NODE_COLUMNS
                    ),
                    params![name],
                    node_from_row,
                )
                .optional()?;
            if exact.is_some() {
                return Ok(exact);
            }

            let contains = like_contains(name);
            let prefix = contains[1..].to_string();
            let fuzzy = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM nodes
                         WHERE long_name LIKE ?1 ESCAPE '\\'
                            OR short_name LIKE ?1 ESCAPE '\\'
                         ORDER BY
                            CASE
                                WHEN long_name LIKE ?2 ESCAPE '\\' THEN 0
                                WHEN short_name LIKE ?2 ESCAPE '\\' THEN 1
                                ELSE 2
                            END,
                            last_heard DESC
                         LIMIT 1",
                        NODE_COLUMNS
                    ),
                    params![contains, prefix],
                    node_from_row,
                )
                .optional()?;
            Ok(fuzzy)
        })
    }

    /// Display name for a node id; the id itself when the node is unknown.
    pub fn node_display_name(&self, node_id: &str) -> Result<String, StorageError> {
        Ok(self
            .get_node(node_id)?
            .map(|n| n.display_name().to_string())
            .unwrap_or_else(|| node_id.to_string()))
    }

    pub fn all_nodes(&self) -> Result<Vec<Node>, StorageError> {
        self.with_read(|conn| {
            collect(
                conn,
                &format!(
                    "SELECT {} FROM nodes ORDER BY last_heard IS NULL, last_heard DESC, node_id",
                    NODE_COLUMNS
                ),
                [],
            )
        })
    }

    /// Nodes heard within the last `threshold_minutes`.
    pub fn active_nodes(&self, threshold_minutes: u64) -> Result<Vec<Node>, StorageError> {
        self.active_nodes_at(threshold_minutes, Utc::now())
    }

    /// `active_nodes` evaluated at an explicit instant.
    pub fn active_nodes_at(
        &self,
        threshold_minutes: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Node>, StorageError> {
        let minutes = i64::try_from(threshold_minutes).unwrap_or(i64::MAX / 60_000);
        let cutoff = to_millis(now) - minutes.saturating_mul(60_000);
        self.with_read(|conn| {
            collect(
                conn,
                &format!(
                    "SELECT {} FROM nodes WHERE last_heard >= ?1 ORDER BY last_heard DESC",
                    NODE_COLUMNS
                ),
                params![cutoff],
            )
        })
    }

    /// Nodes first seen at or after `since`.
    pub fn new_nodes_since(&self, since: DateTime<Utc>) -> Result<Vec<Node>, StorageError> {
        self.with_read(|conn| {
            collect(
                conn,
                &format!(
                    "SELECT {} FROM nodes WHERE first_seen >= ?1 ORDER BY first_seen DESC",
                    NODE_COLUMNS
                ),
                params![to_millis(since)],
            )
        })
    }

    pub fn node_count(&self) -> Result<i64, StorageError> {
        self.with_read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?))
    }
}
