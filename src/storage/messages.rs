//! Message log for both relay directions plus the statistics queries the
//! chat commands are built on.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use super::{from_millis, like_contains, opt_u32, to_millis, StorageError, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    MeshToChat,
    ChatToMesh,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::MeshToChat => "mesh_to_chat",
            Direction::ChatToMesh => "chat_to_mesh",
        }
    }

    fn parse(s: &str) -> Direction {
        match s {
            "chat_to_mesh" => Direction::ChatToMesh,
            _ => Direction::MeshToChat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Row id once stored
    pub id: Option<i64>,
    pub direction: Direction,
    pub from_node_id: String,
    /// `None` for broadcast
    pub to_node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub port_num: Option<String>,
    pub channel: Option<u32>,
    pub hops_away: Option<u32>,
    pub snr: Option<f64>,
    pub rssi: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Talker {
    pub node_id: String,
    pub display_name: String,
    pub messages: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkQuality {
    pub samples: i64,
    pub avg_snr: Option<f64>,
    pub avg_rssi: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageStatistics {
    pub total: i64,
    pub unique_senders: i64,
    pub unique_recipients: i64,
    pub avg_hops: Option<f64>,
    pub avg_snr: Option<f64>,
    pub avg_rssi: Option<f64>,
}

const MESSAGE_COLUMNS: &str = "id, direction, from_node_id, to_node_id, timestamp, message_text, \
     port_num, channel, hops_away, snr, rssi";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        direction: Direction::parse(&row.get::<_, String>(1)?),
        from_node_id: row.get(2)?,
        to_node_id: row.get(3)?,
        timestamp: from_millis(row.get(4)?),
        text: row.get(5)?,
        port_num: row.get(6)?,
        channel: opt_u32(row.get(7)?),
        hops_away: opt_u32(row.get(8)?),
        snr: row.get(9)?,
        rssi: row.get(10)?,
    })
}

pub(crate) fn insert(conn: &Connection, m: &Message) -> Result<i64, StorageError> {
    conn.execute(
        "INSERT INTO messages (direction, from_node_id, to_node_id, timestamp, message_text,
                               port_num, channel, hops_away, snr, rssi)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            m.direction.as_str(),
            m.from_node_id,
            m.to_node_id,
            to_millis(m.timestamp),
            m.text,
            m.port_num,
            m.channel,
            m.hops_away,
            m.snr,
            m.rssi,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl Store {
    pub fn record_message(&self, message: &Message) -> Result<i64, StorageError> {
        self.with_write(|tx| insert(tx, message))
    }

    /// Newest first.
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StorageError> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages ORDER BY timestamp DESC, id DESC LIMIT ?1",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![sql_limit(limit)], message_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Case-insensitive substring search over message text, newest first.
    /// `%` and `_` in the query match literally.
    pub fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<Message>, StorageError> {
        let pattern = like_contains(query);
        self.with_read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE message_text LIKE ?1 ESCAPE '\\'
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![pattern, sql_limit(limit)], message_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn count_messages_since(&self, since: DateTime<Utc>) -> Result<i64, StorageError> {
        self.with_read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE timestamp >= ?1",
                params![to_millis(since)],
                |r| r.get(0),
            )?)
        })
    }

    /// Mesh senders ranked by message count since `since`.
    pub fn top_talkers_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Talker>, StorageError> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.from_node_id,
                        COALESCE(NULLIF(n.long_name, ''), NULLIF(n.short_name, ''), m.from_node_id),
                        COUNT(*) AS c
                 FROM messages m
                 LEFT JOIN nodes n ON n.node_id = m.from_node_id
                 WHERE m.timestamp >= ?1 AND m.direction = 'mesh_to_chat'
                 GROUP BY m.from_node_id
                 ORDER BY c DESC, m.from_node_id
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![to_millis(since), sql_limit(limit)], |r| {
                Ok(Talker {
                    node_id: r.get(0)?,
                    display_name: r.get(1)?,
                    messages: r.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Average SNR/RSSI over received mesh traffic since `since`.
    pub fn avg_link_quality_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<LinkQuality, StorageError> {
        self.with_read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*), AVG(snr), AVG(rssi) FROM messages
                 WHERE timestamp >= ?1 AND direction = 'mesh_to_chat'
                   AND (snr IS NOT NULL OR rssi IS NOT NULL)",
                params![to_millis(since)],
                |r| {
                    Ok(LinkQuality {
                        samples: r.get(0)?,
                        avg_snr: r.get(1)?,
                        avg_rssi: r.get(2)?,
                    })
                },
            )?)
        })
    }

    pub fn message_statistics(
        &self,
        since: DateTime<Utc>,
    ) -> Result<MessageStatistics, StorageError> {
        self.with_read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT from_node_id), COUNT(DISTINCT to_node_id),
                        AVG(hops_away), AVG(snr), AVG(rssi)
                 FROM messages WHERE timestamp >= ?1",
                params![to_millis(since)],
                |r| {
                    Ok(MessageStatistics {
                        total: r.get(0)?,
                        unique_senders: r.get(1)?,
                        unique_recipients: r.get(2)?,
                        avg_hops: r.get(3)?,
                        avg_snr: r.get(4)?,
                        avg_rssi: r.get(5)?,
                    })
                },
            )?)
        })
    }
}
