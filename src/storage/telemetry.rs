//! Telemetry samples (device, environment and air-quality metrics).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use super::{from_millis, to_millis, StorageError, Store};

/// Sparse metric set; any subset may be present in a packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_utilization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air_util_tx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_resistance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iaq: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm10: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm25: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm100: Option<f64>,
}

impl TelemetryMetrics {
    pub fn is_empty(&self) -> bool {
        *self == TelemetryMetrics::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: TelemetryMetrics,
    pub snr: Option<f64>,
    pub rssi: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySummary {
    pub total_nodes: i64,
    pub active_nodes: i64,
    pub avg_battery: Option<f64>,
    pub avg_temperature: Option<f64>,
    pub avg_humidity: Option<f64>,
    pub avg_snr: Option<f64>,
    pub avg_rssi: Option<f64>,
}

const SAMPLE_COLUMNS: &str = "node_id, timestamp, battery_level, voltage, channel_utilization, \
     air_util_tx, uptime_seconds, temperature, humidity, pressure, gas_resistance, iaq, \
     pm10, pm25, pm100, snr, rssi";

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<TelemetrySample> {
    Ok(TelemetrySample {
        node_id: row.get(0)?,
        timestamp: from_millis(row.get(1)?),
        metrics: TelemetryMetrics {
            battery_level: row.get(2)?,
            voltage: row.get(3)?,
            channel_utilization: row.get(4)?,
            air_util_tx: row.get(5)?,
            uptime_seconds: row.get(6)?,
            temperature: row.get(7)?,
            humidity: row.get(8)?,
            pressure: row.get(9)?,
            gas_resistance: row.get(10)?,
            iaq: row.get(11)?,
            pm10: row.get(12)?,
            pm25: row.get(13)?,
            pm100: row.get(14)?,
        },
        snr: row.get(15)?,
        rssi: row.get(16)?,
    })
}

/// Append one sample inside an open transaction.
pub(crate) fn insert(conn: &Connection, s: &TelemetrySample) -> Result<i64, StorageError> {
    let m = &s.metrics;
    conn.execute(
        &format!(
            "INSERT INTO telemetry ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            SAMPLE_COLUMNS
        ),
        params![
            s.node_id,
            to_millis(s.timestamp),
            m.battery_level,
            m.voltage,
            m.channel_utilization,
            m.air_util_tx,
            m.uptime_seconds,
            m.temperature,
            m.humidity,
            m.pressure,
            m.gas_resistance,
            m.iaq,
            m.pm10,
            m.pm25,
            m.pm100,
            s.snr,
            s.rssi,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Store {
    pub fn record_telemetry(&self, sample: &TelemetrySample) -> Result<i64, StorageError> {
        self.with_write(|tx| insert(tx, sample))
    }

    /// Samples for one node since `since`, oldest first, at most `limit`
    /// (the most recent `limit` when there are more).
    pub fn telemetry_history(
        &self,
        node_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TelemetrySample>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM telemetry
                 WHERE node_id = ?1 AND timestamp >= ?2
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?3",
                SAMPLE_COLUMNS
            ))?;
            let mut samples = stmt
                .query_map(params![node_id, to_millis(since), limit], sample_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            samples.reverse();
            Ok(samples)
        })
    }

    /// Network-wide averages over samples taken since `active_since`.
    pub fn telemetry_summary(
        &self,
        active_since: DateTime<Utc>,
    ) -> Result<TelemetrySummary, StorageError> {
        let since = to_millis(active_since);
        self.with_read(|conn| {
            let (total_nodes, active_nodes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN last_heard >= ?1 THEN 1 ELSE 0 END), 0) FROM nodes",
                params![since],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let summary = conn.query_row(
                "SELECT AVG(battery_level), AVG(temperature), AVG(humidity), AVG(snr), AVG(rssi)
                 FROM telemetry WHERE timestamp >= ?1",
                params![since],
                |r| {
                    Ok(TelemetrySummary {
                        total_nodes,
                        active_nodes,
                        avg_battery: r.get(0)?,
                        avg_temperature: r.get(1)?,
                        avg_humidity: r.get(2)?,
                        avg_snr: r.get(3)?,
                        avg_rssi: r.get(4)?,
                    })
                },
            )?;
            Ok(summary)
        })
    }
}
