//! # Meshbridge - Meshtastic ↔ Chat Bridge Core
//!
//! Meshbridge sits between a Meshtastic mesh and a chat platform. It takes
//! every radio event the mesh subscription delivers, keeps a durable model of
//! the mesh (nodes, positions, telemetry, message history) and decides which
//! events are worth relaying to chat. In the other direction it answers chat
//! commands from that model and queues chat messages for the mesh.
//!
//! ## Features
//!
//! - **Non-blocking ingestion**: the radio thread hands events over through a
//!   bounded queue that evicts its oldest event when full and never blocks.
//! - **Relay deduplication**: identical text from the same sender inside a
//!   window is relayed once, under a global rate limit.
//! - **Durable mesh model**: SQLite in WAL mode with a pooled reader set, one
//!   writer, idempotent migrations and graceful drain on close.
//! - **Movement detection**: haversine distance against the last stored fix,
//!   serialized per node.
//! - **Live monitoring**: a capped FIFO of recent traffic and time-boxed
//!   observation sessions.
//! - **Cached queries**: single-flight, time-bounded memoization for chat
//!   commands behind a per-user cooldown.
//! - **Maintenance**: retention pruning and store optimization on a background
//!   thread with a bounded join on stop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshbridge::bridge::Bridge;
//! use meshbridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut bridge = Bridge::new(config).await?;
//!
//!     // hand this to the radio subscription thread
//!     let _handle = bridge.ingest_handle();
//!
//!     bridge.run().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bridge`] - ingestion, relay admission, movement, live buffer, queries and lifecycle
//! - [`meshtastic`] - radio event classification and the JSON-lines event reader
//! - [`storage`] - SQLite persistence, schema migration and maintenance
//! - [`config`] - configuration management and validation
//! - [`validation`] - input validation for text and command arguments
//! - [`metrics`] - pipeline counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌─────────────────┐
//! │ Radio reader    │      │ Chat commands   │
//! │ (own thread)    │      │                 │
//! └─────────────────┘      └─────────────────┘
//!          │ IngestHandle           │ QueryService / submit_outbound
//! ┌─────────────────────────────────────────────┐
//! │   Bridge (tokio)                            │ ← ingest workers, relay decisions
//! └─────────────────────────────────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Storage       │ ← SQLite, maintenance thread
//! └─────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod storage;
pub mod validation;
