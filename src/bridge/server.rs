//! Bridge assembly and lifecycle.
//!
//! [`Bridge`] owns every long-lived component and wires them together:
//! the store, the ingest queue and its workers, the live buffer, the query
//! service, the outbound mesh queue and the maintenance thread. `run()` is
//! the main loop; it returns after Ctrl-C or once the radio source has closed
//! the ingest queue, and always finishes with an orderly shutdown:
//!
//! 1. close the ingest handle (producers get `SubmitError::Closed`)
//! 2. let the workers drain what is already queued (bounded); on timeout
//!    abort them and wait until every worker has stopped
//! 3. stop and join the maintenance thread (bounded)
//! 4. close the store, draining in-flight writes

use anyhow::Result;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::cooldown::CommandCooldown;
use super::ingest::{self, ChatEvent, IngestHandle, IngestQueue, Ingestor};
use super::live::{LiveBuffer, LiveSession};
use super::queries::{CommandError, QueryService};
use super::{blocking, retry_once};
use crate::config::Config;
use crate::logutil::escape_log;
use crate::metrics::{Metrics, Snapshot};
use crate::storage::maintenance::{MaintenanceScheduler, MaintenanceStatus};
use crate::storage::{lock, Direction, Message, Store, StoreOptions};
use crate::validation::{normalize_node_id, validate_message_text};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);
const LIVE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MESH_QUEUE: usize = 64;
/// Sender id stored for outbound messages when no local node id is configured
const BRIDGE_SENDER: &str = "bridge";

/// A chat message accepted for transmission onto the mesh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshOutbound {
    pub message_id: i64,
    pub invoker: String,
    /// `None` for broadcast
    pub to: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub name: String,
    pub metrics: Snapshot,
    pub live_buffered: usize,
    pub live_overflow: u64,
    pub pending_writes: usize,
    pub maintenance: MaintenanceStatus,
}

pub struct Bridge {
    config: Config,
    store: Store,
    metrics: Arc<Metrics>,
    live: Arc<LiveBuffer>,
    cooldown: Arc<CommandCooldown>,
    ingestor: Arc<Ingestor>,
    queries: Arc<QueryService>,
    handle: IngestHandle,
    queue: Option<IngestQueue>,
    chat_tx: mpsc::Sender<ChatEvent>,
    chat_rx: Option<mpsc::Receiver<ChatEvent>>,
    mesh_tx: mpsc::Sender<MeshOutbound>,
    mesh_rx: Option<mpsc::Receiver<MeshOutbound>>,
    maintenance: Mutex<MaintenanceScheduler>,
    closed: bool,
}

impl Bridge {
    /// Open the store (running the schema migration) and build every
    /// component. Nothing runs until [`Bridge::run`].
    pub async fn new(config: Config) -> Result<Self> {
        let path = config.storage.db_path.clone();
        let options = StoreOptions::from(&config.storage);
        let store = blocking(move || Store::open(path, options)).await?;
        Ok(Self::with_store(config, store))
    }

    /// Build around an already open store.
    pub fn with_store(config: Config, store: Store) -> Self {
        let metrics = Arc::new(Metrics::new());
        let live = Arc::new(LiveBuffer::new(config.bridge.live_buffer_cap));
        let cooldown = Arc::new(CommandCooldown::new(config.bridge.command_cooldown()));
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            &config.bridge,
            Arc::clone(&live),
            Arc::clone(&metrics),
        ));
        let queries = Arc::new(QueryService::new(
            store.clone(),
            Arc::clone(&cooldown),
            &config.bridge,
            Arc::clone(&metrics),
        ));
        let (handle, queue) =
            ingest::channel(config.bridge.ingest_queue_capacity, Arc::clone(&metrics));
        let (chat_tx, chat_rx) = mpsc::channel(config.bridge.ingest_queue_capacity.max(1));
        let (mesh_tx, mesh_rx) = mpsc::channel(MESH_QUEUE);
        let maintenance = MaintenanceScheduler::new(store.clone(), config.maintenance.clone());

        Self {
            config,
            store,
            metrics,
            live,
            cooldown,
            ingestor,
            queries,
            handle,
            queue: Some(queue),
            chat_tx,
            chat_rx: Some(chat_rx),
            mesh_tx,
            mesh_rx: Some(mesh_rx),
            maintenance: Mutex::new(maintenance),
            closed: false,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Producer handle for the radio subscription thread.
    pub fn ingest_handle(&self) -> IngestHandle {
        self.handle.clone()
    }

    pub fn ingestor(&self) -> Arc<Ingestor> {
        Arc::clone(&self.ingestor)
    }

    pub fn queries(&self) -> Arc<QueryService> {
        Arc::clone(&self.queries)
    }

    pub fn live_buffer(&self) -> Arc<LiveBuffer> {
        Arc::clone(&self.live)
    }

    /// Relays and notices for the chat side. Only the first caller gets the
    /// receiver; if nobody takes it, `run()` logs the events instead.
    pub fn take_chat_events(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.chat_rx.take()
    }

    /// Messages accepted for the mesh, for the radio transmit side.
    pub fn take_mesh_outbound(&mut self) -> Option<mpsc::Receiver<MeshOutbound>> {
        self.mesh_rx.take()
    }

    /// Observe live traffic for `duration` (the configured live window when
    /// `None`).
    pub fn start_live_session(&self, duration: Option<Duration>) -> LiveSession {
        LiveSession::start(
            Arc::clone(&self.live),
            duration.unwrap_or_else(|| self.config.bridge.live_window()),
            LIVE_POLL_INTERVAL,
        )
    }

    /// Chat → mesh: cooldown, validation, persistence, then hand-off to the
    /// mesh queue. Returns the stored message id.
    pub async fn submit_outbound(
        &self,
        invoker: &str,
        text: &str,
        to: Option<&str>,
    ) -> Result<i64, CommandError> {
        let now = Instant::now();
        if !self.cooldown.allow(invoker, now) {
            self.metrics.inc_cooldown_rejections();
            return Err(CommandError::Cooldown {
                remaining: self.cooldown.remaining(invoker, now),
            });
        }

        let validated = validate_message_text(text, self.config.bridge.message_max_length)
            .and_then(|text| Ok((text, to.map(normalize_node_id).transpose()?)));
        let (text, to) = match validated {
            Ok(v) => v,
            Err(e) => {
                self.metrics.inc_outbound_rejected();
                warn!(
                    target: "security",
                    "Rejected outbound message from {}: {}",
                    escape_log(invoker),
                    e
                );
                return Err(e.into());
            }
        };

        let permit = self.mesh_tx.try_reserve().map_err(|_| {
            self.metrics.inc_outbound_rejected();
            CommandError::MeshUnavailable
        })?;

        let own_id = self.config.bridge.node_id.trim();
        let from_node_id = if own_id.is_empty() { BRIDGE_SENDER } else { own_id };
        let message = Message {
            id: None,
            direction: Direction::ChatToMesh,
            from_node_id: from_node_id.to_string(),
            to_node_id: to.clone(),
            timestamp: Utc::now(),
            text: text.to_string(),
            port_num: Some("TEXT_MESSAGE_APP".to_string()),
            channel: None,
            hops_away: None,
            snr: None,
            rssi: None,
        };
        let message_id = retry_once(&self.metrics, "outbound message", || {
            let store = self.store.clone();
            let message = message.clone();
            blocking(move || store.record_message(&message))
        })
        .await
        .map_err(|e| {
            self.metrics.inc_persist_failures();
            e
        })?;
        self.metrics.inc_persisted();

        permit.send(MeshOutbound {
            message_id,
            invoker: invoker.to_string(),
            to: to.clone(),
            text: message.text,
        });
        info!(
            "Queued message {} from {} for {}",
            message_id,
            escape_log(invoker),
            to.as_deref().unwrap_or("broadcast")
        );
        Ok(message_id)
    }

    pub fn metrics(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            name: self.config.bridge.name.clone(),
            metrics: self.metrics.snapshot(),
            live_buffered: self.live.len(),
            live_overflow: self.live.total_overflow(),
            pending_writes: self.store.in_flight_writes(),
            maintenance: lock(&self.maintenance).status(),
        }
    }

    /// Main loop. Returns after Ctrl-C or once the ingest queue has been
    /// closed and drained, with the bridge shut down.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await
    }

    /// [`Bridge::run`] with a caller-supplied stop signal in place of Ctrl-C.
    pub async fn run_until<S: Future<Output = ()>>(&mut self, stop: S) -> Result<()> {
        info!("Bridge '{}' starting", self.config.bridge.name);
        lock(&self.maintenance).start()?;

        let queue = self
            .queue
            .take()
            .ok_or_else(|| anyhow::anyhow!("bridge is already running or was shut down"))?;
        let mut workers = ingest::spawn_workers(
            Arc::clone(&self.ingestor),
            queue,
            self.config.bridge.ingest_workers,
            self.chat_tx.clone(),
        );
        info!("{} ingest workers started", workers.len());

        let mut sinks = Vec::new();
        if let Some(rx) = self.chat_rx.take() {
            sinks.push(tokio::spawn(log_chat_events(rx)));
        }
        if let Some(rx) = self.mesh_rx.take() {
            sinks.push(tokio::spawn(log_mesh_outbound(rx)));
        }

        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        housekeeping.tick().await;

        tokio::pin!(stop);
        let mut drained = false;
        loop {
            tokio::select! {
                _ = housekeeping.tick() => {
                    let purged = self.queries.housekeeping();
                    debug!("Housekeeping purged {} cache/cooldown entries", purged);
                    info!("Stats: {}", self.metrics.snapshot());
                }
                _ = join_workers(&mut workers) => {
                    info!("Ingest queue closed and drained");
                    drained = true;
                    break;
                }
                _ = &mut stop => break,
            }
        }

        self.handle.close();
        if !drained {
            let drain = Duration::from_millis(self.config.storage.drain_timeout_ms);
            match tokio::time::timeout(drain, join_workers(&mut workers)).await {
                Ok(()) => debug!("Ingest queue drained"),
                Err(_) => {
                    warn!(
                        "Ingest queue not drained after {:?}, abandoning {} queued events",
                        drain,
                        self.handle.pending()
                    );
                    workers.abort_all();
                    join_workers(&mut workers).await;
                }
            }
        }
        for sink in sinks {
            sink.abort();
        }
        self.shutdown().await
    }

    /// Stop background work and close the store. Safe to call more than once.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("Shutting down bridge...");
        self.handle.close();

        // join the maintenance thread off the runtime; stop() blocks up to its timeout
        let maintenance = std::mem::replace(
            &mut *lock(&self.maintenance),
            MaintenanceScheduler::new(self.store.clone(), disabled(&self.config)),
        );
        let joined = tokio::task::spawn_blocking(move || {
            let mut maintenance = maintenance;
            maintenance.stop()
        })
        .await
        .unwrap_or(false);
        if !joined {
            warn!("Maintenance thread did not stop in time");
        }

        self.ingestor.limiter().reset();
        self.live.clear();
        let store = self.store.clone();
        blocking(move || store.close()).await?;
        info!("Bridge shutdown complete ({})", self.metrics.snapshot());
        Ok(())
    }
}

/// Wait until every worker in `workers` has ended.
async fn join_workers(workers: &mut JoinSet<()>) {
    while let Some(done) = workers.join_next().await {
        if let Err(e) = done {
            if !e.is_cancelled() {
                warn!("Ingest worker ended abnormally: {}", e);
            }
        }
    }
}

fn disabled(config: &Config) -> crate::config::MaintenanceConfig {
    crate::config::MaintenanceConfig {
        enabled: false,
        ..config.maintenance.clone()
    }
}

/// Fallback chat sink when no chat collaborator took the receiver.
async fn log_chat_events(mut rx: mpsc::Receiver<ChatEvent>) {
    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => info!("chat <- {}", line),
            Err(e) => warn!("Unserializable chat event: {}", e),
        }
    }
}

async fn log_mesh_outbound(mut rx: mpsc::Receiver<MeshOutbound>) {
    while let Some(out) = rx.recv().await {
        info!(
            "mesh <- #{} to {}: {}",
            out.message_id,
            out.to.as_deref().unwrap_or("broadcast"),
            escape_log(&out.text)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bridge(dir: &tempfile::TempDir) -> Bridge {
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("mesh.db").to_string_lossy().into_owned();
        config.maintenance.enabled = false;
        config.bridge.message_max_length = 20;
        Bridge::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn outbound_is_validated_persisted_and_queued() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = bridge(&dir).await;
        let mut mesh = b.take_mesh_outbound().unwrap();

        let id = b.submit_outbound("alice", "hello mesh", Some("42")).await.unwrap();
        let out = mesh.try_recv().unwrap();
        assert_eq!(out.message_id, id);
        assert_eq!(out.to.as_deref(), Some("!0000002a"));

        let stored = b.store().recent_messages(1).unwrap();
        assert_eq!(stored[0].direction, Direction::ChatToMesh);
        assert_eq!(stored[0].from_node_id, BRIDGE_SENDER);

        // cooldown is per invoker
        assert!(matches!(
            b.submit_outbound("alice", "again", None).await,
            Err(CommandError::Cooldown { .. })
        ));
        assert!(matches!(
            b.submit_outbound("bob", "this one is far too long to send", None).await,
            Err(CommandError::Validation(_))
        ));
        assert!(matches!(
            b.submit_outbound("carol", "bad\u{7}bell", None).await,
            Err(CommandError::Validation(_))
        ));
        assert_eq!(b.metrics().outbound_rejected, 2);
        assert_eq!(b.store().recent_messages(10).unwrap().len(), 1);
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn run_returns_when_the_source_closes() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = bridge(&dir).await;
        let mut chat = b.take_chat_events().unwrap();
        let handle = b.ingest_handle();
        handle
            .submit(crate::meshtastic::RawEvent::new(serde_json::json!({
                "fromId": "!00000001",
                "decoded": {"portnum": "TEXT_MESSAGE_APP", "text": "hello"}
            })))
            .unwrap();
        handle.close();

        tokio::time::timeout(Duration::from_secs(10), b.run())
            .await
            .unwrap()
            .unwrap();
        assert!(b.store().is_closed());

        let mut relayed = 0;
        while let Ok(ev) = chat.try_recv() {
            if matches!(ev, ChatEvent::Relay(_)) {
                relayed += 1;
            }
        }
        assert_eq!(relayed, 1);
    }

    fn text_from(n: u32) -> crate::meshtastic::RawEvent {
        crate::meshtastic::RawEvent::new(serde_json::json!({
            "fromId": format!("!{:08x}", n),
            "decoded": {"portnum": "TEXT_MESSAGE_APP", "text": format!("report {}", n)}
        }))
    }

    #[tokio::test]
    async fn stalled_workers_are_stopped_before_the_store_closes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("mesh.db").to_string_lossy().into_owned();
        config.storage.drain_timeout_ms = 200;
        config.maintenance.enabled = false;
        config.bridge.ingest_workers = 1;
        config.bridge.ingest_queue_capacity = 2;
        let mut b = Bridge::new(config).await.unwrap();
        // nobody reads the chat side: the worker blocks once it holds two events
        let mut chat = b.take_chat_events().unwrap();
        let handle = b.ingest_handle();
        handle.submit(text_from(1)).unwrap();
        handle.submit(text_from(2)).unwrap();
        let late = handle.clone();
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            late.submit(text_from(3)).unwrap();
            late.submit(text_from(4)).unwrap();
        });

        tokio::time::timeout(
            Duration::from_secs(10),
            b.run_until(tokio::time::sleep(Duration::from_millis(400))),
        )
        .await
        .unwrap()
        .unwrap();
        producer.await.unwrap();
        assert!(b.store().is_closed());
        assert_eq!(handle.pending(), 2);

        // unblock anything still holding the sink
        let mut relayed = 0;
        while let Ok(ev) = chat.try_recv() {
            if matches!(ev, ChatEvent::Relay(_)) {
                relayed += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(ev) = chat.try_recv() {
            if matches!(ev, ChatEvent::Relay(_)) {
                relayed += 1;
            }
        }
        assert_eq!(relayed, 1);

        let m = b.metrics();
        assert_eq!(m.received, 4);
        assert_eq!(m.persisted, 2);
        assert_eq!(m.persist_failures, 0);
        assert_eq!(handle.pending(), 2);
    }
}
