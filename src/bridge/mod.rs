//! # Bridge Core
//!
//! The async side of the bridge. Radio events come in through an
//! [`ingest::IngestHandle`], are processed by a pool of ingest workers and
//! leave as [`ingest::ChatEvent`]s for the chat collaborator. Chat commands
//! come in through [`queries::QueryService`] and
//! [`server::Bridge::submit_outbound`].
//!
//! ```text
//! radio thread ──submit──▶ [bounded queue] ──▶ ingest workers ──▶ chat sink
//!                                               │  ├─ Store (nodes, telemetry, messages)
//!                                               │  ├─ MovementDetector (positions)
//!                                               │  ├─ LiveBuffer
//!                                               │  └─ DedupRateLimiter (text only)
//! chat command ──▶ CommandCooldown ──▶ Cached query ──▶ Store
//! ```

pub mod cache;
pub mod cooldown;
pub mod dedup;
pub mod ingest;
pub mod live;
pub mod movement;
pub mod queries;
pub mod server;

pub use cache::{BoxedCached, CacheStats, Cached};
pub use cooldown::CommandCooldown;
pub use dedup::{Admission, DedupRateLimiter, Fingerprint};
pub use ingest::{
    ChatEvent, IngestHandle, Ingestor, Notice, RelayDecision, RelayReason, RelayRecord, SubmitError,
    Submitted,
};
pub use live::{LiveBuffer, LiveEntry, LiveKind, LiveReport, LiveSession, LiveSnapshot};
pub use movement::{MovementDetector, MovementEvent};
pub use queries::{CommandError, Query, QueryResult, QueryService};
pub use server::{Bridge, MeshOutbound};

use log::warn;
use std::future::Future;

use crate::metrics::Metrics;
use crate::storage::StorageError;

/// Run blocking store work off the async worker threads.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res,
        Err(e) => Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
    }
}

/// Run `op`, and run it once more if the first attempt hit a busy or locked
/// database.
pub(crate) async fn retry_once<T, F, Fut>(
    metrics: &Metrics,
    what: &str,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            metrics.inc_persist_retries();
            warn!("Transient store error writing {}, retrying once: {}", what, e);
            op().await
        }
        other => other,
    }
}
