//! Command path: per-invoker cooldown, then a cached read against the store.
//!
//! Every query is a small value type ([`Query`]) so it can key the cache
//! directly. Arguments are normalized before lookup, which keeps equivalent
//! requests (`"  Alice"` and `"alice"`) on one cache entry.

use chrono::{Duration as ChronoDuration, Utc};
use log::debug;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::blocking;
use super::cache::{BoxFuture, BoxedCached, CacheStats, Cached};
use super::cooldown::CommandCooldown;
use crate::config::BridgeConfig;
use crate::logutil::escape_log;
use crate::metrics::Metrics;
use crate::storage::{
    LinkQuality, Message, MessageStatistics, Node, Position, StorageError, Store, Talker,
    TelemetrySample, TelemetrySummary,
};
use crate::validation::{validate_search_query, ValidationError};

pub const MAX_LIST_LIMIT: usize = 50;
const NODE_TELEMETRY_SAMPLES: usize = 5;
const MAX_WINDOW_HOURS: u32 = 24 * 30;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command cooldown active, try again in {:.1}s", .remaining.as_secs_f64())]
    Cooldown { remaining: Duration },

    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no match for {0}")]
    NotFound(String),

    #[error("mesh link is not accepting messages")]
    MeshUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// Nodes heard within the last `minutes` (the configured threshold when `None`)
    ActiveNodes { minutes: Option<u64> },
    AllNodes,
    Node { name: String },
    RecentMessages { limit: usize },
    SearchMessages { text: String, limit: usize },
    TopTalkers { hours: u32, limit: usize },
    Stats { hours: u32 },
}

impl Query {
    /// Canonical form used as the cache key.
    pub fn normalized(self) -> Result<Self, ValidationError> {
        let limit = |l: usize| l.clamp(1, MAX_LIST_LIMIT);
        let hours = |h: u32| h.clamp(1, MAX_WINDOW_HOURS);
        Ok(match self {
            Query::Node { name } => {
                let name = name.trim().to_lowercase();
                if name.is_empty() {
                    return Err(ValidationError::Empty);
                }
                Query::Node { name }
            }
            Query::SearchMessages { text, limit: l } => Query::SearchMessages {
                text: validate_search_query(&text)?.to_lowercase(),
                limit: limit(l),
            },
            Query::RecentMessages { limit: l } => Query::RecentMessages { limit: limit(l) },
            Query::TopTalkers { hours: h, limit: l } => Query::TopTalkers {
                hours: hours(h),
                limit: limit(l),
            },
            Query::Stats { hours: h } => Query::Stats { hours: hours(h) },
            other => other,
        })
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Query::ActiveNodes { minutes: Some(m) } => write!(f, "active nodes ({} min)", m),
            Query::ActiveNodes { minutes: None } => write!(f, "active nodes"),
            Query::AllNodes => write!(f, "all nodes"),
            Query::Node { name } => write!(f, "node '{}'", escape_log(name)),
            Query::RecentMessages { limit } => write!(f, "last {} messages", limit),
            Query::SearchMessages { text, .. } => {
                write!(f, "messages containing '{}'", escape_log(text))
            }
            Query::TopTalkers { hours, limit } => write!(f, "top {} talkers ({} h)", limit, hours),
            Query::Stats { hours } => write!(f, "statistics ({} h)", hours),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub node: Node,
    pub last_position: Option<Position>,
    pub recent_telemetry: Vec<TelemetrySample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkStats {
    pub hours: u32,
    pub messages: MessageStatistics,
    pub link_quality: LinkQuality,
    pub top_talkers: Vec<Talker>,
    pub new_nodes: usize,
    pub telemetry: TelemetrySummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum QueryResult {
    Nodes(Vec<Node>),
    Node(Box<NodeReport>),
    Messages(Vec<Message>),
    Talkers(Vec<Talker>),
    Stats(Box<NetworkStats>),
}

fn run_query(
    store: &Store,
    query: &Query,
    active_minutes: u64,
) -> Result<Option<QueryResult>, StorageError> {
    let now = Utc::now();
    let since_hours = |h: u32| now - ChronoDuration::hours(i64::from(h));
    let result = match query {
        Query::ActiveNodes { minutes } => {
            QueryResult::Nodes(store.active_nodes(minutes.unwrap_or(active_minutes))?)
        }
        Query::AllNodes => QueryResult::Nodes(store.all_nodes()?),
        Query::Node { name } => {
            let Some(node) = store.find_node_by_name(name)? else {
                return Ok(None);
            };
            let last_position = store.last_position(&node.node_id)?;
            let day_ago = now - ChronoDuration::hours(24);
            let recent_telemetry =
                store.telemetry_history(&node.node_id, day_ago, NODE_TELEMETRY_SAMPLES)?;
            QueryResult::Node(Box::new(NodeReport {
                node,
                last_position,
                recent_telemetry,
            }))
        }
        Query::RecentMessages { limit } => QueryResult::Messages(store.recent_messages(*limit)?),
        Query::SearchMessages { text, limit } => {
            let found = store.search_messages(text, *limit)?;
            if found.is_empty() {
                return Ok(None);
            }
            QueryResult::Messages(found)
        }
        Query::TopTalkers { hours, limit } => {
            QueryResult::Talkers(store.top_talkers_since(since_hours(*hours), *limit)?)
        }
        Query::Stats { hours } => {
            let since = since_hours(*hours);
            QueryResult::Stats(Box::new(NetworkStats {
                hours: *hours,
                messages: store.message_statistics(since)?,
                link_quality: store.avg_link_quality_since(since)?,
                top_talkers: store.top_talkers_since(since, 5)?,
                new_nodes: store.new_nodes_since(since)?.len(),
                telemetry: store.telemetry_summary(since)?,
            }))
        }
    };
    Ok(Some(result))
}

type QueryOutcome = Result<QueryResult, CommandError>;
type QueryFn = Box<dyn Fn(Query) -> BoxFuture<QueryOutcome> + Send + Sync>;
type QueryCache = BoxedCached<Query, QueryResult, CommandError>;

pub struct QueryService {
    cooldown: Arc<CommandCooldown>,
    cache: QueryCache,
    metrics: Arc<Metrics>,
}

impl QueryService {
    pub fn new(
        store: Store,
        cooldown: Arc<CommandCooldown>,
        config: &BridgeConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let active_minutes = config.active_node_threshold_minutes;
        let compute: QueryFn = Box::new(move |query: Query| -> BoxFuture<QueryOutcome> {
            let store = store.clone();
            Box::pin(async move {
                let subject = query.to_string();
                blocking(move || run_query(&store, &query, active_minutes))
                    .await?
                    .ok_or(CommandError::NotFound(subject))
            })
        });
        Self {
            cooldown,
            cache: Cached::new(config.query_cache_ttl(), compute),
            metrics,
        }
    }

    /// A command from `invoker`: cooldown first, then the cached query.
    pub async fn run(&self, invoker: &str, query: Query) -> Result<QueryResult, CommandError> {
        let now = Instant::now();
        if !self.cooldown.allow(invoker, now) {
            self.metrics.inc_cooldown_rejections();
            debug!(target: "security", "Command from {} rejected by cooldown", escape_log(invoker));
            return Err(CommandError::Cooldown {
                remaining: self.cooldown.remaining(invoker, now),
            });
        }
        debug!("{} requested {}", escape_log(invoker), query);
        self.query(query).await
    }

    /// Cached query without a cooldown (operator CLI, internal callers).
    pub async fn query(&self, query: Query) -> Result<QueryResult, CommandError> {
        self.cache.get(query.normalized()?).await
    }

    /// Drop expired cache entries and forgotten cooldowns.
    pub fn housekeeping(&self) -> usize {
        self.cooldown.purge(Instant::now()) + self.cache.purge_expired()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
