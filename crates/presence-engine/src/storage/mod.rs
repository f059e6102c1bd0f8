//! The storage-driver contract: the substitutability boundary every backend
//! satisfies. Engines hold an `Arc<dyn StorageDriver>` and never reach for a
//! concrete backend's transport types.

pub mod kv_pubsub;
pub mod log_stream;
pub mod memory;
pub mod queue_broker;
pub mod reconnect;
pub mod ws_broadcast;

use async_trait::async_trait;
use presence_core::{AgentStateSnapshot, AgentStats, AgentStatus, Event, LocationSample, Result};
use std::sync::Arc;

/// A handle returned from [`StorageDriver::subscribe_events`]. Dropping it
/// has no effect; call [`StorageDriver::unsubscribe_events`] with the id to
/// stop delivery.
pub type SubscriptionId = u64;

/// A subscriber callback. Invoked on its own spawned task per event, never
/// inline in the publisher's call stack, so a slow handler cannot stall
/// ingest. Handlers that fail are logged; handlers that panic are caught at
/// the spawn site.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture + Send + Sync>;

/// A boxed, pinned future, returned by an [`EventHandler`] invocation.
pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// The operations every backend implements (§4.2). Delivery semantics for
/// `publish_event`/`subscribe_events` differ by backend and are deliberately
/// not normalized here: in-memory is synchronous best-effort fan-out;
/// pub/sub backends follow their native at-most-once/at-least-once
/// behavior; log-stream backends support replay; the queue broker
/// acknowledges.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    /// Releases resources. Idempotent: calling twice is not an error.
    async fn disconnect(&self) -> Result<()>;

    async fn save_location(&self, agent_id: &str, sample: &LocationSample) -> Result<()>;

    async fn get_last_location(&self, agent_id: &str) -> Result<Option<LocationSample>>;

    async fn save_status(&self, agent_id: &str, status: AgentStatus, ts_ms: i64) -> Result<()>;

    async fn get_status(&self, agent_id: &str) -> Result<Option<AgentStatus>>;

    async fn save_agent_state(
        &self,
        agent_id: &str,
        snapshot: &AgentStateSnapshot,
    ) -> Result<()>;

    async fn get_agent_state(&self, agent_id: &str) -> Result<Option<AgentStateSnapshot>>;

    /// Deduplicated agent ids across every stored kind (location, status,
    /// state, stats).
    async fn get_all_agents(&self) -> Result<Vec<String>>;

    async fn publish_event(&self, event: Event) -> Result<()>;

    /// Registers `handler` to be invoked for every event published after
    /// this call, until [`StorageDriver::unsubscribe_events`] is called with
    /// the returned id.
    async fn subscribe_events(&self, handler: EventHandler) -> Result<SubscriptionId>;

    /// Idempotent: unsubscribing an id that was already removed is not an
    /// error.
    async fn unsubscribe_events(&self, id: SubscriptionId) -> Result<()>;

    async fn get_agent_stats(&self, agent_id: &str) -> Result<Option<AgentStats>>;

    /// Removes location, status, state and stats for `agent_id`.
    async fn clear_agent_data(&self, agent_id: &str) -> Result<()>;
}
