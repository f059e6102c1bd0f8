//! Redis-backed backend: state lives in Redis keys, events fan out over a
//! Redis pub/sub channel. A background task owns the subscriber connection
//! and invokes locally registered handlers as messages arrive.

use crate::storage::{EventHandler, StorageDriver, SubscriptionId};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use presence_core::{
    AgentStateSnapshot, AgentStats, AgentStatus, Event, LocationSample, PresenceError, Result,
};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const CHANNEL: &str = "presence-events";
const AGENTS_SET_KEY: &str = "presence:agents";

fn key(kind: &str, agent_id: &str) -> String {
    format!("presence:{kind}:{agent_id}")
}

/// KV-store + pub/sub backend backed by Redis.
pub struct KvPubSubDriver {
    url: String,
    conn: Mutex<Option<ConnectionManager>>,
    handlers: Arc<DashMap<SubscriptionId, EventHandler>>,
    next_subscription_id: AtomicU64,
    subscriber_task: Mutex<Option<JoinHandle<()>>>,
}

impl KvPubSubDriver {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            conn: Mutex::new(None),
            handlers: Arc::new(DashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            subscriber_task: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let guard = self.conn.lock().await;
        guard.clone().ok_or(PresenceError::NotInitialized)
    }
}

#[async_trait]
impl StorageDriver for KvPubSubDriver {
    async fn initialize(&self) -> Result<()> {
        tracing::info!(url = %self.url, "connecting to redis");
        let client = redis::Client::open(self.url.as_str()).map_err(PresenceError::backend)?;
        let manager = ConnectionManager::new(client.clone()).await.map_err(PresenceError::backend)?;
        *self.conn.lock().await = Some(manager);
        tracing::info!("redis kv/pubsub driver connected");

        let pubsub_client = client;
        let handlers = self.handlers.clone();
        let task = tokio::spawn(async move {
            let mut backoff = crate::storage::reconnect::Backoff::new(
                std::time::Duration::from_millis(200),
                std::time::Duration::from_secs(10),
            );
            loop {
                if !backoff.ready() {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
                let conn = match pubsub_client.get_async_pubsub().await {
                    Ok(c) => c,
                    Err(err) => {
                        tracing::error!("redis pubsub connect failed: {}", err);
                        backoff.fail();
                        continue;
                    }
                };
                let mut conn = conn;
                if let Err(err) = conn.subscribe(CHANNEL).await {
                    tracing::error!("redis subscribe failed: {}", err);
                    backoff.fail();
                    continue;
                }
                backoff.reset();
                let mut stream = conn.on_message();
                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(err) => {
                            tracing::error!("redis message payload decode failed: {}", err);
                            continue;
                        }
                    };
                    let event: Event = match serde_json::from_str(&payload) {
                        Ok(e) => e,
                        Err(err) => {
                            tracing::error!("event decode failed: {}", err);
                            continue;
                        }
                    };
                    for entry in handlers.iter() {
                        let handler = entry.value().clone();
                        let event = event.clone();
                        let subscription_id = *entry.key();
                        tokio::spawn(async move {
                            if let Err(err) = tokio::spawn(async move { handler(event).await }).await {
                                tracing::error!(subscription_id, "event handler panicked: {}", err);
                            }
                        });
                    }
                }
                tracing::warn!("redis pubsub stream ended, reconnecting");
            }
        });
        *self.subscriber_task.lock().await = Some(task);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(task) = self.subscriber_task.lock().await.take() {
            task.abort();
        }
        *self.conn.lock().await = None;
        tracing::info!("redis kv/pubsub driver disconnected");
        Ok(())
    }

    async fn save_location(&self, agent_id: &str, sample: &LocationSample) -> Result<()> {
        let mut conn = self.connection().await?;
        let prior: Option<String> =
            conn.get(key("location", agent_id)).await.map_err(PresenceError::backend)?;
        let delta_m = prior
            .as_deref()
            .and_then(|raw| serde_json::from_str::<LocationSample>(raw).ok())
            .map(|prior| presence_core::geo::distance(prior.coordinate, sample.coordinate))
            .unwrap_or(0.0);

        let payload = serde_json::to_string(sample).map_err(PresenceError::backend)?;
        conn.set::<_, _, ()>(key("location", agent_id), payload)
            .await
            .map_err(PresenceError::backend)?;
        conn.sadd::<_, _, ()>(AGENTS_SET_KEY, agent_id).await.map_err(PresenceError::backend)?;
        conn.hincr::<_, _, _, ()>(key("stats", agent_id), "total_locations", 1)
            .await
            .map_err(PresenceError::backend)?;
        redis::cmd("HINCRBYFLOAT")
            .arg(key("stats", agent_id))
            .arg("total_distance_m")
            .arg(delta_m)
            .query_async::<()>(&mut conn)
            .await
            .map_err(PresenceError::backend)?;
        conn.hset::<_, _, _, ()>(key("stats", agent_id), "last_update_ms", sample.timestamp_ms)
            .await
            .map_err(PresenceError::backend)?;
        Ok(())
    }

    async fn get_last_location(&self, agent_id: &str) -> Result<Option<LocationSample>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> =
            conn.get(key("location", agent_id)).await.map_err(PresenceError::backend)?;
        raw.map(|r| serde_json::from_str(&r).map_err(PresenceError::backend)).transpose()
    }

    async fn save_status(&self, agent_id: &str, status: AgentStatus, _ts_ms: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&status).map_err(PresenceError::backend)?;
        conn.set::<_, _, ()>(key("status", agent_id), payload)
            .await
            .map_err(PresenceError::backend)?;
        conn.sadd::<_, _, ()>(AGENTS_SET_KEY, agent_id).await.map_err(PresenceError::backend)?;
        Ok(())
    }

    async fn get_status(&self, agent_id: &str) -> Result<Option<AgentStatus>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> =
            conn.get(key("status", agent_id)).await.map_err(PresenceError::backend)?;
        raw.map(|r| serde_json::from_str(&r).map_err(PresenceError::backend)).transpose()
    }

    async fn save_agent_state(&self, agent_id: &str, snapshot: &AgentStateSnapshot) -> Result<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(snapshot).map_err(PresenceError::backend)?;
        conn.set::<_, _, ()>(key("state", agent_id), payload)
            .await
            .map_err(PresenceError::backend)?;
        conn.sadd::<_, _, ()>(AGENTS_SET_KEY, agent_id).await.map_err(PresenceError::backend)?;
        Ok(())
    }

    async fn get_agent_state(&self, agent_id: &str) -> Result<Option<AgentStateSnapshot>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> =
            conn.get(key("state", agent_id)).await.map_err(PresenceError::backend)?;
        raw.map(|r| serde_json::from_str(&r).map_err(PresenceError::backend)).transpose()
    }

    async fn get_all_agents(&self) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        conn.smembers(AGENTS_SET_KEY).await.map_err(PresenceError::backend)
    }

    async fn publish_event(&self, event: Event) -> Result<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&event).map_err(PresenceError::backend)?;
        conn.publish::<_, _, ()>(CHANNEL, payload).await.map_err(PresenceError::backend)
    }

    async fn subscribe_events(&self, handler: EventHandler) -> Result<SubscriptionId> {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.insert(id, handler);
        Ok(id)
    }

    async fn unsubscribe_events(&self, id: SubscriptionId) -> Result<()> {
        self.handlers.remove(&id);
        Ok(())
    }

    async fn get_agent_stats(&self, agent_id: &str) -> Result<Option<AgentStats>> {
        let mut conn = self.connection().await?;
        let total_locations: Option<u64> = conn
            .hget(key("stats", agent_id), "total_locations")
            .await
            .map_err(PresenceError::backend)?;
        let Some(total_locations) = total_locations else {
            return Ok(None);
        };
        let last_update_ms: i64 = conn
            .hget(key("stats", agent_id), "last_update_ms")
            .await
            .map_err(PresenceError::backend)?;
        let total_distance_m: Option<String> = conn
            .hget(key("stats", agent_id), "total_distance_m")
            .await
            .map_err(PresenceError::backend)?;
        let total_distance_m = total_distance_m.and_then(|s| s.parse().ok()).unwrap_or(0.0);
        Ok(Some(AgentStats { total_locations, total_distance_m, last_update_ms }))
    }

    async fn clear_agent_data(&self, agent_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key("location", agent_id)).await.map_err(PresenceError::backend)?;
        conn.del::<_, ()>(key("status", agent_id)).await.map_err(PresenceError::backend)?;
        conn.del::<_, ()>(key("state", agent_id)).await.map_err(PresenceError::backend)?;
        conn.del::<_, ()>(key("stats", agent_id)).await.map_err(PresenceError::backend)?;
        conn.srem::<_, _, ()>(AGENTS_SET_KEY, agent_id).await.map_err(PresenceError::backend)?;
        Ok(())
    }
}
