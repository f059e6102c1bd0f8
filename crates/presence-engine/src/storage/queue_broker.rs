//! NATS JetStream-backed backend. The queue broker is pure pub/sub, so
//! last-location/status/state/stats are kept in a process-local mirror
//! populated on every write, exactly as the contract requires for
//! pub/sub-only backends. Events are durable JetStream messages, consumed
//! with explicit acknowledgment.

use crate::storage::{EventHandler, StorageDriver, SubscriptionId};
use async_nats::jetstream::{self, consumer::DeliverPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use presence_core::{
    geo, AgentStateSnapshot, AgentStats, AgentStatus, Event, LocationSample, PresenceError, Result,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct AgentMirror {
    location: Option<LocationSample>,
    status: Option<AgentStatus>,
    state: Option<AgentStateSnapshot>,
    stats: Option<AgentStats>,
}

/// JetStream-backed storage driver.
pub struct QueueBrokerDriver {
    url: String,
    stream_name: String,
    jetstream: Mutex<Option<jetstream::Context>>,
    agents: Arc<DashMap<String, AgentMirror>>,
    subscriber_tasks: DashMap<SubscriptionId, JoinHandle<()>>,
    next_subscription_id: AtomicU64,
}

impl QueueBrokerDriver {
    pub fn new(url: impl Into<String>, stream_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_name: stream_name.into(),
            jetstream: Mutex::new(None),
            agents: Arc::new(DashMap::new()),
            subscriber_tasks: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    fn subject(&self) -> String {
        format!("{}.events", self.stream_name)
    }

    async fn jetstream(&self) -> Result<jetstream::Context> {
        self.jetstream.lock().await.clone().ok_or(PresenceError::NotInitialized)
    }
}

#[async_trait]
impl StorageDriver for QueueBrokerDriver {
    async fn initialize(&self) -> Result<()> {
        tracing::info!(url = %self.url, "connecting to nats jetstream");
        let url = self.url.clone();
        let stream_name = self.stream_name.clone();
        let subject = self.subject();
        let jetstream = crate::storage::reconnect::connect_with_retry(
            std::time::Duration::from_millis(200),
            std::time::Duration::from_secs(5),
            5,
            move || {
                let url = url.clone();
                let stream_name = stream_name.clone();
                let subject = subject.clone();
                async move {
                    let client = async_nats::connect(&url).await.map_err(PresenceError::backend)?;
                    let jetstream = jetstream::new(client);
                    jetstream
                        .get_or_create_stream(jetstream::stream::Config {
                            name: stream_name,
                            subjects: vec![subject],
                            ..Default::default()
                        })
                        .await
                        .map_err(PresenceError::backend)?;
                    Ok(jetstream)
                }
            },
        )
        .await?;
        *self.jetstream.lock().await = Some(jetstream);
        tracing::info!("nats jetstream queue broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        for entry in self.subscriber_tasks.iter() {
            entry.value().abort();
        }
        self.subscriber_tasks.clear();
        *self.jetstream.lock().await = None;
        tracing::info!("nats jetstream queue broker disconnected");
        Ok(())
    }

    async fn save_location(&self, agent_id: &str, sample: &LocationSample) -> Result<()> {
        let mut entry = self.agents.entry(agent_id.to_string()).or_default();
        let delta_m = entry
            .location
            .as_ref()
            .map(|prior| geo::distance(prior.coordinate, sample.coordinate))
            .unwrap_or(0.0);
        entry.location = Some(sample.clone());
        let stats = entry.stats.get_or_insert_with(AgentStats::default);
        stats.total_locations += 1;
        stats.total_distance_m += delta_m;
        stats.last_update_ms = sample.timestamp_ms;
        Ok(())
    }

    async fn get_last_location(&self, agent_id: &str) -> Result<Option<LocationSample>> {
        Ok(self.agents.get(agent_id).and_then(|r| r.location.clone()))
    }

    async fn save_status(&self, agent_id: &str, status: AgentStatus, _ts_ms: i64) -> Result<()> {
        self.agents.entry(agent_id.to_string()).or_default().status = Some(status);
        Ok(())
    }

    async fn get_status(&self, agent_id: &str) -> Result<Option<AgentStatus>> {
        Ok(self.agents.get(agent_id).and_then(|r| r.status))
    }

    async fn save_agent_state(&self, agent_id: &str, snapshot: &AgentStateSnapshot) -> Result<()> {
        self.agents.entry(agent_id.to_string()).or_default().state = Some(snapshot.clone());
        Ok(())
    }

    async fn get_agent_state(&self, agent_id: &str) -> Result<Option<AgentStateSnapshot>> {
        Ok(self.agents.get(agent_id).and_then(|r| r.state.clone()))
    }

    async fn get_all_agents(&self) -> Result<Vec<String>> {
        Ok(self.agents.iter().map(|e| e.key().clone()).collect())
    }

    async fn publish_event(&self, event: Event) -> Result<()> {
        let jetstream = self.jetstream().await?;
        let payload = serde_json::to_vec(&event).map_err(PresenceError::backend)?;
        jetstream
            .publish(self.subject(), payload.into())
            .await
            .map_err(PresenceError::backend)?
            .await
            .map_err(PresenceError::backend)?;
        Ok(())
    }

    async fn subscribe_events(&self, handler: EventHandler) -> Result<SubscriptionId> {
        let jetstream = self.jetstream().await?;
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let consumer_name = format!("presence-sub-{id}");
        let subject = self.subject();

        let stream = jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(PresenceError::backend)?;
        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                durable_name: Some(consumer_name),
                deliver_policy: DeliverPolicy::New,
                filter_subject: subject,
                ..Default::default()
            })
            .await
            .map_err(PresenceError::backend)?;

        let task = tokio::spawn(async move {
            let mut messages = match consumer.messages().await {
                Ok(m) => m,
                Err(err) => {
                    tracing::error!("jetstream consumer stream failed: {}", err);
                    return;
                }
            };
            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(m) => m,
                    Err(err) => {
                        tracing::error!("jetstream message fetch failed: {}", err);
                        continue;
                    }
                };
                match serde_json::from_slice::<Event>(&message.payload) {
                    Ok(event) => {
                        handler(event).await;
                        if let Err(err) = message.ack().await {
                            tracing::error!("jetstream ack failed: {}", err);
                        }
                    }
                    Err(err) => tracing::error!("event decode failed: {}", err),
                }
            }
        });
        self.subscriber_tasks.insert(id, task);
        Ok(id)
    }

    async fn unsubscribe_events(&self, id: SubscriptionId) -> Result<()> {
        // Durable JetStream consumers are left in place for replay after a
        // reconnect; only the local delivery task is torn down here.
        if let Some((_, task)) = self.subscriber_tasks.remove(&id) {
            task.abort();
        }
        Ok(())
    }

    async fn get_agent_stats(&self, agent_id: &str) -> Result<Option<AgentStats>> {
        Ok(self.agents.get(agent_id).and_then(|r| r.stats))
    }

    async fn clear_agent_data(&self, agent_id: &str) -> Result<()> {
        self.agents.remove(agent_id);
        Ok(())
    }
}
