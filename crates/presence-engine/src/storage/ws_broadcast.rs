//! Broadcast-channel backend, fanned out both to locally registered
//! handlers and to any WebSocket client upgraded through
//! [`WsBroadcastDriver::ws_handler`]. Like the queue broker, this is pure
//! pub/sub, so reads are served from a process-local mirror.

use crate::storage::{EventHandler, StorageDriver, SubscriptionId};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use dashmap::DashMap;
use presence_core::{
    geo, AgentStateSnapshot, AgentStats, AgentStatus, Event, LocationSample, Result,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Default)]
struct AgentMirror {
    location: Option<LocationSample>,
    status: Option<AgentStatus>,
    state: Option<AgentStateSnapshot>,
    stats: Option<AgentStats>,
}

/// Broadcast-channel storage driver. `Clone` so an `Arc<WsBroadcastDriver>`
/// can be handed to Axum as router state without an extra indirection.
pub struct WsBroadcastDriver {
    tx: broadcast::Sender<Event>,
    agents: DashMap<String, AgentMirror>,
    handler_tasks: DashMap<SubscriptionId, tokio::task::JoinHandle<()>>,
    next_subscription_id: AtomicU64,
}

impl WsBroadcastDriver {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            tx,
            agents: DashMap::new(),
            handler_tasks: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Axum handler that upgrades a connection and streams every
    /// subsequently published event as a JSON text frame.
    pub async fn ws_handler(
        ws: WebSocketUpgrade,
        State(driver): State<Arc<WsBroadcastDriver>>,
    ) -> impl IntoResponse {
        ws.on_upgrade(move |socket| Self::stream_to_socket(socket, driver))
    }

    async fn stream_to_socket(mut socket: WebSocket, driver: Arc<WsBroadcastDriver>) {
        let mut rx = driver.tx.subscribe();
        while let Ok(event) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else { continue };
            if socket.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    }
}

impl Default for WsBroadcastDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for WsBroadcastDriver {
    async fn initialize(&self) -> Result<()> {
        tracing::info!("ws-broadcast storage driver initialized");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        for entry in self.handler_tasks.iter() {
            entry.value().abort();
        }
        self.handler_tasks.clear();
        self.agents.clear();
        tracing::info!("ws-broadcast storage driver disconnected");
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
        // No receivers is not a failure: it just means nobody is listening.
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn subscribe_events(&self, handler: EventHandler) -> Result<SubscriptionId> {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                handler(event).await;
            }
        });
        self.handler_tasks.insert(id, task);
        Ok(id)
    }

    async fn unsubscribe_events(&self, id: SubscriptionId) -> Result<()> {
        if let Some((_, task)) = self.handler_tasks.remove(&id) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{Coordinate, EventPayload, LocationReceivedPayload};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_reaches_subscribed_handler() {
        let driver = WsBroadcastDriver::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        driver
            .subscribe_events(Arc::new(move |_event| {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            }))
            .await
            .unwrap();

        let sample = LocationSample {
            agent_id: "a1".into(),
            coordinate: Coordinate { lat: 0.0, lon: 0.0 },
            timestamp_ms: 1000,
            speed_kmh: None,
            heading_deg: None,
            metadata: Default::default(),
        };
        let payload = EventPayload::LocationReceived(LocationReceivedPayload {
            agent_id: "a1".into(),
            sample,
            distance_traveled_m: 0.0,
            speed_kmh: None,
        });
        driver.publish_event(Event::new(payload, 1000)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
