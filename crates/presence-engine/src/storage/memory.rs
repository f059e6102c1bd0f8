//! Process-local backend: `DashMap` for state, a handler registry fanned out
//! on its own spawned task per event. No persistence across restarts.

use crate::storage::{EventHandler, StorageDriver, SubscriptionId};
use async_trait::async_trait;
use dashmap::DashMap;
use presence_core::{
    geo, AgentStateSnapshot, AgentStats, AgentStatus, Event, LocationSample, Result,
};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct AgentRecord {
    location: Option<LocationSample>,
    status: Option<AgentStatus>,
    state: Option<AgentStateSnapshot>,
    stats: Option<AgentStats>,
}

/// The in-memory storage driver. Synchronous, best-effort, fan-out-to-all:
/// a handler that fails does not stop delivery to the others.
pub struct MemoryDriver {
    agents: DashMap<String, AgentRecord>,
    handlers: DashMap<SubscriptionId, EventHandler>,
    next_subscription_id: AtomicU64,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            handlers: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn initialize(&self) -> Result<()> {
        tracing::info!("memory storage driver initialized");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.agents.clear();
        self.handlers.clear();
        tracing::info!("memory storage driver disconnected");
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
        for entry in self.handlers.iter() {
            let handler = entry.value().clone();
            let event = event.clone();
            let subscription_id = *entry.key();
            tokio::spawn(async move {
                let result =
                    tokio::spawn(async move { handler(event).await }).await;
                if let Err(err) = result {
                    tracing::error!(subscription_id, "event handler panicked: {}", err);
                }
            });
        }
        Ok(())
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
    use presence_core::{Coordinate, EventKind, EventPayload, LocationReceivedPayload};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn sample(agent_id: &str, ts_ms: i64) -> LocationSample {
        LocationSample {
            agent_id: agent_id.to_string(),
            coordinate: Coordinate { lat: 1.0, lon: 2.0 },
            timestamp_ms: ts_ms,
            speed_kmh: None,
            heading_deg: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn save_location_increments_stats() {
        let driver = MemoryDriver::new();
        driver.save_location("a1", &sample("a1", 1000)).await.unwrap();
        driver.save_location("a1", &sample("a1", 2000)).await.unwrap();
        let stats = driver.get_agent_stats("a1").await.unwrap().unwrap();
        assert_eq!(stats.total_locations, 2);
        assert_eq!(stats.last_update_ms, 2000);
    }

    #[tokio::test]
    async fn clear_agent_data_removes_everything() {
        let driver = MemoryDriver::new();
        driver.save_location("a1", &sample("a1", 1000)).await.unwrap();
        driver.clear_agent_data("a1").await.unwrap();
        assert!(driver.get_last_location("a1").await.unwrap().is_none());
        assert!(driver.get_agent_stats("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_subscribers_and_survives_failures() {
        let driver = MemoryDriver::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let failing_calls = calls.clone();
        driver
            .subscribe_events(Arc::new(move |_event| {
                failing_calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    panic!("handler blew up");
                })
            }))
            .await
            .unwrap();

        let ok_calls = calls.clone();
        driver
            .subscribe_events(Arc::new(move |_event| {
                ok_calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            }))
            .await
            .unwrap();

        let payload = EventPayload::LocationReceived(LocationReceivedPayload {
            agent_id: "a1".into(),
            sample: sample("a1", 1000),
            distance_traveled_m: 0.0,
            speed_kmh: None,
        });
        assert_eq!(payload.kind(), EventKind::LocationReceived);
        driver.publish_event(Event::new(payload, 1000)).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let driver = MemoryDriver::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        let id = driver
            .subscribe_events(Arc::new(move |_event| {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            }))
            .await
            .unwrap();
        driver.unsubscribe_events(id).await.unwrap();

        let payload = EventPayload::LocationReceived(LocationReceivedPayload {
            agent_id: "a1".into(),
            sample: sample("a1", 1000),
            distance_traveled_m: 0.0,
            speed_kmh: None,
        });
        driver.publish_event(Event::new(payload, 1000)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
