//! Zone registry and per-agent membership index. Emits enter/exit deltas
//! as an agent's membership set changes between checks.

use crate::storage::StorageDriver;
use dashmap::DashMap;
use presence_core::{
    geo, Clock, Event, EventPayload, Geofence, GeofenceDirection, GeofenceEventPayload,
    LocationSample, PresenceError, Result,
};
use std::collections::HashSet;
use std::sync::Arc;

pub struct GeofenceEngine {
    storage: Arc<dyn StorageDriver>,
    clock: Arc<dyn Clock>,
    zones: DashMap<String, Geofence>,
    membership: DashMap<String, HashSet<String>>,
}

impl GeofenceEngine {
    pub fn new(storage: Arc<dyn StorageDriver>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock, zones: DashMap::new(), membership: DashMap::new() }
    }

    /// Validates and inserts/overwrites a zone. Does not retroactively
    /// recompute any agent's membership; that happens on the next `check`.
    pub fn register_geofence(&self, zone: Geofence) -> Result<()> {
        let errors = geo::validate_geofence(&zone);
        if !errors.is_empty() {
            return Err(PresenceError::invalid_input(errors.join("; ")));
        }
        self.zones.insert(zone.id().to_string(), zone);
        Ok(())
    }

    /// Erases the zone from the registry and from every agent's membership
    /// set. Removal is an admin operation, not a movement: no exit events
    /// are emitted.
    pub fn remove_geofence(&self, zone_id: &str) {
        self.zones.remove(zone_id);
        for mut entry in self.membership.iter_mut() {
            entry.value_mut().remove(zone_id);
        }
    }

    /// Recomputes `agent_id`'s membership against `sample` and emits
    /// enter/exit events for the delta.
    pub async fn check(&self, agent_id: &str, sample: &LocationSample) -> Result<()> {
        let current: HashSet<String> =
            self.membership.get(agent_id).map(|m| m.clone()).unwrap_or_default();

        let mut next = HashSet::new();
        for entry in self.zones.iter() {
            if geo::point_in_geofence(sample.coordinate, entry.value()) {
                next.insert(entry.key().clone());
            }
        }

        let now_ms = self.clock.now_ms();
        for zone_id in next.difference(&current) {
            self.emit(agent_id, zone_id, sample, now_ms, GeofenceDirection::Enter).await;
        }
        for zone_id in current.difference(&next) {
            self.emit(agent_id, zone_id, sample, now_ms, GeofenceDirection::Exit).await;
        }

        self.membership.insert(agent_id.to_string(), next);
        Ok(())
    }

    async fn emit(
        &self,
        agent_id: &str,
        zone_id: &str,
        sample: &LocationSample,
        ts_ms: i64,
        direction: GeofenceDirection,
    ) {
        let Some(zone) = self.zones.get(zone_id) else { return };
        let payload = GeofenceEventPayload {
            agent_id: agent_id.to_string(),
            zone_id: zone.id().to_string(),
            zone_name: zone.name().to_string(),
            sample: sample.clone(),
            timestamp_ms: ts_ms,
            direction,
        };
        let kind = match direction {
            GeofenceDirection::Enter => "entered",
            GeofenceDirection::Exit => "exited",
        };
        tracing::info!(agent_id, zone_id, kind, "geofence membership change");

        let event_payload = match direction {
            GeofenceDirection::Enter => EventPayload::AgentEnteredGeofence(payload),
            GeofenceDirection::Exit => EventPayload::AgentExitedGeofence(payload),
        };
        if let Err(err) = self.storage.publish_event(Event::new(event_payload, ts_ms)).await {
            tracing::error!(agent_id, zone_id, "failed to publish geofence event: {}", err);
        }
    }

    pub fn get_geofences(&self) -> Vec<Geofence> {
        self.zones.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_geofence(&self, zone_id: &str) -> Option<Geofence> {
        self.zones.get(zone_id).map(|e| e.value().clone())
    }

    pub fn get_agent_geofences(&self, agent_id: &str) -> Vec<Geofence> {
        self.membership
            .get(agent_id)
            .map(|ids| ids.iter().filter_map(|id| self.get_geofence(id)).collect())
            .unwrap_or_default()
    }

    pub fn is_agent_in_geofence(&self, agent_id: &str, zone_id: &str) -> bool {
        self.membership.get(agent_id).map(|m| m.contains(zone_id)).unwrap_or(false)
    }

    pub fn get_agents_in_geofence(&self, zone_id: &str) -> Vec<String> {
        self.membership
            .iter()
            .filter(|e| e.value().contains(zone_id))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn clear_agent_geofences(&self, agent_id: &str) {
        self.membership.remove(agent_id);
    }

    /// The set of zone ids currently containing `agent_id`, for snapshot
    /// construction.
    pub fn current_membership(&self, agent_id: &str) -> HashSet<String> {
        self.membership.get(agent_id).map(|m| m.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryDriver;
    use presence_core::{Coordinate, SystemClock};

    fn engine() -> GeofenceEngine {
        let storage: Arc<dyn StorageDriver> = Arc::new(MemoryDriver::new());
        GeofenceEngine::new(storage, Arc::new(SystemClock))
    }

    fn sample(lat: f64, lon: f64) -> LocationSample {
        LocationSample {
            agent_id: "a1".into(),
            coordinate: Coordinate { lat, lon },
            timestamp_ms: 1000,
            speed_kmh: None,
            heading_deg: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn register_rejects_invalid_zone() {
        let engine = engine();
        let zone = Geofence::Circular {
            id: "z1".into(),
            name: "zone".into(),
            center: Coordinate { lat: 0.0, lon: 0.0 },
            radius_m: -1.0,
            metadata: None,
        };
        assert!(engine.register_geofence(zone).is_err());
    }

    #[tokio::test]
    async fn check_tracks_membership_delta() {
        let engine = engine();
        let zone = Geofence::Circular {
            id: "z1".into(),
            name: "Depot".into(),
            center: Coordinate { lat: 0.0, lon: 0.0 },
            radius_m: 1000.0,
            metadata: None,
        };
        engine.register_geofence(zone).unwrap();

        engine.check("a1", &sample(0.0, 0.0)).await.unwrap();
        assert!(engine.is_agent_in_geofence("a1", "z1"));

        engine.check("a1", &sample(10.0, 10.0)).await.unwrap();
        assert!(!engine.is_agent_in_geofence("a1", "z1"));
    }

    #[tokio::test]
    async fn remove_geofence_clears_membership_without_events() {
        let engine = engine();
        let zone = Geofence::Circular {
            id: "z1".into(),
            name: "Depot".into(),
            center: Coordinate { lat: 0.0, lon: 0.0 },
            radius_m: 1000.0,
            metadata: None,
        };
        engine.register_geofence(zone).unwrap();
        engine.check("a1", &sample(0.0, 0.0)).await.unwrap();
        engine.remove_geofence("z1");
        assert!(!engine.is_agent_in_geofence("a1", "z1"));
        assert!(engine.get_geofences().is_empty());
    }
}
