//! The location-processing pipeline: validate → derive metrics → persist →
//! publish.

use crate::storage::StorageDriver;
use presence_core::{
    geo, Clock, Event, EventPayload, LocationReceivedPayload, LocationSample, PresenceError,
    Result,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum allowed skew of a client-supplied timestamp into the future
/// before it is treated as missing and replaced with the current time.
const MAX_FUTURE_SKEW_MS: i64 = 60_000;

pub struct LocationEngine {
    storage: Arc<dyn StorageDriver>,
    clock: Arc<dyn Clock>,
    max_jump_distance_m: f64,
}

impl LocationEngine {
    pub fn new(storage: Arc<dyn StorageDriver>, clock: Arc<dyn Clock>, max_jump_distance_m: f64) -> Self {
        Self { storage, clock, max_jump_distance_m }
    }

    /// Ingests one observation for `agent_id`. Rejects invalid input before
    /// any I/O; never rejects for an "abnormal jump" (advisory only).
    pub async fn track(
        &self,
        agent_id: &str,
        lat: f64,
        lon: f64,
        ts_ms: Option<i64>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<LocationSample> {
        if agent_id.trim().is_empty() {
            return Err(PresenceError::invalid_input("agent id must not be empty"));
        }
        if !geo::valid_coordinate(lat, lon) {
            return Err(PresenceError::invalid_input(format!(
                "invalid coordinate: lat={lat}, lon={lon}"
            )));
        }

        let now_ms = self.clock.now_ms();
        let ts_ms = match ts_ms {
            Some(ts) if presence_core::time::is_sane_timestamp(ts, now_ms, MAX_FUTURE_SKEW_MS) => ts,
            _ => now_ms,
        };

        let previous = self.storage.get_last_location(agent_id).await?;

        let (distance_m, speed_kmh, heading_deg) = match &previous {
            Some(prior) => {
                let distance_m = geo::distance(prior.coordinate, presence_core::Coordinate { lat, lon });
                let dt_ms = ts_ms - prior.timestamp_ms;
                if geo::abnormal_jump(distance_m, dt_ms, self.max_jump_distance_m) {
                    tracing::warn!(
                        agent_id,
                        distance_m,
                        dt_ms,
                        "abnormal jump detected; accepting sample anyway"
                    );
                }
                let speed_kmh = if dt_ms > 0 { Some(geo::speed(distance_m, dt_ms)) } else { None };
                let heading_deg =
                    if distance_m > 1.0 { Some(geo::bearing(prior.coordinate, presence_core::Coordinate { lat, lon })) } else { None };
                (distance_m, speed_kmh, heading_deg)
            }
            None => (0.0, None, None),
        };

        let sample = LocationSample {
            agent_id: agent_id.to_string(),
            coordinate: presence_core::Coordinate { lat, lon },
            timestamp_ms: ts_ms,
            speed_kmh,
            heading_deg,
            metadata,
        };

        self.storage.save_location(agent_id, &sample).await?;

        let event = Event::new(
            EventPayload::LocationReceived(LocationReceivedPayload {
                agent_id: agent_id.to_string(),
                sample: sample.clone(),
                distance_traveled_m: distance_m,
                speed_kmh,
            }),
            now_ms,
        );
        if let Err(err) = self.storage.publish_event(event).await {
            tracing::error!(agent_id, "failed to publish location.received: {}", err);
        }

        Ok(sample)
    }

    pub async fn get_current_location(&self, agent_id: &str) -> Result<Option<LocationSample>> {
        self.storage.get_last_location(agent_id).await
    }

    /// Distance between the two agents' last known samples, or `None` if
    /// either has never reported.
    pub async fn distance_between_agents(&self, a: &str, b: &str) -> Result<Option<f64>> {
        let (sample_a, sample_b) = (
            self.storage.get_last_location(a).await?,
            self.storage.get_last_location(b).await?,
        );
        Ok(match (sample_a, sample_b) {
            (Some(a), Some(b)) => Some(geo::distance(a.coordinate, b.coordinate)),
            _ => None,
        })
    }
}
