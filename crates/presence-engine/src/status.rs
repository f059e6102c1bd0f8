//! The presence status state machine: event-driven detection from a fresh
//! sample, time-driven detection from the watchdog sweep, and manual
//! override.

use crate::config::Thresholds;
use crate::storage::StorageDriver;
use presence_core::{
    AgentStateSnapshot, AgentStatus, AgentStatusEventPayload, Clock, Event, EventPayload,
    LocationSample, Result, StatusChangedPayload,
};
use std::sync::Arc;

pub struct StatusEngine {
    storage: Arc<dyn StorageDriver>,
    clock: Arc<dyn Clock>,
    thresholds: Thresholds,
}

impl StatusEngine {
    pub fn new(storage: Arc<dyn StorageDriver>, clock: Arc<dyn Clock>, thresholds: Thresholds) -> Self {
        Self { storage, clock, thresholds }
    }

    /// Event-driven transition, consulting the prior sample and thresholds.
    /// Returns the (possibly unchanged) current status.
    pub async fn detect_status(
        &self,
        agent_id: &str,
        prior_sample: Option<&LocationSample>,
        new_sample: &LocationSample,
    ) -> Result<AgentStatus> {
        let new_status = match prior_sample {
            None => AgentStatus::Active,
            Some(prior) => {
                let silence_ms = new_sample.timestamp_ms - prior.timestamp_ms;
                if silence_ms > self.thresholds.unreachable_after_ms {
                    AgentStatus::Active
                } else if new_sample.speed_kmh.unwrap_or(0.0) >= self.thresholds.min_speed_kmh {
                    AgentStatus::Moving
                } else {
                    AgentStatus::Stopped
                }
            }
        };

        let current = self.storage.get_status(agent_id).await?;
        if current == Some(new_status) {
            return Ok(new_status);
        }

        self.apply_transition(agent_id, current.unwrap_or(AgentStatus::Offline), new_status, None)
            .await?;
        Ok(new_status)
    }

    /// Time-driven transition, consulting the agent's snapshot. Returns
    /// `None` when nothing changed.
    pub async fn check_status_by_time(&self, agent_id: &str) -> Result<Option<AgentStatus>> {
        let snapshot = self.storage.get_agent_state(agent_id).await?;
        let Some(snapshot) = snapshot else {
            let current = self.storage.get_status(agent_id).await?;
            if current != Some(AgentStatus::Offline) {
                self.apply_transition(
                    agent_id,
                    current.unwrap_or(AgentStatus::Offline),
                    AgentStatus::Offline,
                    None,
                )
                .await?;
                return Ok(Some(AgentStatus::Offline));
            }
            return Ok(None);
        };

        let now_ms = self.clock.now_ms();
        let current = snapshot.status;
        let mut next = current;

        if presence_core::time::older_than(snapshot.last_update_ms, now_ms, self.thresholds.offline_after_ms)
            && current != AgentStatus::Offline
        {
            next = AgentStatus::Offline;
        } else if presence_core::time::older_than(
            snapshot.last_update_ms,
            now_ms,
            self.thresholds.unreachable_after_ms,
        ) && !matches!(current, AgentStatus::Unreachable | AgentStatus::Offline)
        {
            next = AgentStatus::Unreachable;
        }

        if next == current {
            if let Some(last_movement_ms) = snapshot.last_movement_ms {
                if presence_core::time::older_than(last_movement_ms, now_ms, self.thresholds.idle_after_ms)
                    && matches!(current, AgentStatus::Active | AgentStatus::Moving)
                {
                    next = AgentStatus::Idle;
                }
            }
        }

        if next == current {
            return Ok(None);
        }

        self.apply_transition(agent_id, current, next, None).await?;
        Ok(Some(next))
    }

    /// Forces a transition regardless of thresholds.
    pub async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let current = self.storage.get_status(agent_id).await?.unwrap_or(AgentStatus::Offline);
        self.apply_transition(agent_id, current, status, reason).await
    }

    async fn apply_transition(
        &self,
        agent_id: &str,
        old_status: AgentStatus,
        new_status: AgentStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let ts_ms = self.clock.now_ms();
        self.storage.save_status(agent_id, new_status, ts_ms).await?;

        tracing::info!(agent_id, %old_status, %new_status, "status transition");

        let changed = Event::new(
            EventPayload::StatusChanged(StatusChangedPayload {
                agent_id: agent_id.to_string(),
                old_status,
                new_status,
                timestamp_ms: ts_ms,
                reason,
            }),
            ts_ms,
        );
        if let Err(err) = self.storage.publish_event(changed).await {
            tracing::error!(agent_id, "failed to publish status.changed: {}", err);
        }

        if let Some(kind) = specialized_event_kind(old_status, new_status) {
            let snapshot = self
                .storage
                .get_agent_state(agent_id)
                .await?
                .unwrap_or_else(|| AgentStateSnapshot::new(agent_id, ts_ms));
            let payload = AgentStatusEventPayload {
                agent_id: agent_id.to_string(),
                snapshot,
                timestamp_ms: ts_ms,
            };
            let event = Event::new(kind(payload), ts_ms);
            if let Err(err) = self.storage.publish_event(event).await {
                tracing::error!(agent_id, "failed to publish specialized status event: {}", err);
            }
        }

        Ok(())
    }
}

type SpecializedEventCtor = fn(AgentStatusEventPayload) -> EventPayload;

/// The table in §4.4: which specialized event (if any) a transition emits.
fn specialized_event_kind(old: AgentStatus, new: AgentStatus) -> Option<SpecializedEventCtor> {
    if new == AgentStatus::Unreachable && old != AgentStatus::Unreachable {
        return Some(EventPayload::AgentUnreachable);
    }
    if matches!(old, AgentStatus::Unreachable | AgentStatus::Offline)
        && matches!(new, AgentStatus::Active | AgentStatus::Moving)
    {
        return Some(EventPayload::AgentBackOnline);
    }
    if new == AgentStatus::Idle && old != AgentStatus::Idle {
        return Some(EventPayload::AgentIdle);
    }
    if new == AgentStatus::Active && matches!(old, AgentStatus::Idle | AgentStatus::Stopped) {
        return Some(EventPayload::AgentActive);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryDriver;
    use presence_core::{Coordinate, MockClock};

    fn sample(ts_ms: i64, speed_kmh: Option<f64>) -> LocationSample {
        LocationSample {
            agent_id: "a1".into(),
            coordinate: Coordinate { lat: 0.0, lon: 0.0 },
            timestamp_ms: ts_ms,
            speed_kmh,
            heading_deg: None,
            metadata: Default::default(),
        }
    }

    fn engine() -> (StatusEngine, Arc<dyn StorageDriver>) {
        let storage: Arc<dyn StorageDriver> = Arc::new(MemoryDriver::new());
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new(0));
        (StatusEngine::new(storage.clone(), clock, Thresholds::default()), storage)
    }

    #[tokio::test]
    async fn first_sample_is_active() {
        let (engine, _storage) = engine();
        let status = engine.detect_status("a1", None, &sample(1000, None)).await.unwrap();
        assert_eq!(status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn slow_sample_is_stopped_fast_sample_is_moving() {
        let (engine, _storage) = engine();
        let prior = sample(0, None);
        let stopped = engine.detect_status("a1", Some(&prior), &sample(1000, Some(0.5))).await.unwrap();
        assert_eq!(stopped, AgentStatus::Stopped);

        let moving = engine.detect_status("a1", Some(&prior), &sample(2000, Some(5.0))).await.unwrap();
        assert_eq!(moving, AgentStatus::Moving);
    }

    #[tokio::test]
    async fn long_silence_reports_back_online_as_active() {
        let (engine, _storage) = engine();
        let prior = sample(0, None);
        let after_silence = sample(40_000, Some(0.0));
        let status = engine.detect_status("a1", Some(&prior), &after_silence).await.unwrap();
        assert_eq!(status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn time_driven_offline_wins_over_idle() {
        let (engine, storage) = engine();
        let snapshot = AgentStateSnapshot {
            agent_id: "a1".into(),
            status: AgentStatus::Active,
            last_location: None,
            last_update_ms: 0,
            last_movement_ms: Some(0),
            total_distance_traveled_m: 0.0,
            active_geofences: Default::default(),
        };
        storage.save_agent_state("a1", &snapshot).await.unwrap();
        storage.save_status("a1", AgentStatus::Active, 0).await.unwrap();

        let clock = MockClock::new(700_000);
        let engine = StatusEngine::new(storage, Arc::new(clock), Thresholds::default());
        let next = engine.check_status_by_time("a1").await.unwrap();
        assert_eq!(next, Some(AgentStatus::Offline));
    }
}
