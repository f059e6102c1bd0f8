//! Core data models for the presence and location-tracking engine.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A geographic coordinate. Validity (range and finiteness) is checked at
/// the boundary where a coordinate is constructed from untrusted input
/// ([`crate::geo::valid_coordinate`]); once inside a [`LocationSample`] it
/// is assumed valid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

/// A single accepted location observation for an agent. Immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub agent_id: String,
    pub coordinate: Coordinate,
    /// Milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// km/h, present once a prior sample exists and `dt > 0`.
    pub speed_kmh: Option<f64>,
    /// Degrees in `[0, 360)`, present only when the agent moved more than
    /// 1 meter since the prior sample (to suppress GPS noise at rest).
    pub heading_deg: Option<f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Closed set of presence/motion classifications for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Idle,
    Moving,
    Stopped,
    Unreachable,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Moving => "moving",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Unreachable => "unreachable",
            AgentStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// The materialized view of one agent's state, as maintained by the service
/// facade after every ingest or status transition (I1: at most one current
/// status and one last location per agent at any time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateSnapshot {
    pub agent_id: String,
    pub status: AgentStatus,
    pub last_location: Option<LocationSample>,
    /// Milliseconds since the epoch of the most recent observation or
    /// status change.
    pub last_update_ms: i64,
    /// Milliseconds since the epoch of the most recent sample with
    /// `speed_kmh > 0`.
    pub last_movement_ms: Option<i64>,
    /// Meters, monotonically non-decreasing.
    pub total_distance_traveled_m: f64,
    /// Zone identifiers currently containing the last location sample
    /// (I3: always equal to the geofence engine's membership set for this
    /// agent).
    pub active_geofences: HashSet<String>,
}

impl AgentStateSnapshot {
    pub fn new(agent_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Offline,
            last_location: None,
            last_update_ms: now_ms,
            last_movement_ms: None,
            total_distance_traveled_m: 0.0,
            active_geofences: HashSet::new(),
        }
    }
}

/// Per-agent counters maintained by the storage backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_locations: u64,
    pub total_distance_m: f64,
    pub last_update_ms: i64,
}

/// A named geographic region. Closed sum type with two constructors,
/// exhaustively matched wherever geometry is evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Geofence {
    Circular {
        id: String,
        name: String,
        center: Coordinate,
        radius_m: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    Polygon {
        id: String,
        name: String,
        vertices: Vec<Coordinate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
}

impl Geofence {
    pub fn id(&self) -> &str {
        match self {
            Geofence::Circular { id, .. } => id,
            Geofence::Polygon { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Geofence::Circular { name, .. } => name,
            Geofence::Polygon { name, .. } => name,
        }
    }
}

/// Direction of a geofence membership delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeofenceDirection {
    Enter,
    Exit,
}

/// Wire-stable event taxonomy tags (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    LocationReceived,
    StatusChanged,
    AgentUnreachable,
    AgentBackOnline,
    AgentIdle,
    AgentActive,
    AgentEnteredGeofence,
    AgentExitedGeofence,
}

impl EventKind {
    /// The taxonomy tag exactly as it must appear on the wire.
    pub fn as_tag(&self) -> &'static str {
        match self {
            EventKind::LocationReceived => "location.received",
            EventKind::StatusChanged => "status.changed",
            EventKind::AgentUnreachable => "agent.unreachable",
            EventKind::AgentBackOnline => "agent.back-online",
            EventKind::AgentIdle => "agent.idle",
            EventKind::AgentActive => "agent.active",
            EventKind::AgentEnteredGeofence => "agent.entered-geofence",
            EventKind::AgentExitedGeofence => "agent.exited-geofence",
        }
    }
}

/// Payload carried by a [`LocationReceived`](EventKind::LocationReceived) event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationReceivedPayload {
    pub agent_id: String,
    pub sample: LocationSample,
    pub distance_traveled_m: f64,
    pub speed_kmh: Option<f64>,
}

/// Payload carried by a [`StatusChanged`](EventKind::StatusChanged) event
/// (I2: `old_status != new_status` always holds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangedPayload {
    pub agent_id: String,
    pub old_status: AgentStatus,
    pub new_status: AgentStatus,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload carried by a specialized status event (`agent.unreachable`,
/// `agent.back-online`, `agent.idle`, `agent.active`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusEventPayload {
    pub agent_id: String,
    pub snapshot: AgentStateSnapshot,
    pub timestamp_ms: i64,
}

/// Payload carried by a geofence enter/exit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeofenceEventPayload {
    pub agent_id: String,
    pub zone_id: String,
    pub zone_name: String,
    pub sample: LocationSample,
    pub timestamp_ms: i64,
    pub direction: GeofenceDirection,
}

/// Discriminated payload union for a published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventPayload {
    LocationReceived(LocationReceivedPayload),
    StatusChanged(StatusChangedPayload),
    AgentUnreachable(AgentStatusEventPayload),
    AgentBackOnline(AgentStatusEventPayload),
    AgentIdle(AgentStatusEventPayload),
    AgentActive(AgentStatusEventPayload),
    AgentEnteredGeofence(GeofenceEventPayload),
    AgentExitedGeofence(GeofenceEventPayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::LocationReceived(_) => EventKind::LocationReceived,
            EventPayload::StatusChanged(_) => EventKind::StatusChanged,
            EventPayload::AgentUnreachable(_) => EventKind::AgentUnreachable,
            EventPayload::AgentBackOnline(_) => EventKind::AgentBackOnline,
            EventPayload::AgentIdle(_) => EventKind::AgentIdle,
            EventPayload::AgentActive(_) => EventKind::AgentActive,
            EventPayload::AgentEnteredGeofence(_) => EventKind::AgentEnteredGeofence,
            EventPayload::AgentExitedGeofence(_) => EventKind::AgentExitedGeofence,
        }
    }
}

/// The envelope every event is wrapped in before it crosses the storage
/// contract's publish/subscribe boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind_tag: String,
    pub payload: EventPayload,
    pub emitted_at_ms: i64,
}

impl Event {
    pub fn new(payload: EventPayload, emitted_at_ms: i64) -> Self {
        Self { kind_tag: payload.kind().as_tag().to_string(), payload, emitted_at_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_tags_are_wire_stable() {
        assert_eq!(EventKind::LocationReceived.as_tag(), "location.received");
        assert_eq!(EventKind::AgentBackOnline.as_tag(), "agent.back-online");
        assert_eq!(EventKind::AgentEnteredGeofence.as_tag(), "agent.entered-geofence");
    }

    #[test]
    fn fresh_snapshot_defaults_to_offline() {
        let snap = AgentStateSnapshot::new("a1", 1000);
        assert_eq!(snap.status, AgentStatus::Offline);
        assert!(snap.last_location.is_none());
        assert!(snap.active_geofences.is_empty());
    }

    #[test]
    fn geofence_id_and_name_accessors() {
        let zone = Geofence::Circular {
            id: "z1".into(),
            name: "Depot".into(),
            center: Coordinate { lat: 0.0, lon: 0.0 },
            radius_m: 10.0,
            metadata: None,
        };
        assert_eq!(zone.id(), "z1");
        assert_eq!(zone.name(), "Depot");
    }
}
