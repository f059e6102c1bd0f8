//! End-to-end scenarios (S1-S6) against the in-memory backend, plus the
//! watchdog sweep and geofence membership properties.

use presence_core::{AgentStatus, Clock, Coordinate, Event, EventPayload, Geofence, MockClock};
use presence_engine::config::{EngineConfig, WatchdogConfig};
use presence_engine::service::PresenceService;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const NYC_LAT: f64 = 40.7128;
const NYC_LON: f64 = -74.0060;

async fn tap(service: &Arc<PresenceService>) -> Arc<Mutex<Vec<Event>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    service
        .subscribe_events(Arc::new(move |event| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().await.push(event);
            })
        }))
        .await
        .unwrap();
    collected
}

fn has_tag(events: &[Event], tag: &str) -> bool {
    events.iter().any(|e| e.kind_tag == tag)
}

#[tokio::test]
async fn s1_first_sample_is_active_with_back_online() {
    let service = Arc::new(PresenceService::new(EngineConfig::default()));
    service.initialize().await.unwrap();
    let events = tap(&service).await;

    let sample = service.track("a", NYC_LAT, NYC_LON, None, HashMap::new()).await.unwrap();
    assert_eq!(sample.coordinate, Coordinate { lat: NYC_LAT, lon: NYC_LON });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(service.get_status("a").await.unwrap(), Some(AgentStatus::Active));

    let events = events.lock().await;
    assert!(has_tag(&events, "location.received"));
    assert!(has_tag(&events, "status.changed"));
    assert!(has_tag(&events, "agent.back-online"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn s2_second_sample_with_sufficient_speed_is_moving() {
    let service = Arc::new(PresenceService::new(EngineConfig::default()));
    service.initialize().await.unwrap();
    let events = tap(&service).await;

    service.track("a", NYC_LAT, NYC_LON, None, HashMap::new()).await.unwrap();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    service.track("a", 40.7228, NYC_LON, Some(now + 60_000), HashMap::new()).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(service.get_status("a").await.unwrap(), Some(AgentStatus::Moving));
    assert!(has_tag(&events.lock().await, "status.changed"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn s3_geofence_enter_and_exit() {
    let service = Arc::new(PresenceService::new(EngineConfig::default()));
    service.initialize().await.unwrap();
    let events = tap(&service).await;

    service
        .register_geofence(Geofence::Circular {
            id: "z1".into(),
            name: "Depot".into(),
            center: Coordinate { lat: NYC_LAT, lon: NYC_LON },
            radius_m: 500.0,
            metadata: None,
        })
        .unwrap();

    service.track("a", NYC_LAT, NYC_LON, None, HashMap::new()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(has_tag(&events.lock().await, "agent.entered-geofence"));
    events.lock().await.clear();

    service.track("a", 40.7300, -74.0200, None, HashMap::new()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(has_tag(&events.lock().await, "agent.exited-geofence"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn s4_s5_unreachable_then_back_online_via_watchdog() {
    let mut config = EngineConfig::default();
    config.watchdog = WatchdogConfig { enabled: true, check_interval_ms: 100 };
    config.thresholds.unreachable_after_ms = 300;
    config.thresholds.offline_after_ms = 600_000;

    let service = Arc::new(PresenceService::new(config));
    service.initialize().await.unwrap();
    let events = tap(&service).await;

    service.track("a", NYC_LAT, NYC_LON, None, HashMap::new()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(700)).await;

    let status = service.get_status("a").await.unwrap();
    assert!(matches!(status, Some(AgentStatus::Unreachable) | Some(AgentStatus::Offline)));
    assert!(has_tag(&events.lock().await, "agent.unreachable"));
    events.lock().await.clear();

    service.track("a", 40.7130, -74.0062, None, HashMap::new()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let status = service.get_status("a").await.unwrap();
    assert!(matches!(status, Some(AgentStatus::Active) | Some(AgentStatus::Moving)));
    assert!(has_tag(&events.lock().await, "agent.back-online"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn s6_invalid_input_leaves_state_unchanged() {
    let service = Arc::new(PresenceService::new(EngineConfig::default()));
    service.initialize().await.unwrap();

    let err = service.track("a", 91.0, 0.0, None, HashMap::new()).await;
    assert!(err.is_err());
    assert!(service.get_agent_state("a").await.unwrap().is_none());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn operations_before_initialize_fail_with_not_initialized() {
    let service = PresenceService::new(EngineConfig::default());
    let err = service.track("a", 0.0, 0.0, None, HashMap::new()).await;
    assert!(matches!(err, Err(presence_core::PresenceError::NotInitialized)));
}

#[tokio::test]
async fn force_watchdog_check_drives_offline_transition_deterministically() {
    let mut config = EngineConfig::default();
    config.watchdog = WatchdogConfig { enabled: false, check_interval_ms: 100_000 };
    config.thresholds.offline_after_ms = 1_000;

    let clock = Arc::new(MockClock::new(0));
    let service = Arc::new(PresenceService::with_clock(config, clock.clone() as Arc<dyn Clock>));
    service.initialize().await.unwrap();

    service.track("a", NYC_LAT, NYC_LON, Some(0), HashMap::new()).await.unwrap();
    clock.advance(2_000);
    service.force_watchdog_check("a").await.unwrap();

    assert_eq!(service.get_status("a").await.unwrap(), Some(AgentStatus::Offline));
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_tracks_for_different_agents_do_not_block_each_other() {
    let service = Arc::new(PresenceService::new(EngineConfig::default()));
    service.initialize().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let agent_id = format!("agent-{i}");
            service
                .track(&agent_id, NYC_LAT, NYC_LON, None, HashMap::new())
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let agents = service.get_all_agents().await.unwrap();
    assert_eq!(agents.len(), 8);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn manual_status_override_emits_status_changed_with_reason() {
    let service = Arc::new(PresenceService::new(EngineConfig::default()));
    service.initialize().await.unwrap();
    let events = tap(&service).await;

    service.track("a", NYC_LAT, NYC_LON, None, HashMap::new()).await.unwrap();
    service
        .set_status("a", AgentStatus::Idle, Some("operator override".to_string()))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let events = events.lock().await;
    let reason = events.iter().find_map(|e| match &e.payload {
        EventPayload::StatusChanged(payload) if payload.new_status == AgentStatus::Idle => {
            payload.reason.clone()
        }
        _ => None,
    });
    assert_eq!(reason, Some("operator override".to_string()));
}

#[tokio::test]
async fn distance_between_agents_is_none_until_both_report() {
    let service = Arc::new(PresenceService::new(EngineConfig::default()));
    service.initialize().await.unwrap();

    assert_eq!(service.distance_between_agents("a", "b").await.unwrap(), None);
    service.track("a", NYC_LAT, NYC_LON, None, HashMap::new()).await.unwrap();
    assert_eq!(service.distance_between_agents("a", "b").await.unwrap(), None);
    service.track("b", 40.7228, NYC_LON, None, HashMap::new()).await.unwrap();
    let distance = service.distance_between_agents("a", "b").await.unwrap();
    assert!(distance.unwrap() > 0.0);
}

#[tokio::test]
async fn clear_agent_data_removes_state_and_geofence_membership() {
    let service = Arc::new(PresenceService::new(EngineConfig::default()));
    service.initialize().await.unwrap();
    service
        .register_geofence(Geofence::Circular {
            id: "z1".into(),
            name: "Depot".into(),
            center: Coordinate { lat: NYC_LAT, lon: NYC_LON },
            radius_m: 500.0,
            metadata: None,
        })
        .unwrap();
    service.track("a", NYC_LAT, NYC_LON, None, HashMap::new()).await.unwrap();
    assert!(!service.get_agent_geofences("a").is_empty());

    service.clear_agent_data("a").await.unwrap();
    assert!(service.get_agent_state("a").await.unwrap().is_none());
    assert!(service.get_agent_geofences("a").is_empty());
}
