//! Runs the tracking scenarios end to end against an in-process service
//! over the in-memory backend, printing every emitted event.
//!
//! Usage:
//!   cargo run -p presence-demo --bin demo_scenario

use presence_core::{AgentStatus, Coordinate, Geofence};
use presence_demo::{demo_config, drain_available, tap_events};
use presence_engine::service::PresenceService;
use std::sync::Arc;
use std::time::Duration;

const NYC_LAT: f64 = 40.7128;
const NYC_LON: f64 = -74.0060;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = demo_config(500);
    let service = Arc::new(PresenceService::new(config));
    service.initialize().await?;
    let mut events = tap_events(&service).await;

    println!("=== S1: first sample ===");
    let sample = service.track("a", NYC_LAT, NYC_LON, None, Default::default()).await?;
    println!("sample: {:?}", sample.coordinate);
    tokio::time::sleep(Duration::from_millis(20)).await;
    println!("status: {:?}", service.get_status("a").await?);
    print_events(&mut events);

    println!("=== S2: moving classification ===");
    let now = chrono::Utc::now().timestamp_millis();
    service.track("a", 40.7228, NYC_LON, Some(now + 60_000), Default::default()).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    println!("status: {:?}", service.get_status("a").await?);
    print_events(&mut events);

    println!("=== S3: geofence enter/exit ===");
    service.register_geofence(Geofence::Circular {
        id: "z1".to_string(),
        name: "Depot".to_string(),
        center: Coordinate { lat: NYC_LAT, lon: NYC_LON },
        radius_m: 500.0,
        metadata: None,
    })?;
    service.track("a", NYC_LAT, NYC_LON, None, Default::default()).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    print_events(&mut events);
    service.track("a", 40.7300, -74.0200, None, Default::default()).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    print_events(&mut events);

    println!("=== S4/S5: unreachable then back online via watchdog ===");
    let watchdog_config = {
        let mut c = demo_config(300);
        c.thresholds.unreachable_after_ms = 1_000;
        c.thresholds.offline_after_ms = 600_000;
        c
    };
    let watchdog_service = Arc::new(PresenceService::new(watchdog_config));
    watchdog_service.initialize().await?;
    let mut watchdog_events = tap_events(&watchdog_service).await;

    watchdog_service.track("b", NYC_LAT, NYC_LON, None, Default::default()).await?;
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    println!("status after silence: {:?}", watchdog_service.get_status("b").await?);
    print_events(&mut watchdog_events);

    watchdog_service.track("b", 40.7130, -74.0062, None, Default::default()).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("status after reconnect: {:?}", watchdog_service.get_status("b").await?);
    print_events(&mut watchdog_events);
    watchdog_service.shutdown().await?;

    println!("=== S6: invalid input ===");
    let rejected = service.track("a", 91.0, 0.0, None, Default::default()).await;
    println!("rejected as expected: {}", rejected.is_err());
    let unchanged = service.get_agent_state("a").await?;
    println!("agent state present: {}", unchanged.is_some());

    println!("=== manual override ===");
    service.set_status("a", AgentStatus::Idle, Some("manual override for demo".to_string())).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    print_events(&mut events);

    service.shutdown().await?;
    Ok(())
}

fn print_events(rx: &mut tokio::sync::mpsc::UnboundedReceiver<presence_core::Event>) {
    for event in drain_available(rx) {
        tracing::info!(kind = %event.kind_tag, "event emitted");
        let json = serde_json::to_string(&event).unwrap_or_else(|_| event.kind_tag.clone());
        println!("  event: {json}");
    }
}
