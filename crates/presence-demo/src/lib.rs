//! In-process harness for demonstrating the presence engine's tracking
//! scenarios without a running server or network backend.

use presence_core::Event;
use presence_engine::config::{EngineConfig, WatchdogConfig};
use presence_engine::service::PresenceService;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Builds a service over the in-memory backend with a fast watchdog, the
/// shape every demo scenario in `bin/demo_scenario.rs` starts from.
pub fn demo_config(check_interval_ms: u64) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.watchdog = WatchdogConfig { enabled: true, check_interval_ms };
    config
}

/// Subscribes a channel-backed handler to `service` and returns the
/// receiving end, so a demo can `tokio::select!` on incoming events while
/// driving the scenario forward.
pub async fn tap_events(service: &Arc<PresenceService>) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    let delivered = Arc::new(AtomicUsize::new(0));
    service
        .subscribe_events(Arc::new(move |event| {
            let tx = tx.clone();
            let delivered = delivered.clone();
            Box::pin(async move {
                delivered.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(event);
            })
        }))
        .await
        .expect("service must be initialized before tapping events");
    rx
}

/// Drains every event currently buffered on `rx` without blocking.
pub fn drain_available(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
