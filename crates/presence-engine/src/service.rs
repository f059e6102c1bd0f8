//! The service facade: composes the four engines, owns lifecycle, and
//! exposes every public operation over a consistent per-agent snapshot.

use crate::config::EngineConfig;
use crate::geofence::GeofenceEngine;
use crate::location::LocationEngine;
use crate::logging;
use crate::status::StatusEngine;
use crate::storage::kv_pubsub::KvPubSubDriver;
use crate::storage::log_stream::LogStreamDriver;
use crate::storage::memory::MemoryDriver;
use crate::storage::queue_broker::QueueBrokerDriver;
use crate::storage::ws_broadcast::WsBroadcastDriver;
use crate::storage::{EventHandler, StorageDriver, SubscriptionId};
use crate::watchdog::Watchdog;
use crate::config::StorageBackend;
use dashmap::DashMap;
use presence_core::{
    AgentStateSnapshot, AgentStats, AgentStatus, Clock, Geofence, LocationSample, PresenceError,
    Result, SystemClock,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Builds the concrete storage driver named by `config.storage_backend`.
fn build_storage(backend: &StorageBackend) -> Arc<dyn StorageDriver> {
    match backend {
        StorageBackend::Memory => Arc::new(MemoryDriver::new()),
        StorageBackend::KvPubSub { url } => Arc::new(KvPubSubDriver::new(url.clone())),
        StorageBackend::LogStream { database_path } => {
            Arc::new(LogStreamDriver::new(database_path.clone()))
        }
        StorageBackend::QueueBroker { url, stream_name } => {
            Arc::new(QueueBrokerDriver::new(url.clone(), stream_name.clone()))
        }
        StorageBackend::WsBroadcast => Arc::new(WsBroadcastDriver::new()),
    }
}

/// The presence and location-tracking engine's public entry point.
pub struct PresenceService {
    storage: Arc<dyn StorageDriver>,
    location: LocationEngine,
    status: StatusEngine,
    geofence: GeofenceEngine,
    watchdog: Arc<Watchdog>,
    clock: Arc<dyn Clock>,
    geofence_enabled: bool,
    watchdog_enabled: bool,
    initialized: AtomicBool,
    agent_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl PresenceService {
    /// Builds a service wired to the backend and thresholds in `config`,
    /// using the real wall clock. Does not perform any I/O; call
    /// [`PresenceService::initialize`] before use.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// As [`PresenceService::new`], but with an injected clock, for tests
    /// that need to advance time deterministically.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        logging::init(&config.logging);
        let storage = build_storage(&config.storage_backend);
        let location = LocationEngine::new(
            storage.clone(),
            clock.clone(),
            config.thresholds.max_jump_distance_m,
        );
        let status = StatusEngine::new(storage.clone(), clock.clone(), config.thresholds);
        let geofence = GeofenceEngine::new(storage.clone(), clock.clone());
        let status_for_watchdog = Arc::new(StatusEngine::new(
            storage.clone(),
            clock.clone(),
            config.thresholds,
        ));
        let watchdog =
            Arc::new(Watchdog::new(storage.clone(), status_for_watchdog, config.watchdog.interval()));

        Self {
            storage,
            location,
            status,
            geofence,
            watchdog,
            clock,
            geofence_enabled: config.geofence.enabled,
            watchdog_enabled: config.watchdog.enabled,
            initialized: AtomicBool::new(false),
            agent_locks: DashMap::new(),
        }
    }

    fn require_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PresenceError::NotInitialized)
        }
    }

    fn lock_for(&self, agent_id: &str) -> Arc<AsyncMutex<()>> {
        self.agent_locks.entry(agent_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    pub async fn initialize(&self) -> Result<()> {
        self.storage.initialize().await?;
        if self.watchdog_enabled {
            self.watchdog.start().await;
        }
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!("presence service initialized");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.watchdog.stop().await;
        self.storage.disconnect().await?;
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("presence service shut down");
        Ok(())
    }

    /// Ingests one sample and runs the full pipeline: location engine,
    /// status engine, (if enabled) geofence engine, then the snapshot
    /// write. The `location.received` event is published before any
    /// `status.changed` or geofence event caused by the same sample.
    pub async fn track(
        &self,
        agent_id: &str,
        lat: f64,
        lon: f64,
        ts_ms: Option<i64>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<LocationSample> {
        self.require_initialized()?;
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let prior_sample = self.storage.get_last_location(agent_id).await?;
        let sample = self.location.track(agent_id, lat, lon, ts_ms, metadata).await?;
        let status = self.status.detect_status(agent_id, prior_sample.as_ref(), &sample).await?;

        if self.geofence_enabled {
            self.geofence.check(agent_id, &sample).await?;
        }

        let now_ms = self.clock.now_ms();
        let mut snapshot = self
            .storage
            .get_agent_state(agent_id)
            .await?
            .unwrap_or_else(|| AgentStateSnapshot::new(agent_id, now_ms));
        snapshot.status = status;
        snapshot.last_location = Some(sample.clone());
        snapshot.last_update_ms = now_ms;
        if sample.speed_kmh.unwrap_or(0.0) > 0.0 {
            snapshot.last_movement_ms = Some(now_ms);
        }
        // The current implementation carries total_distance_traveled_m
        // forward without incrementing it here; see the design note on the
        // open question of whether the snapshot or AgentStats.total_distance_m
        // is the accumulator of record.
        snapshot.active_geofences = self.geofence.current_membership(agent_id);
        self.storage.save_agent_state(agent_id, &snapshot).await?;

        Ok(sample)
    }

    pub async fn get_location(&self, agent_id: &str) -> Result<Option<LocationSample>> {
        self.require_initialized()?;
        self.location.get_current_location(agent_id).await
    }

    pub async fn get_status(&self, agent_id: &str) -> Result<Option<AgentStatus>> {
        self.require_initialized()?;
        self.storage.get_status(agent_id).await
    }

    pub async fn get_agent_state(&self, agent_id: &str) -> Result<Option<AgentStateSnapshot>> {
        self.require_initialized()?;
        self.storage.get_agent_state(agent_id).await
    }

    pub async fn get_all_agents(&self) -> Result<Vec<String>> {
        self.require_initialized()?;
        self.storage.get_all_agents().await
    }

    pub async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        reason: Option<String>,
    ) -> Result<()> {
        self.require_initialized()?;
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        self.status.set_status(agent_id, status, reason).await
    }

    pub fn register_geofence(&self, zone: Geofence) -> Result<()> {
        self.geofence.register_geofence(zone)
    }

    pub fn remove_geofence(&self, zone_id: &str) {
        self.geofence.remove_geofence(zone_id);
    }

    pub fn get_geofences(&self) -> Vec<Geofence> {
        self.geofence.get_geofences()
    }

    pub fn get_agent_geofences(&self, agent_id: &str) -> Vec<Geofence> {
        self.geofence.get_agent_geofences(agent_id)
    }

    pub async fn subscribe_events(&self, handler: EventHandler) -> Result<SubscriptionId> {
        self.require_initialized()?;
        self.storage.subscribe_events(handler).await
    }

    pub async fn unsubscribe_events(&self, id: SubscriptionId) -> Result<()> {
        self.require_initialized()?;
        self.storage.unsubscribe_events(id).await
    }

    pub async fn get_agent_stats(&self, agent_id: &str) -> Result<Option<AgentStats>> {
        self.require_initialized()?;
        self.storage.get_agent_stats(agent_id).await
    }

    pub async fn clear_agent_data(&self, agent_id: &str) -> Result<()> {
        self.require_initialized()?;
        self.storage.clear_agent_data(agent_id).await?;
        self.geofence.clear_agent_geofences(agent_id);
        Ok(())
    }

    pub async fn distance_between_agents(&self, a: &str, b: &str) -> Result<Option<f64>> {
        self.require_initialized()?;
        self.location.distance_between_agents(a, b).await
    }

    pub async fn force_watchdog_check(&self, agent_id: &str) -> Result<()> {
        self.require_initialized()?;
        self.watchdog.force_check(agent_id).await
    }

    pub async fn force_watchdog_check_all(&self) -> Result<()> {
        self.require_initialized()?;
        self.watchdog.force_check_all().await
    }
}
