//! Engine configuration, assembled from environment variables or built
//! programmatically for tests.

use std::env;
use std::time::Duration;

/// Which storage driver backs the service. Each variant corresponds to one
/// of the five backend families the storage contract supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process-local `DashMap` + broadcast channel. No persistence across
    /// restarts; the default for tests and local development.
    Memory,
    /// Redis-backed key/value store with pub/sub fan-out.
    KvPubSub { url: String },
    /// SQLite-backed append-only event log, replayable from a position.
    LogStream { database_path: String },
    /// NATS JetStream-backed queue with explicit per-event ack.
    QueueBroker { url: String, stream_name: String },
    /// Broadcast channel fanned out over a WebSocket upgrade endpoint.
    WsBroadcast,
}

impl StorageBackend {
    fn from_env() -> Self {
        match env::var("PRESENCE_STORAGE_BACKEND").unwrap_or_default().as_str() {
            "kv_pubsub" => StorageBackend::KvPubSub {
                url: env::var("PRESENCE_REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            "log_stream" => StorageBackend::LogStream {
                database_path: env::var("PRESENCE_DATABASE_PATH")
                    .unwrap_or_else(|_| "data/presence.db".to_string()),
            },
            "queue_broker" => StorageBackend::QueueBroker {
                url: env::var("PRESENCE_NATS_URL")
                    .unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string()),
                stream_name: env::var("PRESENCE_NATS_STREAM")
                    .unwrap_or_else(|_| "presence-events".to_string()),
            },
            "ws_broadcast" => StorageBackend::WsBroadcast,
            _ => StorageBackend::Memory,
        }
    }
}

/// Thresholds the status engine uses to classify and transition agents
/// between [`presence_core::AgentStatus`] values.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub idle_after_ms: i64,
    pub unreachable_after_ms: i64,
    pub offline_after_ms: i64,
    pub min_speed_kmh: f64,
    pub max_jump_distance_m: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            idle_after_ms: 300_000,
            unreachable_after_ms: 30_000,
            offline_after_ms: 600_000,
            min_speed_kmh: 1.5,
            max_jump_distance_m: 300.0,
        }
    }
}

impl Thresholds {
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            idle_after_ms: env_i64("PRESENCE_IDLE_AFTER_MS", default.idle_after_ms),
            unreachable_after_ms: env_i64(
                "PRESENCE_UNREACHABLE_AFTER_MS",
                default.unreachable_after_ms,
            ),
            offline_after_ms: env_i64("PRESENCE_OFFLINE_AFTER_MS", default.offline_after_ms),
            min_speed_kmh: env_f64("PRESENCE_MIN_SPEED_KMH", default.min_speed_kmh),
            max_jump_distance_m: env_f64(
                "PRESENCE_MAX_JUMP_DISTANCE_M",
                default.max_jump_distance_m,
            ),
        }
    }
}

/// Configuration for the periodic time-driven watchdog sweep.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { enabled: true, check_interval_ms: 5_000 }
    }
}

impl WatchdogConfig {
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            enabled: env_bool("PRESENCE_WATCHDOG_ENABLED", default.enabled),
            check_interval_ms: env_u64(
                "PRESENCE_WATCHDOG_INTERVAL_MS",
                default.check_interval_ms,
            ),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Toggle for the geofence membership engine.
#[derive(Debug, Clone, Copy)]
pub struct GeofenceConfig {
    pub enabled: bool,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl GeofenceConfig {
    fn from_env() -> Self {
        Self { enabled: env_bool("PRESENCE_GEOFENCE_ENABLED", true) }
    }
}

/// Structured-logging configuration, read by [`crate::logging::init`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub console: bool,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false, console: true, file_path: None }
    }
}

impl LoggingConfig {
    fn from_env() -> Self {
        Self {
            level: env::var("PRESENCE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            json: env_bool("PRESENCE_LOG_JSON", false),
            console: env_bool("PRESENCE_LOG_CONSOLE", true),
            file_path: env::var("PRESENCE_LOG_FILE").ok(),
        }
    }
}

/// Top-level engine configuration. Construct with [`EngineConfig::from_env`]
/// for the binary, or [`EngineConfig::default`] plus field overrides for
/// tests and the demo program.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server_port: u16,
    pub storage_backend: StorageBackend,
    pub thresholds: Thresholds,
    pub watchdog: WatchdogConfig,
    pub geofence: GeofenceConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_port: 3000,
            storage_backend: StorageBackend::Memory,
            thresholds: Thresholds::default(),
            watchdog: WatchdogConfig::default(),
            geofence: GeofenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            server_port: env_u16("PRESENCE_PORT", 3000),
            storage_backend: StorageBackend::from_env(),
            thresholds: Thresholds::from_env(),
            watchdog: WatchdogConfig::from_env(),
            geofence: GeofenceConfig::from_env(),
            logging: LoggingConfig::from_env(),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}
