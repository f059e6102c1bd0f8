//! SQLite-backed backend: state tables plus an append-only `event_log` with
//! an autoincrement position, so a subscriber can replay from where it left
//! off instead of relying on a live pub/sub connection.

use crate::storage::{EventHandler, StorageDriver, SubscriptionId};
use async_trait::async_trait;
use presence_core::{
    AgentStateSnapshot, AgentStats, AgentStatus, Event, LocationSample, PresenceError, Result,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Subscription {
    handler: EventHandler,
    last_position: AtomicI64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// SQLite-backed storage driver supporting replay-from-position delivery.
pub struct LogStreamDriver {
    database_path: String,
    pool: Mutex<Option<SqlitePool>>,
    subscriptions: Arc<std::sync::Mutex<HashMap<SubscriptionId, Arc<Subscription>>>>,
    next_subscription_id: AtomicU64,
    poll_interval: std::time::Duration,
}

impl LogStreamDriver {
    pub fn new(database_path: impl Into<String>) -> Self {
        Self {
            database_path: database_path.into(),
            pool: Mutex::new(None),
            subscriptions: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_subscription_id: AtomicU64::new(1),
            poll_interval: std::time::Duration::from_millis(200),
        }
    }

    async fn pool(&self) -> Result<SqlitePool> {
        self.pool.lock().await.clone().ok_or(PresenceError::NotInitialized)
    }

    /// Replays every event at `position` strictly greater than `after`, in
    /// order, invoking `handler` for each.
    async fn replay_from(pool: &SqlitePool, after: i64, handler: &EventHandler) -> i64 {
        let rows = match sqlx::query(
            "SELECT position, event_json FROM event_log WHERE position > ? ORDER BY position ASC",
        )
        .bind(after)
        .fetch_all(pool)
        .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!("event_log poll failed: {}", err);
                return after;
            }
        };

        let mut last = after;
        for row in rows {
            let position: i64 = row.get("position");
            let event_json: String = row.get("event_json");
            last = position;
            match serde_json::from_str::<Event>(&event_json) {
                Ok(event) => handler(event).await,
                Err(err) => tracing::error!("event decode failed: {}", err),
            }
        }
        last
    }
}

#[async_trait]
impl StorageDriver for LogStreamDriver {
    async fn initialize(&self) -> Result<()> {
        if let Some(parent) = Path::new(&self.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let url = format!("sqlite:{}?mode=rwc", self.database_path);
        tracing::info!(path = %self.database_path, "connecting to sqlite log-stream backend");
        let pool = crate::storage::reconnect::connect_with_retry(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_secs(2),
            3,
            || {
                let url = url.clone();
                async move {
                    SqlitePoolOptions::new()
                        .max_connections(8)
                        .connect(&url)
                        .await
                        .map_err(PresenceError::backend)
                }
            },
        )
        .await?;

        let migration_sql = include_str!("../../migrations/001_init.sql");
        for statement in migration_sql.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&pool).await.map_err(PresenceError::backend)?;
        }

        *self.pool.lock().await = Some(pool);
        tracing::info!("sqlite log-stream backend connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let subs: Vec<Arc<Subscription>> = {
            let mut subs = self.subscriptions.lock().expect("subscriptions lock poisoned");
            let collected = subs.values().cloned().collect();
            subs.clear();
            collected
        };
        for sub in &subs {
            if let Some(task) = sub.task.lock().await.take() {
                task.abort();
            }
        }
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
        tracing::info!("sqlite log-stream backend disconnected");
        Ok(())
    }

    async fn save_location(&self, agent_id: &str, sample: &LocationSample) -> Result<()> {
        let pool = self.pool().await?;
        let prior = self.get_last_location(agent_id).await?;
        let delta_m = prior
            .map(|prior| presence_core::geo::distance(prior.coordinate, sample.coordinate))
            .unwrap_or(0.0);

        let payload = serde_json::to_string(sample).map_err(PresenceError::backend)?;
        sqlx::query(
            "INSERT INTO agent_location (agent_id, sample_json, updated_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET sample_json = excluded.sample_json, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(agent_id)
        .bind(&payload)
        .bind(sample.timestamp_ms)
        .execute(&pool)
        .await
        .map_err(PresenceError::backend)?;

        sqlx::query(
            "INSERT INTO agent_stats (agent_id, total_locations, total_distance_m, last_update_ms) VALUES (?, 1, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET total_locations = total_locations + 1, total_distance_m = total_distance_m + excluded.total_distance_m, last_update_ms = excluded.last_update_ms",
        )
        .bind(agent_id)
        .bind(delta_m)
        .bind(sample.timestamp_ms)
        .execute(&pool)
        .await
        .map_err(PresenceError::backend)?;
        Ok(())
    }

    async fn get_last_location(&self, agent_id: &str) -> Result<Option<LocationSample>> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT sample_json FROM agent_location WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&pool)
            .await
            .map_err(PresenceError::backend)?;
        row.map(|r| {
            let json: String = r.get("sample_json");
            serde_json::from_str(&json).map_err(PresenceError::backend)
        })
        .transpose()
    }

    async fn save_status(&self, agent_id: &str, status: AgentStatus, ts_ms: i64) -> Result<()> {
        let pool = self.pool().await?;
        let payload = serde_json::to_string(&status).map_err(PresenceError::backend)?;
        sqlx::query(
            "INSERT INTO agent_status (agent_id, status, updated_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET status = excluded.status, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(agent_id)
        .bind(&payload)
        .bind(ts_ms)
        .execute(&pool)
        .await
        .map_err(PresenceError::backend)?;
        Ok(())
    }

    async fn get_status(&self, agent_id: &str) -> Result<Option<AgentStatus>> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT status FROM agent_status WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&pool)
            .await
            .map_err(PresenceError::backend)?;
        row.map(|r| {
            let json: String = r.get("status");
            serde_json::from_str(&json).map_err(PresenceError::backend)
        })
        .transpose()
    }

    async fn save_agent_state(&self, agent_id: &str, snapshot: &AgentStateSnapshot) -> Result<()> {
        let pool = self.pool().await?;
        let payload = serde_json::to_string(snapshot).map_err(PresenceError::backend)?;
        sqlx::query(
            "INSERT INTO agent_state (agent_id, snapshot_json) VALUES (?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET snapshot_json = excluded.snapshot_json",
        )
        .bind(agent_id)
        .bind(&payload)
        .execute(&pool)
        .await
        .map_err(PresenceError::backend)?;
        Ok(())
    }

    async fn get_agent_state(&self, agent_id: &str) -> Result<Option<AgentStateSnapshot>> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT snapshot_json FROM agent_state WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&pool)
            .await
            .map_err(PresenceError::backend)?;
        row.map(|r| {
            let json: String = r.get("snapshot_json");
            serde_json::from_str(&json).map_err(PresenceError::backend)
        })
        .transpose()
    }

    async fn get_all_agents(&self) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT agent_id FROM agent_location
             UNION SELECT agent_id FROM agent_status
             UNION SELECT agent_id FROM agent_state
             UNION SELECT agent_id FROM agent_stats",
        )
        .fetch_all(&pool)
        .await
        .map_err(PresenceError::backend)?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("agent_id")).collect())
    }

    async fn publish_event(&self, event: Event) -> Result<()> {
        let pool = self.pool().await?;
        let payload = serde_json::to_string(&event).map_err(PresenceError::backend)?;
        sqlx::query("INSERT INTO event_log (event_json, emitted_at_ms) VALUES (?, ?)")
            .bind(&payload)
            .bind(event.emitted_at_ms)
            .execute(&pool)
            .await
            .map_err(PresenceError::backend)?;
        Ok(())
    }

    async fn subscribe_events(&self, handler: EventHandler) -> Result<SubscriptionId> {
        let pool = self.pool().await?;
        let max_position: Option<i64> = sqlx::query("SELECT MAX(position) AS m FROM event_log")
            .fetch_one(&pool)
            .await
            .map_err(PresenceError::backend)?
            .get("m");

        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let subscription = Arc::new(Subscription {
            handler,
            last_position: AtomicI64::new(max_position.unwrap_or(0)),
            task: Mutex::new(None),
        });

        let sub_for_task = subscription.clone();
        let interval = self.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let after = sub_for_task.last_position.load(Ordering::SeqCst);
                let last = Self::replay_from(&pool, after, &sub_for_task.handler).await;
                sub_for_task.last_position.store(last, Ordering::SeqCst);
            }
        });
        *subscription.task.lock().await = Some(task);

        self.subscriptions.lock().expect("subscriptions lock poisoned").insert(id, subscription);
        Ok(id)
    }

    async fn unsubscribe_events(&self, id: SubscriptionId) -> Result<()> {
        let removed = self.subscriptions.lock().expect("subscriptions lock poisoned").remove(&id);
        if let Some(sub) = removed {
            if let Some(task) = sub.task.lock().await.take() {
                task.abort();
            }
        }
        Ok(())
    }

    async fn get_agent_stats(&self, agent_id: &str) -> Result<Option<AgentStats>> {
        let pool = self.pool().await?;
        let row = sqlx::query(
            "SELECT total_locations, total_distance_m, last_update_ms FROM agent_stats WHERE agent_id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&pool)
        .await
        .map_err(PresenceError::backend)?;
        Ok(row.map(|r| AgentStats {
            total_locations: r.get::<i64, _>("total_locations") as u64,
            total_distance_m: r.get("total_distance_m"),
            last_update_ms: r.get("last_update_ms"),
        }))
    }

    async fn clear_agent_data(&self, agent_id: &str) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM agent_location WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&pool)
            .await
            .map_err(PresenceError::backend)?;
        sqlx::query("DELETE FROM agent_status WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&pool)
            .await
            .map_err(PresenceError::backend)?;
        sqlx::query("DELETE FROM agent_state WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&pool)
            .await
            .map_err(PresenceError::backend)?;
        sqlx::query("DELETE FROM agent_stats WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&pool)
            .await
            .map_err(PresenceError::backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::Coordinate;

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
    async fn save_and_get_location_roundtrips() {
        let driver = LogStreamDriver::new(":memory:");
        driver.initialize().await.unwrap();
        driver.save_location("a1", &sample("a1", 1000)).await.unwrap();
        let got = driver.get_last_location("a1").await.unwrap().unwrap();
        assert_eq!(got.timestamp_ms, 1000);
        let stats = driver.get_agent_stats("a1").await.unwrap().unwrap();
        assert_eq!(stats.total_locations, 1);
    }

    #[tokio::test]
    async fn get_all_agents_dedups_across_tables() {
        let driver = LogStreamDriver::new(":memory:");
        driver.initialize().await.unwrap();
        driver.save_location("a1", &sample("a1", 1000)).await.unwrap();
        driver.save_status("a1", AgentStatus::Active, 1000).await.unwrap();
        driver.save_status("a2", AgentStatus::Active, 1000).await.unwrap();
        let mut agents = driver.get_all_agents().await.unwrap();
        agents.sort();
        assert_eq!(agents, vec!["a1".to_string(), "a2".to_string()]);
    }
}
