//! Periodic sweep driving time-based status transitions. Ticks enumerate
//! every known agent and evaluate each with bounded concurrency; a single
//! agent's failure does not abort the sweep.

use crate::status::StatusEngine;
use crate::storage::StorageDriver;
use presence_core::{PresenceError, Result};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

const MAX_CONCURRENT_CHECKS: usize = 16;

pub struct Watchdog {
    storage: Arc<dyn StorageDriver>,
    status_engine: Arc<StatusEngine>,
    interval: std::time::Duration,
    stop: Arc<Notify>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(
        storage: Arc<dyn StorageDriver>,
        status_engine: Arc<StatusEngine>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            storage,
            status_engine,
            interval,
            stop: Arc::new(Notify::new()),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Starts the periodic sweep if not already running. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.sweep_once().await;
                    }
                    _ = this.stop.notified() => {
                        tracing::info!("watchdog stopped");
                        break;
                    }
                }
            }
        });
        *guard = Some(handle);
    }

    /// Cancels the periodic sweep. Idempotent.
    pub async fn stop(&self) {
        let mut guard = self.task.lock().await;
        if let Some(handle) = guard.take() {
            self.stop.notify_one();
            let _ = handle.await;
        }
    }

    /// Runs one sweep pass immediately, synchronously with the caller.
    pub async fn force_check_all(&self) -> Result<()> {
        self.sweep_once().await;
        Ok(())
    }

    /// Runs one pass for a single agent immediately.
    pub async fn force_check(&self, agent_id: &str) -> Result<()> {
        self.status_engine
            .check_status_by_time(agent_id)
            .await
            .map(|_| ())
            .map_err(|err| PresenceError::WatchdogIterationFailure {
                agent_id: agent_id.to_string(),
                source: Box::new(err),
            })
    }

    async fn sweep_once(&self) {
        let agents = match self.storage.get_all_agents().await {
            Ok(agents) => agents,
            Err(err) => {
                tracing::error!("watchdog failed to enumerate agents: {}", err);
                return;
            }
        };

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CHECKS));
        let mut tasks = JoinSet::new();
        for agent_id in agents {
            let status_engine = self.status_engine.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                if let Err(err) = status_engine.check_status_by_time(&agent_id).await {
                    tracing::error!(agent_id = %agent_id, "watchdog iteration failed: {}", err);
                }
            });
        }

        while tasks.join_next().await.is_some() {}
    }
}
