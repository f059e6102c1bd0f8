//! The error taxonomy shared by every crate in the workspace (§7).

use thiserror::Error;

/// Kinds of failure a public operation on the engine can surface. Two
/// variants — [`PresenceError::SubscriberFailure`] and
/// [`PresenceError::WatchdogIterationFailure`] — are never returned to a
/// caller; they exist only to be logged at the site that catches them
/// (event publish, watchdog sweep) and then discarded.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Rejected coordinates, empty agent id, bad timestamp, or an invalid
    /// geofence. Raised by the location engine and geofence registration.
    /// Nothing is persisted when this is returned.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A public call arrived before `initialize` or after `shutdown`.
    #[error("service not initialized")]
    NotInitialized,

    /// A storage backend reported a failure. Partial effects may have
    /// already occurred.
    #[error("backend error: {0}")]
    BackendError(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A subscriber's handler failed while processing an event. Caught at
    /// the publish site and logged; other subscribers still receive the
    /// event.
    #[error("subscriber failure: {0}")]
    SubscriberFailure(String),

    /// A per-agent failure inside one watchdog sweep. Logged; the sweep
    /// continues for the remaining agents.
    #[error("watchdog iteration failed for agent {agent_id}: {source}")]
    WatchdogIterationFailure {
        agent_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl PresenceError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        PresenceError::InvalidInput(msg.into())
    }

    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        PresenceError::BackendError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, PresenceError>;
