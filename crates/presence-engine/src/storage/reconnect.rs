//! Connection retry helpers shared by the backends that talk to an external
//! service: Redis (`kv_pubsub`), NATS JetStream (`queue_broker`) and the
//! SQLite pool (`log_stream`). A dropped connection should back off instead
//! of turning into a tight retry loop and a log storm.

use presence_core::{PresenceError, Result};
use std::future::Future;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    next_attempt_at: Instant,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
            next_attempt_at: Instant::now(),
            jitter_ratio: 0.2,
        }
    }

    pub fn ready(&self) -> bool {
        Instant::now() >= self.next_attempt_at
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.next_attempt_at = Instant::now();
    }

    pub fn fail(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.max);
        let delay = add_jitter(self.current, self.jitter_ratio);
        self.next_attempt_at = Instant::now() + delay;
        delay
    }
}

fn add_jitter(delay: Duration, ratio: f64) -> Duration {
    if !(0.0..=1.0).contains(&ratio) {
        return delay;
    }

    let delay_ms = delay.as_millis();
    if delay_ms == 0 {
        return delay;
    }

    let jitter_ms_max = ((delay_ms as f64) * ratio) as u128;
    if jitter_ms_max == 0 {
        return delay;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let jitter_ms = (now_nanos as u128) % (jitter_ms_max + 1);
    delay + Duration::from_millis(jitter_ms as u64)
}

/// Retries `attempt` up to `max_attempts` times, sleeping an exponentially
/// growing, jittered delay between failures. Used by the `initialize` of
/// every backend that opens a connection to an external service rather than
/// failing on the first transient error (a broker still starting up, a
/// database file on a slow mount).
pub async fn connect_with_retry<T, F, Fut>(
    base: Duration,
    max: Duration,
    max_attempts: u32,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(base, max);
    let mut last_err = None;
    for attempt_no in 1..=max_attempts.max(1) {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(attempt_no, max_attempts, "connect attempt failed: {}", err);
                last_err = Some(err);
                if attempt_no < max_attempts {
                    tokio::time::sleep(backoff.fail()).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(PresenceError::NotInitialized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn new_backoff_is_ready() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        assert!(backoff.ready());
    }

    #[test]
    fn fail_makes_not_ready_until_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert!(backoff.ready());

        let delay = backoff.fail();
        assert!(delay >= Duration::from_millis(200));
        assert!(!backoff.ready());

        backoff.reset();
        assert!(backoff.ready());
    }

    #[test]
    fn fail_saturates_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(20));

        let delay1 = backoff.fail();
        assert!(delay1 >= Duration::from_millis(20));
        assert!(delay1 <= Duration::from_millis(24));

        let delay2 = backoff.fail();
        assert!(delay2 >= Duration::from_millis(20));
        assert!(delay2 <= Duration::from_millis(24));
    }

    #[tokio::test]
    async fn connect_with_retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<()> = connect_with_retry(
            Duration::from_millis(1),
            Duration::from_millis(5),
            3,
            move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(PresenceError::backend(std::io::Error::other("still down")))
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connect_with_retry_succeeds_once_attempt_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result = connect_with_retry(
            Duration::from_millis(1),
            Duration::from_millis(5),
            5,
            move || {
                let counted = counted.clone();
                async move {
                    let n = counted.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(PresenceError::backend(std::io::Error::other("still down")))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
