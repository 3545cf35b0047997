//! Outbound call governor — token bucket plus shared flood-wait gate.
//!
//! Every call to the messaging network goes through [`Governor::call`].
//! The governor is either *flowing* (calls spend one token each, waiting for
//! refill when the bucket is empty) or *suspended until* an instant set by a
//! flood-wait signal, during which every caller waits. Overlapping signals
//! extend the window to the latest end; they never add up.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::config::RateConfig;
use crate::error::ChannelError;

/// Observable governor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    Flowing,
    Suspended { until: Instant },
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    suspended_until: Option<Instant>,
}

/// Shared rate limiter for outbound calls.
pub struct Governor {
    interval: Duration,
    burst: u32,
    max_flood_retries: u32,
    bucket: Mutex<Bucket>,
}

impl Governor {
    pub fn new(config: RateConfig) -> Self {
        let burst = config.burst.max(1);
        Self {
            interval: config.interval,
            burst,
            max_flood_retries: config.max_flood_retries,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
                suspended_until: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        // State is plain numbers, a panic mid-update cannot leave it invalid.
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> GovernorState {
        let bucket = self.lock();
        match bucket.suspended_until {
            Some(until) if until > Instant::now() => GovernorState::Suspended { until },
            _ => GovernorState::Flowing,
        }
    }

    /// Suspend all outbound calls for `wait` from now.
    ///
    /// If a window is already open the later end wins.
    pub fn suspend(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut bucket = self.lock();
        let until = match bucket.suspended_until {
            Some(existing) if existing >= until => existing,
            _ => until,
        };
        bucket.suspended_until = Some(until);
    }

    /// Wait until the gate is open and a token is available, then spend it.
    pub async fn acquire(&self) {
        loop {
            let wake_at = {
                let mut bucket = self.lock();
                let now = Instant::now();

                match bucket.suspended_until {
                    Some(until) if until > now => Some(until),
                    _ => {
                        bucket.suspended_until = None;
                        self.refill(&mut bucket, now);
                        if bucket.tokens >= 1.0 {
                            bucket.tokens -= 1.0;
                            None
                        } else {
                            let missing = 1.0 - bucket.tokens;
                            Some(now + self.interval.mul_f64(missing).max(Duration::from_millis(1)))
                        }
                    }
                }
            };

            match wake_at {
                None => return,
                Some(at) => sleep_until(at).await,
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        if self.interval.is_zero() {
            bucket.tokens = f64::from(self.burst);
        } else {
            let elapsed = now.saturating_duration_since(bucket.last_refill);
            let gained = elapsed.as_secs_f64() / self.interval.as_secs_f64();
            bucket.tokens = (bucket.tokens + gained).min(f64::from(self.burst));
        }
        bucket.last_refill = now;
    }

    /// Run `op` under the governor.
    ///
    /// A flood-wait error suspends every caller for the signalled duration and
    /// the same operation is issued again once the window closes, up to the
    /// configured number of flood waits. Other errors are returned unchanged.
    pub async fn call<T, F, Fut>(&self, method: &str, mut op: F) -> Result<T, ChannelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        let mut flood_waits = 0;
        loop {
            self.acquire().await;
            match op().await {
                Err(e) => match e.flood_wait() {
                    Some(wait) if flood_waits < self.max_flood_retries => {
                        flood_waits += 1;
                        warn!(
                            method,
                            wait_secs = wait.as_secs_f64(),
                            attempt = flood_waits,
                            "Flood wait, suspending outbound calls"
                        );
                        self.suspend(wait);
                    }
                    _ => return Err(e),
                },
                Ok(value) => {
                    if flood_waits > 0 {
                        debug!(method, flood_waits, "Call succeeded after flood wait");
                    }
                    return Ok(value);
                }
            }
        }
    }
}
