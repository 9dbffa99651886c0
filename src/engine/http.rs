// Outbound HTTP helpers shared by the worker client, the relay's downstream
// forward and the upstream assistant.
//
// Backoff doubles from 250ms up to 4s with ±25% jitter; only 429 and the
// gateway-class 5xx statuses are retried. A circuit breaker stops hammering
// an endpoint after repeated failures.

use log::warn;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Retries after the first attempt.
pub const MAX_RETRIES: u32 = 2;

const BASE_DELAY_MS: u64 = 250;
const MAX_DELAY_MS: u64 = 4_000;
const MIN_DELAY_MS: u64 = 50;

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Delay before retry `attempt` (0-based).
pub fn backoff(attempt: u32) -> Duration {
    let ms = (BASE_DELAY_MS << attempt.min(8)).min(MAX_DELAY_MS);
    let spread = ms / 4;
    let jittered = if spread == 0 {
        ms
    } else {
        let mut buf = [0u8; 8];
        let roll = match getrandom::getrandom(&mut buf) {
            Ok(()) => u64::from_le_bytes(buf) % (2 * spread + 1),
            Err(_) => spread,
        };
        ms + roll - spread
    };
    Duration::from_millis(jittered.max(MIN_DELAY_MS))
}

/// Sleep out the backoff for `attempt` and report how long it was.
pub async fn retry_delay(attempt: u32) -> Duration {
    let delay = backoff(attempt);
    tokio::time::sleep(delay).await;
    delay
}

#[derive(Default)]
struct BreakerState {
    failures: u32,
    opened_at: Option<Instant>,
}

/// Opens after `threshold` consecutive failures and fails fast until the
/// cooldown passes; the first call after that is let through as a probe.
pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, threshold: u32, cooldown_secs: u64) -> Self {
        CircuitBreaker {
            name,
            threshold: threshold.max(1),
            cooldown: Duration::from_secs(cooldown_secs),
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// `Err` with a readable reason while the circuit is open.
    pub fn check(&self) -> Result<(), String> {
        let st = self.state.lock();
        match st.opened_at {
            Some(at) if at.elapsed() < self.cooldown => {
                let left = self.cooldown.saturating_sub(at.elapsed());
                Err(format!("{} unavailable after {} failures, retry in {}s", self.name, st.failures, left.as_secs()))
            }
            _ => Ok(()),
        }
    }

    pub fn record_success(&self) {
        *self.state.lock() = BreakerState::default();
    }

    pub fn record_failure(&self) {
        let mut st = self.state.lock();
        st.failures += 1;
        if st.failures >= self.threshold {
            st.opened_at = Some(Instant::now());
            warn!("[http] {} circuit open after {} failures ({}s cooldown)", self.name, st.failures, self.cooldown.as_secs());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_statuses_retry() {
        assert!([429, 500, 502, 503, 504].into_iter().all(is_retryable_status));
        assert!(![200, 400, 401, 403, 409].into_iter().any(is_retryable_status));
    }

    #[test]
    fn backoff_grows_then_caps() {
        assert!(backoff(0) <= Duration::from_millis(BASE_DELAY_MS + BASE_DELAY_MS / 4));
        for attempt in 0..12 {
            let d = backoff(attempt).as_millis() as u64;
            assert!((MIN_DELAY_MS..=MAX_DELAY_MS + MAX_DELAY_MS / 4).contains(&d));
        }
    }

    #[test]
    fn breaker_opens_and_resets() {
        let cb = CircuitBreaker::new("chat", 3, 60);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.check().is_ok());
        cb.record_failure();
        assert!(cb.check().unwrap_err().contains("chat unavailable"));
        cb.record_success();
        assert!(cb.check().is_ok());
    }

    #[test]
    fn elapsed_cooldown_lets_a_probe_through() {
        let cb = CircuitBreaker::new("nonce", 1, 0);
        cb.record_failure();
        assert!(cb.check().is_ok());
    }
}
