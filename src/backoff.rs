use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Reconnect delay: `base * 2^(failures-1)`, capped. The failure count is
/// reset by a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_secs: u64,
    max_secs: u64,
    failures: u32,
}

impl Backoff {
    pub fn new(base_secs: u64, max_secs: u64) -> Self {
        let base_secs = base_secs.max(1);
        Self {
            base_secs,
            max_secs: max_secs.max(base_secs),
            failures: 0,
        }
    }

    /// Delay after `failures` consecutive failures, without jitter.
    pub fn delay_secs_for(&self, failures: u32) -> u64 {
        if failures == 0 {
            return 0;
        }
        let factor = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
        self.base_secs.saturating_mul(factor).min(self.max_secs)
    }

    /// Counts one more failure and returns the delay to wait before retrying.
    pub fn record_failure(&mut self) -> u64 {
        self.failures = self.failures.saturating_add(1);
        self.delay_secs_for(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn current_delay_secs(&self) -> u64 {
        self.delay_secs_for(self.failures)
    }
}

/// Spread added on top of a backoff delay so clients restarted together do
/// not reconnect in lockstep.
pub(crate) fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos() / 1_000) % max_ms)
        .unwrap_or(0);
    Duration::from_millis(millis)
}
