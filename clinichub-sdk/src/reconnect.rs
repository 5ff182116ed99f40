//! Reconnection decisions and local teardown signalling.
//!
//! The backoff policy is a pure function of the attempt count. The mutable
//! counter lives in the channel's reconnect task, which asks the policy for
//! a delay after every failure and stops once the policy gives up.
//!
//! Teardown is signalled explicitly: every connect attempt carries a
//! [`TeardownToken`] taken from the channel's [`TeardownSignal`], and a
//! `disconnect()` fires the signal. No error text is inspected.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::HubError;

/// Tuning for automatic reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Base delay, doubled per attempt.
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
    /// Attempts allowed before the channel settles into `Failed`.
    pub max_attempts: u32,
    /// Retry immediately on the first attempt after a drop.
    pub instant_first_retry: bool,
    /// Random extra delay added by the scheduler (0 disables).
    pub jitter_ms: u64,
    /// How long a single handshake may take.
    pub handshake_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            instant_first_retry: true,
            jitter_ms: 0,
            handshake_timeout_ms: 10_000,
        }
    }
}

/// Transient per-decision state: how many reconnects have failed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryContext {
    pub attempt_count: u32,
}

/// Exponential backoff with a cap and an attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    instant_first: bool,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32, instant_first: bool) -> Self {
        Self {
            base,
            cap: cap.max(base),
            max_attempts,
            instant_first,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt number `attempt_count`, or `None` once the
    /// ceiling is exceeded.
    ///
    /// `min(base * 2^attempt_count, cap)`, with attempt 0 returning zero when
    /// instant first retry is enabled. Non-decreasing in `attempt_count`.
    pub fn next_delay(&self, attempt_count: u32) -> Option<Duration> {
        if attempt_count > self.max_attempts {
            return None;
        }
        if attempt_count == 0 && self.instant_first {
            return Some(Duration::ZERO);
        }
        let factor = 1u32.checked_shl(attempt_count).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.cap);
        Some(delay.min(self.cap))
    }

    pub fn decide(&self, ctx: RetryContext) -> Option<Duration> {
        self.next_delay(ctx.attempt_count)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(c: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(c.base_delay_ms),
            Duration::from_millis(c.max_delay_ms),
            c.max_attempts,
            c.instant_first_retry,
        )
    }
}

/// True for failures caused by our own teardown racing a connect, which
/// are swallowed and never count as a retry.
pub fn is_transient_teardown(error: &HubError) -> bool {
    matches!(error, HubError::Teardown)
}

/// Fired by `disconnect()`; cancels every token handed out before it.
#[derive(Debug)]
pub struct TeardownSignal {
    tx: watch::Sender<u64>,
}

impl TeardownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// A token bound to the current generation.
    pub fn token(&self) -> TeardownToken {
        let rx = self.tx.subscribe();
        let generation = *rx.borrow();
        TeardownToken { generation, rx }
    }

    pub fn fire(&self) {
        self.tx.send_modify(|g| *g = g.wrapping_add(1));
    }
}

impl Default for TeardownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a connect attempt or a reconnect task.
#[derive(Debug, Clone)]
pub struct TeardownToken {
    generation: u64,
    rx: watch::Receiver<u64>,
}

impl TeardownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != self.generation
    }

    /// Resolves once the signal has been fired after this token was taken.
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Signal dropped with the channel; nothing can cancel us anymore.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(500), Duration::from_secs(8), 6, false)
    }

    #[test]
    fn doubles_until_cap() {
        let p = policy();
        assert_eq!(p.next_delay(0), Some(Duration::from_millis(500)));
        assert_eq!(p.next_delay(1), Some(Duration::from_millis(1_000)));
        assert_eq!(p.next_delay(3), Some(Duration::from_millis(4_000)));
        assert_eq!(p.next_delay(5), Some(Duration::from_secs(8)));
        assert_eq!(p.next_delay(6), Some(Duration::from_secs(8)));
    }

    #[test]
    fn gives_up_after_ceiling() {
        let p = policy();
        assert!(p.next_delay(6).is_some());
        assert_eq!(p.next_delay(7), None);
        assert_eq!(p.next_delay(u32::MAX), None);
    }

    #[test]
    fn delays_never_decrease_below_ceiling() {
        for instant in [false, true] {
            let p = ReconnectPolicy::new(Duration::from_millis(250), Duration::from_secs(30), 40, instant);
            for k in 0..p.max_attempts() {
                assert!(p.next_delay(k).unwrap() <= p.next_delay(k + 1).unwrap(), "k={k}");
            }
            assert_eq!(p.next_delay(p.max_attempts() + 1), None);
        }
    }

    #[test]
    fn instant_first_retry_is_zero() {
        let p = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 3, true);
        assert_eq!(p.decide(RetryContext::default()), Some(Duration::ZERO));
        assert_eq!(p.decide(RetryContext { attempt_count: 1 }), Some(Duration::from_secs(2)));
    }

    #[test]
    fn large_attempts_saturate_at_cap() {
        let p = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 100, false);
        assert_eq!(p.next_delay(40), Some(Duration::from_secs(30)));
        assert_eq!(p.next_delay(99), Some(Duration::from_secs(30)));
    }

    #[test]
    fn policy_from_config() {
        let cfg = ReconnectConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: 2,
            instant_first_retry: false,
            ..Default::default()
        };
        let p = ReconnectPolicy::from(&cfg);
        assert_eq!(p.next_delay(2), Some(Duration::from_millis(400)));
        assert_eq!(p.next_delay(3), None);
    }

    #[test]
    fn classifies_teardown_only() {
        assert!(is_transient_teardown(&HubError::Teardown));
        assert!(!is_transient_teardown(&HubError::Handshake("connection refused".into())));
        assert!(!is_transient_teardown(&HubError::Transport("stopped during negotiation".into())));
    }

    #[test]
    fn fired_signal_cancels_older_tokens_only() {
        let signal = TeardownSignal::new();
        let old = signal.token();
        signal.fire();
        let fresh = signal.token();
        assert!(old.is_cancelled());
        assert!(!fresh.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_on_fire() {
        let signal = TeardownSignal::new();
        let mut token = signal.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        signal.fire();
        waiter.await.unwrap();
    }
}
