//! Reconnection backoff.
//!
//! Each disconnect grows the delay exponentially up to a cap; each successful
//! connect resets it.

use std::time::{Duration, Instant};

use crate::transport::DisconnectReason;

/// Exponential backoff state
#[derive(Debug, Clone)]
pub struct BackoffController {
    base_delay: Duration,
    max_delay: Duration,
    attempt_count: u32,
    last_connected_at: Option<Instant>,
}

impl BackoffController {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            attempt_count: 0,
            last_connected_at: None,
        }
    }

    /// `min(base * 2^attempt, max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay the next reconnect would use
    pub fn next_delay(&self) -> Duration {
        self.delay_for(self.attempt_count)
    }

    /// Record a successful connect
    pub fn on_connected(&mut self, now: Instant) {
        self.attempt_count = 0;
        self.last_connected_at = Some(now);
    }

    /// Record a disconnect.
    ///
    /// Returns the delay before reconnecting, or `None` if this reason does not
    /// warrant a reconnect. The attempt counter grows either way.
    pub fn on_disconnected(&mut self, reason: DisconnectReason) -> Option<Duration> {
        let delay = self.next_delay();
        self.attempt_count = self.attempt_count.saturating_add(1);

        if reason.should_reconnect() {
            Some(delay)
        } else {
            None
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_connected_at(&self) -> Option<Instant> {
        self.last_connected_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackoffController {
        BackoffController::new(Duration::from_millis(500), Duration::from_secs(10))
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let mut backoff = controller();
        let mut delays = Vec::new();
        for _ in 0..10 {
            delays.push(backoff.on_disconnected(DisconnectReason::TransportClose).unwrap());
        }

        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_connect_resets_to_base() {
        let mut backoff = controller();
        for _ in 0..4 {
            backoff.on_disconnected(DisconnectReason::ServerDisconnect);
        }
        assert_eq!(backoff.attempt_count(), 4);

        let now = Instant::now();
        backoff.on_connected(now);

        assert_eq!(backoff.attempt_count(), 0);
        assert_eq!(backoff.last_connected_at(), Some(now));
        assert_eq!(
            backoff.on_disconnected(DisconnectReason::TransportClose),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_client_disconnect_does_not_reconnect() {
        let mut backoff = controller();
        assert_eq!(backoff.on_disconnected(DisconnectReason::ClientDisconnect), None);
        // The attempt still counts
        assert_eq!(backoff.attempt_count(), 1);
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let backoff = controller();
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(10));
    }
}
