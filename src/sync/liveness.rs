//! Liveness monitoring.
//!
//! Catches failures the transport never reports: a socket that went quiet
//! without a disconnect event, or a sync handshake whose reply was lost. The
//! monitor only decides; the provider acts through its normal entry points.

use std::time::{Duration, Instant};

/// What the provider looked like when the check ran
#[derive(Debug, Clone, Copy)]
pub struct LivenessSnapshot {
    /// The provider believes it is connected
    pub connected: bool,
    /// The transport reports itself active
    pub transport_active: bool,
    pub joined: bool,
    pub synced: bool,
    /// A reconnect is scheduled or already in flight
    pub reconnect_pending: bool,
    /// When the current connection was established
    pub connected_at: Option<Instant>,
}

/// Corrective action chosen by a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    None,
    /// Tear the transport down and connect again
    ForceReconnect,
    /// Send sync-step1 again
    Resync,
}

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    interval: Duration,
    stale_sync_threshold: Duration,
    last_step1_at: Option<Instant>,
}

impl LivenessMonitor {
    pub fn new(interval: Duration, stale_sync_threshold: Duration) -> Self {
        Self {
            interval,
            stale_sync_threshold,
            last_step1_at: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Remember that sync-step1 went out at `now`
    pub fn note_step1_sent(&mut self, now: Instant) {
        self.last_step1_at = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_step1_at = None;
    }

    pub fn check(&self, snapshot: LivenessSnapshot, now: Instant) -> LivenessAction {
        if !snapshot.connected {
            return LivenessAction::None;
        }

        if !snapshot.transport_active {
            if snapshot.reconnect_pending {
                return LivenessAction::None;
            }
            return LivenessAction::ForceReconnect;
        }

        if snapshot.joined && !snapshot.synced {
            // Waiting counts from the later of connect and the last step1
            let since = match (snapshot.connected_at, self.last_step1_at) {
                (Some(a), Some(b)) => a.max(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => return LivenessAction::None,
            };
            if now.saturating_duration_since(since) >= self.stale_sync_threshold {
                return LivenessAction::Resync;
            }
        }

        LivenessAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(now: Instant) -> LivenessSnapshot {
        LivenessSnapshot {
            connected: true,
            transport_active: true,
            joined: true,
            synced: true,
            reconnect_pending: false,
            connected_at: Some(now),
        }
    }

    fn monitor() -> LivenessMonitor {
        LivenessMonitor::new(Duration::from_secs(30), Duration::from_secs(30))
    }

    #[test]
    fn test_healthy_session_needs_nothing() {
        let now = Instant::now();
        assert_eq!(monitor().check(snapshot(now), now + Duration::from_secs(300)), LivenessAction::None);
    }

    #[test]
    fn test_inactive_transport_forces_reconnect() {
        let now = Instant::now();
        let mut snap = snapshot(now);
        snap.transport_active = false;

        assert_eq!(monitor().check(snap, now), LivenessAction::ForceReconnect);

        snap.reconnect_pending = true;
        assert_eq!(monitor().check(snap, now), LivenessAction::None);
    }

    #[test]
    fn test_stuck_unsynced_resyncs_once_per_window() {
        let start = Instant::now();
        let mut monitor = monitor();
        let mut snap = snapshot(start);
        snap.synced = false;
        monitor.note_step1_sent(start);

        assert_eq!(monitor.check(snap, start + Duration::from_secs(10)), LivenessAction::None);

        let late = start + Duration::from_secs(31);
        assert_eq!(monitor.check(snap, late), LivenessAction::Resync);
        monitor.note_step1_sent(late);
        assert_eq!(monitor.check(snap, late + Duration::from_secs(1)), LivenessAction::None);
    }

    #[test]
    fn test_fresh_connection_is_not_stale() {
        let start = Instant::now();
        let mut monitor = monitor();
        monitor.note_step1_sent(start);

        // Reconnected long after the last step1
        let reconnected = start + Duration::from_secs(120);
        let mut snap = snapshot(reconnected);
        snap.synced = false;

        assert_eq!(
            monitor.check(snap, reconnected + Duration::from_secs(5)),
            LivenessAction::None
        );
    }

    #[test]
    fn test_disconnected_is_left_to_backoff() {
        let now = Instant::now();
        let mut snap = snapshot(now);
        snap.connected = false;
        snap.transport_active = false;
        assert_eq!(monitor().check(snap, now), LivenessAction::None);
    }
}
