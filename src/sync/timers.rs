//! Owned, cancelable timers and the clock that drives them.
//!
//! Timers are plain deadlines kept in one set. Nothing runs on its own: the
//! owner asks for the next deadline, sleeps until then and collects whatever
//! expired. Canceling everything is a single call.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// The timers a session can own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Bounds how long a join may stay unconfirmed
    JoinTimeout,
    /// Re-sends sync-step1 until the session is synced
    Resync,
    /// Periodic liveness check
    Liveness,
    /// Scheduled reconnect after a disconnect
    Reconnect,
}

/// At most one deadline per timer kind
#[derive(Debug, Default)]
pub struct TimerSet {
    deadlines: HashMap<TimerKind, Instant>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer, replacing any existing deadline of the same kind
    pub fn schedule(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines.insert(kind, at);
    }

    /// Disarm a timer. Returns whether it was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines.get(&kind).copied()
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Disarm and return every timer due at `now`, earliest first
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut expired: Vec<(Instant, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(kind, at)| (*at, *kind))
            .collect();
        expired.sort();

        for (_, kind) in &expired {
            self.deadlines.remove(kind);
        }

        expired.into_iter().map(|(_, kind)| kind).collect()
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_replaces_same_kind() {
        let clock = ManualClock::new();
        let mut timers = TimerSet::new();

        timers.schedule(TimerKind::Reconnect, clock.now() + Duration::from_secs(5));
        timers.schedule(TimerKind::Reconnect, clock.now() + Duration::from_secs(1));

        assert_eq!(timers.len(), 1);
        assert_eq!(
            timers.deadline(TimerKind::Reconnect),
            Some(clock.now() + Duration::from_secs(1))
        );
    }

    #[test]
    fn test_take_expired_in_deadline_order() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut timers = TimerSet::new();

        timers.schedule(TimerKind::Liveness, start + Duration::from_secs(30));
        timers.schedule(TimerKind::Resync, start + Duration::from_secs(10));
        timers.schedule(TimerKind::JoinTimeout, start + Duration::from_secs(20));

        assert_eq!(timers.next_deadline(), Some(start + Duration::from_secs(10)));
        assert!(timers.take_expired(start).is_empty());

        clock.advance(Duration::from_secs(25));
        assert_eq!(
            timers.take_expired(clock.now()),
            vec![TimerKind::Resync, TimerKind::JoinTimeout]
        );
        assert_eq!(timers.len(), 1);
        assert!(timers.is_scheduled(TimerKind::Liveness));
    }

    #[test]
    fn test_cancel_all() {
        let mut timers = TimerSet::new();
        timers.schedule(TimerKind::Liveness, Instant::now());
        timers.schedule(TimerKind::Reconnect, Instant::now());

        assert!(timers.cancel(TimerKind::Reconnect));
        assert!(!timers.cancel(TimerKind::Reconnect));

        timers.cancel_all();
        assert!(timers.is_empty());
        assert!(timers.next_deadline().is_none());
    }
}
