//! Minimum spacing between dispatched actions.

use std::time::{Duration, Instant};

/// Tracks when the last action finished and how long the next must wait.
///
/// Owned by the dispatch thread; never shared.
#[derive(Debug, Clone)]
pub(crate) struct CooldownGovernor {
    cooldown: Duration,
    last_dispatch: Option<Instant>,
}

impl CooldownGovernor {
    pub(crate) const fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_dispatch: None,
        }
    }

    /// Soonest instant the next action may start, or `None` if nothing has
    /// been dispatched yet.
    pub(crate) fn next_available_at(&self) -> Option<Instant> {
        self.last_dispatch.map(|last| last + self.cooldown)
    }

    /// Time left until [`next_available_at`](Self::next_available_at),
    /// zero if it has passed.
    pub(crate) fn remaining(&self, now: Instant) -> Duration {
        self.next_available_at()
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }

    /// Block until the cooldown since the last dispatch has elapsed.
    pub(crate) fn wait(&self) {
        let remaining = self.remaining(Instant::now());
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
    }

    /// Record that an action finished at `at`.
    pub(crate) fn mark(&mut self, at: Instant) {
        self.last_dispatch = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_action_is_immediate() {
        let governor = CooldownGovernor::new(Duration::from_millis(50));
        assert_eq!(governor.next_available_at(), None);
        assert_eq!(governor.remaining(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn remaining_counts_down_from_last_dispatch() {
        let mut governor = CooldownGovernor::new(Duration::from_millis(50));
        let t0 = Instant::now();
        governor.mark(t0);
        assert_eq!(governor.next_available_at(), Some(t0 + Duration::from_millis(50)));
        assert_eq!(governor.remaining(t0), Duration::from_millis(50));
        assert_eq!(
            governor.remaining(t0 + Duration::from_millis(20)),
            Duration::from_millis(30)
        );
        assert_eq!(
            governor.remaining(t0 + Duration::from_millis(80)),
            Duration::ZERO
        );
    }

    #[test]
    fn zero_cooldown_never_waits() {
        let mut governor = CooldownGovernor::new(Duration::ZERO);
        let t0 = Instant::now();
        governor.mark(t0);
        assert_eq!(governor.remaining(t0), Duration::ZERO);
    }

    #[test]
    fn wait_sleeps_out_the_cooldown() {
        let mut governor = CooldownGovernor::new(Duration::from_millis(20));
        let t0 = Instant::now();
        governor.mark(t0);
        governor.wait();
        assert!(t0.elapsed() >= Duration::from_millis(20));
    }
}
