//! Bounded-retry accounting for automatic recovery.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// What kind of subject a ledger entry tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartScope {
    Pool,
    Bot,
}

#[derive(Debug, Clone, Copy)]
struct RestartEntry {
    count: u32,
    last_attempt: Instant,
}

/// Whether a recovery may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Go ahead; this is attempt number `attempt` in the current window.
    Attempt { attempt: u32 },
    /// Budget exhausted; retry after `cooldown_remaining`.
    Skip { cooldown_remaining: Duration },
}

/// Per-subject restart counters with a cooldown window. At most
/// `max_attempts` recoveries per subject within `cooldown`; the counter
/// resets once the window has passed without attempts.
#[derive(Debug)]
pub struct RestartLedger {
    max_attempts: u32,
    cooldown: Duration,
    entries: HashMap<(RestartScope, String), RestartEntry>,
}

impl RestartLedger {
    /// Ledger allowing `max_attempts` per `cooldown` window.
    pub fn new(max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            max_attempts,
            cooldown,
            entries: HashMap::new(),
        }
    }

    /// Account for one recovery intent and decide whether it may run.
    /// A skipped attempt does not extend the window.
    pub fn begin(&mut self, scope: RestartScope, id: &str) -> RestartDecision {
        let key = (scope, id.to_string());
        let now = Instant::now();
        match self.entries.get_mut(&key) {
            None => {
                self.entries.insert(
                    key,
                    RestartEntry {
                        count: 1,
                        last_attempt: now,
                    },
                );
                RestartDecision::Attempt { attempt: 1 }
            }
            Some(entry) => {
                let elapsed = now.duration_since(entry.last_attempt);
                if elapsed >= self.cooldown {
                    entry.count = 1;
                    entry.last_attempt = now;
                    RestartDecision::Attempt { attempt: 1 }
                } else if entry.count < self.max_attempts {
                    entry.count += 1;
                    entry.last_attempt = now;
                    RestartDecision::Attempt {
                        attempt: entry.count,
                    }
                } else {
                    RestartDecision::Skip {
                        cooldown_remaining: self.cooldown - elapsed,
                    }
                }
            }
        }
    }

    /// Drop the counter of a subject, e.g. once it was removed.
    pub fn forget(&mut self, scope: RestartScope, id: &str) {
        self.entries.remove(&(scope, id.to_string()));
    }

    /// Number of tracked subjects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_plus_first_attempt_is_skipped() {
        let mut ledger =
            RestartLedger::new(3, Duration::from_secs(60));
        for attempt in 1..=3 {
            assert_eq!(
                ledger.begin(RestartScope::Bot, "b2"),
                RestartDecision::Attempt { attempt }
            );
        }
        match ledger.begin(RestartScope::Bot, "b2") {
            RestartDecision::Skip { cooldown_remaining } => {
                assert!(cooldown_remaining > Duration::from_secs(0));
                assert!(cooldown_remaining <= Duration::from_secs(60));
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn counter_resets_after_cooldown() {
        let mut ledger =
            RestartLedger::new(1, Duration::from_millis(30));
        assert_eq!(
            ledger.begin(RestartScope::Pool, "u-pool-1"),
            RestartDecision::Attempt { attempt: 1 }
        );
        assert!(matches!(
            ledger.begin(RestartScope::Pool, "u-pool-1"),
            RestartDecision::Skip { .. }
        ));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(
            ledger.begin(RestartScope::Pool, "u-pool-1"),
            RestartDecision::Attempt { attempt: 1 }
        );
    }

    #[test]
    fn scopes_are_independent() {
        let mut ledger =
            RestartLedger::new(1, Duration::from_secs(60));
        assert!(matches!(
            ledger.begin(RestartScope::Pool, "x"),
            RestartDecision::Attempt { .. }
        ));
        assert!(matches!(
            ledger.begin(RestartScope::Bot, "x"),
            RestartDecision::Attempt { .. }
        ));
        assert!(matches!(
            ledger.begin(RestartScope::Bot, "x"),
            RestartDecision::Skip { .. }
        ));
        ledger.forget(RestartScope::Bot, "x");
        assert!(matches!(
            ledger.begin(RestartScope::Bot, "x"),
            RestartDecision::Attempt { attempt: 1 }
        ));
    }
}
