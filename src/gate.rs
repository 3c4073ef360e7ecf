//! The one place a worker suspends for a human.
//!
//! A collector that hits a challenge page calls `wait_for_resume` and stays
//! parked until an operator channel calls `signal_resume` for that same
//! employer, `abort` is called, or the optional timeout passes. Nothing here
//! polls the remote site or guesses that a challenge has cleared.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Resumed,
    TimedOut,
    Aborted,
}

#[derive(Default)]
struct GateInner {
    /// Blocked employers; `true` once their resume signal arrived.
    blocked: HashMap<String, bool>,
    aborted: bool,
}

#[derive(Default)]
pub struct InteractionGate {
    inner: Mutex<GateInner>,
    cond: Condvar,
}

impl InteractionGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parks the caller until `employer_id` is resumed. `None` waits forever.
    pub fn wait_for_resume(&self, employer_id: &str, timeout: Option<Duration>) -> GateOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        if inner.aborted {
            return GateOutcome::Aborted;
        }
        inner.blocked.insert(employer_id.to_string(), false);
        warn!(
            "Challenge on '{}': waiting for operator resume signal{}",
            employer_id,
            timeout.map(|t| format!(" (timeout {}s)", t.as_secs())).unwrap_or_default()
        );

        loop {
            if inner.aborted {
                inner.blocked.remove(employer_id);
                return GateOutcome::Aborted;
            }
            if inner.blocked.get(employer_id) == Some(&true) {
                inner.blocked.remove(employer_id);
                info!("Operator resumed '{}'", employer_id);
                return GateOutcome::Resumed;
            }
            inner = match deadline {
                None => self.cond.wait(inner).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        inner.blocked.remove(employer_id);
                        warn!("Gave up waiting on '{}'", employer_id);
                        return GateOutcome::TimedOut;
                    }
                    self.cond
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Releases the worker blocked on `employer_id`. False if none is.
    pub fn signal_resume(&self, employer_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.blocked.get_mut(employer_id) {
            Some(released) => {
                *released = true;
                self.cond.notify_all();
                true
            }
            None => false,
        }
    }

    /// Wakes every waiter with `Aborted`; later waits return immediately.
    pub fn abort(&self) {
        let mut inner = self.lock();
        inner.aborted = true;
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    pub fn blocked(&self) -> Vec<String> {
        let inner = self.lock();
        let mut ids: Vec<String> = inner
            .blocked
            .iter()
            .filter(|(_, released)| !**released)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn wait_until_blocked(gate: &InteractionGate, id: &str) {
        for _ in 0..500 {
            if gate.blocked().iter().any(|b| b == id) {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("{} never blocked", id);
    }

    #[test]
    fn resume_wakes_only_the_named_employer() {
        let gate = Arc::new(InteractionGate::new());
        let a = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait_for_resume("a", None))
        };
        let b = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait_for_resume("b", Some(Duration::from_millis(300))))
        };
        wait_until_blocked(&gate, "a");
        wait_until_blocked(&gate, "b");

        assert!(gate.signal_resume("a"));
        assert_eq!(a.join().unwrap(), GateOutcome::Resumed);
        assert_eq!(b.join().unwrap(), GateOutcome::TimedOut);
        assert!(gate.blocked().is_empty());
    }

    #[test]
    fn signal_without_waiter_is_ignored() {
        let gate = InteractionGate::new();
        assert!(!gate.signal_resume("nobody"));
        // An earlier stray signal must not pre-release a later block.
        assert_eq!(
            gate.wait_for_resume("nobody", Some(Duration::from_millis(20))),
            GateOutcome::TimedOut
        );
    }

    #[test]
    fn abort_releases_waiters() {
        let gate = Arc::new(InteractionGate::new());
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait_for_resume("x", None))
        };
        wait_until_blocked(&gate, "x");
        gate.abort();
        assert_eq!(waiter.join().unwrap(), GateOutcome::Aborted);
        assert_eq!(gate.wait_for_resume("y", None), GateOutcome::Aborted);
    }
}
