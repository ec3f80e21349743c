//! Distributed termination for the marking tasks.
//!
//! A task offers termination once it has run out of local work,
//! global work and steal victims. The offer succeeds when every
//! active task has offered; a waiting task retracts its offer when
//! its peek predicate reports new work (global mark stack non-empty)
//! or its own abort flag.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Peek predicate consulted while waiting inside the termination
/// protocol.
pub trait TerminatorTerminator {
    fn should_exit_termination(&mut self) -> bool;
}

pub struct ParallelTaskTerminator {
    n_tasks: AtomicUsize,
    offered: AtomicUsize,
}

impl ParallelTaskTerminator {
    pub fn new() -> Self {
        Self {
            n_tasks: AtomicUsize::new(1),
            offered: AtomicUsize::new(0),
        }
    }

    /// Arm the terminator for a phase with `n` active tasks.
    pub fn set_n_tasks(&self, n: usize) {
        debug_assert!(n > 0);
        self.n_tasks.store(n, Ordering::Release);
        self.offered.store(0, Ordering::Release);
    }

    /// Returns true when all tasks terminated together, false when
    /// the caller should go back to look for more work.
    pub fn offer_termination(&self, terminator: &mut dyn TerminatorTerminator) -> bool {
        let n = self.n_tasks.load(Ordering::Acquire);
        let offered = self.offered.fetch_add(1, Ordering::AcqRel) + 1;
        if offered == n {
            return true;
        }

        loop {
            if self.offered.load(Ordering::Acquire) >= n {
                return true;
            }
            thread::sleep(Duration::from_micros(1));
            if terminator.should_exit_termination() {
                // Retract the offer, unless termination was decided
                // in the meantime; a decided rendezvous wins.
                let mut cur = self.offered.load(Ordering::Acquire);
                loop {
                    if cur >= n {
                        return true;
                    }
                    match self.offered.compare_exchange(
                        cur,
                        cur - 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return false,
                        Err(c) => cur = c,
                    }
                }
            }
        }
    }
}

impl Default for ParallelTaskTerminator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Never;
    impl TerminatorTerminator for Never {
        fn should_exit_termination(&mut self) -> bool {
            false
        }
    }

    struct Once(bool);
    impl TerminatorTerminator for Once {
        fn should_exit_termination(&mut self) -> bool {
            !std::mem::replace(&mut self.0, true)
        }
    }

    #[test]
    fn single_task_terminates_immediately() {
        let t = ParallelTaskTerminator::new();
        t.set_n_tasks(1);
        assert!(t.offer_termination(&mut Never));
    }

    #[test]
    fn all_tasks_terminate_together() {
        let t = Arc::new(ParallelTaskTerminator::new());
        t.set_n_tasks(3);
        let mut handles = vec![];
        for _ in 0..3 {
            let t = t.clone();
            handles.push(std::thread::spawn(move || t.offer_termination(&mut Never)));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn peek_retracts_offer() {
        let t = ParallelTaskTerminator::new();
        t.set_n_tasks(2);
        // With only one of two tasks offering, a firing predicate
        // sends the task back for more work.
        assert!(!t.offer_termination(&mut Once(false)));
        // The retraction left the count at zero.
        assert_eq!(t.offered.load(Ordering::Acquire), 0);
    }
}
