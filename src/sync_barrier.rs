//! Rendezvous barrier for the overflow restart protocol.
//!
//! Two of these back the restart: all tasks arrive at the first
//! barrier, task 0 clears the global marking state, every task clears
//! its own state, and all tasks arrive at the second barrier before
//! the cycle resumes from bitmap scanning. Tasks enter with the
//! safepoint token released, so a pending stop-the-world pause cannot
//! deadlock against the rendezvous.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: usize,
}

pub struct WorkerBarrier {
    state: Mutex<BarrierState>,
    cv: Condvar,
    n_workers: AtomicUsize,
}

impl WorkerBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            cv: Condvar::new(),
            n_workers: AtomicUsize::new(1),
        }
    }

    /// Set the expected arrival count for the coming phase. Must not
    /// run while a rendezvous is in progress.
    pub fn set_n_workers(&self, n: usize) {
        debug_assert!(n > 0);
        self.n_workers.store(n, Ordering::Release);
    }

    /// Block until all workers of the phase have arrived.
    pub fn enter(&self) {
        let n = self.n_workers.load(Ordering::Acquire);
        let mut state = self.state.lock();
        state.arrived += 1;
        if state.arrived == n {
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
        } else {
            let generation = state.generation;
            while state.generation == generation {
                self.cv.wait(&mut state);
            }
        }
    }

    /// How many rendezvous have completed. Diagnostic only.
    pub fn generation(&self) -> usize {
        self.state.lock().generation
    }
}

impl Default for WorkerBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn all_workers_rendezvous() {
        let barrier = Arc::new(WorkerBarrier::new());
        barrier.set_n_workers(4);
        let mut handles = vec![];
        for _ in 0..4 {
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.enter();
                barrier.enter();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(barrier.generation(), 2);
    }
}
