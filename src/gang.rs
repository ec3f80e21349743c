//! Worker gang for the parallel phases.
//!
//! One pool is constructed at engine startup and reused by the
//! concurrent-mark, remark and cleanup phases. Workers receive their
//! worker id and a shared reference to the phase context.

use parking_lot::Mutex;
use scoped_threadpool::Pool;

pub struct WorkGang {
    pool: Mutex<Pool>,
    total_workers: usize,
}

impl WorkGang {
    pub fn new(total_workers: usize) -> Self {
        debug_assert!(total_workers > 0);
        Self {
            pool: Mutex::new(Pool::new(total_workers as u32)),
            total_workers,
        }
    }

    pub fn total_workers(&self) -> usize {
        self.total_workers
    }

    /// Run `task(worker_id)` on `active` workers and wait for all of
    /// them. `active` is capped at the pool size.
    pub fn run_task<F>(&self, active: usize, task: F)
    where
        F: Fn(usize) + Sync,
    {
        let active = active.min(self.total_workers).max(1);
        let mut pool = self.pool.lock();
        pool.scoped(|scope| {
            for worker_id in 0..active {
                let task = &task;
                scope.execute(move || task(worker_id));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_worker_once() {
        let gang = WorkGang::new(4);
        let mask = AtomicUsize::new(0);
        gang.run_task(4, |worker_id| {
            mask.fetch_or(1 << worker_id, Ordering::SeqCst);
        });
        assert_eq!(mask.load(Ordering::SeqCst), 0b1111);
    }
}
