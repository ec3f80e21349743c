//! The safepoint-synchronization token.
//!
//! Concurrent marking workers join the set while they are doing work
//! that must observe stop-the-world pauses, and leave it before any
//! blocking operation. The stop-the-world coordinator synchronizes
//! the set: from then on joined threads are expected to yield, and
//! the coordinator blocks until every member has left or yielded.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct StsState {
    joined: usize,
    synchronizing: bool,
}

pub struct SuspendibleThreadSet {
    state: Mutex<StsState>,
    cv_changed: Condvar,
    /// Cheap mirror of `synchronizing` for the yield polls on the
    /// marking fast path.
    yield_requested: AtomicBool,
}

impl SuspendibleThreadSet {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StsState::default()),
            cv_changed: Condvar::new(),
            yield_requested: AtomicBool::new(false),
        }
    }

    /// Join the set; blocks while a safepoint synchronization is in
    /// progress.
    pub fn join(&self) {
        let mut state = self.state.lock();
        while state.synchronizing {
            self.cv_changed.wait(&mut state);
        }
        state.joined += 1;
    }

    /// Leave the set. Must pair with a prior `join`.
    pub fn leave(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.joined > 0);
        state.joined -= 1;
        if state.synchronizing && state.joined == 0 {
            self.cv_changed.notify_all();
        }
    }

    #[inline]
    pub fn should_yield(&self) -> bool {
        self.yield_requested.load(Ordering::Relaxed)
    }

    /// Yield to a pending safepoint: release the token, wait for the
    /// coordinator to finish, re-acquire.
    pub fn yield_slow(&self) {
        self.leave();
        self.join();
    }

    /// Coordinator side: stop handing out the token and wait until
    /// every member has left.
    pub fn synchronize(&self) {
        let mut state = self.state.lock();
        debug_assert!(!state.synchronizing);
        state.synchronizing = true;
        self.yield_requested.store(true, Ordering::Release);
        while state.joined > 0 {
            self.cv_changed.wait(&mut state);
        }
    }

    /// Coordinator side: release waiting threads.
    pub fn desynchronize(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.synchronizing);
        state.synchronizing = false;
        self.yield_requested.store(false, Ordering::Release);
        self.cv_changed.notify_all();
    }

    pub fn is_synchronized(&self) -> bool {
        let state = self.state.lock();
        state.synchronizing && state.joined == 0
    }
}

impl Default for SuspendibleThreadSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn synchronize_waits_for_members() {
        let sts = Arc::new(SuspendibleThreadSet::new());
        let progressed = Arc::new(AtomicUsize::new(0));

        let worker = {
            let sts = sts.clone();
            let progressed = progressed.clone();
            std::thread::spawn(move || {
                sts.join();
                while !sts.should_yield() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                sts.yield_slow();
                progressed.fetch_add(1, Ordering::SeqCst);
                sts.leave();
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        sts.synchronize();
        assert!(sts.is_synchronized());
        // The worker is parked in yield_slow and has not progressed.
        assert_eq!(progressed.load(Ordering::SeqCst), 0);
        sts.desynchronize();
        worker.join().unwrap();
        assert_eq!(progressed.load(Ordering::SeqCst), 1);
    }
}
