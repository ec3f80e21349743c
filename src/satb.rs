//! Snapshot-at-the-beginning buffer plumbing.
//!
//! Mutator write barriers log the prior value of every overwritten
//! reference slot into a per-thread [`SatbQueue`]. Full buffers move
//! onto the shared completed list, where marking tasks claim them one
//! at a time and apply the marking closure to each logged reference.
//! During remark the not-yet-completed per-thread buffers are swept
//! as well.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::heap::ReferenceVisitor;

pub struct SatbQueue {
    active: AtomicBool,
    buf: Mutex<Vec<usize>>,
}

impl SatbQueue {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            buf: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub struct SatbQueueSet {
    buffer_size: AtomicUsize,
    process_completed_threshold: AtomicUsize,
    all_active: AtomicBool,
    completed: Mutex<VecDeque<Vec<usize>>>,
    queues: Mutex<Vec<Arc<SatbQueue>>>,
}

impl SatbQueueSet {
    pub fn new(buffer_size: usize, process_completed_threshold: usize) -> Self {
        Self {
            buffer_size: AtomicUsize::new(buffer_size),
            process_completed_threshold: AtomicUsize::new(process_completed_threshold),
            all_active: AtomicBool::new(false),
            completed: Mutex::new(VecDeque::new()),
            queues: Mutex::new(Vec::new()),
        }
    }

    pub fn set_buffer_size(&self, size: usize) {
        debug_assert!(size > 0);
        self.buffer_size.store(size, Ordering::Release);
    }

    pub fn set_process_completed_threshold(&self, threshold: usize) {
        self.process_completed_threshold
            .store(threshold, Ordering::Release);
    }

    /// Attach a mutator thread. The returned handle is what its write
    /// barrier enqueues into.
    pub fn register_queue(&self) -> Arc<SatbQueue> {
        let queue = Arc::new(SatbQueue::new());
        queue
            .active
            .store(self.all_active.load(Ordering::Acquire), Ordering::Release);
        self.queues.lock().push(queue.clone());
        queue
    }

    /// Flip SATB recording for every attached thread. Runs at a
    /// safepoint.
    pub fn set_active_all_threads(&self, active: bool) {
        self.all_active.store(active, Ordering::Release);
        for queue in self.queues.lock().iter() {
            queue.active.store(active, Ordering::Release);
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.all_active.load(Ordering::Acquire)
    }

    /// Write-barrier entry: log the prior value of an overwritten
    /// reference slot.
    pub fn enqueue(&self, queue: &SatbQueue, obj: usize) {
        if !queue.is_active() || obj == 0 {
            return;
        }
        let full = {
            let mut buf = queue.buf.lock();
            buf.push(obj);
            if buf.len() >= self.buffer_size.load(Ordering::Acquire) {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };
        if let Some(buffer) = full {
            self.completed.lock().push_back(buffer);
        }
    }

    pub fn completed_buffers_num(&self) -> usize {
        self.completed.lock().len()
    }

    /// Whether enough completed buffers are queued to wake the
    /// marker (the regular clock's SATB-pressure test).
    pub fn process_completed_buffers(&self) -> bool {
        self.completed_buffers_num() > self.process_completed_threshold.load(Ordering::Acquire)
    }

    /// Claim one completed buffer, remove it from the set and apply
    /// the closure to each logged reference. Returns false when no
    /// buffer was available.
    pub fn apply_closure_to_completed_buffer(&self, cl: &mut dyn ReferenceVisitor) -> bool {
        let buffer = self.completed.lock().pop_front();
        match buffer {
            Some(buffer) => {
                for obj in buffer {
                    cl.visit_ref(obj);
                }
                true
            }
            None => false,
        }
    }

    /// Sweep every thread's in-flight buffer, applying the closure
    /// and emptying it. Only runs at a safepoint (remark).
    pub fn iterate_closure_all_threads(&self, cl: &mut dyn ReferenceVisitor) {
        for queue in self.queues.lock().iter() {
            let buffer = std::mem::take(&mut *queue.buf.lock());
            for obj in buffer {
                cl.visit_ref(obj);
            }
        }
    }

    /// Throw away all logged references after an aborted cycle.
    pub fn abandon_partial_marking(&self) {
        self.completed.lock().clear();
        for queue in self.queues.lock().iter() {
            queue.buf.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_queue_drops_entries() {
        let set = SatbQueueSet::new(4, 0);
        let q = set.register_queue();
        set.enqueue(&q, 0x1000);
        assert_eq!(set.completed_buffers_num(), 0);
        let mut seen = vec![];
        set.iterate_closure_all_threads(&mut |obj: usize| seen.push(obj));
        assert!(seen.is_empty());
    }

    #[test]
    fn full_buffer_spills_to_completed_list() {
        let set = SatbQueueSet::new(2, 0);
        set.set_active_all_threads(true);
        let q = set.register_queue();
        set.enqueue(&q, 0x1000);
        assert_eq!(set.completed_buffers_num(), 0);
        set.enqueue(&q, 0x1008);
        assert_eq!(set.completed_buffers_num(), 1);
        assert!(set.process_completed_buffers());

        let mut seen = vec![];
        assert!(set.apply_closure_to_completed_buffer(&mut |obj: usize| seen.push(obj)));
        assert_eq!(seen, vec![0x1000, 0x1008]);
        assert!(!set.apply_closure_to_completed_buffer(&mut |_: usize| {}));
    }

    #[test]
    fn remark_sweep_covers_inflight_buffers() {
        let set = SatbQueueSet::new(16, 0);
        set.set_active_all_threads(true);
        let q1 = set.register_queue();
        let q2 = set.register_queue();
        set.enqueue(&q1, 0x1000);
        set.enqueue(&q2, 0x2000);
        let mut seen = vec![];
        set.iterate_closure_all_threads(&mut |obj: usize| seen.push(obj));
        seen.sort();
        assert_eq!(seen, vec![0x1000, 0x2000]);
        // The sweep empties the buffers.
        seen.clear();
        set.iterate_closure_all_threads(&mut |obj: usize| seen.push(obj));
        assert!(seen.is_empty());
    }

    #[test]
    fn abandon_discards_everything() {
        let set = SatbQueueSet::new(1, 0);
        set.set_active_all_threads(true);
        let q = set.register_queue();
        set.enqueue(&q, 0x1000);
        assert_eq!(set.completed_buffers_num(), 1);
        set.abandon_partial_marking();
        assert_eq!(set.completed_buffers_num(), 0);
    }

    #[test]
    fn late_registration_inherits_active_state() {
        let set = SatbQueueSet::new(8, 0);
        set.set_active_all_threads(true);
        let q = set.register_queue();
        assert!(q.is_active());
    }
}
