//! The mark coordinator.
//!
//! Owns the two mark bitmaps, the global mark and region stacks, the
//! marking tasks, the global finger and the overflow-restart
//! barriers, and drives the four-phase cycle: initial-mark
//! (stop-the-world), concurrent-mark, remark (stop-the-world) and
//! cleanup (stop-the-world plus parallel workers).
//!
//! Stop-the-world entry points take `&mut self` and assume the world
//! is stopped by the embedding runtime's safepoint machinery; the
//! concurrent phase shares `&self` across the worker gang.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_deque::{Steal, Stealer, Worker};
use crossbeam_utils::CachePadded;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;

use crate::bitmap::{MarkBitmap, ParFlagBitmap};
use crate::config::{MarkingOptions, WorkerPlan};
use crate::gang::WorkGang;
use crate::heap::{CollectedHeap, ReferenceVisitor};
use crate::mark_stack::{MarkStack, RegionStack};
use crate::marking::MarkingTask;
use crate::memory::{MemRegion, BYTES_PER_WORD};
use crate::refs::{ReferenceProcessor, SoftRefPolicy};
use crate::region::HeapRegion;
use crate::safepoint::SuspendibleThreadSet;
use crate::satb::SatbQueueSet;
use crate::stats::NumberSeq;
use crate::sync_barrier::WorkerBarrier;
use crate::terminator::{ParallelTaskTerminator, TerminatorTerminator};
use crate::utils::formatted_size;
use crate::GcError;

/// Private mark stack depth for the in-collection-set completion
/// pass.
const CSET_MARK_STACK_SIZE: usize = 1000;

/// Bitmap bytes cleared per chunk between yield checks.
const BITMAP_CLEAR_CHUNK: usize = 1024 * 1024;

struct TaskCell(UnsafeCell<MarkingTask>);

// Tasks are handed out one per worker; the claimed flag inside the
// task catches protocol violations in debug builds.
unsafe impl Sync for TaskCell {}

#[derive(Default)]
struct PhaseTimes {
    init_times: NumberSeq,
    remark_times: NumberSeq,
    remark_mark_times: NumberSeq,
    remark_weak_ref_times: NumberSeq,
    cleanup_times: NumberSeq,
    total_counting_time: f64,
    total_rs_scrub_time: f64,
}

/// What cleanup hands to the collector policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupStats {
    pub live_bytes: usize,
    pub used_bytes: usize,
    pub known_garbage_bytes: usize,
    pub freed_bytes: usize,
    pub max_live_bytes: usize,
}

impl std::fmt::Display for CleanupStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "live = {}, used = {}, known garbage = {}, freed = {}, max live = {}",
            formatted_size(self.live_bytes),
            formatted_size(self.used_bytes),
            formatted_size(self.known_garbage_bytes),
            formatted_size(self.freed_bytes),
            formatted_size(self.max_live_bytes)
        )
    }
}

pub struct ConcurrentMarker<H: CollectedHeap> {
    heap: Arc<H>,
    opts: MarkingOptions,
    plan: WorkerPlan,

    prev_bitmap: MarkBitmap,
    next_bitmap: MarkBitmap,

    heap_start: usize,
    heap_end: AtomicUsize,
    finger: CachePadded<AtomicUsize>,

    mark_stack: MarkStack,
    region_stack: RegionStack,

    tasks: Vec<TaskCell>,
    stealers: Vec<Stealer<usize>>,
    max_task_num: usize,
    active_tasks: AtomicUsize,

    terminator: ParallelTaskTerminator,
    first_overflow_barrier: WorkerBarrier,
    second_overflow_barrier: WorkerBarrier,
    overflow_restarts: AtomicUsize,

    has_overflown: AtomicBool,
    has_aborted: AtomicBool,
    concurrent: AtomicBool,
    /// Heap-facing: a cycle's *next* marks are being built.
    mark_in_progress: AtomicBool,
    /// The concurrent phase proper is running; gates heap-end
    /// updates and gray-on-copy support.
    concurrent_marking_in_progress: AtomicBool,
    restart_for_overflow: AtomicBool,
    at_least_one_mark_complete: AtomicBool,

    /// Gray-on-copy latch, recomputed per collection set.
    should_gray_objects: AtomicBool,
    min_finger: AtomicUsize,

    region_bm: ParFlagBitmap,
    card_bm: ParFlagBitmap,
    /// Fully-dead regions found by cleanup, reclaimed in
    /// `complete_cleanup`.
    pending_reclaim: Mutex<Vec<usize>>,

    satb: SatbQueueSet,
    ref_processor: ReferenceProcessor,
    sts: SuspendibleThreadSet,
    gang: Option<WorkGang>,
    /// Unique token source for chunked parallel region passes.
    claim_seq: AtomicUsize,

    accum_task_vtime: Mutex<Vec<f64>>,
    phase_times: Mutex<PhaseTimes>,
    last_cleanup: Mutex<CleanupStats>,
}

unsafe impl<H: CollectedHeap> Sync for ConcurrentMarker<H> {}
unsafe impl<H: CollectedHeap + Send> Send for ConcurrentMarker<H> {}

struct TaskTerminatorView<'a, H: CollectedHeap> {
    cm: &'a ConcurrentMarker<H>,
    task: &'a mut MarkingTask,
}

impl<'a, H: CollectedHeap> TerminatorTerminator for TaskTerminatorView<'a, H> {
    fn should_exit_termination(&mut self) -> bool {
        self.task.should_exit_termination(self.cm)
    }
}

impl<H: CollectedHeap> ConcurrentMarker<H> {
    pub fn new(heap: Arc<H>, opts: MarkingOptions) -> Result<Self, GcError> {
        opts.validate()?;
        let reserved = heap.reserved();
        let prev_bitmap = MarkBitmap::new("prev-mark", reserved.start(), reserved.byte_size())?;
        let next_bitmap = MarkBitmap::new("next-mark", reserved.start(), reserved.byte_size())?;

        let plan = opts.worker_plan();
        let max_task_num = opts.gc_threads.max(1);

        let mut tasks = Vec::with_capacity(max_task_num);
        let mut stealers = Vec::with_capacity(max_task_num);
        for task_id in 0..max_task_num {
            let (task, stealer) = MarkingTask::new(task_id, opts.task_queue_max_elems);
            tasks.push(TaskCell(UnsafeCell::new(task)));
            stealers.push(stealer);
        }

        let cards = (reserved.byte_size() + opts.card_size() - 1) >> opts.card_shift;
        let satb = SatbQueueSet::new(opts.satb_buffer_size, opts.satb_process_completed_threshold);

        let gang = if plan.marking_threads > 0 {
            Some(WorkGang::new(max_task_num))
        } else {
            None
        };

        debug!(
            "marking engine init: heap = [{:#x}, {:#x}), {} tasks, {} marking threads",
            reserved.start(),
            reserved.end(),
            max_task_num,
            plan.marking_threads
        );

        let this = Self {
            heap_start: reserved.start(),
            heap_end: AtomicUsize::new(heap.committed().end()),
            finger: CachePadded::new(AtomicUsize::new(reserved.start())),
            mark_stack: MarkStack::new(opts.mark_stack_size),
            region_stack: RegionStack::new(opts.region_stack_size),
            region_bm: ParFlagBitmap::new(heap.max_regions()),
            card_bm: ParFlagBitmap::new(cards),
            pending_reclaim: Mutex::new(Vec::new()),
            tasks,
            stealers,
            max_task_num,
            active_tasks: AtomicUsize::new(0),
            terminator: ParallelTaskTerminator::new(),
            first_overflow_barrier: WorkerBarrier::new(),
            second_overflow_barrier: WorkerBarrier::new(),
            overflow_restarts: AtomicUsize::new(0),
            has_overflown: AtomicBool::new(false),
            has_aborted: AtomicBool::new(false),
            concurrent: AtomicBool::new(false),
            mark_in_progress: AtomicBool::new(false),
            concurrent_marking_in_progress: AtomicBool::new(false),
            restart_for_overflow: AtomicBool::new(false),
            at_least_one_mark_complete: AtomicBool::new(false),
            should_gray_objects: AtomicBool::new(false),
            min_finger: AtomicUsize::new(0),
            satb,
            ref_processor: ReferenceProcessor::new(),
            sts: SuspendibleThreadSet::new(),
            gang,
            claim_seq: AtomicUsize::new(0),
            accum_task_vtime: Mutex::new(vec![0.0; max_task_num]),
            phase_times: Mutex::new(PhaseTimes::default()),
            last_cleanup: Mutex::new(CleanupStats::default()),
            prev_bitmap,
            next_bitmap,
            heap,
            opts,
            plan,
        };
        Ok(this)
    }

    // ----- accessors ----------------------------------------------

    #[inline]
    pub fn heap(&self) -> &H {
        &self.heap
    }

    #[inline]
    pub fn opts(&self) -> &MarkingOptions {
        &self.opts
    }

    #[inline]
    pub fn prev_bitmap(&self) -> &MarkBitmap {
        &self.prev_bitmap
    }

    #[inline]
    pub fn next_bitmap(&self) -> &MarkBitmap {
        &self.next_bitmap
    }

    #[inline]
    pub fn mark_stack(&self) -> &MarkStack {
        &self.mark_stack
    }

    #[inline]
    pub fn region_stack(&self) -> &RegionStack {
        &self.region_stack
    }

    #[inline]
    pub fn satb_queue_set(&self) -> &SatbQueueSet {
        &self.satb
    }

    #[inline]
    pub fn ref_processor(&self) -> &ReferenceProcessor {
        &self.ref_processor
    }

    #[inline]
    pub fn suspendible_thread_set(&self) -> &SuspendibleThreadSet {
        &self.sts
    }

    #[inline]
    pub fn finger(&self) -> usize {
        self.finger.load(Ordering::Acquire)
    }

    #[inline]
    pub fn heap_end(&self) -> usize {
        self.heap_end.load(Ordering::Acquire)
    }

    #[inline]
    pub fn out_of_regions(&self) -> bool {
        self.finger() >= self.heap_end()
    }

    #[inline]
    pub fn concurrent(&self) -> bool {
        self.concurrent.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_overflown(&self) -> bool {
        self.has_overflown.load(Ordering::Acquire)
    }

    pub fn set_has_overflown(&self) {
        self.has_overflown.store(true, Ordering::Release);
    }

    pub fn clear_has_overflown(&self) {
        self.has_overflown.store(false, Ordering::Release);
    }

    #[inline]
    pub fn mark_in_progress(&self) -> bool {
        self.mark_in_progress.load(Ordering::Acquire)
    }

    #[inline]
    pub fn concurrent_marking_in_progress(&self) -> bool {
        self.concurrent_marking_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn clear_concurrent_marking_in_progress(&self) {
        self.concurrent_marking_in_progress
            .store(false, Ordering::Release);
    }

    #[inline]
    pub fn restart_for_overflow(&self) -> bool {
        self.restart_for_overflow.load(Ordering::Acquire)
    }

    #[inline]
    pub fn at_least_one_mark_complete(&self) -> bool {
        self.at_least_one_mark_complete.load(Ordering::Acquire)
    }

    pub fn overflow_restarts(&self) -> usize {
        self.overflow_restarts.load(Ordering::Acquire)
    }

    /// Completed rendezvous counts of the two restart barriers.
    /// Diagnostic only.
    pub fn overflow_barrier_generations(&self) -> (usize, usize) {
        (
            self.first_overflow_barrier.generation(),
            self.second_overflow_barrier.generation(),
        )
    }

    #[inline]
    pub fn should_yield(&self) -> bool {
        self.sts.should_yield()
    }

    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Acquire)
    }

    pub fn last_cleanup_stats(&self) -> CleanupStats {
        *self.last_cleanup.lock()
    }

    /// One task per worker; callers outside the worker protocol must
    /// hold the world stopped.
    #[allow(clippy::mut_from_ref)]
    unsafe fn task_mut(&self, index: usize) -> &mut MarkingTask {
        &mut *self.tasks[index].0.get()
    }

    fn task_finger(&self, index: usize) -> usize {
        unsafe { (*self.tasks[index].0.get()).finger() }
    }

    // ----- snapshot predicates ------------------------------------

    /// Ill = below its region's NTAMS and not yet marked in *next*.
    pub fn is_obj_ill(&self, obj: usize) -> bool {
        match self.heap.region_containing(obj) {
            Some(hr) => {
                !hr.obj_allocated_since_next_marking(obj) && !self.next_bitmap.is_marked(obj)
            }
            None => false,
        }
    }

    // ----- global stacks ------------------------------------------

    pub fn mark_stack_push(&self, obj: usize) -> bool {
        if !self.mark_stack.par_push(obj) {
            self.set_has_overflown();
            return false;
        }
        true
    }

    pub fn mark_stack_push_arr(&self, arr: &[usize]) -> bool {
        if !self.mark_stack.par_push_arr(arr) {
            self.set_has_overflown();
            return false;
        }
        true
    }

    pub fn mark_stack_pop(&self) -> Option<usize> {
        self.mark_stack.pop()
    }

    pub fn region_stack_push(&self, mr: MemRegion) -> bool {
        if !self.region_stack.push(mr) {
            self.set_has_overflown();
            return false;
        }
        true
    }

    pub fn region_stack_pop(&self) -> MemRegion {
        self.region_stack.pop()
    }

    // ----- finger protocol ----------------------------------------

    /// Claim the region under the finger by CASing the finger to its
    /// end. Returns the claimed region's index, or `None` when the
    /// CAS lost, the region was empty, or the heap is exhausted; the
    /// caller retries until `out_of_regions()`.
    pub fn claim_region(&self, task_id: usize) -> Option<usize> {
        let mut finger = self.finger();
        while finger < self.heap_end() {
            let r = match self.heap.region_containing(finger) {
                Some(r) => r,
                None => return None,
            };
            let bottom = r.bottom();
            let end = r.end();
            let limit = r.next_top_at_mark_start();

            match self
                .finger
                .compare_exchange(finger, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return if limit > bottom {
                        trace!("[{}] claimed region {} [{:#x}, {:#x})", task_id, r.index(), bottom, end);
                        Some(r.index())
                    } else {
                        // Nothing to scan here; the finger moved, the
                        // caller just claims again.
                        debug_assert!(limit == bottom);
                        None
                    };
                }
                Err(current) => {
                    debug_assert!(current > finger, "the finger only moves forward");
                    finger = current;
                }
            }
        }
        None
    }

    /// Refresh `heap_end` from the committed range. Declined while
    /// the concurrent phase is in progress (unless forced at a
    /// stop-the-world point), so a cycle never claims regions past
    /// the bound it started with.
    pub fn update_committed(&self, force: bool) {
        if self.concurrent_marking_in_progress() && !force {
            return;
        }
        let committed = self.heap.committed();
        debug_assert!(committed.start() == self.heap_start);
        let new_end = committed.end();
        if new_end > self.heap_end() {
            self.heap_end.store(new_end, Ordering::Release);
        }
    }

    // ----- stealing -----------------------------------------------

    pub fn try_stealing(&self, task_id: usize, worker: &Worker<usize>) -> Option<usize> {
        if self.stealers.len() == 1 {
            return None;
        }
        let active = self.active_tasks().max(1).min(self.stealers.len());
        if active == 1 {
            return None;
        }
        let mut rng = thread_rng();
        let range = Uniform::new(0, active);

        for _ in 0..2 * active {
            let mut victim = task_id;
            while victim == task_id {
                victim = range.sample(&mut rng);
            }
            loop {
                match self.stealers[victim].steal_batch_and_pop(worker) {
                    Steal::Empty => break,
                    Steal::Success(obj) => return Some(obj),
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    pub(crate) fn offer_termination(&self, task: &mut MarkingTask) -> bool {
        let mut view = TaskTerminatorView { cm: self, task };
        self.terminator.offer_termination(&mut view)
    }

    // ----- overflow barrier protocol ------------------------------

    /// Both barriers are entered with the safepoint token released so
    /// a stop-the-world pause initiated while tasks wait here cannot
    /// deadlock against the rendezvous.
    pub(crate) fn enter_first_sync_barrier(&self, task_id: usize) {
        trace!("[{}] entering first barrier", task_id);
        let concurrent = self.concurrent();
        if concurrent {
            self.sts.leave();
        }
        self.first_overflow_barrier.enter();
        if concurrent {
            self.sts.join();
        }

        if task_id == 0 {
            self.overflow_restarts.fetch_add(1, Ordering::AcqRel);
            self.clear_marking_state();
            info!("concurrent-mark-reset-for-overflow");
        }
    }

    pub(crate) fn enter_second_sync_barrier(&self, task_id: usize) {
        trace!("[{}] entering second barrier", task_id);
        let concurrent = self.concurrent();
        if concurrent {
            self.sts.leave();
        }
        self.second_overflow_barrier.enter();
        if concurrent {
            self.sts.join();
        }
        // Everything is re-initialised; the cycle restarts from
        // bitmap scanning.
    }

    fn clear_marking_state(&self) {
        self.mark_stack.set_empty();
        self.mark_stack.clear_overflow();
        self.region_stack.set_empty();
        self.region_stack.clear_overflow();
        self.clear_has_overflown();
        self.finger.store(self.heap_start, Ordering::Release);
        for stealer in &self.stealers {
            let _ = MarkingTask::drain_worker_via(stealer);
        }
    }

    fn set_non_marking_state(&self) {
        self.clear_marking_state();
        self.active_tasks.store(0, Ordering::Release);
        self.clear_concurrent_marking_in_progress();
    }

    fn set_phase(&self, active_tasks: usize, concurrent: bool) {
        debug_assert!(active_tasks <= self.max_task_num);
        self.active_tasks.store(active_tasks, Ordering::Release);
        self.terminator.set_n_tasks(active_tasks);
        self.first_overflow_barrier.set_n_workers(active_tasks);
        self.second_overflow_barrier.set_n_workers(active_tasks);
        self.concurrent.store(concurrent, Ordering::Release);
        for i in 0..self.max_task_num {
            unsafe { self.task_mut(i).set_concurrent(concurrent) };
        }
        if concurrent {
            self.concurrent_marking_in_progress
                .store(true, Ordering::Release);
        } else {
            debug_assert!(!self.concurrent_marking_in_progress());
            // The only point where a cycle may observe a grown heap.
            self.update_committed(true);
        }
    }

    // ----- phase 1: initial mark ----------------------------------

    /// Mark all roots into *next*. Stop-the-world, piggy-backed on an
    /// evacuation pause by the runtime.
    pub fn checkpoint_roots_initial(&mut self) {
        let start = Instant::now();
        self.has_aborted.store(false, Ordering::Release);

        self.reset();

        // Capture NTAMS on every region before any root is grayed.
        let heap = self.heap.clone();
        for i in 0..heap.num_regions() {
            let r = heap.region_at(i);
            if !r.continues_humongous() {
                r.note_start_of_marking();
            }
        }
        self.region_bm.clear_all();
        self.card_bm.clear_all();

        let this: &Self = self;
        heap.process_strong_roots(&mut |obj: usize| this.gray_root(obj));

        self.ref_processor.enable_discovery();
        self.satb.set_active_all_threads(true);
        self.mark_in_progress.store(true, Ordering::Release);

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        self.phase_times.lock().init_times.add(elapsed);
        debug!("concurrent-mark-init took {:.2}ms", elapsed);
    }

    fn reset(&mut self) {
        let committed = self.heap.committed();
        debug_assert!(committed.start() == self.heap_start && !committed.is_empty());
        self.heap_end.store(committed.end(), Ordering::Release);

        self.clear_marking_state();
        self.restart_for_overflow.store(false, Ordering::Release);
        for i in 0..self.max_task_num {
            unsafe { self.task_mut(i).reset() };
        }
        // Keep the flag up throughout the pause that hosts us.
        self.concurrent_marking_in_progress
            .store(true, Ordering::Release);
    }

    /// Called by the root-scanning closure for each reachable
    /// reference. Only marks; the bitmap scan will find and push it.
    pub fn gray_root(&self, obj: usize) {
        debug_assert!(
            self.heap.committed().contains(obj),
            "root outside the heap: {:#x}",
            obj
        );
        if !self.next_bitmap.is_marked(obj) {
            self.next_bitmap.par_mark(obj);
        }
    }

    // ----- phase 2: concurrent mark -------------------------------

    pub fn mark_from_roots(&self) {
        self.restart_for_overflow.store(false, Ordering::Release);
        let active = self.plan.marking_threads.max(1);
        self.set_phase(active, true);

        match (&self.gang, self.plan.marking_threads) {
            (Some(gang), n) if n > 0 => {
                gang.run_task(active, |worker_id| self.concurrent_mark_work(worker_id))
            }
            // Sequential fallback: run task 0 in the caller's thread.
            _ => self.concurrent_mark_work(0),
        }
        self.print_task_stats();
    }

    fn concurrent_mark_work(&self, worker_id: usize) {
        let start_vtime = Instant::now();
        self.sts.join();

        debug_assert!(worker_id < self.active_tasks());
        let task = unsafe { self.task_mut(worker_id) };
        if !self.has_aborted() {
            loop {
                let step_start = Instant::now();
                task.do_marking_step(self, self.opts.marking_step_target_ms);
                let elapsed_ms = step_start.elapsed().as_secs_f64() * 1000.0;

                self.do_yield_check();

                if !self.has_aborted() && task.has_aborted() && self.plan.sleep_factor > 0.0 {
                    // Pace ourselves to the configured overhead.
                    let sleep_ms = (elapsed_ms * self.plan.sleep_factor) as u64;
                    if sleep_ms > 0 {
                        self.sts.leave();
                        std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
                        self.sts.join();
                    }
                }
                if self.has_aborted() || !task.has_aborted() {
                    break;
                }
            }
        }
        self.sts.leave();
        self.accum_task_vtime.lock()[worker_id] += start_vtime.elapsed().as_secs_f64();
    }

    /// Yield to a pending stop-the-world pause. Returns whether we
    /// yielded.
    pub fn do_yield_check(&self) -> bool {
        if self.sts.should_yield() {
            self.sts.yield_slow();
            true
        } else {
            false
        }
    }

    // ----- phase 3: remark ----------------------------------------

    /// Drain SATB residuals and terminate marking. Stop-the-world.
    /// Returns whether an overflow forced a restart of the
    /// concurrent phase.
    pub fn checkpoint_roots_final(&mut self, clear_all_soft_refs: bool) -> bool {
        if self.has_aborted() {
            // A full collection intervened; show the sweeper a
            // consistent (empty) result.
            self.mark_in_progress.store(false, Ordering::Release);
            return false;
        }
        let start = Instant::now();

        // The concurrent phase ran the finger to the end; only the
        // forced committed-range refresh below may open new regions.
        debug_assert!(self.out_of_regions());

        // Remark uses every available thread; the sequential fallback
        // runs a single task in the caller.
        let active = if self.gang.is_some() { self.max_task_num } else { 1 };
        self.set_phase(active, false);

        let this: &Self = self;
        match &self.gang {
            Some(gang) => gang.run_task(active, |worker_id| this.remark_work(worker_id)),
            None => this.remark_work(0),
        }
        let mark_work_end = Instant::now();

        self.weak_refs_work(clear_all_soft_refs);

        // Remark-step overflows were absorbed by the barrier protocol
        // above; a flag still up here came from the un-barriered
        // weak-reference drain and forces a restart of the concurrent
        // phase.
        let restart = self.has_overflown();
        if restart {
            self.restart_for_overflow.store(true, Ordering::Release);
            self.clear_has_overflown();
            self.mark_stack.clear_overflow();
            self.region_stack.clear_overflow();
            info!("Remark led to restart for overflow.");
        } else {
            debug_assert!(self.satb.completed_buffers_num() == 0);
            self.satb.set_active_all_threads(false);
            self.set_non_marking_state();
        }
        self.print_task_stats();

        let now = Instant::now();
        {
            let mut times = self.phase_times.lock();
            times
                .remark_mark_times
                .add(mark_work_end.duration_since(start).as_secs_f64() * 1000.0);
            times
                .remark_weak_ref_times
                .add(now.duration_since(mark_work_end).as_secs_f64() * 1000.0);
            times
                .remark_times
                .add(now.duration_since(start).as_secs_f64() * 1000.0);
        }
        restart
    }

    fn remark_work(&self, worker_id: usize) {
        if worker_id >= self.active_tasks() {
            return;
        }
        let task = unsafe { self.task_mut(worker_id) };
        loop {
            // Effectively unbounded budget. An overflow inside the
            // step goes through the barrier protocol, which resets
            // the global state; the step comes back aborted with the
            // flag already clear, so we retry within this same pause
            // until marking converges.
            task.do_marking_step(self, 1_000_000_000.0);
            if !task.has_aborted() || self.has_overflown() {
                break;
            }
        }
    }

    fn weak_refs_work(&self, clear_all_soft_refs: bool) {
        debug_assert!(self.mark_stack.is_empty() || self.has_overflown());
        let policy = if clear_all_soft_refs {
            SoftRefPolicy::AlwaysClear
        } else {
            SoftRefPolicy::KeepAll
        };

        let heap = &*self.heap;
        let mut is_alive =
            |obj: usize| -> bool { !heap.is_in_reserved(obj) || !self.is_obj_ill(obj) };
        let mut keep_alive = |obj: usize| {
            if heap.is_in_reserved(obj) && self.is_obj_ill(obj) {
                self.next_bitmap.mark(obj);
                self.mark_stack_push(obj);
            }
        };
        // Non-yielding drain: scan until the global stack is dry,
        // graying transitively reachable referents.
        let mut drain = || {
            while let Some(obj) = self.mark_stack.pop() {
                debug_assert!(self.next_bitmap.is_marked(obj));
                heap.object_iterate(obj, &mut |r: usize| {
                    if heap.is_in_reserved(r) && self.is_obj_ill(r) {
                        self.next_bitmap.mark(r);
                        self.mark_stack_push(r);
                    }
                });
            }
        };

        self.ref_processor
            .process_discovered_references(policy, &mut is_alive, &mut keep_alive, &mut drain);

        if self.mark_stack.overflow() {
            self.set_has_overflown();
        }
    }

    // ----- phase 4: cleanup ---------------------------------------

    /// Count live data per region, install *next* as *prev*, and
    /// stage fully-dead regions for reclamation. Stop-the-world plus
    /// parallel workers. Returns `None` after an aborted cycle.
    pub fn cleanup(&mut self) -> Option<CleanupStats> {
        if self.has_aborted() {
            self.mark_in_progress.store(false, Ordering::Release);
            return None;
        }
        let start = Instant::now();

        let (live_bytes, used_bytes) = self.final_count_pass();
        let known_garbage_bytes = used_bytes.saturating_sub(live_bytes);

        self.at_least_one_mark_complete.store(true, Ordering::Release);
        self.mark_in_progress.store(false, Ordering::Release);

        let counting_ms = start.elapsed().as_secs_f64() * 1000.0;
        if self.opts.print_cleanup_stats {
            debug!("cleanup: finalize counting {:.3}ms", counting_ms);
        }
        self.phase_times.lock().total_counting_time += counting_ms / 1000.0;

        // Install the newly built marks as the previous-cycle view.
        self.swap_mark_bitmaps();

        let (freed_bytes, max_live_bytes) = self.note_end_pass();

        if self.opts.scrub_remembered_sets {
            let scrub_start = Instant::now();
            let this: &Self = self;
            let scrub_worker = |worker_id: usize| {
                this.heap
                    .scrub_remembered_set(&this.region_bm, &this.card_bm, worker_id)
            };
            match &self.gang {
                Some(gang) => gang.run_task(gang.total_workers(), scrub_worker),
                None => scrub_worker(0),
            }
            self.phase_times.lock().total_rs_scrub_time += scrub_start.elapsed().as_secs_f64();
        }

        let stats = CleanupStats {
            live_bytes,
            used_bytes,
            known_garbage_bytes,
            freed_bytes,
            max_live_bytes,
        };
        *self.last_cleanup.lock() = stats;
        self.phase_times
            .lock()
            .cleanup_times
            .add(start.elapsed().as_secs_f64() * 1000.0);
        debug!("cleanup: {}", stats);

        if self.opts.verify_conc_mark {
            self.verify_live_counts();
        }
        Some(stats)
    }

    /// Hand the regions cleanup found fully dead back to the heap.
    pub fn complete_cleanup(&self) {
        if self.has_aborted() {
            return;
        }
        let pending = std::mem::take(&mut *self.pending_reclaim.lock());
        for index in pending {
            let r = self.heap.region_at(index);
            let bytes = self.heap.free_totally_dead_region(r);
            trace!("reclaimed region {} ({} bytes)", index, bytes);
        }
    }

    /// Stop-the-world final counting with yield disabled. Returns
    /// `(live_bytes, used_bytes)` over all regions.
    fn final_count_pass(&self) -> (usize, usize) {
        let live = AtomicUsize::new(0);
        let used = AtomicUsize::new(0);
        let claim = self.next_claim_value();
        let count_worker = |worker_id: usize| {
            let mut tot_live = 0;
            let mut tot_used = 0;
            self.for_each_claimed_region(worker_id, claim, &mut |r| {
                self.calc_live_for_region(r, true, false, &mut tot_live, &mut tot_used);
                false
            });
            live.fetch_add(tot_live, Ordering::AcqRel);
            used.fetch_add(tot_used, Ordering::AcqRel);
        };
        match &self.gang {
            Some(gang) => gang.run_task(gang.total_workers(), count_worker),
            None => count_worker(0),
        }
        (live.load(Ordering::Acquire), used.load(Ordering::Acquire))
    }

    /// Note the end of marking on every region and stage the fully
    /// dead ones for reclamation. Returns `(freed_bytes,
    /// max_live_bytes)`.
    fn note_end_pass(&self) -> (usize, usize) {
        let freed = AtomicUsize::new(0);
        let max_live = AtomicUsize::new(0);
        let claim = self.next_claim_value();
        let note_end_worker = |worker_id: usize| {
            let worker_start = Instant::now();
            let mut regions_claimed = 0usize;
            self.for_each_claimed_region(worker_id, claim, &mut |r| {
                r.reset_gc_time_stamp();
                if !r.continues_humongous() {
                    regions_claimed += 1;
                    r.note_end_of_marking();
                    max_live.fetch_add(r.max_live_bytes(), Ordering::AcqRel);
                    if r.used() > 0 && r.next_live_bytes() == 0 {
                        freed.fetch_add(r.used(), Ordering::AcqRel);
                        self.pending_reclaim.lock().push(r.index());
                    }
                }
                false
            });
            if self.opts.print_cleanup_stats {
                debug!(
                    "cleanup: worker {} claimed {} regions in {:.3}ms",
                    worker_id,
                    regions_claimed,
                    worker_start.elapsed().as_secs_f64() * 1000.0
                );
            }
        };
        match &self.gang {
            Some(gang) => gang.run_task(gang.total_workers(), note_end_worker),
            None => note_end_worker(0),
        }
        (freed.load(Ordering::Acquire), max_live.load(Ordering::Acquire))
    }

    fn swap_mark_bitmaps(&mut self) {
        std::mem::swap(&mut self.prev_bitmap, &mut self.next_bitmap);
    }

    fn next_claim_value(&self) -> u32 {
        // Never zero: regions start with a zero token.
        (self.claim_seq.fetch_add(1, Ordering::AcqRel) + 1) as u32
    }

    /// Chunked parallel region iteration: workers start at spread
    /// offsets and claim regions with a per-pass token, so no region
    /// is processed twice. The closure returns true to stop the walk.
    fn for_each_claimed_region(
        &self,
        worker_id: usize,
        claim_value: u32,
        cl: &mut dyn FnMut(&HeapRegion) -> bool,
    ) {
        let n = self.heap.num_regions();
        if n == 0 {
            return;
        }
        let workers = self.gang.as_ref().map_or(1, |g| g.total_workers());
        let start = n * worker_id / workers.max(1);
        for i in 0..n {
            let r = self.heap.region_at((start + i) % n);
            if r.try_claim(claim_value) && cl(r) {
                break;
            }
        }
    }

    // ----- live counting ------------------------------------------

    /// Concurrent pre-count: iterate until a fixpoint so cleanup has
    /// less to do. Cooperates with safepoints; call only after
    /// marking has terminated.
    pub fn calc_desired_regions(&self) {
        self.region_bm.clear_all();
        self.card_bm.clear_all();
        self.sts.join();
        let mut regions_done = 0usize;
        let mut interval_start = Instant::now();
        loop {
            let mut changed = false;
            let mut live = 0;
            let mut used = 0;
            for i in 0..self.heap.num_regions() {
                let r = self.heap.region_at(i);
                match self.calc_live_for_region(r, false, true, &mut live, &mut used) {
                    RegionCount::Counted(c) => changed |= c,
                    RegionCount::Abandoned => continue,
                    RegionCount::AbortedAll => {
                        self.sts.leave();
                        return;
                    }
                }
                // Pace the pre-count to the cleanup overhead target.
                regions_done += 1;
                if regions_done % 10 == 0 && self.plan.cleanup_sleep_factor > 0.0 {
                    let elapsed_ms = interval_start.elapsed().as_secs_f64() * 1000.0;
                    if elapsed_ms > 10.0 {
                        let sleep_ms = (elapsed_ms * self.plan.cleanup_sleep_factor) as u64;
                        self.sts.leave();
                        std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
                        self.sts.join();
                        interval_start = Instant::now();
                    }
                }
            }
            if !changed {
                break;
            }
        }
        self.sts.leave();
    }

    /// Count live words in `[top_at_conc_mark_count, NTAMS)` of one
    /// region, marking the cards every live object spans. The final
    /// pass also covers the implicitly-live `[NTAMS, top)` suffix.
    fn calc_live_for_region(
        &self,
        r: &HeapRegion,
        final_pass: bool,
        allow_yield: bool,
        tot_live: &mut usize,
        tot_used: &mut usize,
    ) -> RegionCount {
        if r.continues_humongous() {
            return RegionCount::Counted(false);
        }
        let ntams = r.next_top_at_mark_start();
        let mut cursor = r.top_at_conc_mark_count();
        debug_assert!(r.bottom() <= cursor && cursor <= ntams && ntams <= r.end());

        let bitmap = &self.next_bitmap;
        let card_shift = self.opts.card_shift;
        let bottom_card = self.heap_start >> card_shift;

        let mut changed = false;
        let mut marked_bytes = 0usize;
        // Last card already flagged, so runs of small objects do not
        // re-set the same card.
        let mut last_card: Option<usize> = None;

        cursor = bitmap.next_marked_word(cursor, ntams);
        while cursor < ntams {
            if allow_yield && self.should_yield() {
                self.do_yield_check();
                if self.has_aborted() {
                    return RegionCount::AbortedAll;
                }
                // A pause ran; the region may now be in a collection
                // set. Abandon it and let the next pass retry.
                return RegionCount::Abandoned;
            }
            let size_words = self.heap.object_size(cursor);
            let size_bytes = size_words * BYTES_PER_WORD;

            let first_card = cursor >> card_shift;
            let last_obj_card = (cursor + size_bytes - 1) >> card_shift;
            let from = match last_card {
                Some(last) if first_card <= last => last + 1,
                _ => first_card,
            };
            for card in from..=last_obj_card {
                self.card_bm.par_set(card - bottom_card);
            }
            last_card = Some(last_obj_card);

            marked_bytes += size_bytes;
            changed = true;
            cursor = bitmap.next_marked_word(cursor + BYTES_PER_WORD, ntams);
        }

        if final_pass {
            // Everything allocated since the snapshot is live.
            let top = r.top();
            if ntams < top {
                for card in (ntams >> card_shift)..=((top - 1) >> card_shift) {
                    self.card_bm.par_set(card - bottom_card);
                }
                self.region_bm.par_set(r.index());
            }
        }

        r.add_to_marked_bytes(marked_bytes);
        if marked_bytes > 0 {
            self.region_bm.par_set(r.index());
        }
        r.set_top_at_conc_mark_count(ntams);
        *tot_live += r.next_live_bytes();
        *tot_used += r.used();
        RegionCount::Counted(changed)
    }

    /// Post-cleanup consistency pass: recompute live bytes from the
    /// *prev* bitmap and compare against the per-region counters.
    fn verify_live_counts(&self) {
        for i in 0..self.heap.num_regions() {
            let r = self.heap.region_at(i);
            if r.continues_humongous() {
                continue;
            }
            // After the swap, NTAMS still delimits the range the
            // finished cycle counted.
            let ntams = r.next_top_at_mark_start();
            let mut expected = 0usize;
            let mut cursor = self.prev_bitmap.next_marked_word(r.bottom(), ntams);
            while cursor < ntams {
                expected += self.heap.object_size(cursor) * BYTES_PER_WORD;
                cursor = self
                    .prev_bitmap
                    .next_marked_word(cursor + BYTES_PER_WORD, ntams);
            }
            if expected != r.prev_marked_bytes() {
                warn!(
                    "region {}: counted {} marked bytes, bitmap says {}",
                    i,
                    r.prev_marked_bytes(),
                    expected
                );
                debug_assert_eq!(expected, r.prev_marked_bytes());
            }
        }
    }

    // ----- abort (full collection) --------------------------------

    /// Abandon the cycle: a full collection owns the heap now. The
    /// caller guarantees marking workers are quiesced at a safepoint.
    pub fn abort(&self) {
        self.next_bitmap.clear_all();
        self.clear_marking_state();
        for i in 0..self.max_task_num {
            unsafe { self.task_mut(i).clear_region_fields() };
        }
        self.has_aborted.store(true, Ordering::Release);
        self.clear_concurrent_marking_in_progress();
        self.satb.abandon_partial_marking();
        self.satb.set_active_all_threads(false);
        self.ref_processor.abandon();
        warn!("concurrent marking aborted for full collection");
    }

    /// Clear *next* between cycles, in chunks with yield checks.
    /// Joins the safepoint token for the duration.
    pub fn clear_next_bitmap(&self) {
        debug_assert!(!self.mark_in_progress());
        self.sts.join();
        let mut cursor = self.heap_start;
        let end = self.heap.reserved().end();
        while cursor < end {
            let next = (cursor + BITMAP_CLEAR_CHUNK).min(end);
            self.next_bitmap.clear_range(MemRegion::new(cursor, next));
            cursor = next;
            self.do_yield_check();
        }
        self.sts.leave();
    }

    // ----- evacuation support -------------------------------------

    /// Process every logged SATB reference with the global closure.
    /// Used inside evacuation pauses.
    pub fn drain_all_satb_buffers(&self) {
        let this: &Self = self;
        let mut cl = |obj: usize| this.deal_with_reference(obj);
        while self.satb.apply_closure_to_completed_buffer(&mut cl) {}
        self.satb.iterate_closure_all_threads(&mut cl);
        debug_assert!(self.satb.completed_buffers_num() == 0);
    }

    /// The coordinator-level marking closure: mark and, when below
    /// the global finger, push on the global mark stack. Used by the
    /// SATB drain above and by in-cset completion.
    pub fn deal_with_reference(&self, obj: usize) {
        if obj == 0 || !self.heap.is_in_reserved(obj) {
            return;
        }
        if !self.is_obj_ill(obj) {
            return;
        }
        if self.next_bitmap.par_mark(obj) {
            let finger = self.finger();
            if obj < finger && !self.mark_stack_push(obj) {
                debug!("global stack overflow during deal_with_reference");
            }
        }
    }

    /// Gray an object the evacuator copied below the finger.
    pub fn mark_and_gray_object_if_necessary(&self, obj: usize) {
        if self.next_bitmap.is_marked(obj) {
            return;
        }
        if self.next_bitmap.par_mark(obj) {
            if !self.concurrent_marking_in_progress() || !self.should_gray_objects() {
                return;
            }
            let finger = self.finger();
            if obj < finger && !self.mark_stack_push(obj) {
                debug!("global stack overflow during gray-on-copy");
            }
        }
    }

    /// Queue a bulk-marked range for rescanning when it landed below
    /// the finger.
    pub fn gray_region_if_necessary(&self, mr: MemRegion) {
        if !self.concurrent_marking_in_progress() || !self.should_gray_objects() {
            return;
        }
        let finger = self.finger();
        if mr.start() < finger {
            debug_assert!(mr.end() <= finger, "ranges never span a region boundary");
            if !self.region_stack_push(mr) {
                debug!("region stack overflow during gray-on-copy");
            }
        }
    }

    #[inline]
    pub fn should_gray_objects(&self) -> bool {
        self.should_gray_objects.load(Ordering::Acquire)
    }

    /// A new collection set is being formed: find the minimum of the
    /// global and per-task fingers. Copies below it need no explicit
    /// graying unless the region stack holds work.
    pub fn new_cset(&self) {
        if !self.concurrent_marking_in_progress() {
            return;
        }
        let mut min_finger = self.finger();
        for i in 0..self.max_task_num {
            let task_finger = self.task_finger(i);
            if task_finger != 0 && task_finger < min_finger {
                min_finger = task_finger;
            }
        }
        self.min_finger.store(min_finger, Ordering::Release);
        // Region-stack entries may point at objects that get copied;
        // stay conservative while any are queued.
        self.should_gray_objects
            .store(!self.region_stack.is_empty(), Ordering::Release);
    }

    /// Called by the evacuator for each region put in the collection
    /// set.
    pub fn register_cset_region(&self, r: &HeapRegion) {
        if !self.concurrent_marking_in_progress() {
            return;
        }
        if r.end() > self.min_finger.load(Ordering::Acquire) {
            self.should_gray_objects.store(true, Ordering::Release);
        }
    }

    /// Rewrite all in-flight references during evacuation: the global
    /// mark stack residuals, every task queue, then drop region-stack
    /// entries pointing into the collection set. Safepoint only.
    pub fn oops_do(&self, cl: &mut dyn FnMut(&mut usize)) {
        self.mark_stack.set_oops_do_bound();
        self.mark_stack.oops_do(cl);

        // Task queues cannot be edited in place; drain them through
        // their stealers, fix the entries, and park them on the
        // global mark stack. They stay gray either way.
        for stealer in &self.stealers {
            let mut entries = MarkingTask::drain_worker_via(stealer);
            if entries.is_empty() {
                continue;
            }
            for slot in entries.iter_mut() {
                cl(slot);
            }
            if !self.mark_stack_push_arr(&entries) {
                debug!("global stack overflow while migrating task queues");
            }
        }

        let heap = self.heap.clone();
        let invalidated = self.region_stack.invalidate_entries_into_cset(&|start| {
            heap.region_containing(start)
                .map_or(false, |r| r.in_collection_set())
        });
        if invalidated {
            debug_assert!(self.should_gray_objects());
        }
    }

    /// Finish marking inside collection-set regions before they are
    /// evacuated, following forwarding pointers for objects that
    /// already moved (or self-forwarded on evacuation failure).
    /// Afterwards the cset marks are cleared; survivors get re-marked
    /// at their new location.
    pub fn complete_marking_in_collection_set(&self) {
        if !self.mark_in_progress() {
            return;
        }
        let start = Instant::now();
        loop {
            if self.complete_cset_marking_pass() {
                break;
            }
        }
        for i in 0..self.heap.num_regions() {
            let r = self.heap.region_at(i);
            if r.in_collection_set() && !r.used_region().is_empty() {
                self.next_bitmap.clear_range(r.used_region());
            }
        }
        debug!(
            "in-cset completion marking took {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
    }

    /// One attempt; false means a private stack filled up and the
    /// pass must rerun (marks keep it monotone).
    fn complete_cset_marking_pass(&self) -> bool {
        for i in 0..self.heap.num_regions() {
            let r = self.heap.region_at(i);
            if !r.in_collection_set() {
                continue;
            }
            let mr = MemRegion::new(r.bottom(), r.next_top_at_mark_start());
            if mr.is_empty() {
                continue;
            }
            let mut stack: Vec<usize> = Vec::with_capacity(CSET_MARK_STACK_SIZE);
            let mut overflowed = false;
            let completed = self.next_bitmap.iterate(
                &mut |addr| {
                    if self.heap.is_forwarded(addr) {
                        return true;
                    }
                    stack.push(addr);
                    while let Some(obj) = stack.pop() {
                        let mut visitor = CsetRefVisitor {
                            cm: self,
                            stack: &mut stack,
                            overflowed: &mut overflowed,
                        };
                        self.heap.object_iterate(obj, &mut visitor);
                        if overflowed {
                            return false;
                        }
                    }
                    true
                },
                mr,
            );
            if !completed {
                return false;
            }
        }
        true
    }

    // ----- card queries -------------------------------------------

    /// Card-bitmap query for the remembered-set scrubber.
    pub fn containing_card_is_marked(&self, addr: usize) -> bool {
        let offset = addr - self.heap.reserved().start();
        self.card_bm.at(offset >> self.opts.card_shift)
    }

    pub fn containing_cards_are_marked(&self, start: usize, last: usize) -> bool {
        self.containing_card_is_marked(start) && self.containing_card_is_marked(last)
    }

    // ----- reporting ----------------------------------------------

    fn print_task_stats(&self) {
        if log::log_enabled!(log::Level::Debug) {
            for i in 0..self.active_tasks().min(self.max_task_num) {
                unsafe { self.task_mut(i) }.print_stats();
            }
        }
    }

    pub fn print_summary_info(&self) {
        let times = self.phase_times.lock();
        let fmt = |name: &str, seq: &NumberSeq| {
            format!(
                "{:>5} {:>12}: total = {:8.2}s (avg = {:8.2}ms)",
                seq.num(),
                name,
                seq.sum() / 1000.0,
                seq.avg()
            )
        };
        info!(
            "concurrent marking summary:\n  {}\n  {}\n     {}\n     {}\n  {}\n  counting total = {:.2}s, rs scrub total = {:.2}s, overflow restarts = {}\n  last cleanup: {}",
            fmt("init marks", &times.init_times),
            fmt("remarks", &times.remark_times),
            fmt("final marks", &times.remark_mark_times),
            fmt("weak refs", &times.remark_weak_ref_times),
            fmt("cleanups", &times.cleanup_times),
            times.total_counting_time,
            times.total_rs_scrub_time,
            self.overflow_restarts(),
            self.last_cleanup_stats(),
        );
    }

    pub fn accumulated_task_vtime(&self, worker_id: usize) -> f64 {
        self.accum_task_vtime.lock()[worker_id]
    }
}

enum RegionCount {
    /// Pass finished the region; payload says whether anything new
    /// was counted.
    Counted(bool),
    /// Yielded mid-region; retry on the next fixpoint pass.
    Abandoned,
    /// A full collection aborted everything.
    AbortedAll,
}

struct CsetRefVisitor<'a, H: CollectedHeap> {
    cm: &'a ConcurrentMarker<H>,
    stack: &'a mut Vec<usize>,
    overflowed: &'a mut bool,
}

impl<'a, H: CollectedHeap> ReferenceVisitor for CsetRefVisitor<'a, H> {
    fn visit_ref(&mut self, obj: usize) {
        if obj == 0 || *self.overflowed {
            return;
        }
        // Follow forwarding so evacuation-failure self-forwarded
        // objects resolve to themselves.
        let obj = if self.cm.heap().is_forwarded(obj) {
            self.cm.heap().forwardee(obj)
        } else {
            obj
        };
        let hr = match self.cm.heap().region_containing(obj) {
            Some(hr) => hr,
            None => return,
        };
        if hr.in_collection_set() {
            if self.cm.is_obj_ill(obj) {
                self.cm.next_bitmap().mark(obj);
                if self.stack.len() >= CSET_MARK_STACK_SIZE {
                    debug!("in-cset mark stack is full");
                    *self.overflowed = true;
                } else {
                    self.stack.push(obj);
                }
            }
        } else {
            // Outside the collection set: gray through the normal
            // protocol.
            self.cm.deal_with_reference(obj);
        }
    }
}
