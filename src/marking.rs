//! The per-worker marking task.
//!
//! A task is constructed once and reset per cycle. Its
//! [`do_marking_step`](MarkingTask::do_marking_step) is the building
//! block of the parallel marking framework: it drains SATB buffers,
//! rescans region-stack residues, claims heap regions off the global
//! finger, scans their bitmap range, steals from peers and finally
//! offers termination. The step is abortable at the regular clock and
//! resumable: all progress lives in persistent task fields, so
//! resumption is simply the next call.

use std::time::Instant;

use crossbeam_deque::{Steal, Stealer, Worker};
use log::{debug, trace};

use crate::heap::{CollectedHeap, ReferenceVisitor};
use crate::marker::ConcurrentMarker;
use crate::memory::{MemRegion, BYTES_PER_WORD};
use crate::stats::{NumberSeq, TaskStats};

/// Entries moved between a local queue and the global mark stack in
/// one transfer.
pub(crate) const GLOBAL_STACK_TRANSFER_SIZE: usize = 1024;

pub struct MarkingTask {
    task_id: usize,
    worker: Worker<usize>,
    max_elems: usize,

    concurrent: bool,
    claimed: bool,
    has_aborted: bool,
    has_timed_out: bool,
    draining_satb: bool,

    /// Index of the region being scanned, if any.
    curr_region: Option<usize>,
    /// Scan position inside the claimed region; zero when none.
    finger: usize,
    region_limit: usize,
    /// Scan position inside a sub-region popped off the region
    /// stack. Kept apart from `finger` so rescans never advance the
    /// claim protocol.
    region_finger: usize,

    words_scanned: usize,
    refs_reached: usize,
    words_scanned_limit: usize,
    real_words_scanned_limit: usize,
    refs_reached_limit: usize,
    real_refs_reached_limit: usize,

    start_time: Instant,
    time_target_ms: f64,

    calls: usize,
    elapsed_time_ms: f64,
    termination_time_ms: f64,
    step_times: NumberSeq,
    /// Overshoot history; its prediction is shaved off the next
    /// step's budget.
    step_diffs: NumberSeq,
    stats: TaskStats,
}

/// Applies a task's marking closure to each visited reference.
struct TaskRefVisitor<'a, H: CollectedHeap> {
    task: &'a mut MarkingTask,
    cm: &'a ConcurrentMarker<H>,
}

impl<'a, H: CollectedHeap> ReferenceVisitor for TaskRefVisitor<'a, H> {
    #[inline]
    fn visit_ref(&mut self, obj: usize) {
        self.task.deal_with_reference(self.cm, obj);
    }
}

impl MarkingTask {
    pub fn new(task_id: usize, max_elems: usize) -> (Self, Stealer<usize>) {
        let worker = Worker::new_lifo();
        let stealer = worker.stealer();
        let task = Self {
            task_id,
            worker,
            max_elems,
            concurrent: false,
            claimed: false,
            has_aborted: false,
            has_timed_out: false,
            draining_satb: false,
            curr_region: None,
            finger: 0,
            region_limit: 0,
            region_finger: 0,
            words_scanned: 0,
            refs_reached: 0,
            words_scanned_limit: 0,
            real_words_scanned_limit: 0,
            refs_reached_limit: 0,
            real_refs_reached_limit: 0,
            start_time: Instant::now(),
            time_target_ms: 0.0,
            calls: 0,
            elapsed_time_ms: 0.0,
            termination_time_ms: 0.0,
            step_times: NumberSeq::new(),
            step_diffs: NumberSeq::new(),
            stats: TaskStats::default(),
        };
        (task, stealer)
    }

    #[inline]
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    #[inline]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted
    }

    #[inline]
    pub fn set_has_aborted(&mut self) {
        self.has_aborted = true;
    }

    #[inline]
    pub fn clear_has_aborted(&mut self) {
        self.has_aborted = false;
    }

    #[inline]
    pub fn set_concurrent(&mut self, concurrent: bool) {
        self.concurrent = concurrent;
    }

    /// The task's claim position, consulted when the evacuator forms
    /// a collection set.
    #[inline]
    pub fn finger(&self) -> usize {
        self.finger
    }

    #[inline]
    pub fn local_queue_size(&self) -> usize {
        self.worker.len()
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    pub fn elapsed_time_ms(&self) -> f64 {
        self.elapsed_time_ms
    }

    pub fn termination_time_ms(&self) -> f64 {
        self.termination_time_ms
    }

    pub fn step_times(&self) -> &NumberSeq {
        &self.step_times
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Per-cycle reset. Runs in a stop-the-world phase.
    pub fn reset(&mut self) {
        self.clear_region_fields();
        self.has_aborted = false;
        self.has_timed_out = false;
        self.draining_satb = false;
        self.calls = 0;
        self.elapsed_time_ms = 0.0;
        self.termination_time_ms = 0.0;
        self.stats.reset();
        while self.worker.pop().is_some() {}
    }

    pub fn clear_region_fields(&mut self) {
        self.curr_region = None;
        self.finger = 0;
        self.region_limit = 0;
        self.region_finger = 0;
    }

    fn elapsed_ms(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64() * 1000.0
    }

    fn recalculate_limits<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>) {
        let opts = cm.opts();
        self.real_words_scanned_limit = self.words_scanned + opts.words_scanned_period;
        self.words_scanned_limit = self.real_words_scanned_limit;
        self.real_refs_reached_limit = self.refs_reached + opts.refs_reached_period;
        self.refs_reached_limit = self.real_refs_reached_limit;
    }

    /// Pull the limits in ahead of an infrequent expensive operation
    /// so the clock fires sooner afterwards.
    fn decrease_limits<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>) {
        let opts = cm.opts();
        self.words_scanned_limit =
            self.real_words_scanned_limit - 3 * opts.words_scanned_period / 4;
        self.refs_reached_limit = self.real_refs_reached_limit - 3 * opts.refs_reached_period / 4;
    }

    fn reached_limit<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>) {
        debug_assert!(
            self.words_scanned >= self.words_scanned_limit
                || self.refs_reached >= self.refs_reached_limit
        );
        self.regular_clock_call(cm);
    }

    /// The work-based clock. Rechecks every abort condition in a
    /// fixed order; cheap enough to be called from the hot paths.
    fn regular_clock_call<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>) {
        if self.has_aborted {
            return;
        }
        self.recalculate_limits(cm);

        if cm.has_overflown() {
            self.set_has_aborted();
            return;
        }
        // Everything below only applies to the concurrent phase.
        if !self.concurrent {
            return;
        }
        if cm.has_aborted() {
            self.set_has_aborted();
            self.stats.aborted_cm_aborted += 1;
            return;
        }
        if cm.should_yield() {
            self.set_has_aborted();
            self.stats.aborted_yield += 1;
            return;
        }
        if self.elapsed_ms() > self.time_target_ms {
            self.set_has_aborted();
            self.has_timed_out = true;
            self.stats.aborted_timed_out += 1;
            return;
        }
        if !self.draining_satb && cm.satb_queue_set().process_completed_buffers() {
            self.set_has_aborted();
            self.stats.aborted_satb += 1;
        }
    }

    /// The marking closure: grays `obj` if the snapshot considers it
    /// ill, then decides queue membership against the three fingers.
    pub fn deal_with_reference<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>, obj: usize) {
        self.refs_reached += 1;
        if self.refs_reached >= self.refs_reached_limit {
            self.reached_limit(cm);
        }

        if obj == 0 || !cm.heap().is_in_reserved(obj) {
            return;
        }
        let ill = match cm.heap().region_containing(obj) {
            Some(hr) => {
                !hr.obj_allocated_since_next_marking(obj) && !cm.next_bitmap().is_marked(obj)
            }
            None => false,
        };
        if !ill {
            return;
        }
        if !cm.next_bitmap().par_mark(obj) {
            // Somebody else won the race; the winner queues it.
            return;
        }
        let global_finger = cm.finger();
        if self.finger != 0 && obj < self.finger {
            // Behind our local scan; it will not be revisited.
            self.push(cm, obj);
        } else if self.curr_region.is_some() && obj < self.region_limit {
            // Ahead of us inside the claimed region; our own bitmap
            // scan will reach it.
        } else if obj < global_finger {
            // The global finger may move concurrently; the worst case
            // is a duplicate visit when a claimant also finds the
            // mark on the bitmap.
            self.push(cm, obj);
        }
        // Above the global finger: a future claimant will observe the
        // mark and push it then.
    }

    /// Visit the reference slots of `obj` and account its size
    /// against the words-scanned budget.
    pub fn scan_object<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>, obj: usize) {
        debug_assert!(cm.next_bitmap().is_marked(obj));
        {
            let mut visitor = TaskRefVisitor { task: self, cm };
            cm.heap().object_iterate(obj, &mut visitor);
        }
        self.stats.objs_scanned += 1;
        self.words_scanned += cm.heap().object_size(obj);
        if self.words_scanned >= self.words_scanned_limit {
            self.reached_limit(cm);
        }
    }

    /// Queue a gray reference locally, spilling a chunk to the global
    /// mark stack at the watermark.
    fn push<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>, obj: usize) {
        debug_assert!(cm.next_bitmap().is_marked(obj));
        if self.worker.len() >= self.max_elems {
            self.move_entries_to_global_stack(cm);
        }
        self.worker.push(obj);
        self.stats.note_local_push(self.worker.len());
    }

    fn move_entries_to_global_stack<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>) {
        let mut buffer = [0usize; GLOBAL_STACK_TRANSFER_SIZE];
        let mut n = 0;
        while n < GLOBAL_STACK_TRANSFER_SIZE {
            match self.worker.pop() {
                Some(obj) => {
                    buffer[n] = obj;
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 {
            self.stats.global_transfers_to += 1;
            self.stats.local_pops += n;
            if !cm.mark_stack_push_arr(&buffer[..n]) {
                debug!("[{}] aborting due to global stack overflow", self.task_id);
                self.set_has_aborted();
            } else {
                self.stats.global_pushes += n;
            }
        }
        self.decrease_limits(cm);
    }

    fn get_entries_from_global_stack<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>) {
        let mut buffer = [0usize; GLOBAL_STACK_TRANSFER_SIZE];
        let n = cm.mark_stack().par_pop_arr(&mut buffer);
        if n > 0 {
            self.stats.global_transfers_from += 1;
            self.stats.global_pops += n;
            for &obj in buffer.iter().take(n) {
                self.worker.push(obj);
                self.stats.note_local_push(self.worker.len());
            }
        }
        self.decrease_limits(cm);
    }

    /// Pop-and-scan until the queue reaches the target: a third of
    /// capacity when partial (leaving entries for stealers), empty
    /// otherwise.
    pub fn drain_local_queue<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>, partially: bool) {
        if self.has_aborted {
            return;
        }
        let target = if partially {
            (self.max_elems / 3).min(cm.opts().drain_stack_target_size)
        } else {
            0
        };
        while self.worker.len() > target {
            match self.worker.pop() {
                Some(obj) => {
                    self.stats.local_pops += 1;
                    self.scan_object(cm, obj);
                    if self.has_aborted {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    pub fn drain_global_stack<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>, partially: bool) {
        if self.has_aborted {
            return;
        }
        // Local work is always drained before global work.
        debug_assert!(partially || self.worker.is_empty());
        let target = if partially {
            cm.opts().partial_mark_stack_size_target()
        } else {
            0
        };
        while !self.has_aborted && cm.mark_stack().size() > target {
            self.get_entries_from_global_stack(cm);
            self.drain_local_queue(cm, partially);
        }
    }

    /// Claim and apply the marking closure to completed SATB buffers
    /// until they run out or the clock demands an abort. During
    /// remark the in-flight buffers of every mutator are swept too.
    pub fn drain_satb_buffers<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>) {
        if self.has_aborted {
            return;
        }
        // Keep the clock from aborting for SATB pressure while we are
        // the ones relieving it.
        self.draining_satb = true;
        loop {
            if self.has_aborted {
                break;
            }
            let processed = {
                let mut visitor = TaskRefVisitor { task: self, cm };
                cm.satb_queue_set()
                    .apply_closure_to_completed_buffer(&mut visitor)
            };
            if !processed {
                break;
            }
            self.stats.satb_buffers_processed += 1;
            self.regular_clock_call(cm);
        }
        if !self.concurrent && !self.has_aborted {
            let mut visitor = TaskRefVisitor { task: self, cm };
            cm.satb_queue_set().iterate_closure_all_threads(&mut visitor);
        }
        self.draining_satb = false;

        debug_assert!(
            self.has_aborted
                || self.concurrent
                || cm.satb_queue_set().completed_buffers_num() == 0
        );
        self.decrease_limits(cm);
    }

    /// Scan the *next* bitmap over `mr`. Each marked address moves
    /// the appropriate finger, gets scanned and is followed by a
    /// partial drain. Returns false iff the scan aborted mid-way.
    fn bitmap_scan<H: CollectedHeap>(
        &mut self,
        cm: &ConcurrentMarker<H>,
        mr: MemRegion,
        scanning_heap_region: bool,
    ) -> bool {
        let this = &mut *self;
        cm.next_bitmap().iterate(
            &mut |addr| {
                debug_assert!(cm.next_bitmap().is_marked(addr));
                debug_assert!(addr < cm.finger());
                if scanning_heap_region {
                    this.stats.objs_found_on_bitmap += 1;
                    debug_assert!(addr >= this.finger);
                    this.finger = addr;
                } else {
                    this.region_finger = addr;
                }
                this.scan_object(cm, addr);
                this.drain_local_queue(cm, true);
                this.drain_global_stack(cm, true);
                !this.has_aborted
            },
            mr,
        )
    }

    /// Fully drain the region stack. An aborted sub-region scan
    /// pushes its unscanned tail back for a later task.
    pub fn drain_region_stack<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>) {
        if self.has_aborted {
            return;
        }
        debug_assert!(self.region_finger == 0);
        if cm.region_stack().is_empty() {
            return;
        }

        let mut mr = cm.region_stack().pop();
        if mr.start() != 0 {
            self.stats.region_stack_pops += 1;
        }
        while mr.start() != 0 {
            debug_assert!(!mr.is_empty());
            debug_assert!(mr.end() <= cm.finger());
            if self.bitmap_scan(cm, mr, false) {
                self.regular_clock_call(cm);
                if self.has_aborted {
                    mr = MemRegion::empty();
                } else {
                    mr = cm.region_stack().pop();
                    if mr.start() != 0 {
                        self.stats.region_stack_pops += 1;
                    }
                }
            } else {
                debug_assert!(self.has_aborted);
                // The region finger sits on the last scanned object;
                // resume one bitmap granule past it.
                debug_assert!(self.region_finger != 0);
                let rest = MemRegion::new(self.region_finger + BYTES_PER_WORD, mr.end());
                if !rest.is_empty() {
                    cm.region_stack_push(rest);
                }
                mr = MemRegion::empty();
            }
            self.region_finger = 0;
        }
    }

    fn setup_for_region<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>, region_index: usize) {
        let r = cm.heap().region_at(region_index);
        debug_assert!(!r.continues_humongous());
        self.curr_region = Some(region_index);
        self.finger = r.bottom();
        self.update_region_limit(cm);
    }

    fn update_region_limit<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>) {
        let r = cm.heap().region_at(self.curr_region.expect("no current region"));
        let bottom = r.bottom();
        let limit = r.next_top_at_mark_start();

        if limit == bottom {
            // The region was emptied underneath our feet; park the
            // finger so the bitmap scan is a no-op.
            self.finger = bottom;
        } else if limit >= self.region_limit {
            // Unchanged, or freshly claimed.
        } else {
            // NTAMS retreated: the region was emptied and then reused
            // as an allocation region, so every mark in it was pushed
            // explicitly and nothing is left for us to scan.
            self.finger = limit;
        }
        self.region_limit = limit;
    }

    fn giveup_current_region(&mut self) {
        debug_assert!(self.curr_region.is_some());
        self.clear_region_fields();
    }

    /// One marking step. See the module docs; the protocol follows
    /// the phase description in the coordinator.
    pub fn do_marking_step<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>, time_target_ms: f64) {
        debug_assert!(time_target_ms >= 1.0, "minimum granularity is 1ms");
        debug_assert!(self.concurrent == cm.concurrent());
        debug_assert!(self.concurrent || cm.region_stack().is_empty());
        debug_assert!(self.region_finger == 0);
        debug_assert!(!self.claimed, "only one thread per task at a time");
        self.claimed = true;

        self.start_time = Instant::now();
        // Shave the predicted overshoot off the budget.
        self.time_target_ms = (time_target_ms - self.step_diffs.predict()).max(1.0);

        self.words_scanned = 0;
        self.refs_reached = 0;
        self.recalculate_limits(cm);
        self.has_aborted = false;
        self.has_timed_out = false;
        self.draining_satb = false;
        self.calls += 1;

        trace!(
            "[{}] >>>> start, call = {}, target = {:.2}ms",
            self.task_id,
            self.calls,
            self.time_target_ms
        );

        // A latched overflow (e.g. raised while this task was parked
        // at a yield point) sends us straight into the barrier
        // protocol at the bottom of this step.
        if cm.has_overflown() {
            self.set_has_aborted();
        }

        // SATB first; the clock will bring us back here if buffers
        // pile up again.
        self.drain_satb_buffers(cm);
        self.drain_local_queue(cm, true);
        self.drain_global_stack(cm, true);

        // Then the region stack, completely. It only grows during
        // evacuation pauses, for which we abort anyway, so it will
        // not be revisited within this step.
        self.drain_region_stack(cm);
        self.drain_local_queue(cm, true);
        self.drain_global_stack(cm, true);

        loop {
            if !self.has_aborted && self.curr_region.is_some() {
                debug_assert!(self.finger != 0);
                // An evacuation pause may have moved NTAMS since we
                // claimed (or since we last aborted inside) this
                // region.
                self.update_region_limit(cm);
                let mr = MemRegion::new(self.finger, self.region_limit);
                if mr.is_empty() || self.bitmap_scan(cm, mr, true) {
                    self.giveup_current_region();
                    self.regular_clock_call(cm);
                } else {
                    debug_assert!(self.has_aborted);
                    // The local finger sits on the last scanned
                    // object; the next step resumes one granule past
                    // it.
                    self.finger += BYTES_PER_WORD;
                }
            }

            self.drain_local_queue(cm, true);
            self.drain_global_stack(cm, true);

            while !self.has_aborted && self.curr_region.is_none() && !cm.out_of_regions() {
                debug_assert!(self.finger == 0 && self.region_limit == 0);
                if let Some(region_index) = cm.claim_region(self.task_id) {
                    self.stats.regions_claimed += 1;
                    self.setup_for_region(cm, region_index);
                }
                // Claiming can take a while over a run of empty
                // regions; keep the clock honest.
                self.regular_clock_call(cm);
            }

            if self.curr_region.is_none() || self.has_aborted {
                break;
            }
        }

        if !self.has_aborted {
            debug_assert!(cm.out_of_regions());
            // Give remark less SATB work to do.
            self.drain_satb_buffers(cm);
        }

        // Now drain everything, completely.
        self.drain_local_queue(cm, false);
        self.drain_global_stack(cm, false);

        if !self.has_aborted {
            debug_assert!(cm.out_of_regions() && self.worker.is_empty());
            loop {
                if self.has_aborted {
                    break;
                }
                self.stats.steal_attempts += 1;
                match cm.try_stealing(self.task_id, &self.worker) {
                    Some(obj) => {
                        self.stats.steals += 1;
                        debug_assert!(cm.next_bitmap().is_marked(obj));
                        self.scan_object(cm, obj);
                        self.drain_local_queue(cm, false);
                        self.drain_global_stack(cm, false);
                    }
                    None => break,
                }
            }
        }

        if !self.has_aborted {
            debug_assert!(cm.out_of_regions() && self.worker.is_empty());
            let termination_start = Instant::now();
            let finished = cm.offer_termination(self);
            self.termination_time_ms += termination_start.elapsed().as_secs_f64() * 1000.0;
            if finished {
                if self.task_id == 0 && self.concurrent {
                    // Ensure no further heap expansions are observed
                    // by this marking cycle.
                    cm.clear_concurrent_marking_in_progress();
                }
            } else {
                // A peer found more work; retry.
                self.set_has_aborted();
                self.stats.aborted_termination += 1;
            }
        }

        let elapsed_ms = self.elapsed_ms();
        self.step_times.add(elapsed_ms);
        self.elapsed_time_ms += elapsed_ms;

        if self.has_aborted {
            self.stats.aborted += 1;
            if self.has_timed_out {
                self.step_diffs.add(elapsed_ms - self.time_target_ms);
            }
            if cm.has_overflown() {
                self.stats.aborted_overflow += 1;
                cm.enter_first_sync_barrier(self.task_id);
                // Global state is cleared by task 0 between the
                // barriers; every task clears its own.
                self.clear_region_fields();
                while self.worker.pop().is_some() {}
                cm.enter_second_sync_barrier(self.task_id);
            }
            trace!(
                "[{}] <<<< aborted, target = {:.2}ms, elapsed = {:.2}ms",
                self.task_id,
                self.time_target_ms,
                elapsed_ms
            );
        } else {
            trace!(
                "[{}] <<<< finished, target = {:.2}ms, elapsed = {:.2}ms",
                self.task_id,
                self.time_target_ms,
                elapsed_ms
            );
        }
        self.claimed = false;
    }

    /// Consulted from the termination protocol: leave early when the
    /// global stack has work or this task was aborted.
    pub(crate) fn should_exit_termination<H: CollectedHeap>(&mut self, cm: &ConcurrentMarker<H>) -> bool {
        self.regular_clock_call(cm);
        !cm.mark_stack().is_empty() || self.has_aborted
    }

    pub(crate) fn drain_worker_via(stealer: &Stealer<usize>) -> Vec<usize> {
        let mut out = Vec::new();
        loop {
            match stealer.steal() {
                Steal::Success(obj) => out.push(obj),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        out
    }

    pub fn print_stats(&self) {
        debug!(
            "Marking stats, task = {}, calls = {}\n  Elapsed = {:.2}ms, Termination = {:.2}ms\n  Step times: num = {}, avg = {:.2}ms, sd = {:.2}ms, max = {:.2}ms\n{}",
            self.task_id,
            self.calls,
            self.elapsed_time_ms,
            self.termination_time_ms,
            self.step_times.num(),
            self.step_times.avg(),
            self.step_times.sd(),
            self.step_times.maximum(),
            self.stats
        );
    }
}
