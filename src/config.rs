//! Marking engine configuration.
//!
//! All knobs have defaults tuned for a pause-time-targeted
//! collector; embedders override what they need. The worker count
//! can be given explicitly or derived from a CPU-overhead target
//! against the pause-time goal.

use crate::GcError;

#[derive(Clone, Debug)]
pub struct MarkingOptions {
    /// Explicit marking worker count. `None` derives one; `Some(0)`
    /// is rejected (use `gc_threads = 0` for the sequential
    /// fallback).
    pub parallel_marking_threads: Option<usize>,
    /// Number of parallel GC threads the embedding runtime uses.
    /// Zero selects the sequential in-caller-thread fallback.
    pub gc_threads: usize,
    /// Target CPU overhead (percent) used to derive the worker count
    /// and per-step sleep ratio when no explicit count is set.
    pub marking_overhead_percent: usize,
    /// Soft real-time goal the overhead derivation works against.
    pub max_pause_time_ms: f64,
    pub time_slice_ms: f64,

    /// Capacity of the global mark stack, in entries.
    pub mark_stack_size: usize,
    /// Capacity of the global region stack, in entries.
    pub region_stack_size: usize,
    /// Watermark above which a task spills its local queue to the
    /// global mark stack.
    pub task_queue_max_elems: usize,

    /// Entries per SATB log buffer.
    pub satb_buffer_size: usize,
    /// Completed-buffer count above which the regular clock aborts a
    /// step to go process them.
    pub satb_process_completed_threshold: usize,

    /// Cap on the local-queue partial drain target.
    pub drain_stack_target_size: usize,

    /// Regular-clock granularity, in object words scanned.
    pub words_scanned_period: usize,
    /// Regular-clock granularity, in references reached.
    pub refs_reached_period: usize,

    /// Wall-clock budget handed to each concurrent marking step.
    pub marking_step_target_ms: f64,

    /// log2 of the card size in bytes.
    pub card_shift: usize,

    /// Run the post-cleanup consistency pass.
    pub verify_conc_mark: bool,
    /// Let cleanup scrub remembered sets with the card bitmap.
    pub scrub_remembered_sets: bool,
    /// Emit per-worker cleanup timing.
    pub print_cleanup_stats: bool,
}

impl Default for MarkingOptions {
    fn default() -> Self {
        Self {
            parallel_marking_threads: None,
            gc_threads: num_cpus::get(),
            marking_overhead_percent: 0,
            max_pause_time_ms: 30.0,
            time_slice_ms: 500.0,
            mark_stack_size: 32 * 1024,
            region_stack_size: 4 * 1024,
            task_queue_max_elems: 16 * 1024,
            satb_buffer_size: 1024,
            satb_process_completed_threshold: 20,
            drain_stack_target_size: 64,
            words_scanned_period: 12 * 1024,
            refs_reached_period: 384,
            marking_step_target_ms: 10.0,
            card_shift: 9,
            verify_conc_mark: false,
            scrub_remembered_sets: false,
            print_cleanup_stats: false,
        }
    }
}

/// Worker counts and sleep ratios derived from the options.
#[derive(Clone, Copy, Debug)]
pub struct WorkerPlan {
    /// Marking workers; zero means sequential-in-caller-thread.
    pub marking_threads: usize,
    pub sleep_factor: f64,
    pub marking_task_overhead: f64,
    pub cleanup_sleep_factor: f64,
}

impl MarkingOptions {
    pub fn validate(&self) -> Result<(), GcError> {
        if self.parallel_marking_threads == Some(0) {
            return Err(GcError::Configuration(
                "explicit marking thread count must be non-zero".into(),
            ));
        }
        if let Some(n) = self.parallel_marking_threads {
            if n > self.gc_threads.max(1) {
                return Err(GcError::Configuration(format!(
                    "cannot have more marking threads ({}) than GC threads ({})",
                    n, self.gc_threads
                )));
            }
        }
        if self.mark_stack_size == 0 || self.region_stack_size == 0 {
            return Err(GcError::Configuration("stack capacities must be non-zero".into()));
        }
        if self.marking_step_target_ms < 1.0 {
            return Err(GcError::Configuration(
                "marking step granularity is 1ms".into(),
            ));
        }
        Ok(())
    }

    pub fn worker_plan(&self) -> WorkerPlan {
        let (marking_threads, sleep_factor, marking_task_overhead);
        if self.gc_threads == 0 {
            // No parallel GC threads: no marking threads either.
            marking_threads = 0;
            sleep_factor = 0.0;
            marking_task_overhead = 1.0;
        } else if let Some(n) = self.parallel_marking_threads {
            // An explicit count overrides the overhead target.
            marking_threads = n;
            sleep_factor = 0.0;
            marking_task_overhead = 1.0;
        } else if self.marking_overhead_percent > 0 {
            let marking_overhead = self.marking_overhead_percent as f64 / 100.0;
            let overall_overhead =
                self.max_pause_time_ms * marking_overhead / self.time_slice_ms;
            let cpu_ratio = 1.0 / num_cpus::get() as f64;
            let thread_num = (overall_overhead / cpu_ratio).ceil().max(1.0);
            let task_overhead = overall_overhead / thread_num * num_cpus::get() as f64;
            marking_threads = thread_num as usize;
            marking_task_overhead = task_overhead;
            sleep_factor = (1.0 - task_overhead) / task_overhead;
        } else {
            marking_threads = ((self.gc_threads + 2) / 4).max(1);
            sleep_factor = 0.0;
            marking_task_overhead = 1.0;
        }

        let cleanup_task_overhead = if marking_threads > 1 {
            1.0
        } else {
            marking_task_overhead
        };
        let cleanup_sleep_factor = (1.0 - cleanup_task_overhead) / cleanup_task_overhead;

        WorkerPlan {
            marking_threads,
            sleep_factor,
            marking_task_overhead,
            cleanup_sleep_factor,
        }
    }

    /// Partial drain stops once the global stack is below this.
    pub fn partial_mark_stack_size_target(&self) -> usize {
        self.mark_stack_size / 3
    }

    pub fn card_size(&self) -> usize {
        1 << self.card_shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_thread_count_wins() {
        let opts = MarkingOptions {
            parallel_marking_threads: Some(2),
            gc_threads: 8,
            marking_overhead_percent: 50,
            ..Default::default()
        };
        let plan = opts.worker_plan();
        assert_eq!(plan.marking_threads, 2);
        assert_eq!(plan.sleep_factor, 0.0);
    }

    #[test]
    fn zero_gc_threads_means_sequential() {
        let opts = MarkingOptions {
            gc_threads: 0,
            ..Default::default()
        };
        assert_eq!(opts.worker_plan().marking_threads, 0);
    }

    #[test]
    fn fallback_derivation() {
        let opts = MarkingOptions {
            gc_threads: 8,
            ..Default::default()
        };
        assert_eq!(opts.worker_plan().marking_threads, 2);
    }

    #[test]
    fn overhead_derivation_sleeps() {
        let opts = MarkingOptions {
            gc_threads: 8,
            marking_overhead_percent: 10,
            ..Default::default()
        };
        let plan = opts.worker_plan();
        assert!(plan.marking_threads >= 1);
        assert!(plan.marking_task_overhead <= 1.0);
        assert!(plan.sleep_factor >= 0.0);
    }

    #[test]
    fn validation_rejects_oversubscription() {
        let opts = MarkingOptions {
            parallel_marking_threads: Some(9),
            gc_threads: 4,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
        assert!(MarkingOptions::default().validate().is_ok());
    }
}
