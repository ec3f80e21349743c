//! Timing sequences and per-task marking statistics.

/// Running sequence of samples: count, average, standard deviation,
/// maximum. Backs the phase timing reports and the step-overshoot
/// predictor.
#[derive(Clone, Debug, Default)]
pub struct NumberSeq {
    num: usize,
    sum: f64,
    sum_of_squares: f64,
    maximum: f64,
}

impl NumberSeq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.num += 1;
        self.sum += value;
        self.sum_of_squares += value * value;
        if value > self.maximum {
            self.maximum = value;
        }
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn avg(&self) -> f64 {
        if self.num == 0 {
            0.0
        } else {
            self.sum / self.num as f64
        }
    }

    pub fn sd(&self) -> f64 {
        if self.num == 0 {
            return 0.0;
        }
        let avg = self.avg();
        let variance = self.sum_of_squares / self.num as f64 - avg * avg;
        variance.max(0.0).sqrt()
    }

    pub fn maximum(&self) -> f64 {
        self.maximum
    }

    /// Pessimistic prediction of the next sample, used to shave the
    /// expected overshoot off a step's time budget.
    pub fn predict(&self) -> f64 {
        self.avg() + self.sd()
    }
}

/// Per-task counters accumulated across marking steps. Reset per
/// cycle, dumped through `log` when stats printing is on.
#[derive(Clone, Debug, Default)]
pub struct TaskStats {
    pub local_pushes: usize,
    pub local_pops: usize,
    pub local_max_size: usize,
    pub global_pushes: usize,
    pub global_pops: usize,
    pub global_transfers_to: usize,
    pub global_transfers_from: usize,
    pub objs_scanned: usize,
    pub objs_found_on_bitmap: usize,
    pub regions_claimed: usize,
    pub region_stack_pops: usize,
    pub satb_buffers_processed: usize,
    pub steal_attempts: usize,
    pub steals: usize,
    pub aborted: usize,
    pub aborted_overflow: usize,
    pub aborted_cm_aborted: usize,
    pub aborted_yield: usize,
    pub aborted_timed_out: usize,
    pub aborted_satb: usize,
    pub aborted_termination: usize,
}

impl TaskStats {
    pub fn reset(&mut self) {
        *self = TaskStats::default();
    }

    pub fn note_local_push(&mut self, queue_size: usize) {
        self.local_pushes += 1;
        if queue_size > self.local_max_size {
            self.local_max_size = queue_size;
        }
    }
}

impl std::fmt::Display for TaskStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "  Objects: scanned = {}, found on the bitmap = {}",
            self.objs_scanned, self.objs_found_on_bitmap
        )?;
        writeln!(
            f,
            "  Local Queue: pushes = {}, pops = {}, max size = {}",
            self.local_pushes, self.local_pops, self.local_max_size
        )?;
        writeln!(
            f,
            "  Global Stack: pushes = {}, pops = {}, transfers to = {}, transfers from = {}",
            self.global_pushes,
            self.global_pops,
            self.global_transfers_to,
            self.global_transfers_from
        )?;
        writeln!(
            f,
            "  Regions: claimed = {}, Region Stack: pops = {}",
            self.regions_claimed, self.region_stack_pops
        )?;
        writeln!(
            f,
            "  SATB buffers: processed = {}",
            self.satb_buffers_processed
        )?;
        writeln!(
            f,
            "  Steals: attempts = {}, successes = {}",
            self.steal_attempts, self.steals
        )?;
        writeln!(f, "  Aborted: {}, due to", self.aborted)?;
        writeln!(
            f,
            "    overflow: {}, global abort: {}, yield: {}",
            self.aborted_overflow, self.aborted_cm_aborted, self.aborted_yield
        )?;
        write!(
            f,
            "    time out: {}, SATB: {}, termination: {}",
            self.aborted_timed_out, self.aborted_satb, self.aborted_termination
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_moments() {
        let mut seq = NumberSeq::new();
        assert_eq!(seq.predict(), 0.0);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            seq.add(v);
        }
        assert_eq!(seq.num(), 8);
        assert!((seq.avg() - 5.0).abs() < 1e-9);
        assert!((seq.sd() - 2.0).abs() < 1e-9);
        assert_eq!(seq.maximum(), 9.0);
        assert!((seq.predict() - 7.0).abs() < 1e-9);
    }
}
