//! The capability surface the engine requires from the embedding
//! runtime.
//!
//! The marker never interprets object memory itself; object sizes and
//! reference slots are reached through [`CollectedHeap`]. A concrete
//! heap implements this trait once and hands the engine a shared
//! reference for the lifetime of the process.

use crate::bitmap::ParFlagBitmap;
use crate::memory::MemRegion;
use crate::region::HeapRegion;

/// The single-method closure passed through object iteration, root
/// scanning and SATB draining. Implemented for plain `FnMut` so call
/// sites can pass closures directly.
pub trait ReferenceVisitor {
    fn visit_ref(&mut self, obj: usize);
}

impl<F: FnMut(usize)> ReferenceVisitor for F {
    #[inline]
    fn visit_ref(&mut self, obj: usize) {
        self(obj)
    }
}

pub trait CollectedHeap: Sync {
    /// The full word-addressed range the heap may ever occupy.
    fn reserved(&self) -> MemRegion;

    /// The currently committed prefix of the reserved range. May grow
    /// between cycles, never shrinks during one.
    fn committed(&self) -> MemRegion;

    fn num_regions(&self) -> usize;

    /// Upper bound on `num_regions` over the heap's lifetime; sizes
    /// the region-liveness bitmap.
    fn max_regions(&self) -> usize {
        self.num_regions()
    }

    fn region_at(&self, index: usize) -> &HeapRegion;

    fn region_containing(&self, addr: usize) -> Option<&HeapRegion>;

    /// Enumerate the strong roots, calling the closure on every
    /// reachable reference. Runs inside the initial-mark pause.
    fn process_strong_roots(&self, cl: &mut dyn ReferenceVisitor);

    /// Object size in words.
    fn object_size(&self, obj: usize) -> usize;

    /// Visit the reference slots of `obj`.
    fn object_iterate(&self, obj: usize, cl: &mut dyn ReferenceVisitor);

    /// Evacuation-failure support: self-forwarded objects answer true
    /// and forward to themselves.
    fn is_forwarded(&self, _obj: usize) -> bool {
        false
    }

    fn forwardee(&self, obj: usize) -> usize {
        obj
    }

    #[inline]
    fn is_in_reserved(&self, addr: usize) -> bool {
        self.reserved().contains(addr)
    }

    /// Reclaim a region the cleanup pass found fully dead. Returns
    /// the number of bytes handed back.
    fn free_totally_dead_region(&self, _region: &HeapRegion) -> usize {
        0
    }

    /// Scrub the remembered set against the liveness bitmaps. Called
    /// once per cleanup worker when scrubbing is enabled.
    fn scrub_remembered_set(
        &self,
        _region_live: &ParFlagBitmap,
        _card_live: &ParFlagBitmap,
        _worker_id: usize,
    ) {
    }
}
