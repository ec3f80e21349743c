//! Mark bitmaps.
//!
//! [`MarkBitmap`] keeps one bit per heap word over the reserved heap
//! range. Two instances exist per engine: *prev* (the snapshot of the
//! last completed cycle) and *next* (under construction). The backing
//! store is an anonymous mapping sized at engine construction and
//! never reallocated.
//!
//! [`ParFlagBitmap`] is the small index-keyed variant used for the
//! per-region liveness bits and the card bits written by the counting
//! pass.

use atomic::{Atomic, Ordering};
use core::fmt;
use memmap2::MmapMut;
use std::mem::size_of;
use std::sync::atomic::AtomicUsize;

use crate::memory::{MemRegion, BYTES_PER_WORD, LOG_BYTES_PER_WORD};
use crate::GcError;

const BITS_PER_INTPTR: usize = size_of::<usize>() * 8;

pub struct MarkBitmap {
    mem_map: MmapMut,
    bitmap_begin: *mut Atomic<usize>,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
    name: &'static str,
}

unsafe impl Send for MarkBitmap {}
unsafe impl Sync for MarkBitmap {}

impl MarkBitmap {
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }

    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    #[inline]
    fn index_of(offset: usize) -> usize {
        offset / BYTES_PER_WORD / BITS_PER_INTPTR
    }

    #[inline]
    fn bit_of(offset: usize) -> usize {
        (offset >> LOG_BYTES_PER_WORD) % BITS_PER_INTPTR
    }

    #[inline]
    fn mask_of(offset: usize) -> usize {
        1 << Self::bit_of(offset)
    }

    #[inline]
    fn word_count(&self) -> usize {
        self.bitmap_size / size_of::<usize>()
    }

    #[inline]
    fn entry(&self, index: usize) -> &Atomic<usize> {
        debug_assert!(
            index < self.word_count(),
            "bitmap index {} out of bounds ({})",
            index,
            self.word_count()
        );
        unsafe { &*self.bitmap_begin.add(index) }
    }

    #[inline]
    pub fn covers(&self, addr: usize) -> bool {
        self.heap_begin <= addr && addr < self.heap_limit
    }

    /// Atomically set the bit for `addr`. Returns true iff this call
    /// newly set it; exactly one concurrent caller observes true for
    /// a given address. The CAS carries release semantics so readers
    /// of the bit observe the setter's prior writes.
    #[inline]
    pub fn par_mark(&self, addr: usize) -> bool {
        debug_assert!(self.covers(addr), "mark outside the heap: {:#x}", addr);
        let offset = addr.wrapping_sub(self.heap_begin);
        let entry = self.entry(Self::index_of(offset));
        let mask = Self::mask_of(offset);

        let mut old_word = entry.load(Ordering::Relaxed);
        loop {
            if (old_word & mask) != 0 {
                return false;
            }
            match entry.compare_exchange_weak(
                old_word,
                old_word | mask,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(w) => old_word = w,
            }
        }
    }

    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        debug_assert!(self.covers(addr), "query outside the heap: {:#x}", addr);
        let offset = addr.wrapping_sub(self.heap_begin);
        (self.entry(Self::index_of(offset)).load(Ordering::Acquire) & Self::mask_of(offset)) != 0
    }

    #[inline]
    pub fn mark(&self, addr: usize) {
        self.modify::<true>(addr);
    }

    #[inline]
    pub fn clear(&self, addr: usize) {
        self.modify::<false>(addr);
    }

    #[inline]
    fn modify<const SET_BIT: bool>(&self, addr: usize) -> bool {
        debug_assert!(self.covers(addr), "modify outside the heap: {:#x}", addr);
        let offset = addr.wrapping_sub(self.heap_begin);
        let entry = self.entry(Self::index_of(offset));
        let mask = Self::mask_of(offset);
        let old_word = entry.load(Ordering::Relaxed);
        if SET_BIT {
            if (old_word & mask) == 0 {
                entry.store(old_word | mask, Ordering::Release);
            }
        } else {
            entry.store(old_word & !mask, Ordering::Release);
        }
        (old_word & mask) != 0
    }

    /// Clear every bit for addresses in `mr`, intersected with the
    /// covered range.
    pub fn clear_range(&self, mr: MemRegion) {
        let mr = mr.intersection(MemRegion::new(self.heap_begin, self.heap_limit));
        if mr.is_empty() {
            return;
        }
        let mut begin_offset = mr.start() - self.heap_begin;
        let mut end_offset = mr.end() - self.heap_begin;

        while begin_offset < end_offset && Self::bit_of(begin_offset) != 0 {
            self.clear(self.heap_begin + begin_offset);
            begin_offset += BYTES_PER_WORD;
        }
        while begin_offset < end_offset && Self::bit_of(end_offset) != 0 {
            end_offset -= BYTES_PER_WORD;
            self.clear(self.heap_begin + end_offset);
        }
        let first = Self::index_of(begin_offset);
        let last = Self::index_of(end_offset);
        for i in first..last {
            self.entry(i).store(0, Ordering::Release);
        }
    }

    pub fn clear_all(&self) {
        for i in 0..self.word_count() {
            self.entry(i).store(0, Ordering::Release);
        }
    }

    /// First marked word address in `[addr, limit)`, or `limit`.
    pub fn next_marked_word(&self, addr: usize, limit: usize) -> usize {
        self.scan::<true>(addr, limit)
    }

    /// First unmarked word address in `[addr, limit)`, or `limit`.
    pub fn next_unmarked_word(&self, addr: usize, limit: usize) -> usize {
        self.scan::<false>(addr, limit)
    }

    fn scan<const MARKED: bool>(&self, addr: usize, limit: usize) -> usize {
        if addr >= limit {
            return limit;
        }
        debug_assert!(self.covers(addr));
        let mut offset = addr - self.heap_begin;
        let end_offset = limit - self.heap_begin;
        let mut index = Self::index_of(offset);
        let last = Self::index_of(end_offset - 1);

        while index <= last {
            let mut word = self.entry(index).load(Ordering::Acquire);
            if !MARKED {
                word = !word;
            }
            // Bits below the current offset are not part of the scan.
            word &= !((1usize << Self::bit_of(offset)) - 1);
            if word != 0 {
                let found = index * BITS_PER_INTPTR * BYTES_PER_WORD
                    + (word.trailing_zeros() as usize) * BYTES_PER_WORD;
                if found >= end_offset {
                    return limit;
                }
                return self.heap_begin + found;
            }
            index += 1;
            offset = index * BITS_PER_INTPTR * BYTES_PER_WORD;
        }
        limit
    }

    /// Visit marked addresses in `[mr.start, mr.end)` in strictly
    /// increasing order. Halts early iff the closure returns false;
    /// the return value tells the caller whether the pass completed.
    ///
    /// Bits may be set concurrently while iterating; a bit set behind
    /// the cursor is not revisited.
    pub fn iterate(&self, cl: &mut dyn FnMut(usize) -> bool, mr: MemRegion) -> bool {
        let mr = mr.intersection(MemRegion::new(self.heap_begin, self.heap_limit));
        if mr.is_empty() {
            return true;
        }
        let mut addr = self.next_marked_word(mr.start(), mr.end());
        while addr < mr.end() {
            if !cl(addr) {
                return false;
            }
            addr = self.next_marked_word(addr + BYTES_PER_WORD, mr.end());
        }
        true
    }

    pub fn compute_bitmap_size(heap_capacity: usize) -> usize {
        let bytes_covered_per_word = BYTES_PER_WORD * BITS_PER_INTPTR;
        crate::utils::align_up(heap_capacity, bytes_covered_per_word) / bytes_covered_per_word
            * size_of::<usize>()
    }

    pub fn new(
        name: &'static str,
        heap_begin: usize,
        heap_capacity: usize,
    ) -> Result<Self, GcError> {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity);
        let mem_map = MmapMut::map_anon(bitmap_size).map_err(|e| GcError::BitmapReservation {
            name,
            size: bitmap_size,
            source: e,
        })?;
        let bitmap_begin = mem_map.as_ptr() as *mut Atomic<usize>;
        Ok(Self {
            name,
            mem_map,
            bitmap_begin,
            bitmap_size,
            heap_begin,
            heap_limit: heap_begin + heap_capacity,
        })
    }
}

impl fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[begin={:#x},end={:#x}]",
            self.name, self.heap_begin, self.heap_limit
        )
    }
}

/// Index-keyed atomic bit vector for the region-liveness and card
/// bitmaps produced by the final counting pass.
pub struct ParFlagBitmap {
    words: Box<[AtomicUsize]>,
    bits: usize,
}

impl ParFlagBitmap {
    pub fn new(bits: usize) -> Self {
        let words = (bits + BITS_PER_INTPTR - 1) / BITS_PER_INTPTR;
        Self {
            words: (0..words).map(|_| AtomicUsize::new(0)).collect(),
            bits,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bits
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    #[inline]
    pub fn par_set(&self, index: usize) {
        debug_assert!(index < self.bits);
        self.words[index / BITS_PER_INTPTR]
            .fetch_or(1 << (index % BITS_PER_INTPTR), std::sync::atomic::Ordering::AcqRel);
    }

    #[inline]
    pub fn at(&self, index: usize) -> bool {
        debug_assert!(index < self.bits);
        (self.words[index / BITS_PER_INTPTR].load(std::sync::atomic::Ordering::Acquire)
            & (1 << (index % BITS_PER_INTPTR)))
            != 0
    }

    pub fn clear_all(&self) {
        for w in self.words.iter() {
            w.store(0, std::sync::atomic::Ordering::Release);
        }
    }
}
