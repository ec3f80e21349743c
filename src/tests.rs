//! End-to-end marking scenarios against a scripted heap.
//!
//! `TestHeap` fabricates a region-structured heap without real object
//! memory: objects are (address, size, out-edges) records, which is
//! all the engine ever asks for through `CollectedHeap`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::heap::{CollectedHeap, ReferenceVisitor};
use crate::marker::ConcurrentMarker;
use crate::memory::{MemRegion, BYTES_PER_WORD};
use crate::region::{HeapRegion, RegionKind};
use crate::MarkingOptions;

const REGION_BYTES: usize = 0x1000;
const HEAP_START: usize = 0x1000;
const OBJ_WORDS: usize = 16;
const OBJ_BYTES: usize = OBJ_WORDS * BYTES_PER_WORD;

#[derive(Clone)]
struct TestObject {
    size_words: usize,
    refs: Vec<usize>,
}

struct TestHeap {
    reserved: MemRegion,
    committed_end: AtomicUsize,
    regions: Vec<HeapRegion>,
    objects: Mutex<HashMap<usize, TestObject>>,
    roots: Mutex<Vec<usize>>,
}

impl TestHeap {
    fn new(region_kinds: &[RegionKind]) -> Self {
        let end = HEAP_START + region_kinds.len() * REGION_BYTES;
        let regions = region_kinds
            .iter()
            .enumerate()
            .map(|(i, &kind)| {
                let bottom = HEAP_START + i * REGION_BYTES;
                HeapRegion::new(i, bottom, bottom + REGION_BYTES, kind)
            })
            .collect();
        Self {
            reserved: MemRegion::new(HEAP_START, end),
            committed_end: AtomicUsize::new(end),
            regions,
            objects: Mutex::new(HashMap::new()),
            roots: Mutex::new(Vec::new()),
        }
    }

    fn regular(num_regions: usize) -> Self {
        Self::new(&vec![RegionKind::Regular; num_regions])
    }

    fn set_committed_end(&self, end: usize) {
        self.committed_end.store(end, Ordering::Release);
    }

    fn add_object(&self, addr: usize, size_words: usize, refs: Vec<usize>) {
        assert!(self.reserved.contains(addr));
        self.objects
            .lock()
            .insert(addr, TestObject { size_words, refs });
        let obj_end = addr + size_words * BYTES_PER_WORD;
        for region in &self.regions {
            if obj_end > region.bottom() && addr < region.end() {
                region.set_top(obj_end.min(region.end()).max(region.top()));
            }
        }
    }

    fn set_refs(&self, addr: usize, refs: Vec<usize>) {
        self.objects.lock().get_mut(&addr).unwrap().refs = refs;
    }

    fn add_root(&self, addr: usize) {
        self.roots.lock().push(addr);
    }

    /// A chain of 16-word objects at the bottom of region 0, each
    /// pointing to the next.
    fn linked_list(&self, count: usize) -> Vec<usize> {
        let addrs: Vec<usize> = (0..count).map(|i| HEAP_START + i * OBJ_BYTES).collect();
        for (i, &addr) in addrs.iter().enumerate() {
            let refs = if i + 1 < count {
                vec![addrs[i + 1]]
            } else {
                vec![]
            };
            self.add_object(addr, OBJ_WORDS, refs);
        }
        addrs
    }
}

impl CollectedHeap for TestHeap {
    fn reserved(&self) -> MemRegion {
        self.reserved
    }

    fn committed(&self) -> MemRegion {
        MemRegion::new(
            self.reserved.start(),
            self.committed_end.load(Ordering::Acquire),
        )
    }

    fn num_regions(&self) -> usize {
        (self.committed().end() - self.reserved.start()) / REGION_BYTES
    }

    fn max_regions(&self) -> usize {
        self.regions.len()
    }

    fn region_at(&self, index: usize) -> &HeapRegion {
        &self.regions[index]
    }

    fn region_containing(&self, addr: usize) -> Option<&HeapRegion> {
        if !self.committed().contains(addr) {
            return None;
        }
        self.regions.get((addr - self.reserved.start()) / REGION_BYTES)
    }

    fn process_strong_roots(&self, cl: &mut dyn ReferenceVisitor) {
        let roots = self.roots.lock().clone();
        for root in roots {
            cl.visit_ref(root);
        }
    }

    fn object_size(&self, obj: usize) -> usize {
        self.objects
            .lock()
            .get(&obj)
            .unwrap_or_else(|| panic!("no object at {:#x}", obj))
            .size_words
    }

    fn object_iterate(&self, obj: usize, cl: &mut dyn ReferenceVisitor) {
        let refs = {
            self.objects
                .lock()
                .get(&obj)
                .unwrap_or_else(|| panic!("no object at {:#x}", obj))
                .refs
                .clone()
        };
        for r in refs {
            if r != 0 {
                cl.visit_ref(r);
            }
        }
    }
}

fn test_opts() -> MarkingOptions {
    MarkingOptions {
        parallel_marking_threads: Some(1),
        gc_threads: 1,
        ..Default::default()
    }
}

fn run_full_cycle<H: CollectedHeap>(marker: &mut ConcurrentMarker<H>) {
    marker.checkpoint_roots_initial();
    loop {
        marker.mark_from_roots();
        if !marker.checkpoint_roots_final(false) {
            break;
        }
    }
    marker.cleanup().expect("cycle should complete");
    marker.complete_cleanup();
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn single_region_all_live() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(1));
    let addrs = heap.linked_list(8);
    heap.region_at(0).set_top(HEAP_START + REGION_BYTES);
    heap.add_root(addrs[0]);

    let mut marker = ConcurrentMarker::new(heap.clone(), test_opts()).unwrap();
    marker.checkpoint_roots_initial();
    assert!(marker.mark_in_progress());
    assert_eq!(heap.region_at(0).next_top_at_mark_start(), HEAP_START + REGION_BYTES);

    marker.mark_from_roots();
    // The finger ran the whole committed range.
    assert_eq!(marker.finger(), HEAP_START + REGION_BYTES);
    for &addr in &addrs {
        assert!(marker.next_bitmap().is_marked(addr), "obj {:#x}", addr);
    }

    assert!(!marker.checkpoint_roots_final(false));
    let stats = marker.cleanup().unwrap();

    // 8 objects of 16 words.
    assert_eq!(heap.region_at(0).prev_marked_bytes(), 1024);
    assert_eq!(stats.live_bytes, 1024);
    assert_eq!(stats.used_bytes, REGION_BYTES);
    assert_eq!(stats.known_garbage_bytes, REGION_BYTES - 1024);
    for &addr in &addrs {
        assert!(marker.prev_bitmap().is_marked(addr));
    }
    assert!(!marker.mark_in_progress());
}

#[test]
fn unreachable_tail_is_not_marked() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(1));
    let addrs = heap.linked_list(8);
    // Sever the link to the third object.
    heap.set_refs(addrs[1], vec![]);
    heap.add_root(addrs[0]);

    let mut marker = ConcurrentMarker::new(heap.clone(), test_opts()).unwrap();
    run_full_cycle(&mut marker);

    assert!(marker.prev_bitmap().is_marked(addrs[0]));
    assert!(marker.prev_bitmap().is_marked(addrs[1]));
    for &addr in &addrs[2..] {
        assert!(!marker.prev_bitmap().is_marked(addr), "obj {:#x}", addr);
    }
    assert_eq!(heap.region_at(0).prev_marked_bytes(), 256);
}

#[test]
fn overflow_restarts_and_completes() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(1));
    // Ten leaf objects low in the region, then a fan-out object whose
    // references all point backwards, forcing queue pushes.
    let leaves: Vec<usize> = (0..10).map(|i| HEAP_START + i * OBJ_BYTES).collect();
    for &addr in &leaves {
        heap.add_object(addr, OBJ_WORDS, vec![]);
    }
    let fan = HEAP_START + 10 * OBJ_BYTES;
    heap.add_object(fan, OBJ_WORDS, leaves.clone());
    heap.add_root(fan);

    let opts = MarkingOptions {
        mark_stack_size: 4,
        task_queue_max_elems: 2,
        ..test_opts()
    };
    let mut marker = ConcurrentMarker::new(heap.clone(), opts).unwrap();
    run_full_cycle(&mut marker);

    // The overflow latched, both barriers fired once, and the second
    // attempt finished the heap.
    assert_eq!(marker.overflow_restarts(), 1);
    let (first, second) = marker.overflow_barrier_generations();
    assert_eq!((first, second), (1, 1));

    assert!(marker.prev_bitmap().is_marked(fan));
    for &addr in &leaves {
        assert!(marker.prev_bitmap().is_marked(addr), "obj {:#x}", addr);
    }
    assert_eq!(heap.region_at(0).prev_marked_bytes(), 11 * OBJ_BYTES);
}

#[test]
fn overflow_during_remark_converges_in_pause() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(1));
    // The fan-out object is unreachable from the roots; the marker
    // only learns about it from the SATB log, so the overflow its
    // back-pointing references provoke happens inside remark.
    let leaves: Vec<usize> = (0..10).map(|i| HEAP_START + i * OBJ_BYTES).collect();
    for &addr in &leaves {
        heap.add_object(addr, OBJ_WORDS, vec![]);
    }
    let fan = HEAP_START + 10 * OBJ_BYTES;
    heap.add_object(fan, OBJ_WORDS, leaves.clone());

    let opts = MarkingOptions {
        mark_stack_size: 4,
        task_queue_max_elems: 2,
        ..test_opts()
    };
    let mut marker = ConcurrentMarker::new(heap.clone(), opts).unwrap();
    let mutator_queue = marker.satb_queue_set().register_queue();

    marker.checkpoint_roots_initial();
    // A mutator drops the last reference to the fan object; the
    // write barrier logs the prior value.
    marker.satb_queue_set().enqueue(&mutator_queue, fan);

    marker.mark_from_roots();
    assert_eq!(marker.overflow_restarts(), 0);

    // Remark hits the overflow, resets through the barriers and
    // retries within the same pause; no restart of the concurrent
    // phase is requested.
    assert!(!marker.checkpoint_roots_final(false));
    assert!(!marker.restart_for_overflow());
    assert_eq!(marker.overflow_restarts(), 1);

    marker.cleanup().unwrap();
    assert!(marker.prev_bitmap().is_marked(fan));
    for &addr in &leaves {
        assert!(marker.prev_bitmap().is_marked(addr), "obj {:#x}", addr);
    }
    assert_eq!(heap.region_at(0).prev_marked_bytes(), 11 * OBJ_BYTES);
}

#[test]
fn full_gc_abort_yields_empty_result() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(1));
    let addrs = heap.linked_list(8);
    heap.add_root(addrs[0]);

    let mut marker = ConcurrentMarker::new(heap.clone(), test_opts()).unwrap();
    marker.checkpoint_roots_initial();
    // Roots are grayed on the bitmap at this point.
    assert!(marker.next_bitmap().is_marked(addrs[0]));

    marker.abort();
    assert!(marker.has_aborted());
    for &addr in &addrs {
        assert!(!marker.next_bitmap().is_marked(addr));
    }

    // The remaining stop-the-world phases short-circuit to "marking
    // complete".
    assert!(!marker.checkpoint_roots_final(false));
    assert!(!marker.mark_in_progress());
    assert!(marker.cleanup().is_none());
    assert_eq!(heap.region_at(0).prev_marked_bytes(), 0);
}

#[test]
fn satb_log_preserves_snapshot() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(1));
    let addrs = heap.linked_list(2);
    heap.add_root(addrs[0]);

    let mut marker = ConcurrentMarker::new(heap.clone(), test_opts()).unwrap();
    let mutator_queue = marker.satb_queue_set().register_queue();

    marker.checkpoint_roots_initial();
    assert!(mutator_queue.is_active());

    // The mutator overwrites the only reference to the second object;
    // the write barrier logs the prior value.
    marker
        .satb_queue_set()
        .enqueue(&mutator_queue, addrs[1]);
    heap.set_refs(addrs[0], vec![]);

    marker.mark_from_roots();
    assert!(!marker.checkpoint_roots_final(false));
    marker.cleanup().unwrap();

    // Snapshot semantics: the overwritten referent survives.
    assert!(marker.prev_bitmap().is_marked(addrs[1]));
    assert_eq!(heap.region_at(0).prev_marked_bytes(), 256);
}

#[test]
fn committed_growth_is_fenced_during_marking() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(2));
    heap.set_committed_end(HEAP_START + REGION_BYTES);
    let addrs = heap.linked_list(2);
    heap.add_root(addrs[0]);

    let mut marker = ConcurrentMarker::new(heap.clone(), test_opts()).unwrap();
    marker.checkpoint_roots_initial();

    // The heap grows by a region between initial-mark and
    // concurrent-mark; the cycle must not observe it yet.
    heap.set_committed_end(HEAP_START + 2 * REGION_BYTES);
    marker.update_committed(false);
    assert_eq!(marker.heap_end(), HEAP_START + REGION_BYTES);

    marker.mark_from_roots();
    assert_eq!(marker.finger(), HEAP_START + REGION_BYTES);

    // Remark refreshes the bound at a stop-the-world point.
    assert!(!marker.checkpoint_roots_final(false));
    assert_eq!(marker.heap_end(), HEAP_START + 2 * REGION_BYTES);
    marker.cleanup().unwrap();

    assert_eq!(heap.region_at(1).prev_marked_bytes(), 0);
}

#[test]
fn reference_at_ntams_is_implicitly_live() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(1));
    let a = HEAP_START;
    let c = HEAP_START + OBJ_BYTES;
    heap.add_object(a, OBJ_WORDS, vec![c]);
    // NTAMS will land exactly on `c`.
    heap.region_at(0).set_top(c);
    heap.add_root(a);

    let mut marker = ConcurrentMarker::new(heap.clone(), test_opts()).unwrap();
    marker.checkpoint_roots_initial();
    assert_eq!(heap.region_at(0).next_top_at_mark_start(), c);

    // The object at NTAMS is allocated "after" the snapshot.
    heap.add_object(c, OBJ_WORDS, vec![]);

    marker.mark_from_roots();
    assert!(!marker.checkpoint_roots_final(false));
    let stats = marker.cleanup().unwrap();

    assert!(marker.prev_bitmap().is_marked(a));
    // Above NTAMS: implicitly live, never traced or marked.
    assert!(!marker.prev_bitmap().is_marked(c));
    assert_eq!(heap.region_at(0).prev_marked_bytes(), OBJ_BYTES);
    assert_eq!(stats.live_bytes, 2 * OBJ_BYTES);
}

#[test]
fn humongous_continuation_is_never_scanned() {
    init_logging();
    let heap = Arc::new(TestHeap::new(&[
        RegionKind::HumongousStart,
        RegionKind::HumongousCont,
        RegionKind::Regular,
    ]));
    // One object spanning the first two regions.
    let big = HEAP_START;
    let big_words = (REGION_BYTES + REGION_BYTES / 2) / BYTES_PER_WORD;
    heap.add_object(big, big_words, vec![]);
    heap.region_at(0).set_top(heap.region_at(0).end());
    heap.add_root(big);

    let mut marker = ConcurrentMarker::new(heap.clone(), test_opts()).unwrap();
    run_full_cycle(&mut marker);

    assert!(marker.prev_bitmap().is_marked(big));
    // The continuation keeps NTAMS at bottom and carries no marks;
    // the start region accounts the whole object.
    let cont = heap.region_at(1);
    assert_eq!(cont.next_top_at_mark_start(), cont.bottom());
    assert_eq!(cont.prev_marked_bytes(), 0);
    assert_eq!(
        heap.region_at(0).prev_marked_bytes(),
        big_words * BYTES_PER_WORD
    );
    assert!(marker.containing_card_is_marked(big));
}

#[test]
fn two_cycles_converge_to_the_same_marks() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(1));
    let addrs = heap.linked_list(5);
    heap.add_root(addrs[0]);

    let mut marker = ConcurrentMarker::new(heap.clone(), test_opts()).unwrap();
    run_full_cycle(&mut marker);
    let first = heap.region_at(0).prev_marked_bytes();

    marker.clear_next_bitmap();
    run_full_cycle(&mut marker);
    let second = heap.region_at(0).prev_marked_bytes();

    assert_eq!(first, second);
    for &addr in &addrs {
        assert!(marker.prev_bitmap().is_marked(addr));
    }
}

#[test]
fn parallel_workers_trace_a_wide_graph() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(4));
    // A root per region plus cross-region edges.
    let mut all = Vec::new();
    for region in 0..4 {
        let base = HEAP_START + region * REGION_BYTES;
        let addrs: Vec<usize> = (0..16).map(|i| base + i * OBJ_BYTES).collect();
        for (i, &addr) in addrs.iter().enumerate() {
            let target = addrs[(i + 1) % addrs.len()];
            let cross = HEAP_START + ((region + 1) % 4) * REGION_BYTES + i * OBJ_BYTES;
            heap.add_object(addr, OBJ_WORDS, vec![target, cross]);
        }
        all.extend(addrs);
    }
    heap.add_root(HEAP_START);

    let opts = MarkingOptions {
        parallel_marking_threads: Some(2),
        gc_threads: 2,
        ..Default::default()
    };
    let mut marker = ConcurrentMarker::new(heap.clone(), opts).unwrap();
    run_full_cycle(&mut marker);

    for &addr in &all {
        assert!(marker.prev_bitmap().is_marked(addr), "obj {:#x}", addr);
    }
    let marked: usize = (0..4)
        .map(|i| heap.region_at(i).prev_marked_bytes())
        .sum();
    assert_eq!(marked, all.len() * OBJ_BYTES);
}

#[test]
fn cset_registration_arms_gray_on_copy() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(2));
    let addrs = heap.linked_list(2);
    heap.add_root(addrs[0]);

    let mut marker = ConcurrentMarker::new(heap.clone(), test_opts()).unwrap();
    marker.checkpoint_roots_initial();

    // Marking is in progress; queue a sub-region as if an evacuation
    // pause had bulk-marked it, then invalidate it via a cset.
    assert!(marker.region_stack_push(MemRegion::new(HEAP_START, HEAP_START + 0x100)));
    marker.new_cset();
    assert!(marker.should_gray_objects());

    heap.region_at(0).set_in_collection_set(true);
    marker.register_cset_region(heap.region_at(0));
    assert!(marker.should_gray_objects());

    // Stack fix-ups drop entries pointing into the cset.
    marker.mark_stack_push(addrs[1]);
    marker.oops_do(&mut |_slot| {});
    assert_eq!(marker.region_stack_pop(), MemRegion::empty());

    heap.region_at(0).set_in_collection_set(false);
    marker.abort();
}

#[test]
fn in_cset_completion_follows_references_out() {
    init_logging();
    let heap = Arc::new(TestHeap::regular(2));
    let x = HEAP_START;
    let y = HEAP_START + REGION_BYTES;
    heap.add_object(x, OBJ_WORDS, vec![y]);
    heap.add_object(y, OBJ_WORDS, vec![]);
    heap.add_root(x);

    let mut marker = ConcurrentMarker::new(heap.clone(), test_opts()).unwrap();
    marker.checkpoint_roots_initial();
    assert!(marker.next_bitmap().is_marked(x));

    heap.region_at(0).set_in_collection_set(true);
    marker.complete_marking_in_collection_set();

    // The reference escaped the collection set and was grayed there;
    // marks inside the cset were cleared for evacuation.
    assert!(marker.next_bitmap().is_marked(y));
    assert!(!marker.next_bitmap().is_marked(x));

    heap.region_at(0).set_in_collection_set(false);
    marker.abort();
}
