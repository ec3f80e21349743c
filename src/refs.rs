//! Weak-reference processing for the remark pause.
//!
//! Reference objects are discovered by the runtime while marking is
//! active. At remark the engine processes the discovered set with an
//! is-alive predicate over the *next* bitmap, a keep-alive closure
//! that grays referents, and a drain closure that empties the global
//! mark stack without yielding. Cleared references are staged for the
//! runtime to enqueue on its pending list.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefKind {
    Soft,
    Weak,
}

/// Policy for soft references at remark.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SoftRefPolicy {
    /// Treat soft references like weak ones (full collections and
    /// `clear_all_soft_refs`).
    AlwaysClear,
    /// Keep every softly reachable referent alive this cycle.
    KeepAll,
}

#[derive(Clone, Copy, Debug)]
struct DiscoveredRef {
    reference: usize,
    referent: usize,
    kind: RefKind,
}

pub struct ReferenceProcessor {
    discovery_enabled: AtomicBool,
    discovered: Mutex<Vec<DiscoveredRef>>,
    pending: Mutex<Vec<usize>>,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self {
            discovery_enabled: AtomicBool::new(false),
            discovered: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn enable_discovery(&self) {
        debug_assert!(self.discovered.lock().is_empty());
        self.discovery_enabled.store(true, Ordering::Release);
    }

    pub fn disable_discovery(&self) {
        self.discovery_enabled.store(false, Ordering::Release);
    }

    pub fn discovery_enabled(&self) -> bool {
        self.discovery_enabled.load(Ordering::Acquire)
    }

    /// Called by the runtime when tracing finds a reference object.
    /// Returns whether the reference was recorded.
    pub fn discover_reference(&self, reference: usize, referent: usize, kind: RefKind) -> bool {
        if !self.discovery_enabled() || referent == 0 {
            return false;
        }
        self.discovered.lock().push(DiscoveredRef {
            reference,
            referent,
            kind,
        });
        true
    }

    pub fn num_discovered(&self) -> usize {
        self.discovered.lock().len()
    }

    /// Process the discovered set. `is_alive` answers liveness in the
    /// snapshot, `keep_alive` grays a referent that must survive, and
    /// `drain` fully empties the global mark stack so transitively
    /// kept objects get traced before the next decision.
    pub fn process_discovered_references(
        &self,
        policy: SoftRefPolicy,
        is_alive: &mut dyn FnMut(usize) -> bool,
        keep_alive: &mut dyn FnMut(usize),
        drain: &mut dyn FnMut(),
    ) {
        let discovered = std::mem::take(&mut *self.discovered.lock());
        let mut cleared = Vec::new();
        for d in discovered {
            let keep = d.kind == RefKind::Soft && policy == SoftRefPolicy::KeepAll;
            if keep {
                keep_alive(d.referent);
            } else if !is_alive(d.referent) {
                // Referent dies this cycle; the reference object goes
                // onto the pending list for the runtime.
                cleared.push(d.reference);
            }
            drain();
        }
        self.pending.lock().extend(cleared);
        self.disable_discovery();
    }

    /// Hand the cleared references to the runtime's pending list.
    pub fn enqueue_discovered_references(&self) -> Vec<usize> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Drop all recorded state after an aborted cycle.
    pub fn abandon(&self) {
        self.discovered.lock().clear();
        self.pending.lock().clear();
        self.disable_discovery();
    }
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_gate() {
        let rp = ReferenceProcessor::new();
        assert!(!rp.discover_reference(0x100, 0x200, RefKind::Weak));
        rp.enable_discovery();
        assert!(rp.discover_reference(0x100, 0x200, RefKind::Weak));
        assert_eq!(rp.num_discovered(), 1);
    }

    #[test]
    fn dead_referents_are_enqueued() {
        let rp = ReferenceProcessor::new();
        rp.enable_discovery();
        rp.discover_reference(0x100, 0x200, RefKind::Weak);
        rp.discover_reference(0x110, 0x300, RefKind::Weak);

        let mut kept = vec![];
        rp.process_discovered_references(
            SoftRefPolicy::AlwaysClear,
            &mut |referent| referent == 0x200,
            &mut |referent| kept.push(referent),
            &mut || {},
        );
        assert!(kept.is_empty());
        assert_eq!(rp.enqueue_discovered_references(), vec![0x110]);
        assert!(!rp.discovery_enabled());
    }

    #[test]
    fn keep_all_policy_revives_soft_referents() {
        let rp = ReferenceProcessor::new();
        rp.enable_discovery();
        rp.discover_reference(0x100, 0x200, RefKind::Soft);
        rp.discover_reference(0x110, 0x300, RefKind::Weak);

        let mut kept = vec![];
        rp.process_discovered_references(
            SoftRefPolicy::KeepAll,
            &mut |_| false,
            &mut |referent| kept.push(referent),
            &mut || {},
        );
        assert_eq!(kept, vec![0x200]);
        assert_eq!(rp.enqueue_discovered_references(), vec![0x110]);
    }
}
