//! Concurrent region-marking engine for pause-time-targeted GCs.
//!
//! The crate implements the concurrent phase of a region-based
//! snapshot-at-the-beginning collector: the parallel tri-color
//! marking state machine, the work-stealing task queues and global
//! mark stack, the region-claiming finger protocol, SATB buffer
//! ingestion, the overflow-and-restart barrier protocol, and the
//! final live-data counting pass that feeds the reclamation planner.
//!
//! The heap itself, the write barriers, root scanning and the
//! evacuation phase are external collaborators reached through the
//! [`heap::CollectedHeap`] trait.

pub mod bitmap;
pub mod config;
pub mod gang;
pub mod heap;
pub mod mark_stack;
pub mod marker;
pub mod marking;
pub mod memory;
pub mod refs;
pub mod region;
pub mod safepoint;
pub mod satb;
pub mod stats;
pub mod sync_barrier;
pub mod terminator;
pub mod utils;

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Construction-time failures. Everything that can go wrong after
/// construction is reported through flags on the engine, never
/// through `Result`.
#[derive(Debug, Error)]
pub enum GcError {
    #[error("failed to reserve {size} bytes of backing store for the {name} bitmap")]
    BitmapReservation {
        name: &'static str,
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid marking configuration: {0}")]
    Configuration(String),
}

pub use config::MarkingOptions;
pub use heap::{CollectedHeap, ReferenceVisitor};
pub use marker::{CleanupStats, ConcurrentMarker};
pub use memory::MemRegion;
pub use region::{HeapRegion, RegionKind};
