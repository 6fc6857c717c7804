//! Sable is an embeddable database page-cache core.
//!
//! It owns the hardest part of a page cache: the packed off-heap metadata
//! table with one 32-byte slot per cache page, the per-page sequence lock
//! multiplexing optimistic readers, writers, flushers, and an exclusive
//! owner over one 64-bit word, and the fault/evict transitions that must
//! stay safe against concurrent lookups while I/O is in flight. Cursors,
//! translation tables, and the eviction thread are the embedding database's
//! business; they drive this crate through [`PageTable`].

/// Error type and result alias.
pub mod error;

/// The per-page sequence lock word.
pub mod lock;

/// Aligned off-heap allocation for the metadata region and page buffers.
pub mod memory;

/// Swappers: per-file page I/O and the id registry.
pub mod swap;

/// The packed page metadata table and its fault/evict transitions.
pub mod table;

/// Telemetry hooks for faults, evictions, and flushes.
pub mod trace;

pub use crate::error::{CacheError, Result};
pub use crate::lock::PageLock;
pub use crate::memory::{allocate_victim_page, MemoryManager, MmapMemoryManager};
pub use crate::swap::{FileSwapper, Swapper, SwapperId, SwapperSet};
pub use crate::table::{
    CacheOptions, PageRef, PageTable, SlotSnapshot, MAX_USAGE, UNBOUND_PAGE_ID,
};
pub use crate::trace::{
    CacheCounters, CountersSnapshot, EvictionEvent, EvictionTracer, FaultEvent, FlushEvent,
    NoopFaultEvent, NoopTracer,
};
