//! Telemetry hooks for faults, evictions, and flushes.
//!
//! The page table reports everything it does through these traits and never
//! looks at the data again; sinks are free to drop events. Eviction and flush
//! events are scoped: drop glue is the close, so every exit path of an
//! eviction, including I/O failure, closes its events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::CacheError;
use crate::swap::SwapperId;

/// Sink for a single page fault.
pub trait FaultEvent {
    fn add_bytes_read(&mut self, bytes: u64);
    fn set_cache_page_id(&mut self, cache_page_id: usize);
}

/// Sink for a single page flush.
pub trait FlushEvent: Send {
    fn add_bytes_written(&mut self, bytes: u64);
    fn add_pages_flushed(&mut self, pages: u64);
    fn done(self: Box<Self>);
    fn failed(self: Box<Self>, error: &CacheError);
}

/// Sink for a single eviction, including its optional inner flush.
pub trait EvictionEvent: Send {
    fn set_file_page_id(&mut self, file_page_id: u64);
    fn set_cache_page_id(&mut self, cache_page_id: usize);
    fn set_swapper_id(&mut self, swapper_id: SwapperId);
    fn threw_exception(&mut self, error: &CacheError);
    fn begin_flush(
        &mut self,
        file_page_id: u64,
        cache_page_id: usize,
        swapper_id: SwapperId,
    ) -> Box<dyn FlushEvent>;
}

/// An opportunity to evict: the tracer the eviction thread hands to
/// `try_evict`, consulted only when a page is actually reclaimed.
pub trait EvictionTracer: Send + Sync {
    fn begin_eviction(&self) -> Box<dyn EvictionEvent>;
}

/// Fault event that drops everything.
#[derive(Default)]
pub struct NoopFaultEvent;

impl FaultEvent for NoopFaultEvent {
    fn add_bytes_read(&mut self, _bytes: u64) {}
    fn set_cache_page_id(&mut self, _cache_page_id: usize) {}
}

/// Tracer that drops everything.
#[derive(Default)]
pub struct NoopTracer;

struct NoopEvictionEvent;
struct NoopFlushEvent;

impl EvictionTracer for NoopTracer {
    fn begin_eviction(&self) -> Box<dyn EvictionEvent> {
        Box::new(NoopEvictionEvent)
    }
}

impl EvictionEvent for NoopEvictionEvent {
    fn set_file_page_id(&mut self, _file_page_id: u64) {}
    fn set_cache_page_id(&mut self, _cache_page_id: usize) {}
    fn set_swapper_id(&mut self, _swapper_id: SwapperId) {}
    fn threw_exception(&mut self, _error: &CacheError) {}
    fn begin_flush(
        &mut self,
        _file_page_id: u64,
        _cache_page_id: usize,
        _swapper_id: SwapperId,
    ) -> Box<dyn FlushEvent> {
        Box::new(NoopFlushEvent)
    }
}

impl FlushEvent for NoopFlushEvent {
    fn add_bytes_written(&mut self, _bytes: u64) {}
    fn add_pages_flushed(&mut self, _pages: u64) {}
    fn done(self: Box<Self>) {}
    fn failed(self: Box<Self>, _error: &CacheError) {}
}

#[derive(Default)]
struct Cells {
    faults: AtomicU64,
    bytes_read: AtomicU64,
    evictions: AtomicU64,
    eviction_failures: AtomicU64,
    flushes: AtomicU64,
    pages_flushed: AtomicU64,
    bytes_written: AtomicU64,
}

/// Tracer aggregating relaxed counters, cheap enough to leave on.
///
/// Clones share the same cells, so one handle can feed the page table while
/// another serves a metrics endpoint.
#[derive(Clone, Default)]
pub struct CacheCounters {
    cells: Arc<Cells>,
}

/// Point-in-time view of [`CacheCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountersSnapshot {
    pub faults: u64,
    pub bytes_read: u64,
    pub evictions: u64,
    pub eviction_failures: u64,
    pub flushes: u64,
    pub pages_flushed: u64,
    pub bytes_written: u64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts counting a fault; pass the returned event to `PageTable::fault`.
    pub fn begin_fault(&self) -> CountingFaultEvent {
        self.cells.faults.fetch_add(1, Ordering::Relaxed);
        CountingFaultEvent {
            cells: Arc::clone(&self.cells),
        }
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            faults: self.cells.faults.load(Ordering::Relaxed),
            bytes_read: self.cells.bytes_read.load(Ordering::Relaxed),
            evictions: self.cells.evictions.load(Ordering::Relaxed),
            eviction_failures: self.cells.eviction_failures.load(Ordering::Relaxed),
            flushes: self.cells.flushes.load(Ordering::Relaxed),
            pages_flushed: self.cells.pages_flushed.load(Ordering::Relaxed),
            bytes_written: self.cells.bytes_written.load(Ordering::Relaxed),
        }
    }
}

pub struct CountingFaultEvent {
    cells: Arc<Cells>,
}

impl FaultEvent for CountingFaultEvent {
    fn add_bytes_read(&mut self, bytes: u64) {
        self.cells.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    fn set_cache_page_id(&mut self, _cache_page_id: usize) {}
}

struct CountingEvictionEvent {
    cells: Arc<Cells>,
}

struct CountingFlushEvent {
    cells: Arc<Cells>,
}

impl EvictionTracer for CacheCounters {
    fn begin_eviction(&self) -> Box<dyn EvictionEvent> {
        self.cells.evictions.fetch_add(1, Ordering::Relaxed);
        Box::new(CountingEvictionEvent {
            cells: Arc::clone(&self.cells),
        })
    }
}

impl EvictionEvent for CountingEvictionEvent {
    fn set_file_page_id(&mut self, _file_page_id: u64) {}
    fn set_cache_page_id(&mut self, _cache_page_id: usize) {}
    fn set_swapper_id(&mut self, _swapper_id: SwapperId) {}

    fn threw_exception(&mut self, _error: &CacheError) {
        self.cells.eviction_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn begin_flush(
        &mut self,
        _file_page_id: u64,
        _cache_page_id: usize,
        _swapper_id: SwapperId,
    ) -> Box<dyn FlushEvent> {
        Box::new(CountingFlushEvent {
            cells: Arc::clone(&self.cells),
        })
    }
}

impl FlushEvent for CountingFlushEvent {
    fn add_bytes_written(&mut self, bytes: u64) {
        self.cells.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    fn add_pages_flushed(&mut self, pages: u64) {
        self.cells.pages_flushed.fetch_add(pages, Ordering::Relaxed);
    }

    fn done(self: Box<Self>) {
        self.cells.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn failed(self: Box<Self>, _error: &CacheError) {}
}
