//! The packed per-page metadata table.
//!
//! Each cache page owns a 32-byte off-heap slot:
//!
//! | bytes | field |
//! |-------|-------|
//! | 8     | sequence lock word |
//! | 8     | buffer address (0 until allocated, never cleared after) |
//! | 8     | file page id (`UNBOUND_PAGE_ID` when free) |
//! | 4     | swapper id (0 when not bound) |
//! | 1     | usage stamp, saturating at 4 |
//! | 3     | padding |
//!
//! Slots are addressed through opaque [`PageRef`] handles. Identity fields
//! (file page id, swapper id) change only under the exclusive lock, through
//! [`PageTable::fault`] and [`PageTable::try_evict`]; everything else reads
//! them racily, which is why all access goes through atomics. The layout is
//! stable so a crash dump can be interpreted from the base address and page
//! count alone.

#![allow(unsafe_code)]

use std::slice;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::lock::PageLock;
use crate::memory::{allocate_victim_page, MemoryManager, MmapMemoryManager};
use crate::swap::{Swapper, SwapperId, SwapperSet};
use crate::trace::{EvictionEvent, EvictionTracer, FaultEvent};

/// Reserved file page id meaning "this slot is not loaded".
pub const UNBOUND_PAGE_ID: u64 = u64::MAX;

/// Ceiling of the clock usage stamp.
pub const MAX_USAGE: u8 = 4;

const SLOT_BYTES: usize = 32;
const SLOT_SHIFT: u32 = 5;
const OFF_LOCK: usize = 0;
const OFF_ADDRESS: usize = 8;
const OFF_FILE_PAGE_ID: usize = 16;
const OFF_SWAPPER_ID: usize = 24;
const OFF_USAGE: usize = 28;

/// Sizing for [`PageTable::with_options`].
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Number of cache pages in the table.
    pub page_count: usize,
    /// Size of each cache page in bytes.
    pub page_size: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            page_count: 128,
            page_size: 8192,
        }
    }
}

/// Opaque handle to one metadata slot, valid only for the table that minted
/// it. Constant-time conversion to and from the small cache page id.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PageRef(usize);

struct TableInner {
    base: usize,
    page_count: usize,
    page_size: usize,
    memory: Arc<dyn MemoryManager>,
    swappers: Arc<SwapperSet>,
    victim_page: *mut u8,
}

// SAFETY: every access to the metadata region goes through atomics, and the
// mutation protocols for identity fields and buffers are serialized by the
// per-slot lock word. The raw pointers themselves are never handed out
// mutably without that protocol.
unsafe impl Send for TableInner {}
unsafe impl Sync for TableInner {}

/// The page metadata table. Cloning produces another view of the same region;
/// all clones are effectively the same object.
#[derive(Clone)]
pub struct PageTable {
    inner: Arc<TableInner>,
}

fn clear_slots(base: usize, page_count: usize) {
    for id in 0..page_count {
        let slot = base + id * SLOT_BYTES;
        // SAFETY: `slot` addresses a freshly allocated, exclusively owned
        // region; nothing can observe it before the fence below.
        unsafe {
            (*((slot + OFF_LOCK) as *const AtomicU64)).store(
                PageLock::initial_word_with_exclusive_lock(),
                Ordering::Relaxed,
            );
            (*((slot + OFF_ADDRESS) as *const AtomicU64)).store(0, Ordering::Relaxed);
            (*((slot + OFF_FILE_PAGE_ID) as *const AtomicU64))
                .store(UNBOUND_PAGE_ID, Ordering::Relaxed);
            (*((slot + OFF_SWAPPER_ID) as *const AtomicU32)).store(0, Ordering::Relaxed);
            (*((slot + OFF_USAGE) as *const AtomicU8)).store(0, Ordering::Relaxed);
        }
    }
    // Publish the cleared image before the table is handed out.
    fence(Ordering::SeqCst);
}

impl PageTable {
    /// Builds a table over `page_count` slots, allocating and clearing the
    /// metadata region. Every slot starts with the exclusive lock held; the
    /// owner releases it as the slot enters the free list.
    pub fn new(
        page_count: usize,
        page_size: usize,
        memory: Arc<dyn MemoryManager>,
        swappers: Arc<SwapperSet>,
        victim_page: *mut u8,
    ) -> Result<PageTable> {
        if page_count == 0 {
            return Err(CacheError::InvalidArgument("page count must be non-zero"));
        }
        if page_size == 0 {
            return Err(CacheError::InvalidArgument("page size must be non-zero"));
        }
        let bytes = page_count
            .checked_mul(SLOT_BYTES)
            .ok_or(CacheError::InvalidArgument("metadata region overflows"))?;
        let base = memory.allocate_aligned(bytes)? as usize;
        clear_slots(base, page_count);
        debug!(pages = page_count, page_size, "table.created");
        Ok(PageTable {
            inner: Arc::new(TableInner {
                base,
                page_count,
                page_size,
                memory,
                swappers,
                victim_page,
            }),
        })
    }

    /// Convenience constructor wiring up the default memory manager and a
    /// victim page.
    pub fn with_options(options: CacheOptions, swappers: Arc<SwapperSet>) -> Result<PageTable> {
        let memory: Arc<dyn MemoryManager> = Arc::new(MmapMemoryManager::new());
        let victim_page = allocate_victim_page(&*memory, options.page_size)?;
        PageTable::new(
            options.page_count,
            options.page_size,
            memory,
            swappers,
            victim_page,
        )
    }

    pub fn page_count(&self) -> usize {
        self.inner.page_count
    }

    pub fn cache_page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn swappers(&self) -> &Arc<SwapperSet> {
        &self.inner.swappers
    }

    /// The shared scratch page handed to cursors whose fault failed. The
    /// table only holds it; it never reads or writes through it.
    pub fn victim_page(&self) -> *mut u8 {
        self.inner.victim_page
    }

    fn contains(&self, page_ref: PageRef) -> bool {
        let end = self.inner.base + self.inner.page_count * SLOT_BYTES;
        page_ref.0 >= self.inner.base
            && page_ref.0 < end
            && (page_ref.0 - self.inner.base) % SLOT_BYTES == 0
    }

    /// Turns a cache page id into the handle used by every other operation.
    pub fn deref(&self, cache_page_id: usize) -> PageRef {
        debug_assert!(cache_page_id < self.inner.page_count);
        PageRef(self.inner.base + cache_page_id * SLOT_BYTES)
    }

    /// Inverse of [`deref`](Self::deref).
    pub fn to_id(&self, page_ref: PageRef) -> usize {
        debug_assert!(self.contains(page_ref));
        (page_ref.0 - self.inner.base) >> SLOT_SHIFT
    }

    fn lock(&self, page_ref: PageRef) -> &PageLock {
        debug_assert!(self.contains(page_ref));
        // SAFETY: `PageLock` is repr(transparent) over AtomicU64 and the slot
        // keeps its lock word at offset 0, 8-byte aligned, for the region's
        // lifetime (the inner Arc outlives the returned borrow).
        unsafe { &*((page_ref.0 + OFF_LOCK) as *const PageLock) }
    }

    fn address_cell(&self, page_ref: PageRef) -> &AtomicU64 {
        debug_assert!(self.contains(page_ref));
        // SAFETY: as in `lock`; 8-byte aligned field inside the live region.
        unsafe { &*((page_ref.0 + OFF_ADDRESS) as *const AtomicU64) }
    }

    fn file_page_id_cell(&self, page_ref: PageRef) -> &AtomicU64 {
        debug_assert!(self.contains(page_ref));
        // SAFETY: as in `lock`.
        unsafe { &*((page_ref.0 + OFF_FILE_PAGE_ID) as *const AtomicU64) }
    }

    fn swapper_id_cell(&self, page_ref: PageRef) -> &AtomicU32 {
        debug_assert!(self.contains(page_ref));
        // SAFETY: as in `lock`; 4-byte aligned field.
        unsafe { &*((page_ref.0 + OFF_SWAPPER_ID) as *const AtomicU32) }
    }

    fn usage_cell(&self, page_ref: PageRef) -> &AtomicU8 {
        debug_assert!(self.contains(page_ref));
        // SAFETY: as in `lock`; single byte.
        unsafe { &*((page_ref.0 + OFF_USAGE) as *const AtomicU8) }
    }

    // Lock operations, forwarded to the slot's lock word.

    pub fn try_optimistic_read_lock(&self, page_ref: PageRef) -> u64 {
        self.lock(page_ref).try_optimistic_read_lock()
    }

    pub fn validate_read_lock(&self, page_ref: PageRef, stamp: u64) -> bool {
        self.lock(page_ref).validate_read_lock(stamp)
    }

    pub fn is_modified(&self, page_ref: PageRef) -> bool {
        self.lock(page_ref).is_modified()
    }

    pub fn is_exclusively_locked(&self, page_ref: PageRef) -> bool {
        self.lock(page_ref).is_exclusively_locked()
    }

    pub fn try_write_lock(&self, page_ref: PageRef) -> bool {
        self.lock(page_ref).try_write_lock()
    }

    pub fn unlock_write(&self, page_ref: PageRef) {
        self.lock(page_ref).unlock_write()
    }

    pub fn unlock_write_and_try_take_flush_lock(&self, page_ref: PageRef) -> u64 {
        self.lock(page_ref).unlock_write_and_try_take_flush_lock()
    }

    pub fn try_exclusive_lock(&self, page_ref: PageRef) -> bool {
        self.lock(page_ref).try_exclusive_lock()
    }

    pub fn unlock_exclusive(&self, page_ref: PageRef) -> u64 {
        self.lock(page_ref).unlock_exclusive()
    }

    pub fn unlock_exclusive_and_take_write_lock(&self, page_ref: PageRef) {
        self.lock(page_ref).unlock_exclusive_and_take_write_lock()
    }

    pub fn try_flush_lock(&self, page_ref: PageRef) -> u64 {
        self.lock(page_ref).try_flush_lock()
    }

    pub fn unlock_flush(&self, page_ref: PageRef, stamp: u64, success: bool) {
        self.lock(page_ref).unlock_flush(stamp, success)
    }

    pub fn explicitly_mark_unmodified(&self, page_ref: PageRef) {
        self.lock(page_ref).explicitly_mark_unmodified()
    }

    // Slot fields.

    /// Address of the slot's page buffer, or 0 if none was allocated yet.
    /// Once non-zero it never changes; the buffer is recycled with the slot.
    pub fn address(&self, page_ref: PageRef) -> u64 {
        self.address_cell(page_ref).load(Ordering::Acquire)
    }

    /// Allocates the slot's page buffer if it does not have one. Idempotent.
    /// The caller must hold the exclusive lock.
    pub fn init_buffer(&self, page_ref: PageRef) -> Result<()> {
        debug_assert!(self.is_exclusively_locked(page_ref));
        if self.address(page_ref) == 0 {
            let buffer = self.inner.memory.allocate_aligned(self.inner.page_size)?;
            self.address_cell(page_ref)
                .store(buffer as u64, Ordering::Release);
        }
        Ok(())
    }

    pub fn file_page_id(&self, page_ref: PageRef) -> u64 {
        self.file_page_id_cell(page_ref).load(Ordering::Relaxed)
    }

    fn set_file_page_id(&self, page_ref: PageRef, file_page_id: u64) {
        self.file_page_id_cell(page_ref)
            .store(file_page_id, Ordering::Relaxed);
    }

    pub fn swapper_id(&self, page_ref: PageRef) -> SwapperId {
        SwapperId(self.swapper_id_cell(page_ref).load(Ordering::Acquire))
    }

    fn set_swapper_id(&self, page_ref: PageRef, swapper_id: SwapperId) {
        self.swapper_id_cell(page_ref)
            .store(swapper_id.0, Ordering::Release);
    }

    /// A loaded slot carries file data, though possibly not yet (or no
    /// longer) bound to its file.
    pub fn is_loaded(&self, page_ref: PageRef) -> bool {
        self.file_page_id(page_ref) != UNBOUND_PAGE_ID
    }

    /// True iff the slot is bound to exactly this page of this swapper's
    /// file; this is the check translation-table lookups race against.
    pub fn is_bound_to(&self, page_ref: PageRef, swapper_id: SwapperId, file_page_id: u64) -> bool {
        self.swapper_id(page_ref) == swapper_id && self.file_page_id(page_ref) == file_page_id
    }

    pub fn usage_counter(&self, page_ref: PageRef) -> u8 {
        self.usage_cell(page_ref).load(Ordering::Relaxed)
    }

    pub fn set_usage_counter(&self, page_ref: PageRef, usage: u8) {
        debug_assert!(usage <= MAX_USAGE);
        self.usage_cell(page_ref).store(usage, Ordering::Relaxed);
    }

    /// Bumps the usage stamp towards [`MAX_USAGE`]. Intentionally racy: a
    /// lost increment only makes the page cheaper to evict. Skips the store
    /// when already maxed so hot pages do not slosh the cache line.
    pub fn increment_usage(&self, page_ref: PageRef) {
        let usage = self.usage_counter(page_ref);
        if usage < MAX_USAGE {
            self.set_usage_counter(page_ref, usage + 1);
        }
    }

    /// Ticks the clock hand down. Returns true iff the value seen or written
    /// is zero, meaning the page is ripe for eviction. Racy like
    /// [`increment_usage`](Self::increment_usage).
    pub fn decrement_usage(&self, page_ref: PageRef) -> bool {
        let mut usage = self.usage_counter(page_ref);
        if usage > 0 {
            usage -= 1;
            self.set_usage_counter(page_ref, usage);
        }
        usage == 0
    }

    // SAFETY: callers must hold a lock that keeps the buffer from going away
    // or being written concurrently (exclusive, or flush for reads), and the
    // slot's address must be non-zero.
    unsafe fn buffer(&self, page_ref: PageRef) -> &[u8] {
        let address = self.address(page_ref);
        debug_assert_ne!(address, 0);
        slice::from_raw_parts(address as *const u8, self.inner.page_size)
    }

    unsafe fn buffer_mut(&self, page_ref: PageRef) -> &mut [u8] {
        let address = self.address(page_ref);
        debug_assert_ne!(address, 0);
        slice::from_raw_parts_mut(address as *mut u8, self.inner.page_size)
    }

    /// Binds an unbound slot to `file_page_id` of the swapper's file, reading
    /// the page image into the slot's buffer.
    ///
    /// The caller must hold the exclusive lock on a slot with an initialized
    /// buffer that is neither loaded nor bound; anything else is
    /// [`CacheError::IllegalFault`].
    ///
    /// The file page id is assigned before the read and the swapper id after
    /// it. If the read fails the slot stays loaded-but-unbound: translation
    /// table lookups will not match it (so the fault is redone), while
    /// eviction still reclaims it back to fully unbound.
    pub fn fault(
        &self,
        page_ref: PageRef,
        swapper: &dyn Swapper,
        swapper_id: SwapperId,
        file_page_id: u64,
        event: &mut dyn FaultEvent,
    ) -> Result<()> {
        let current_swapper_id = self.swapper_id(page_ref);
        let current_file_page_id = self.file_page_id(page_ref);
        if file_page_id == UNBOUND_PAGE_ID
            || swapper_id == SwapperId::NONE
            || !self.is_exclusively_locked(page_ref)
            || self.address(page_ref) == 0
            || current_swapper_id != SwapperId::NONE
            || current_file_page_id != UNBOUND_PAGE_ID
        {
            return Err(CacheError::IllegalFault {
                cache_page_id: self.to_id(page_ref),
                swapper_id: swapper_id.0,
                file_page_id,
                current_swapper_id: current_swapper_id.0,
                current_file_page_id,
            });
        }
        // Loaded from here on. Must precede the read: see the doc comment.
        self.set_file_page_id(page_ref, file_page_id);
        fence(Ordering::Release);
        // SAFETY: exclusive is held and the address check above passed.
        let dst = unsafe { self.buffer_mut(page_ref) };
        let bytes_read = swapper.read(file_page_id, dst)?;
        event.add_bytes_read(bytes_read as u64);
        event.set_cache_page_id(self.to_id(page_ref));
        // Bound from here on; lookups will now match.
        self.set_swapper_id(page_ref, swapper_id);
        Ok(())
    }

    /// Attempts to reclaim the slot: takes the exclusive lock, flushes the
    /// page if it is dirty, notifies the swapper, and clears the binding.
    ///
    /// Returns `Ok(false)` when the slot is locked by someone else or not
    /// loaded. On `Ok(true)` the caller is left holding the exclusive lock on
    /// a now-unbound slot, ready to push onto a free list. On error the
    /// exclusive lock has been released and the binding is intact.
    pub fn try_evict(&self, page_ref: PageRef, tracer: &dyn EvictionTracer) -> Result<bool> {
        if !self.try_exclusive_lock(page_ref) {
            return Ok(false);
        }
        if !self.is_loaded(page_ref) {
            self.unlock_exclusive(page_ref);
            return Ok(false);
        }
        let mut event = tracer.begin_eviction();
        self.evict(page_ref, &mut *event)?;
        Ok(true)
    }

    fn evict(&self, page_ref: PageRef, event: &mut dyn EvictionEvent) -> Result<()> {
        let file_page_id = self.file_page_id(page_ref);
        event.set_file_page_id(file_page_id);
        event.set_cache_page_id(self.to_id(page_ref));
        let swapper_id = self.swapper_id(page_ref);
        if swapper_id != SwapperId::NONE {
            // Non-zero swapper id means the slot is not only loaded but
            // bound, and possibly modified.
            let swapper = match self.inner.swappers.get_allocation(swapper_id) {
                Some(swapper) => swapper,
                None => {
                    let error = CacheError::UnknownSwapper(swapper_id.0);
                    self.unlock_exclusive(page_ref);
                    event.threw_exception(&error);
                    warn!(file_page_id, swapper_id = swapper_id.0, "table.evict.swapper_missing");
                    return Err(error);
                }
            };
            event.set_swapper_id(swapper_id);
            if self.is_modified(page_ref) {
                let mut flush =
                    event.begin_flush(file_page_id, self.to_id(page_ref), swapper_id);
                // SAFETY: exclusive is held; a bound slot was faulted, so its
                // buffer exists.
                let image = unsafe { self.buffer(page_ref) };
                match swapper.write(file_page_id, image) {
                    Ok(bytes_written) => {
                        self.explicitly_mark_unmodified(page_ref);
                        flush.add_bytes_written(bytes_written as u64);
                        flush.add_pages_flushed(1);
                        flush.done();
                    }
                    Err(error) => {
                        self.unlock_exclusive(page_ref);
                        flush.failed(&error);
                        event.threw_exception(&error);
                        warn!(file_page_id, error = %error, "table.evict.flush_failed");
                        return Err(error);
                    }
                }
            }
            swapper.evicted(file_page_id);
        }
        self.clear_binding(page_ref);
        Ok(())
    }

    fn clear_binding(&self, page_ref: PageRef) {
        self.set_file_page_id(page_ref, UNBOUND_PAGE_ID);
        self.set_swapper_id(page_ref, SwapperId::NONE);
    }

    /// Racy point-in-time view of one slot, for logs and crash diagnostics.
    pub fn slot_snapshot(&self, page_ref: PageRef) -> SlotSnapshot {
        SlotSnapshot {
            cache_page_id: self.to_id(page_ref),
            address: self.address(page_ref),
            file_page_id: self.file_page_id(page_ref),
            swapper_id: self.swapper_id(page_ref),
            usage_counter: self.usage_counter(page_ref),
            modified: self.is_modified(page_ref),
            exclusively_locked: self.is_exclusively_locked(page_ref),
        }
    }
}

/// Snapshot of one slot's fields for observability.
#[derive(Clone, Debug)]
pub struct SlotSnapshot {
    pub cache_page_id: usize,
    pub address: u64,
    pub file_page_id: u64,
    pub swapper_id: SwapperId,
    pub usage_counter: u8,
    pub modified: bool,
    pub exclusively_locked: bool,
}

impl std::fmt::Display for SlotSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Page[id = {}, address = {:#x}, file_page_id = {}, swapper_id = {}, usage = {}, modified = {}, exclusive = {}]",
            self.cache_page_id,
            self.address,
            self.file_page_id,
            self.swapper_id.0,
            self.usage_counter,
            self.modified,
            self.exclusively_locked,
        )
    }
}
