//! Per-page sequence lock.
//!
//! Each cache page is guarded by a single 64-bit word combining a sequence
//! counter with writer, exclusive, modified, and flush flags. Readers are
//! optimistic and wait-free: they sample a stamp, read the page, and
//! re-validate. Writers, flushers, and the exclusive owner coordinate through
//! compare-and-swap on the same word. None of the operations block.

use std::fmt;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Low 56 bits: sequence counter, bumped on write release, exclusive release,
/// and exclusive-to-write downgrade.
const SEQ_MASK: u64 = (1 << 56) - 1;
/// Set while a write lock is held. At most one writer.
const WRT_MASK: u64 = 1 << 56;
/// Set while the exclusive lock is held. Forbids every other acquisition.
const EXC_MASK: u64 = 1 << 57;
/// Set when a write lock releases; cleared under exclusive or by a successful
/// flush whose stamp is still current.
const MOD_MASK: u64 = 1 << 58;
/// Set while a flush is in progress. Sits above the sequence so a live flush
/// stamp is never zero.
const FLS_MASK: u64 = 1 << 59;

/// Stamp returned by [`PageLock::unlock_write_and_try_take_flush_lock`] and
/// [`PageLock::try_flush_lock`] when the flush bit was already taken.
pub const FAILED_FLUSH_STAMP: u64 = 0;

fn next_seq(word: u64) -> u64 {
    (word & !SEQ_MASK) | (word.wrapping_add(1) & SEQ_MASK)
}

/// The lock word guarding one cache page.
///
/// `#[repr(transparent)]` over [`AtomicU64`] so the page table can project a
/// `&PageLock` straight onto the first eight bytes of a metadata slot.
#[repr(transparent)]
pub struct PageLock(AtomicU64);

impl PageLock {
    /// A lock word with nothing held and the sequence at zero.
    pub const fn new() -> Self {
        PageLock(AtomicU64::new(0))
    }

    /// The word freshly cleared slots start from: exclusive held, so the slot
    /// stays untouchable until it is handed to the free list.
    pub const fn initial_word_with_exclusive_lock() -> u64 {
        EXC_MASK
    }

    fn word(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Begins an optimistic read. Wait-free, never fails as an operation.
    ///
    /// The stamp carries the sequence bits plus the exclusive bit, so a stamp
    /// taken while the exclusive lock was held can never validate.
    pub fn try_optimistic_read_lock(&self) -> u64 {
        self.0.load(Ordering::Acquire) & (SEQ_MASK | EXC_MASK)
    }

    /// True iff nothing intervened since the stamp was taken: no writer or
    /// exclusive is currently held, the sequence is unchanged, and the stamp
    /// itself was not taken under the exclusive lock.
    pub fn validate_read_lock(&self, stamp: u64) -> bool {
        fence(Ordering::Acquire);
        let word = self.word();
        word & (WRT_MASK | EXC_MASK) == 0 && word & SEQ_MASK == stamp
    }

    /// Relaxed read of the modified flag.
    pub fn is_modified(&self) -> bool {
        self.word() & MOD_MASK != 0
    }

    /// Relaxed read of the exclusive flag.
    pub fn is_exclusively_locked(&self) -> bool {
        self.word() & EXC_MASK != 0
    }

    /// Takes the write lock unless a writer or the exclusive owner holds the
    /// page. A concurrent flush does not block writers.
    pub fn try_write_lock(&self) -> bool {
        let mut word = self.word();
        loop {
            if word & (WRT_MASK | EXC_MASK) != 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                word,
                word | WRT_MASK,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    /// Releases the write lock: clears the writer bit, sets modified, and
    /// bumps the sequence. Must pair 1:1 with a successful
    /// [`try_write_lock`](Self::try_write_lock).
    pub fn unlock_write(&self) {
        let mut word = self.word();
        loop {
            debug_assert!(word & WRT_MASK != 0, "unlock_write without a write lock");
            let next = (next_seq(word) & !WRT_MASK) | MOD_MASK;
            match self
                .0
                .compare_exchange_weak(word, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => word = current,
            }
        }
    }

    /// Releases the write lock and, in the same atomic step, takes the flush
    /// lock if it is free. Returns the new word as the flush stamp, or
    /// [`FAILED_FLUSH_STAMP`] when another flush already holds the page (the
    /// write lock is released either way).
    pub fn unlock_write_and_try_take_flush_lock(&self) -> u64 {
        let mut word = self.word();
        loop {
            debug_assert!(word & WRT_MASK != 0, "unlock_write without a write lock");
            let mut next = (next_seq(word) & !WRT_MASK) | MOD_MASK;
            let stamp = if next & FLS_MASK == 0 {
                next |= FLS_MASK;
                next
            } else {
                FAILED_FLUSH_STAMP
            };
            match self
                .0
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return stamp,
                Err(current) => word = current,
            }
        }
    }

    /// Takes the exclusive lock unless a writer, another exclusive owner, or a
    /// flush holds the page.
    pub fn try_exclusive_lock(&self) -> bool {
        let mut word = self.word();
        loop {
            if word & (WRT_MASK | EXC_MASK | FLS_MASK) != 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                word,
                word | EXC_MASK,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    /// Releases the exclusive lock and bumps the sequence. Returns a stamp
    /// that validates as an optimistic read until the next writer.
    ///
    /// No other thread can change the word while exclusive is held, so this is
    /// a plain store.
    pub fn unlock_exclusive(&self) -> u64 {
        let word = self.word();
        debug_assert!(
            word & EXC_MASK != 0,
            "unlock_exclusive without the exclusive lock"
        );
        let next = next_seq(word) & !EXC_MASK;
        self.0.store(next, Ordering::Release);
        next & SEQ_MASK
    }

    /// Atomically downgrades the exclusive lock to a write lock, bumping the
    /// sequence so stamps taken before the downgrade fail validation.
    pub fn unlock_exclusive_and_take_write_lock(&self) {
        let word = self.word();
        debug_assert!(
            word & EXC_MASK != 0,
            "downgrade without the exclusive lock"
        );
        let next = (next_seq(word) & !EXC_MASK) | WRT_MASK;
        self.0.store(next, Ordering::Release);
    }

    /// Takes the flush lock unless the exclusive owner or another flush holds
    /// the page. Returns the new word as a stamp for
    /// [`unlock_flush`](Self::unlock_flush), or [`FAILED_FLUSH_STAMP`].
    pub fn try_flush_lock(&self) -> u64 {
        let mut word = self.word();
        loop {
            if word & (EXC_MASK | FLS_MASK) != 0 {
                return FAILED_FLUSH_STAMP;
            }
            let next = word | FLS_MASK;
            match self
                .0
                .compare_exchange_weak(word, next, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => word = current,
            }
        }
    }

    /// Releases the flush lock. When `success` and no writer has released or
    /// is holding the page since `stamp`, also clears the modified flag; the
    /// decision is atomic with respect to writers.
    pub fn unlock_flush(&self, stamp: u64, success: bool) {
        let mut word = self.word();
        loop {
            debug_assert!(word & FLS_MASK != 0, "unlock_flush without a flush lock");
            let mut next = word & !FLS_MASK;
            if success && word & SEQ_MASK == stamp & SEQ_MASK && word & WRT_MASK == 0 {
                next &= !MOD_MASK;
            }
            match self
                .0
                .compare_exchange_weak(word, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => word = current,
            }
        }
    }

    /// Clears the modified flag. Legal only under the exclusive lock, which is
    /// what makes the plain store safe.
    pub fn explicitly_mark_unmodified(&self) {
        let word = self.word();
        debug_assert!(
            word & EXC_MASK != 0,
            "marking unmodified without the exclusive lock"
        );
        self.0.store(word & !MOD_MASK, Ordering::Relaxed);
    }
}

impl Default for PageLock {
    fn default() -> Self {
        PageLock::new()
    }
}

impl fmt::Debug for PageLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.word();
        f.debug_struct("PageLock")
            .field("sequence", &(word & SEQ_MASK))
            .field("writer", &(word & WRT_MASK != 0))
            .field("exclusive", &(word & EXC_MASK != 0))
            .field("modified", &(word & MOD_MASK != 0))
            .field("flush", &(word & FLS_MASK != 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn optimistic_read_validates_when_idle() {
        let lock = PageLock::new();
        let stamp = lock.try_optimistic_read_lock();
        assert!(lock.validate_read_lock(stamp));
        assert!(lock.validate_read_lock(stamp), "stamps stay valid until a writer");
    }

    #[test]
    fn stamp_taken_under_exclusive_never_validates() {
        let lock = PageLock::new();
        assert!(lock.try_exclusive_lock());
        let stamp = lock.try_optimistic_read_lock();
        assert!(!lock.validate_read_lock(stamp));
        lock.unlock_exclusive();
        assert!(
            !lock.validate_read_lock(stamp),
            "release bumps the sequence, the old stamp stays dead"
        );
    }

    #[test]
    fn held_write_lock_fails_validation() {
        let lock = PageLock::new();
        let stamp = lock.try_optimistic_read_lock();
        assert!(lock.try_write_lock());
        assert!(!lock.validate_read_lock(stamp));
        lock.unlock_write();
        assert!(!lock.validate_read_lock(stamp), "sequence moved on release");
    }

    #[test]
    fn fresh_stamp_after_write_release_validates() {
        let lock = PageLock::new();
        assert!(lock.try_write_lock());
        lock.unlock_write();
        let stamp = lock.try_optimistic_read_lock();
        assert!(lock.validate_read_lock(stamp));
    }

    #[test]
    fn write_lock_excludes_writers_and_exclusive() {
        let lock = PageLock::new();
        assert!(lock.try_write_lock());
        assert!(!lock.try_write_lock());
        assert!(!lock.try_exclusive_lock());
        lock.unlock_write();
        assert!(lock.try_write_lock());
        lock.unlock_write();
    }

    #[test]
    fn exclusive_lock_excludes_everything() {
        let lock = PageLock::new();
        assert!(lock.try_exclusive_lock());
        assert!(!lock.try_write_lock());
        assert!(!lock.try_exclusive_lock());
        assert_eq!(lock.try_flush_lock(), FAILED_FLUSH_STAMP);
        lock.unlock_exclusive();
    }

    #[test]
    fn flush_does_not_block_writers() {
        let lock = PageLock::new();
        let stamp = lock.try_flush_lock();
        assert_ne!(stamp, FAILED_FLUSH_STAMP);
        assert!(lock.try_write_lock());
        lock.unlock_write();
        lock.unlock_flush(stamp, false);
    }

    #[test]
    fn flush_blocks_exclusive_and_other_flushes() {
        let lock = PageLock::new();
        let stamp = lock.try_flush_lock();
        assert_ne!(stamp, FAILED_FLUSH_STAMP);
        assert!(!lock.try_exclusive_lock());
        assert_eq!(lock.try_flush_lock(), FAILED_FLUSH_STAMP);
        lock.unlock_flush(stamp, false);
        assert!(lock.try_exclusive_lock());
        lock.unlock_exclusive();
    }

    #[test]
    fn write_release_marks_modified_until_exclusive_clear() {
        let lock = PageLock::new();
        assert!(!lock.is_modified());
        assert!(lock.try_write_lock());
        lock.unlock_write();
        assert!(lock.is_modified());
        assert!(lock.try_exclusive_lock());
        lock.explicitly_mark_unmodified();
        assert!(!lock.is_modified());
        lock.unlock_exclusive();
    }

    #[test]
    fn successful_flush_clears_modified() {
        let lock = PageLock::new();
        assert!(lock.try_write_lock());
        lock.unlock_write();
        let stamp = lock.try_flush_lock();
        assert_ne!(stamp, FAILED_FLUSH_STAMP);
        lock.unlock_flush(stamp, true);
        assert!(!lock.is_modified());
    }

    #[test]
    fn failed_flush_leaves_modified() {
        let lock = PageLock::new();
        assert!(lock.try_write_lock());
        lock.unlock_write();
        let stamp = lock.try_flush_lock();
        lock.unlock_flush(stamp, false);
        assert!(lock.is_modified());
    }

    #[test]
    fn write_during_flush_keeps_modified() {
        let lock = PageLock::new();
        assert!(lock.try_write_lock());
        lock.unlock_write();
        let stamp = lock.try_flush_lock();
        assert_ne!(stamp, FAILED_FLUSH_STAMP);
        // A writer slips in while the flush is writing the old image out.
        assert!(lock.try_write_lock());
        lock.unlock_write();
        lock.unlock_flush(stamp, true);
        assert!(
            lock.is_modified(),
            "the page changed after the flush snapshot, it must stay dirty"
        );
    }

    #[test]
    fn writer_holding_during_flush_release_keeps_modified() {
        let lock = PageLock::new();
        assert!(lock.try_write_lock());
        lock.unlock_write();
        let stamp = lock.try_flush_lock();
        assert!(lock.try_write_lock());
        lock.unlock_flush(stamp, true);
        assert!(lock.is_modified());
        lock.unlock_write();
        assert!(lock.is_modified());
    }

    #[test]
    fn unlock_write_and_take_flush_composes() {
        let lock = PageLock::new();
        assert!(lock.try_write_lock());
        let stamp = lock.unlock_write_and_try_take_flush_lock();
        assert_ne!(stamp, FAILED_FLUSH_STAMP);
        assert!(lock.is_modified());
        // The write lock is gone, the flush lock is ours.
        assert!(lock.try_write_lock());
        lock.unlock_write();
        assert_eq!(lock.try_flush_lock(), FAILED_FLUSH_STAMP);
        lock.unlock_flush(stamp, true);
        assert!(lock.is_modified(), "the second writer re-dirtied the page");
    }

    #[test]
    fn unlock_write_and_take_flush_reports_held_flush() {
        let lock = PageLock::new();
        let flush_stamp = lock.try_flush_lock();
        assert_ne!(flush_stamp, FAILED_FLUSH_STAMP);
        assert!(lock.try_write_lock());
        assert_eq!(
            lock.unlock_write_and_try_take_flush_lock(),
            FAILED_FLUSH_STAMP
        );
        // The write lock was still released.
        assert!(lock.try_write_lock());
        lock.unlock_write();
        lock.unlock_flush(flush_stamp, false);
    }

    #[test]
    fn unlock_exclusive_stamp_validates() {
        let lock = PageLock::new();
        assert!(lock.try_exclusive_lock());
        let stamp = lock.unlock_exclusive();
        assert!(lock.validate_read_lock(stamp));
        assert!(lock.try_write_lock());
        lock.unlock_write();
        assert!(!lock.validate_read_lock(stamp));
    }

    #[test]
    fn downgrade_to_write_lock() {
        let lock = PageLock::new();
        let stamp = lock.try_optimistic_read_lock();
        assert!(lock.try_exclusive_lock());
        lock.unlock_exclusive_and_take_write_lock();
        assert!(!lock.is_exclusively_locked());
        assert!(!lock.try_write_lock());
        assert!(!lock.try_exclusive_lock());
        assert!(!lock.validate_read_lock(stamp), "downgrade bumps the sequence");
        lock.unlock_write();
        assert!(lock.is_modified());
    }

    #[test]
    fn initial_word_is_exclusively_locked() {
        let lock = PageLock(AtomicU64::new(
            PageLock::initial_word_with_exclusive_lock(),
        ));
        assert!(lock.is_exclusively_locked());
        assert!(!lock.try_write_lock());
        lock.unlock_exclusive();
        assert!(!lock.is_exclusively_locked());
        assert!(lock.try_write_lock());
        lock.unlock_write();
    }

    #[test]
    fn sequence_wraps_without_touching_flags() {
        let lock = PageLock(AtomicU64::new(SEQ_MASK));
        assert!(lock.try_write_lock());
        lock.unlock_write();
        assert!(lock.is_modified());
        assert!(!lock.is_exclusively_locked());
        let stamp = lock.try_optimistic_read_lock();
        assert!(lock.validate_read_lock(stamp));
        assert_eq!(stamp, 0, "sequence wrapped to zero");
    }

    #[test]
    fn exclusive_lock_is_mutually_exclusive_across_threads() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 10_000;
        let lock = Arc::new(PageLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let acquired = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let acquired = Arc::clone(&acquired);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    if lock.try_exclusive_lock() {
                        let holders = inside.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(holders, 0, "two threads inside the exclusive lock");
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock_exclusive();
                        acquired.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(acquired.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn writers_are_mutually_exclusive_across_threads() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 10_000;
        let lock = Arc::new(PageLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    if lock.try_write_lock() {
                        let holders = inside.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(holders, 0, "two threads inside the write lock");
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock_write();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
