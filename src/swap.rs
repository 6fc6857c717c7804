//! Swappers move page images between cache buffers and backing files.
//!
//! The page table never allocates swapper ids; it only stores and retrieves
//! them. Ids are small positive integers handed out by [`SwapperSet`], with
//! id 0 reserved to mean "not bound".

#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{CacheError, Result};

/// Identifier of a registered swapper. Zero is never a valid registration.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SwapperId(pub u32);

impl SwapperId {
    /// The reserved "not bound" id stored in free slots.
    pub const NONE: SwapperId = SwapperId(0);
}

/// Per-file page I/O.
pub trait Swapper: Send + Sync + 'static {
    /// Reads the page image into `dst`. Short reads at end-of-file zero-fill
    /// the remainder of the buffer; the return value is the bytes actually
    /// read from the file.
    fn read(&self, file_page_id: u64, dst: &mut [u8]) -> Result<usize>;

    /// Writes the page image from `src`, returning the bytes written.
    fn write(&self, file_page_id: u64, src: &[u8]) -> Result<usize>;

    /// Called after the page was evicted from the cache, so the swapper can
    /// drop per-page state of its own.
    fn evicted(&self, file_page_id: u64);
}

/// Registry mapping [`SwapperId`]s to swappers.
///
/// Slot 0 is permanently reserved; freed ids are reused by later allocations.
#[derive(Default)]
pub struct SwapperSet {
    slots: RwLock<Vec<Option<Arc<dyn Swapper>>>>,
}

impl SwapperSet {
    pub fn new() -> Self {
        SwapperSet {
            slots: RwLock::new(vec![None]),
        }
    }

    /// Registers a swapper and returns the lowest free id.
    pub fn allocate(&self, swapper: Arc<dyn Swapper>) -> SwapperId {
        let mut slots = self.slots.write();
        if slots.is_empty() {
            slots.push(None);
        }
        let id = match slots.iter().skip(1).position(Option::is_none) {
            Some(free) => {
                let id = free + 1;
                slots[id] = Some(swapper);
                id
            }
            None => {
                slots.push(Some(swapper));
                slots.len() - 1
            }
        };
        debug!(swapper_id = id, "swappers.allocated");
        SwapperId(id as u32)
    }

    /// Looks up the swapper registered under `id`, if any.
    pub fn get_allocation(&self, id: SwapperId) -> Option<Arc<dyn Swapper>> {
        self.slots.read().get(id.0 as usize)?.clone()
    }

    /// Drops the registration for `id`, making it available for reuse.
    /// Returns whether the id was registered. The caller is responsible for
    /// evicting every page still bound to the id first.
    pub fn free(&self, id: SwapperId) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(id.0 as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                debug!(swapper_id = id.0, "swappers.freed");
                true
            }
            _ => false,
        }
    }
}

/// [`Swapper`] over a single backing file using positioned I/O.
pub struct FileSwapper {
    file: Arc<File>,
    page_size: usize,
    path: PathBuf,
}

impl FileSwapper {
    /// Opens (creating if absent) the backing file.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(CacheError::InvalidArgument("page size must be non-zero"));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(CacheError::Io)?;
        Ok(FileSwapper {
            file: Arc::new(file),
            page_size,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(CacheError::Io)
    }

    fn page_offset(&self, file_page_id: u64) -> Result<u64> {
        file_page_id
            .checked_mul(self.page_size as u64)
            .ok_or(CacheError::InvalidArgument("page offset overflow"))
    }
}

impl Swapper for FileSwapper {
    fn read(&self, file_page_id: u64, dst: &mut [u8]) -> Result<usize> {
        let offset = self.page_offset(file_page_id)?;
        let read = positioned::read_until_eof(&self.file, offset, dst)?;
        dst[read..].fill(0);
        Ok(read)
    }

    fn write(&self, file_page_id: u64, src: &[u8]) -> Result<usize> {
        let offset = self.page_offset(file_page_id)?;
        positioned::write_all(&self.file, offset, src)?;
        Ok(src.len())
    }

    fn evicted(&self, _file_page_id: u64) {}
}

#[cfg(unix)]
mod positioned {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::unix::fs::FileExt;

    pub fn read_until_eof(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < dst.len() {
            let read = file.read_at(&mut dst[filled..], off)?;
            if read == 0 {
                break;
            }
            filled += read;
            off += read as u64;
        }
        Ok(filled)
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod positioned {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::windows::fs::FileExt;

    pub fn read_until_eof(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < dst.len() {
            let read = file.seek_read(&mut dst[filled..], off)?;
            if read == 0 {
                break;
            }
            filled += read;
            off += read as u64;
        }
        Ok(filled)
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod positioned {
    use std::fs::File;
    use std::io;

    pub fn read_until_eof(_file: &File, _off: u64, _dst: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned I/O unsupported on this platform",
        ))
    }

    pub fn write_all(_file: &File, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned I/O unsupported on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let swapper = FileSwapper::open(dir.path().join("pages.db"), 64).unwrap();
        let image = vec![0xABu8; 64];
        assert_eq!(swapper.write(3, &image).unwrap(), 64);
        let mut dst = vec![0u8; 64];
        assert_eq!(swapper.read(3, &mut dst).unwrap(), 64);
        assert_eq!(dst, image);
    }

    #[test]
    fn read_past_eof_zero_fills() {
        let dir = tempdir().unwrap();
        let swapper = FileSwapper::open(dir.path().join("pages.db"), 64).unwrap();
        let mut dst = vec![0xFFu8; 64];
        assert_eq!(swapper.read(9, &mut dst).unwrap(), 0);
        assert!(dst.iter().all(|&b| b == 0));
    }

    #[test]
    fn partial_tail_page_zero_fills_remainder() {
        let dir = tempdir().unwrap();
        let swapper = FileSwapper::open(dir.path().join("pages.db"), 64).unwrap();
        swapper.write(0, &vec![7u8; 64]).unwrap();
        swapper.file.set_len(16).unwrap();
        let mut dst = vec![0xFFu8; 64];
        assert_eq!(swapper.read(0, &mut dst).unwrap(), 16);
        assert!(dst[..16].iter().all(|&b| b == 7));
        assert!(dst[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn huge_page_id_overflows_cleanly() {
        let dir = tempdir().unwrap();
        let swapper = FileSwapper::open(dir.path().join("pages.db"), 8192).unwrap();
        let mut dst = vec![0u8; 8192];
        assert!(matches!(
            swapper.read(u64::MAX, &mut dst),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    struct DummySwapper;

    impl Swapper for DummySwapper {
        fn read(&self, _file_page_id: u64, dst: &mut [u8]) -> Result<usize> {
            dst.fill(0);
            Ok(0)
        }

        fn write(&self, _file_page_id: u64, src: &[u8]) -> Result<usize> {
            Ok(src.len())
        }

        fn evicted(&self, _file_page_id: u64) {}
    }

    #[test]
    fn ids_start_at_one_and_are_reused() {
        let set = SwapperSet::new();
        let a = set.allocate(Arc::new(DummySwapper));
        let b = set.allocate(Arc::new(DummySwapper));
        assert_eq!(a, SwapperId(1));
        assert_eq!(b, SwapperId(2));
        assert!(set.get_allocation(a).is_some());
        assert!(set.free(a));
        assert!(set.get_allocation(a).is_none());
        let c = set.allocate(Arc::new(DummySwapper));
        assert_eq!(c, a, "freed ids are reused first");
        assert!(set.get_allocation(b).is_some());
    }

    #[test]
    fn zero_id_is_never_registered() {
        let set = SwapperSet::new();
        assert!(set.get_allocation(SwapperId::NONE).is_none());
        assert!(!set.free(SwapperId::NONE));
    }

    #[test]
    fn double_free_reports_false() {
        let set = SwapperSet::new();
        let id = set.allocate(Arc::new(DummySwapper));
        assert!(set.free(id));
        assert!(!set.free(id));
    }
}
