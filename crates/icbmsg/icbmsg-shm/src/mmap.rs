use crate::error::ShmError;
use crate::view::Backing;
use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    path::Path,
};

/// A file-backed read-write mapping shared between two processes.
///
/// Each process plays one core of the link; the file holds both directions.
pub struct MmapRegion {
    _file: File,
    mmap: MmapMut,
    /// Captured once at map time so `Backing::as_mut_ptr` can take `&self`.
    ptr: *mut u8,
}

// SAFETY: the raw pointer aliases `mmap`, which is Send + Sync and lives as
// long as this struct.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Create (or truncate) a file of `size_bytes` zero bytes and map it read-write
    pub fn create_rw<P: AsRef<Path>>(path: P, size_bytes: u64) -> Result<Self, ShmError> {
        let path = path.as_ref();
        let map_err = |source| ShmError::Map {
            path: path.display().to_string(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(map_err)?;
        file.set_len(size_bytes).map_err(map_err)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(map_err)? };
        let ptr = mmap.as_mut_ptr();
        Ok(Self {
            _file: file,
            mmap,
            ptr,
        })
    }

    /// Open an existing file and map it to read and write
    pub fn open_rw<P: AsRef<Path>>(path: P) -> Result<Self, ShmError> {
        let path = path.as_ref();
        let map_err = |source| ShmError::Map {
            path: path.display().to_string(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(map_err)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(map_err)? };
        let ptr = mmap.as_mut_ptr();
        Ok(Self {
            _file: file,
            mmap,
            ptr,
        })
    }
}

impl Backing for MmapRegion {
    #[inline]
    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    fn len(&self) -> usize {
        self.mmap.len()
    }
}
