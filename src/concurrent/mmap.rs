use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::{Error, Result};

/// A read/write shared file mapping.
///
/// The base pointer is captured once at map time so that views handed out via
/// [`MmapFile::buffer`] can be used concurrently from several threads; the
/// mapping itself stays alive until the `MmapFile` is dropped.
pub struct MmapFile {
    path: PathBuf,
    file: File,
    map: MmapMut,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is shared memory by design; every concurrent access goes
// through `AtomicBuffer`, which uses atomic operations for all cross-actor words.
unsafe impl Send for MmapFile {}
unsafe impl Sync for MmapFile {}

impl MmapFile {
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidConfig("mmap length must be non-zero".into()));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            ptr,
            len,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::CorruptMetadata("mapped file is empty"));
        }
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            ptr,
            len,
        })
    }

    /// A view over the whole mapping.
    pub fn buffer(&self) -> AtomicBuffer {
        // SAFETY: ptr/len describe the live mapping owned by self.
        unsafe { AtomicBuffer::new(self.ptr, self.len) }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }
}
