use std::path::Path;

use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::concurrent::mmap::MmapFile;
use crate::logbuffer::descriptor::{
    check_term_length, compute_log_length, LogMetadata, LOG_META_DATA_LENGTH, PARTITION_COUNT,
};
use crate::{Error, Result};

/// A mapped log file: three term partitions followed by the metadata trailer.
///
/// Publications and images hold this behind an `Arc`; the mapping is released
/// when the last of them is dropped.
pub struct LogBuffers {
    mmap: MmapFile,
    term_length: usize,
    terms: [AtomicBuffer; PARTITION_COUNT],
    metadata: LogMetadata,
}

impl LogBuffers {
    pub fn create(path: &Path, term_length: usize) -> Result<Self> {
        check_term_length(term_length)?;
        let mmap = MmapFile::create(path, compute_log_length(term_length))?;
        Ok(Self::map(mmap, term_length))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mmap = MmapFile::open(path)?;
        let term_length = mmap
            .len()
            .checked_sub(LOG_META_DATA_LENGTH)
            .map(|len| len / PARTITION_COUNT)
            .ok_or(Error::CorruptMetadata("log buffer shorter than its metadata"))?;
        check_term_length(term_length)?;
        if compute_log_length(term_length) != mmap.len() {
            return Err(Error::CorruptMetadata("log buffer length is not 3 terms + metadata"));
        }
        let log = Self::map(mmap, term_length);
        if log.metadata.term_length() != term_length {
            return Err(Error::CorruptMetadata("log metadata term length mismatch"));
        }
        Ok(log)
    }

    fn map(mmap: MmapFile, term_length: usize) -> Self {
        let whole = mmap.buffer();
        let terms = [
            whole.view(0, term_length),
            whole.view(term_length, term_length),
            whole.view(2 * term_length, term_length),
        ];
        let metadata =
            LogMetadata::new(whole.view(PARTITION_COUNT * term_length, LOG_META_DATA_LENGTH));
        Self {
            mmap,
            term_length,
            terms,
            metadata,
        }
    }

    pub fn term_length(&self) -> usize {
        self.term_length
    }

    pub fn term_buffer(&self, partition: usize) -> AtomicBuffer {
        self.terms[partition]
    }

    pub fn metadata(&self) -> LogMetadata {
        self.metadata
    }

    pub fn path(&self) -> &Path {
        self.mmap.path()
    }
}

#[cfg(test)]
mod tests {
    use super::LogBuffers;
    use crate::logbuffer::descriptor::TERM_MIN_LENGTH;
    use tempfile::tempdir;

    #[test]
    fn reopened_log_sees_driver_metadata() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("1.logbuffer");
        let created = LogBuffers::create(&path, TERM_MIN_LENGTH).expect("create");
        created
            .metadata()
            .initialise(1, 50, TERM_MIN_LENGTH, 1408, 3, 4);
        created.term_buffer(2).put_i32(0, 99);

        let opened = LogBuffers::open(&path).expect("open");
        assert_eq!(opened.term_length(), TERM_MIN_LENGTH);
        assert_eq!(opened.metadata().initial_term_id(), 50);
        assert_eq!(opened.term_buffer(2).get_i32(0), 99);
    }

    #[test]
    fn rejects_files_with_bad_geometry() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.logbuffer");
        std::fs::write(&path, vec![0u8; 10_000]).expect("write");
        assert!(LogBuffers::open(&path).is_err());
    }
}
