//! The command-and-control file shared by the driver and every client.
//!
//! ```text
//! +----------------------------+ 0
//! | CncHeader (128 bytes)      |
//! +----------------------------+ 128
//! | to-driver ring buffer      |
//! +----------------------------+
//! | to-clients broadcast       |
//! +----------------------------+
//! | counters metadata          |
//! +----------------------------+
//! | counters values            |
//! +----------------------------+
//! ```

use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::concurrent::counters::{CountersReader, DRIVER_HEARTBEAT_TYPE_ID};
use crate::concurrent::mmap::MmapFile;
use crate::{Error, Result};

pub const CNC_FILE: &str = "cnc.dat";
pub const CNC_MAGIC: u32 = 0x4344_4E54; // 'CNDT'
pub const CNC_VERSION: u32 = 1;

const INIT_STATE_CREATING: u32 = 1;
const INIT_STATE_READY: u32 = 2;

#[repr(C, align(128))]
pub struct CncHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    pub pid: AtomicU32,
    pub to_driver_buffer_length: AtomicU64,
    pub to_clients_buffer_length: AtomicU64,
    pub counters_metadata_length: AtomicU64,
    pub counters_values_length: AtomicU64,
    pub client_liveness_timeout_ns: AtomicU64,
    pub start_timestamp_ms: AtomicI64,
    pub _pad: [u8; 64],
}

pub const HEADER_LENGTH: usize = size_of::<CncHeader>();

/// Region lengths, trailers included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CncLayout {
    pub to_driver_buffer_length: usize,
    pub to_clients_buffer_length: usize,
    pub counters_metadata_length: usize,
    pub counters_values_length: usize,
}

impl CncLayout {
    pub fn file_length(&self) -> usize {
        HEADER_LENGTH
            + self.to_driver_buffer_length
            + self.to_clients_buffer_length
            + self.counters_metadata_length
            + self.counters_values_length
    }

    fn to_driver_offset(&self) -> usize {
        HEADER_LENGTH
    }

    fn to_clients_offset(&self) -> usize {
        self.to_driver_offset() + self.to_driver_buffer_length
    }

    fn counters_metadata_offset(&self) -> usize {
        self.to_clients_offset() + self.to_clients_buffer_length
    }

    fn counters_values_offset(&self) -> usize {
        self.counters_metadata_offset() + self.counters_metadata_length
    }
}

pub struct CncFile {
    path: PathBuf,
    mmap: MmapFile,
    ptr: *const CncHeader,
}

// SAFETY: the header is only accessed through atomics and the regions through
// `AtomicBuffer` views; the mapping lives as long as the CncFile.
unsafe impl Send for CncFile {}
unsafe impl Sync for CncFile {}

impl CncFile {
    /// Creates the file under a temporary name and renames it into place once
    /// the header is complete, so openers never observe a partial header.
    pub fn create(
        path: &Path,
        layout: CncLayout,
        client_liveness_timeout: Duration,
        start_timestamp_ms: i64,
    ) -> Result<Self> {
        let tmp_path = path.with_extension("tmp");
        let mmap = MmapFile::create(&tmp_path, layout.file_length())?;
        let ptr = mmap.as_slice().as_ptr() as *const CncHeader;
        let header = unsafe { &*ptr };
        header
            .init_state
            .store(INIT_STATE_CREATING, Ordering::Relaxed);
        header.version.store(CNC_VERSION, Ordering::Relaxed);
        header.pid.store(std::process::id(), Ordering::Relaxed);
        header
            .to_driver_buffer_length
            .store(layout.to_driver_buffer_length as u64, Ordering::Relaxed);
        header
            .to_clients_buffer_length
            .store(layout.to_clients_buffer_length as u64, Ordering::Relaxed);
        header
            .counters_metadata_length
            .store(layout.counters_metadata_length as u64, Ordering::Relaxed);
        header
            .counters_values_length
            .store(layout.counters_values_length as u64, Ordering::Relaxed);
        header
            .client_liveness_timeout_ns
            .store(client_liveness_timeout.as_nanos() as u64, Ordering::Relaxed);
        header
            .start_timestamp_ms
            .store(start_timestamp_ms, Ordering::Relaxed);
        header.magic.store(CNC_MAGIC, Ordering::Relaxed);
        header.init_state.store(INIT_STATE_READY, Ordering::Release);
        std::fs::rename(&tmp_path, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            ptr,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mmap = MmapFile::open(path)?;
        if mmap.len() < HEADER_LENGTH {
            return Err(Error::CorruptMetadata("cnc file too small"));
        }
        let ptr = mmap.as_slice().as_ptr() as *const CncHeader;
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            ptr,
        })
    }

    pub fn header(&self) -> &CncHeader {
        unsafe { &*self.ptr }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn check_ready(&self) -> Result<bool> {
        let header = self.header();
        if header.init_state.load(Ordering::Acquire) != INIT_STATE_READY {
            return Ok(false);
        }
        if header.magic.load(Ordering::Acquire) != CNC_MAGIC {
            return Err(Error::CorruptMetadata("cnc magic mismatch"));
        }
        let version = header.version.load(Ordering::Acquire);
        if version != CNC_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        if self.layout().file_length() > self.mmap.len() {
            return Err(Error::CorruptMetadata("cnc regions exceed file length"));
        }
        Ok(true)
    }

    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.check_ready()? {
            if Instant::now() >= deadline {
                return Err(Error::DriverTimeout(format!(
                    "cnc file {} not initialised",
                    self.path.display()
                )));
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    pub fn layout(&self) -> CncLayout {
        let header = self.header();
        CncLayout {
            to_driver_buffer_length: header.to_driver_buffer_length.load(Ordering::Acquire)
                as usize,
            to_clients_buffer_length: header.to_clients_buffer_length.load(Ordering::Acquire)
                as usize,
            counters_metadata_length: header.counters_metadata_length.load(Ordering::Acquire)
                as usize,
            counters_values_length: header.counters_values_length.load(Ordering::Acquire)
                as usize,
        }
    }

    pub fn to_driver_buffer(&self) -> AtomicBuffer {
        let layout = self.layout();
        self.mmap
            .buffer()
            .view(layout.to_driver_offset(), layout.to_driver_buffer_length)
    }

    pub fn to_clients_buffer(&self) -> AtomicBuffer {
        let layout = self.layout();
        self.mmap
            .buffer()
            .view(layout.to_clients_offset(), layout.to_clients_buffer_length)
    }

    pub fn counters_metadata_buffer(&self) -> AtomicBuffer {
        let layout = self.layout();
        self.mmap
            .buffer()
            .view(layout.counters_metadata_offset(), layout.counters_metadata_length)
    }

    pub fn counters_values_buffer(&self) -> AtomicBuffer {
        let layout = self.layout();
        self.mmap
            .buffer()
            .view(layout.counters_values_offset(), layout.counters_values_length)
    }

    pub fn counters_reader(&self) -> CountersReader {
        CountersReader::new(self.counters_metadata_buffer(), self.counters_values_buffer())
    }

    pub fn client_liveness_timeout(&self) -> Duration {
        Duration::from_nanos(
            self.header()
                .client_liveness_timeout_ns
                .load(Ordering::Acquire),
        )
    }

    pub fn start_timestamp_ms(&self) -> i64 {
        self.header().start_timestamp_ms.load(Ordering::Acquire)
    }

    pub fn pid(&self) -> u32 {
        self.header().pid.load(Ordering::Acquire)
    }

    /// Whether the process that created the file still exists.
    #[cfg(unix)]
    pub fn is_driver_process_alive(&self) -> bool {
        let pid = self.pid();
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        // SAFETY: signal 0 only performs the existence and permission check.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    pub fn is_driver_process_alive(&self) -> bool {
        true
    }

    /// Last driver heartbeat (epoch ms), if the driver has allocated its
    /// heartbeat counter.
    pub fn driver_heartbeat_ms(&self) -> Option<i64> {
        let counters = self.counters_reader();
        counters
            .find_by_type_id_and_key(DRIVER_HEARTBEAT_TYPE_ID, &[])
            .map(|id| counters.counter_value(id))
    }

    /// True if a ready CnC file exists in `dir` whose driver heartbeat is
    /// younger than `timeout`.
    pub fn is_driver_active(dir: &Path, timeout: Duration, now_ms: i64) -> Result<bool> {
        let path = dir.join(CNC_FILE);
        if !path.exists() {
            return Ok(false);
        }
        let cnc = match CncFile::open(&path) {
            Ok(cnc) => cnc,
            Err(Error::CorruptMetadata(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        if !cnc.check_ready()? {
            return Ok(false);
        }
        Ok(cnc
            .driver_heartbeat_ms()
            .is_some_and(|heartbeat| now_ms - heartbeat <= timeout.as_millis() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::{CncFile, CncLayout, CNC_FILE, HEADER_LENGTH};
    use crate::concurrent::counters::{
        CountersManager, COUNTER_LENGTH, DRIVER_HEARTBEAT_TYPE_ID, METADATA_LENGTH,
    };
    use std::time::Duration;
    use tempfile::tempdir;

    fn layout() -> CncLayout {
        CncLayout {
            to_driver_buffer_length: 1024 + 512,
            to_clients_buffer_length: 1024 + 128,
            counters_metadata_length: 8 * METADATA_LENGTH,
            counters_values_length: 8 * COUNTER_LENGTH,
        }
    }

    #[test]
    fn header_is_one_cache_line_pair() {
        assert_eq!(HEADER_LENGTH, 128);
    }

    #[test]
    fn created_file_is_ready_and_regions_line_up() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CNC_FILE);
        let created =
            CncFile::create(&path, layout(), Duration::from_secs(10), 1_000).expect("create");
        created.to_clients_buffer().put_i64(0, 77);

        let opened = CncFile::open(&path).expect("open");
        opened.wait_ready(Duration::from_secs(1)).expect("ready");
        assert_eq!(opened.layout(), layout());
        assert_eq!(opened.start_timestamp_ms(), 1_000);
        assert_eq!(opened.client_liveness_timeout(), Duration::from_secs(10));
        assert_eq!(opened.to_clients_buffer().get_i64(0), 77);
        assert_eq!(opened.to_driver_buffer().capacity(), 1024 + 512);
        assert_eq!(opened.pid(), std::process::id());
        assert!(opened.is_driver_process_alive());
    }

    #[test]
    fn driver_activity_follows_heartbeat_freshness() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CNC_FILE);
        assert!(!CncFile::is_driver_active(dir.path(), Duration::from_secs(1), 0).expect("absent"));

        let cnc = CncFile::create(&path, layout(), Duration::from_secs(10), 0).expect("create");
        let mut counters = CountersManager::new(
            cnc.counters_metadata_buffer(),
            cnc.counters_values_buffer(),
            0,
        );
        let id = counters
            .allocate(DRIVER_HEARTBEAT_TYPE_ID, &[], "driver-heartbeat", 1, 0, 0)
            .expect("heartbeat");
        counters.set_counter_value(id, 5_000);

        let timeout = Duration::from_millis(1_000);
        assert!(CncFile::is_driver_active(dir.path(), timeout, 5_500).expect("fresh"));
        assert!(!CncFile::is_driver_active(dir.path(), timeout, 7_000).expect("stale"));
    }
}
