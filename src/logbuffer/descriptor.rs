//! Log buffer geometry and the metadata trailer that follows the three term
//! partitions.
//!
//! ```text
//! 0    raw tail partition 0..2   i64 x 3   (term_id << 32 | term_offset)
//! 24   active term count         i32
//! 128  end of stream position    i64
//! 136  is connected              i32
//! 256  correlation id            i64
//! 264  initial term id           i32
//! 268  default frame hdr length  i32
//! 272  mtu                       i32
//! 276  term length               i32
//! 280  page size                 i32
//! 384  default frame header      [u8; 32]
//! ```

use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::logbuffer::frame::{DataHeader, HEADER_LENGTH};
use crate::{Error, Result};

pub const PARTITION_COUNT: usize = 3;
pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;
pub const PAGE_SIZE: usize = 4096;
pub const LOG_META_DATA_LENGTH: usize = 4096;
pub const MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

pub const TERM_TAIL_COUNTERS_OFFSET: usize = 0;
pub const LOG_ACTIVE_TERM_COUNT_OFFSET: usize = 24;
pub const LOG_END_OF_STREAM_POSITION_OFFSET: usize = 128;
pub const LOG_IS_CONNECTED_OFFSET: usize = 136;
pub const LOG_CORRELATION_ID_OFFSET: usize = 256;
pub const LOG_INITIAL_TERM_ID_OFFSET: usize = 264;
pub const LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET: usize = 268;
pub const LOG_MTU_LENGTH_OFFSET: usize = 272;
pub const LOG_TERM_LENGTH_OFFSET: usize = 276;
pub const LOG_PAGE_SIZE_OFFSET: usize = 280;
pub const LOG_DEFAULT_FRAME_HEADER_OFFSET: usize = 384;

pub fn check_term_length(term_length: usize) -> Result<()> {
    if !(TERM_MIN_LENGTH..=TERM_MAX_LENGTH).contains(&term_length) {
        return Err(Error::InvalidConfig(format!(
            "term length {term_length} outside {TERM_MIN_LENGTH}..={TERM_MAX_LENGTH}"
        )));
    }
    if !term_length.is_power_of_two() {
        return Err(Error::InvalidConfig(format!(
            "term length {term_length} is not a power of two"
        )));
    }
    Ok(())
}

pub fn compute_log_length(term_length: usize) -> usize {
    term_length * PARTITION_COUNT + LOG_META_DATA_LENGTH
}

pub fn max_message_length(term_length: usize) -> usize {
    (term_length / 8).min(MAX_MESSAGE_LENGTH)
}

pub fn position_bits_to_shift(term_length: usize) -> u32 {
    term_length.trailing_zeros()
}

#[inline]
pub fn index_by_term_count(term_count: i64) -> usize {
    (term_count % PARTITION_COUNT as i64) as usize
}

#[inline]
pub fn index_by_term(initial_term_id: i32, active_term_id: i32) -> usize {
    (active_term_id.wrapping_sub(initial_term_id) as i64).rem_euclid(PARTITION_COUNT as i64)
        as usize
}

#[inline]
pub fn index_by_position(position: i64, position_bits_to_shift: u32) -> usize {
    ((position >> position_bits_to_shift) % PARTITION_COUNT as i64) as usize
}

#[inline]
pub fn compute_position(
    active_term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = active_term_id.wrapping_sub(initial_term_id) as i64;
    (term_count << position_bits_to_shift) + term_offset as i64
}

#[inline]
pub fn compute_term_begin_position(
    active_term_id: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    compute_position(active_term_id, 0, position_bits_to_shift, initial_term_id)
}

#[inline]
pub fn compute_term_id_from_position(
    position: i64,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i32 {
    ((position >> position_bits_to_shift) as i32).wrapping_add(initial_term_id)
}

#[inline]
pub fn compute_term_offset_from_position(position: i64, position_bits_to_shift: u32) -> i32 {
    (position & ((1i64 << position_bits_to_shift) - 1)) as i32
}

#[inline]
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as u32 as i64)
}

#[inline]
pub fn term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Offset part of a raw tail, clamped to the term length since appenders may
/// push the tail past the end of the term.
#[inline]
pub fn term_offset(raw_tail: i64, term_length: usize) -> i32 {
    let tail = raw_tail & 0xFFFF_FFFF;
    tail.min(term_length as i64) as i32
}

/// Typed access to the metadata trailer of a log.
#[derive(Clone, Copy, Debug)]
pub struct LogMetadata {
    buffer: AtomicBuffer,
}

impl LogMetadata {
    pub fn new(buffer: AtomicBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> AtomicBuffer {
        self.buffer
    }

    fn tail_offset(partition: usize) -> usize {
        TERM_TAIL_COUNTERS_OFFSET + partition * 8
    }

    pub fn raw_tail_volatile(&self, partition: usize) -> i64 {
        self.buffer.get_i64_volatile(Self::tail_offset(partition))
    }

    pub fn set_raw_tail(&self, partition: usize, raw_tail: i64) {
        self.buffer
            .put_i64_ordered(Self::tail_offset(partition), raw_tail);
    }

    pub fn cas_raw_tail(&self, partition: usize, expected: i64, update: i64) -> bool {
        self.buffer
            .compare_and_set_i64(Self::tail_offset(partition), expected, update)
    }

    /// Fetch-add on the partition tail; returns the tail before the add.
    pub fn get_and_add_raw_tail(&self, partition: usize, delta: i64) -> i64 {
        self.buffer
            .get_and_add_i64(Self::tail_offset(partition), delta)
    }

    pub fn active_term_count(&self) -> i32 {
        self.buffer.get_i32_volatile(LOG_ACTIVE_TERM_COUNT_OFFSET)
    }

    pub fn set_active_term_count(&self, count: i32) {
        self.buffer
            .put_i32_ordered(LOG_ACTIVE_TERM_COUNT_OFFSET, count);
    }

    pub fn cas_active_term_count(&self, expected: i32, update: i32) -> bool {
        self.buffer
            .compare_and_set_i32(LOG_ACTIVE_TERM_COUNT_OFFSET, expected, update)
    }

    pub fn end_of_stream_position(&self) -> i64 {
        self.buffer
            .get_i64_volatile(LOG_END_OF_STREAM_POSITION_OFFSET)
    }

    pub fn set_end_of_stream_position(&self, position: i64) {
        self.buffer
            .put_i64_ordered(LOG_END_OF_STREAM_POSITION_OFFSET, position);
    }

    pub fn is_connected(&self) -> bool {
        self.buffer.get_i32_volatile(LOG_IS_CONNECTED_OFFSET) == 1
    }

    pub fn set_is_connected(&self, connected: bool) {
        self.buffer
            .put_i32_ordered(LOG_IS_CONNECTED_OFFSET, connected as i32);
    }

    pub fn correlation_id(&self) -> i64 {
        self.buffer.get_i64(LOG_CORRELATION_ID_OFFSET)
    }

    pub fn initial_term_id(&self) -> i32 {
        self.buffer.get_i32(LOG_INITIAL_TERM_ID_OFFSET)
    }

    pub fn mtu_length(&self) -> usize {
        self.buffer.get_i32(LOG_MTU_LENGTH_OFFSET).max(0) as usize
    }

    pub fn term_length(&self) -> usize {
        self.buffer.get_i32(LOG_TERM_LENGTH_OFFSET).max(0) as usize
    }

    pub fn page_size(&self) -> usize {
        self.buffer.get_i32(LOG_PAGE_SIZE_OFFSET).max(0) as usize
    }

    pub fn default_frame_header(&self) -> DataHeader {
        DataHeader::read(&self.buffer, LOG_DEFAULT_FRAME_HEADER_OFFSET)
    }

    /// Fills in the immutable part of the metadata and primes the tails so
    /// that partition `i` holds `initial_term_id + i` (partition 0) or the
    /// term id that will make it eligible for rotation (partitions 1 and 2).
    pub fn initialise(
        &self,
        correlation_id: i64,
        initial_term_id: i32,
        term_length: usize,
        mtu: usize,
        session_id: i32,
        stream_id: i32,
    ) {
        self.buffer.put_i64(LOG_CORRELATION_ID_OFFSET, correlation_id);
        self.buffer
            .put_i32(LOG_INITIAL_TERM_ID_OFFSET, initial_term_id);
        self.buffer
            .put_i32(LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET, HEADER_LENGTH as i32);
        self.buffer.put_i32(LOG_MTU_LENGTH_OFFSET, mtu as i32);
        self.buffer
            .put_i32(LOG_TERM_LENGTH_OFFSET, term_length as i32);
        self.buffer.put_i32(LOG_PAGE_SIZE_OFFSET, PAGE_SIZE as i32);
        let header = DataHeader::default_for(session_id, stream_id, initial_term_id);
        self.buffer
            .put_bytes(LOG_DEFAULT_FRAME_HEADER_OFFSET, &header.to_bytes());

        self.set_raw_tail(0, pack_tail(initial_term_id, 0));
        for partition in 1..PARTITION_COUNT {
            let expected_term_id = initial_term_id
                .wrapping_add(partition as i32)
                .wrapping_sub(PARTITION_COUNT as i32);
            self.set_raw_tail(partition, pack_tail(expected_term_id, 0));
        }
        self.set_end_of_stream_position(i64::MAX);
        self.set_active_term_count(0);
    }

    /// Moves the log onto the next term. Safe to race: whichever caller wins
    /// the CAS on the next tail and term count performs the rotation.
    pub fn rotate_log(&self, current_term_count: i32, current_term_id: i32) -> bool {
        let next_term_id = current_term_id.wrapping_add(1);
        let next_term_count = current_term_count + 1;
        let next_index = index_by_term_count(next_term_count as i64);
        let expected_term_id = next_term_id.wrapping_sub(PARTITION_COUNT as i32);

        loop {
            let raw_tail = self.raw_tail_volatile(next_index);
            if expected_term_id != term_id(raw_tail) {
                break;
            }
            if self.cas_raw_tail(next_index, raw_tail, pack_tail(next_term_id, 0)) {
                break;
            }
        }
        self.cas_active_term_count(current_term_count, next_term_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> (Vec<u64>, LogMetadata) {
        let mut backing = vec![0u64; LOG_META_DATA_LENGTH / 8];
        let buffer =
            unsafe { AtomicBuffer::new(backing.as_mut_ptr() as *mut u8, LOG_META_DATA_LENGTH) };
        (backing, LogMetadata::new(buffer))
    }

    #[test]
    fn positions_are_derived_from_term_and_offset() {
        let bits = position_bits_to_shift(TERM_MIN_LENGTH);
        assert_eq!(bits, 16);
        assert_eq!(compute_position(7, 64, bits, 5), (2 << 16) + 64);
        assert_eq!(compute_term_id_from_position((2 << 16) + 64, bits, 5), 7);
        assert_eq!(compute_term_offset_from_position((2 << 16) + 64, bits), 64);
        assert_eq!(index_by_position((4 << 16) + 1, bits), 1);
        assert_eq!(index_by_term(5, 9), 1);
    }

    #[test]
    fn term_length_must_be_power_of_two_within_bounds() {
        assert!(check_term_length(TERM_MIN_LENGTH).is_ok());
        assert!(check_term_length(TERM_MIN_LENGTH / 2).is_err());
        assert!(check_term_length(TERM_MIN_LENGTH + 32).is_err());
    }

    #[test]
    fn rotation_advances_partition_and_term_count() {
        let (_backing, meta) = metadata();
        meta.initialise(42, 100, TERM_MIN_LENGTH, 1408, 9, 10);
        assert_eq!(term_id(meta.raw_tail_volatile(0)), 100);
        assert_eq!(term_id(meta.raw_tail_volatile(1)), 98);
        assert_eq!(term_id(meta.raw_tail_volatile(2)), 99);
        assert_eq!(meta.default_frame_header().session_id, 9);
        assert_eq!(meta.term_length(), TERM_MIN_LENGTH);
        assert_eq!(meta.correlation_id(), 42);

        assert!(meta.rotate_log(0, 100));
        assert_eq!(meta.active_term_count(), 1);
        assert_eq!(meta.raw_tail_volatile(1), pack_tail(101, 0));

        // a second rotation attempt for the same term loses the race
        assert!(!meta.rotate_log(0, 100));
        assert_eq!(meta.active_term_count(), 1);
    }

    #[test]
    fn term_offset_is_clamped_to_term_length() {
        let raw = pack_tail(3, (TERM_MIN_LENGTH + 96) as i32);
        assert_eq!(term_offset(raw, TERM_MIN_LENGTH), TERM_MIN_LENGTH as i32);
        assert_eq!(term_id(raw), 3);
    }
}
