//! Data frame header layout within a term.
//!
//! ```text
//! 0   frame length   i32   (negative while the frame is being written)
//! 4   version        u8
//! 5   flags          u8    (BEGIN 0x80, END 0x40)
//! 6   type           u16   (PAD 0, DATA 1)
//! 8   term offset    i32
//! 12  session id     i32
//! 16  stream id      i32
//! 20  term id        i32
//! 24  reserved value i64
//! ```

use crate::concurrent::atomic_buffer::AtomicBuffer;

pub const HEADER_LENGTH: usize = 32;
pub const FRAME_ALIGNMENT: usize = 32;
pub const CURRENT_VERSION: u8 = 0;

pub const FRAME_LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const RESERVED_VALUE_OFFSET: usize = 24;

pub const BEGIN_FRAG_FLAG: u8 = 0x80;
pub const END_FRAG_FLAG: u8 = 0x40;
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;

pub const HDR_TYPE_PAD: u16 = 0x00;
pub const HDR_TYPE_DATA: u16 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: u16,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
}

impl DataHeader {
    /// The header the driver stores in the log metadata; appenders copy it
    /// and fill in length, flags, offset and term id per frame.
    pub fn default_for(session_id: i32, stream_id: i32, initial_term_id: i32) -> Self {
        Self {
            frame_length: 0,
            version: CURRENT_VERSION,
            flags: UNFRAGMENTED,
            frame_type: HDR_TYPE_DATA,
            term_offset: 0,
            session_id,
            stream_id,
            term_id: initial_term_id,
            reserved_value: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[FRAME_LENGTH_OFFSET..FRAME_LENGTH_OFFSET + 4]
            .copy_from_slice(&self.frame_length.to_le_bytes());
        buf[VERSION_OFFSET] = self.version;
        buf[FLAGS_OFFSET] = self.flags;
        buf[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&self.frame_type.to_le_bytes());
        buf[TERM_OFFSET_OFFSET..TERM_OFFSET_OFFSET + 4]
            .copy_from_slice(&self.term_offset.to_le_bytes());
        buf[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 4]
            .copy_from_slice(&self.session_id.to_le_bytes());
        buf[STREAM_ID_OFFSET..STREAM_ID_OFFSET + 4].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[TERM_ID_OFFSET..TERM_ID_OFFSET + 4].copy_from_slice(&self.term_id.to_le_bytes());
        buf[RESERVED_VALUE_OFFSET..RESERVED_VALUE_OFFSET + 8]
            .copy_from_slice(&self.reserved_value.to_le_bytes());
        buf
    }

    pub fn read(buffer: &AtomicBuffer, offset: usize) -> Self {
        Self {
            frame_length: buffer.get_i32(offset + FRAME_LENGTH_OFFSET),
            version: buffer.get_u8(offset + VERSION_OFFSET),
            flags: buffer.get_u8(offset + FLAGS_OFFSET),
            frame_type: buffer.get_u16(offset + TYPE_OFFSET),
            term_offset: buffer.get_i32(offset + TERM_OFFSET_OFFSET),
            session_id: buffer.get_i32(offset + SESSION_ID_OFFSET),
            stream_id: buffer.get_i32(offset + STREAM_ID_OFFSET),
            term_id: buffer.get_i32(offset + TERM_ID_OFFSET),
            reserved_value: buffer.get_i64(offset + RESERVED_VALUE_OFFSET),
        }
    }
}

#[inline]
pub fn align(value: usize) -> usize {
    (value + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

#[inline]
pub fn frame_length_volatile(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32_volatile(offset + FRAME_LENGTH_OFFSET)
}

#[inline]
pub fn frame_length_ordered(term: &AtomicBuffer, offset: usize, length: i32) {
    term.put_i32_ordered(offset + FRAME_LENGTH_OFFSET, length);
}

#[inline]
pub fn frame_type(term: &AtomicBuffer, offset: usize) -> u16 {
    term.get_u16(offset + TYPE_OFFSET)
}

#[inline]
pub fn frame_flags(term: &AtomicBuffer, offset: usize) -> u8 {
    term.get_u8(offset + FLAGS_OFFSET)
}

#[inline]
pub fn is_padding(term: &AtomicBuffer, offset: usize) -> bool {
    frame_type(term, offset) == HDR_TYPE_PAD
}

/// Writes `header` with a negative frame length, making the frame visible as
/// "in progress" to readers until the positive length is published.
pub fn write_in_progress(term: &AtomicBuffer, offset: usize, header: &DataHeader, length: i32) {
    let version_flags_type = (header.version as i64)
        | ((header.flags as i64) << 8)
        | ((header.frame_type as i64) << 16);
    term.put_i64_ordered(
        offset,
        (version_flags_type << 32) | ((-length) as u32 as i64),
    );
    term.put_i32(offset + TERM_OFFSET_OFFSET, offset as i32);
    term.put_i32(offset + SESSION_ID_OFFSET, header.session_id);
    term.put_i32(offset + STREAM_ID_OFFSET, header.stream_id);
    term.put_i32(offset + TERM_ID_OFFSET, header.term_id);
    term.put_i64(offset + RESERVED_VALUE_OFFSET, header.reserved_value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_header_matches_field_layout() {
        let mut backing = vec![0u64; 16];
        let term = unsafe { AtomicBuffer::new(backing.as_mut_ptr() as *mut u8, 128) };
        let mut header = DataHeader::default_for(7, 10_000, 3);
        header.flags = BEGIN_FRAG_FLAG;
        header.term_id = 4;
        write_in_progress(&term, 32, &header, 45);

        assert_eq!(frame_length_volatile(&term, 32), -45);
        let read = DataHeader::read(&term, 32);
        assert_eq!(read.flags, BEGIN_FRAG_FLAG);
        assert_eq!(read.frame_type, HDR_TYPE_DATA);
        assert_eq!(read.term_offset, 32);
        assert_eq!(read.session_id, 7);
        assert_eq!(read.stream_id, 10_000);
        assert_eq!(read.term_id, 4);

        frame_length_ordered(&term, 32, 45);
        assert_eq!(DataHeader::read(&term, 32).frame_length, 45);
    }

    #[test]
    fn encoded_bytes_round_trip_through_buffer() {
        let mut backing = vec![0u64; 4];
        let term = unsafe { AtomicBuffer::new(backing.as_mut_ptr() as *mut u8, 32) };
        let header = DataHeader {
            frame_length: 64,
            reserved_value: -9,
            ..DataHeader::default_for(1, 2, 3)
        };
        term.put_bytes(0, &header.to_bytes());
        assert_eq!(DataHeader::read(&term, 0), header);
        assert_eq!(align(33), 64);
    }
}
