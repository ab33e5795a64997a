use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::logbuffer::descriptor;
use crate::logbuffer::frame::{self, DataHeader};

/// Metadata of the frame being handed to a fragment handler.
///
/// For a reassembled message this describes its final fragment, so
/// [`Header::position`] is the stream position just after the message.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    term: AtomicBuffer,
    offset: usize,
    initial_term_id: i32,
    position_bits_to_shift: u32,
}

impl Header {
    pub(crate) fn new(
        term: AtomicBuffer,
        offset: usize,
        initial_term_id: i32,
        position_bits_to_shift: u32,
    ) -> Self {
        Self {
            term,
            offset,
            initial_term_id,
            position_bits_to_shift,
        }
    }

    pub fn frame_length(&self) -> i32 {
        self.term.get_i32(self.offset + frame::FRAME_LENGTH_OFFSET)
    }

    pub fn flags(&self) -> u8 {
        frame::frame_flags(&self.term, self.offset)
    }

    pub fn frame_type(&self) -> u16 {
        frame::frame_type(&self.term, self.offset)
    }

    pub fn term_offset(&self) -> i32 {
        self.offset as i32
    }

    pub fn session_id(&self) -> i32 {
        self.term.get_i32(self.offset + frame::SESSION_ID_OFFSET)
    }

    pub fn stream_id(&self) -> i32 {
        self.term.get_i32(self.offset + frame::STREAM_ID_OFFSET)
    }

    pub fn term_id(&self) -> i32 {
        self.term.get_i32(self.offset + frame::TERM_ID_OFFSET)
    }

    pub fn reserved_value(&self) -> i64 {
        self.term.get_i64(self.offset + frame::RESERVED_VALUE_OFFSET)
    }

    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    pub fn term_length(&self) -> usize {
        self.term.capacity()
    }

    pub fn position(&self) -> i64 {
        let end_offset = frame::align(self.offset + self.frame_length().max(0) as usize);
        descriptor::compute_position(
            self.term_id(),
            end_offset as i32,
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }

    pub fn data_header(&self) -> DataHeader {
        DataHeader::read(&self.term, self.offset)
    }
}
