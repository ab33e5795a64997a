//! Concurrent appends into one term partition.
//!
//! Space is claimed with a fetch-add on the partition's raw tail, so any
//! number of threads may append at once. A claim that runs past the end of
//! the term pads the remainder and trips the term; the caller then rotates
//! the log and retries.

use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::logbuffer::descriptor::{self, LogMetadata};
use crate::logbuffer::frame::{
    self, DataHeader, BEGIN_FRAG_FLAG, END_FRAG_FLAG, HDR_TYPE_PAD, HEADER_LENGTH, UNFRAGMENTED,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Append {
    /// Frames written; `resulting_offset` is the term offset after them and
    /// `frame_offset` where the first one starts.
    Appended {
        term_id: i32,
        frame_offset: i32,
        resulting_offset: i32,
    },
    /// The claim ran off the end of term `term_id`; rotate and retry.
    Tripped { term_id: i32 },
}

pub struct TermAppender {
    term: AtomicBuffer,
    metadata: LogMetadata,
    partition: usize,
}

impl TermAppender {
    pub fn new(term: AtomicBuffer, metadata: LogMetadata, partition: usize) -> Self {
        Self {
            term,
            metadata,
            partition,
        }
    }

    pub fn raw_tail_volatile(&self) -> i64 {
        self.metadata.raw_tail_volatile(self.partition)
    }

    fn claim_space(&self, aligned_length: usize) -> (i32, i64) {
        let raw_tail = self
            .metadata
            .get_and_add_raw_tail(self.partition, aligned_length as i64);
        (descriptor::term_id(raw_tail), raw_tail & 0xFFFF_FFFF)
    }

    fn handle_end_of_term(&self, header: &DataHeader, term_offset: i64, term_id: i32) -> Append {
        let term_length = self.term.capacity() as i64;
        if term_offset < term_length {
            let offset = term_offset as usize;
            let padding_length = (term_length - term_offset) as i32;
            let pad = DataHeader {
                flags: UNFRAGMENTED,
                frame_type: HDR_TYPE_PAD,
                term_id,
                ..*header
            };
            frame::write_in_progress(&self.term, offset, &pad, padding_length);
            frame::frame_length_ordered(&self.term, offset, padding_length);
        }
        Append::Tripped { term_id }
    }

    pub fn append_unfragmented(&self, header: &DataHeader, payload: &[u8]) -> Append {
        let frame_length = payload.len() + HEADER_LENGTH;
        let aligned_length = frame::align(frame_length);
        let (term_id, term_offset) = self.claim_space(aligned_length);
        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > self.term.capacity() as i64 {
            return self.handle_end_of_term(header, term_offset, term_id);
        }

        let offset = term_offset as usize;
        let frame_header = DataHeader {
            flags: UNFRAGMENTED,
            term_id,
            ..*header
        };
        frame::write_in_progress(&self.term, offset, &frame_header, frame_length as i32);
        self.term.put_bytes(offset + HEADER_LENGTH, payload);
        frame::frame_length_ordered(&self.term, offset, frame_length as i32);
        Append::Appended {
            term_id,
            frame_offset: offset as i32,
            resulting_offset: resulting_offset as i32,
        }
    }

    /// Writes `payload` as a run of frames of at most `max_payload_length`
    /// bytes each, claimed as one contiguous block.
    pub fn append_fragmented(
        &self,
        header: &DataHeader,
        payload: &[u8],
        max_payload_length: usize,
    ) -> Append {
        let full_frames = payload.len() / max_payload_length;
        let remaining = payload.len() % max_payload_length;
        let last_frame_length = if remaining > 0 {
            frame::align(remaining + HEADER_LENGTH)
        } else {
            0
        };
        let required =
            full_frames * frame::align(max_payload_length + HEADER_LENGTH) + last_frame_length;
        let (term_id, term_offset) = self.claim_space(required);
        let resulting_offset = term_offset + required as i64;
        if resulting_offset > self.term.capacity() as i64 {
            return self.handle_end_of_term(header, term_offset, term_id);
        }

        let mut flags = BEGIN_FRAG_FLAG;
        let mut remaining = payload.len();
        let mut frame_offset = term_offset as usize;
        let mut payload_offset = 0;
        while remaining > 0 {
            let bytes_to_write = remaining.min(max_payload_length);
            let frame_length = bytes_to_write + HEADER_LENGTH;
            if remaining <= max_payload_length {
                flags |= END_FRAG_FLAG;
            }
            let frame_header = DataHeader {
                flags,
                term_id,
                ..*header
            };
            frame::write_in_progress(&self.term, frame_offset, &frame_header, frame_length as i32);
            self.term.put_bytes(
                frame_offset + HEADER_LENGTH,
                &payload[payload_offset..payload_offset + bytes_to_write],
            );
            frame::frame_length_ordered(&self.term, frame_offset, frame_length as i32);

            flags = 0;
            frame_offset += frame::align(frame_length);
            payload_offset += bytes_to_write;
            remaining -= bytes_to_write;
        }

        Append::Appended {
            term_id,
            frame_offset: term_offset as i32,
            resulting_offset: resulting_offset as i32,
        }
    }

    /// Reserves an unfragmented frame of `length` payload bytes and leaves it
    /// in progress; the claimant publishes it by storing the frame length.
    pub fn claim(&self, header: &DataHeader, length: usize) -> Append {
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = frame::align(frame_length);
        let (term_id, term_offset) = self.claim_space(aligned_length);
        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > self.term.capacity() as i64 {
            return self.handle_end_of_term(header, term_offset, term_id);
        }

        let offset = term_offset as usize;
        let frame_header = DataHeader {
            flags: UNFRAGMENTED,
            term_id,
            ..*header
        };
        frame::write_in_progress(&self.term, offset, &frame_header, frame_length as i32);
        Append::Appended {
            term_id,
            frame_offset: offset as i32,
            resulting_offset: resulting_offset as i32,
        }
    }
}
