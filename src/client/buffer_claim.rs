use std::marker::PhantomData;

use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::logbuffer::frame::{self, HDR_TYPE_PAD, HEADER_LENGTH, TYPE_OFFSET};

/// A frame reserved by [`Publication::try_claim`](crate::Publication::try_claim).
///
/// Write the payload through [`BufferClaim::buffer_mut`], then `commit`.
/// A claim dropped without `commit` is aborted: the frame becomes padding and
/// subscribers skip it.
pub struct BufferClaim<'a> {
    term: AtomicBuffer,
    frame_offset: usize,
    frame_length: usize,
    position: i64,
    done: bool,
    _publication: PhantomData<&'a ()>,
}

impl<'a> BufferClaim<'a> {
    pub(crate) fn new(
        term: AtomicBuffer,
        frame_offset: usize,
        frame_length: usize,
        position: i64,
    ) -> Self {
        Self {
            term,
            frame_offset,
            frame_length,
            position,
            done: false,
            _publication: PhantomData,
        }
    }

    /// Payload length reserved.
    pub fn length(&self) -> usize {
        self.frame_length - HEADER_LENGTH
    }

    /// Stream position after this frame.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        // SAFETY: the claim owns the frame until it is committed or aborted,
        // and the returned borrow is tied to `&mut self`.
        unsafe {
            self.term
                .as_mut_slice(self.frame_offset + HEADER_LENGTH, self.length())
        }
    }

    pub fn put_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.buffer_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_reserved_value(&mut self, value: i64) {
        self.term
            .put_i64(self.frame_offset + frame::RESERVED_VALUE_OFFSET, value);
    }

    /// Publishes the frame to subscribers.
    pub fn commit(mut self) {
        self.publish();
    }

    /// Turns the frame into padding.
    pub fn abort(mut self) {
        self.term.put_u16(self.frame_offset + TYPE_OFFSET, HDR_TYPE_PAD);
        self.publish();
    }

    fn publish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        frame::frame_length_ordered(&self.term, self.frame_offset, self.frame_length as i32);
    }
}

impl std::fmt::Debug for BufferClaim<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferClaim")
            .field("frame_offset", &self.frame_offset)
            .field("length", &self.length())
            .field("position", &self.position)
            .finish()
    }
}

impl Drop for BufferClaim<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.term.put_u16(self.frame_offset + TYPE_OFFSET, HDR_TYPE_PAD);
            self.publish();
        }
    }
}
