use crate::logbuffer::frame::{BEGIN_FRAG_FLAG, END_FRAG_FLAG, UNFRAGMENTED};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentStatus {
    /// The frame is a whole message; use its payload directly.
    Unfragmented,
    /// Part of a message; nothing to deliver yet.
    Incomplete,
    /// The frame completed a message, available through `message()`.
    Complete,
}

/// Reassembles messages split across BEGIN .. END fragments of one image.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    buffer: Vec<u8>,
    in_progress: bool,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fragment(&mut self, payload: &[u8], flags: u8) -> FragmentStatus {
        if flags & UNFRAGMENTED == UNFRAGMENTED {
            return FragmentStatus::Unfragmented;
        }
        if flags & BEGIN_FRAG_FLAG == BEGIN_FRAG_FLAG {
            self.buffer.clear();
            self.buffer.extend_from_slice(payload);
            self.in_progress = true;
            return FragmentStatus::Incomplete;
        }
        if !self.in_progress {
            // joined mid-message; drop until the next BEGIN
            return FragmentStatus::Incomplete;
        }
        self.buffer.extend_from_slice(payload);
        if flags & END_FRAG_FLAG == END_FRAG_FLAG {
            FragmentStatus::Complete
        } else {
            FragmentStatus::Incomplete
        }
    }

    pub fn message(&self) -> &[u8] {
        &self.buffer
    }

    /// Marks the completed message as delivered.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_progress = false;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drops bytes appended after `len`, keeping the message in progress so
    /// the same fragment can be appended again.
    pub fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len);
    }
}
