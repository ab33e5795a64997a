//! Scans published frames in a term. A frame is visible once its length word
//! is positive; padding frames are stepped over without being reported.

use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::logbuffer::frame;

/// What a controlled fragment handler wants done with the fragment it saw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlledAction {
    /// Leave the fragment unconsumed and stop; it is delivered again next poll.
    Abort,
    /// Consume the fragment and stop.
    Break,
    /// Consume the fragment and publish the position immediately.
    Commit,
    /// Consume the fragment and keep going.
    Continue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    pub fragments_read: usize,
    /// Term offset just past the last consumed frame.
    pub offset: usize,
}

/// False for unpublished frames and for lengths that cannot hold a header or
/// run past the end of the term; the scan stops on either.
fn is_whole_frame(frame_length: i32, offset: usize, capacity: usize) -> bool {
    frame_length > 0
        && frame_length as usize >= frame::HEADER_LENGTH
        && offset + frame_length as usize <= capacity
}

/// Hands `(frame_offset, frame_length)` of up to `fragments_limit` data
/// frames starting at `term_offset`.
pub fn read<F>(
    term: &AtomicBuffer,
    term_offset: usize,
    fragments_limit: usize,
    mut handler: F,
) -> ReadOutcome
where
    F: FnMut(usize, usize),
{
    let capacity = term.capacity();
    let mut offset = term_offset;
    let mut fragments_read = 0;
    while fragments_read < fragments_limit && offset < capacity {
        let frame_length = frame::frame_length_volatile(term, offset);
        if !is_whole_frame(frame_length, offset, capacity) {
            break;
        }
        let frame_offset = offset;
        offset += frame::align(frame_length as usize);
        if frame::is_padding(term, frame_offset) {
            continue;
        }
        fragments_read += 1;
        handler(frame_offset, frame_length as usize);
    }
    ReadOutcome {
        fragments_read,
        offset,
    }
}

/// Like [`read`], but the handler steers consumption. `commit` receives the
/// term offset to publish whenever the handler returns `Commit`.
pub fn controlled_read<F, C>(
    term: &AtomicBuffer,
    term_offset: usize,
    fragments_limit: usize,
    mut handler: F,
    mut commit: C,
) -> ReadOutcome
where
    F: FnMut(usize, usize) -> ControlledAction,
    C: FnMut(usize),
{
    let capacity = term.capacity();
    let mut offset = term_offset;
    let mut fragments_read = 0;
    while fragments_read < fragments_limit && offset < capacity {
        let frame_length = frame::frame_length_volatile(term, offset);
        if !is_whole_frame(frame_length, offset, capacity) {
            break;
        }
        let frame_offset = offset;
        let aligned_length = frame::align(frame_length as usize);
        if frame::is_padding(term, frame_offset) {
            offset += aligned_length;
            continue;
        }

        match handler(frame_offset, frame_length as usize) {
            ControlledAction::Abort => break,
            ControlledAction::Break => {
                offset += aligned_length;
                fragments_read += 1;
                break;
            }
            ControlledAction::Commit => {
                offset += aligned_length;
                fragments_read += 1;
                commit(offset);
            }
            ControlledAction::Continue => {
                offset += aligned_length;
                fragments_read += 1;
            }
        }
    }
    ReadOutcome {
        fragments_read,
        offset,
    }
}
