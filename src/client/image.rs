use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cnc::CncFile;
use crate::concurrent::counters::AtomicCounter;
use crate::logbuffer::assembler::{FragmentAssembler, FragmentStatus};
use crate::logbuffer::descriptor::{self, LogMetadata};
use crate::logbuffer::frame::{self, HEADER_LENGTH};
use crate::logbuffer::header::Header;
use crate::logbuffer::log_buffers::LogBuffers;
use crate::logbuffer::reader::{self, ControlledAction};

/// One publisher's stream as seen by one subscription.
///
/// Consumption is tracked by the subscriber position counter, which the
/// driver reads to compute the publisher's flow-control limit.
pub struct Image {
    log: Arc<LogBuffers>,
    _cnc: Arc<CncFile>,
    metadata: LogMetadata,
    subscriber_position: AtomicCounter,
    correlation_id: i64,
    session_id: i32,
    stream_id: i32,
    subscription_registration_id: i64,
    join_position: i64,
    source_identity: String,
    initial_term_id: i32,
    position_bits_to_shift: u32,
    term_length_mask: i64,
    assembler: Mutex<FragmentAssembler>,
    closed: AtomicBool,
    final_position: AtomicI64,
}

impl Image {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log: Arc<LogBuffers>,
        cnc: Arc<CncFile>,
        subscriber_position: AtomicCounter,
        correlation_id: i64,
        session_id: i32,
        stream_id: i32,
        subscription_registration_id: i64,
        source_identity: String,
    ) -> Self {
        let metadata = log.metadata();
        let term_length = log.term_length();
        let join_position = subscriber_position.get();
        Self {
            metadata,
            subscriber_position,
            correlation_id,
            session_id,
            stream_id,
            subscription_registration_id,
            join_position,
            source_identity,
            initial_term_id: metadata.initial_term_id(),
            position_bits_to_shift: descriptor::position_bits_to_shift(term_length),
            term_length_mask: term_length as i64 - 1,
            assembler: Mutex::new(FragmentAssembler::new()),
            closed: AtomicBool::new(false),
            final_position: AtomicI64::new(join_position),
            log,
            _cnc: cnc,
        }
    }

    /// Registration id of the publication feeding this image.
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn subscription_registration_id(&self) -> i64 {
        self.subscription_registration_id
    }

    pub fn join_position(&self) -> i64 {
        self.join_position
    }

    pub fn source_identity(&self) -> &str {
        &self.source_identity
    }

    pub fn term_buffer_length(&self) -> usize {
        self.log.term_length()
    }

    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    pub fn subscriber_position_id(&self) -> i32 {
        self.subscriber_position.id()
    }

    pub fn position(&self) -> i64 {
        if self.is_closed() {
            return self.final_position.load(Ordering::Acquire);
        }
        self.subscriber_position.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once every message up to the publisher's end of stream has
    /// been consumed.
    pub fn is_end_of_stream(&self) -> bool {
        self.position() >= self.metadata.end_of_stream_position()
    }

    pub(crate) fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.final_position
            .store(self.subscriber_position.get(), Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }

    fn term_for(&self, position: i64) -> (crate::concurrent::AtomicBuffer, usize) {
        let term_offset = (position & self.term_length_mask) as usize;
        let index = descriptor::index_by_position(position, self.position_bits_to_shift);
        (self.log.term_buffer(index), term_offset)
    }

    /// Delivers up to `fragment_limit` fragments; reassembled messages reach
    /// the handler once, on their final fragment.
    pub fn poll<F>(&self, mut handler: F, fragment_limit: usize) -> usize
    where
        F: FnMut(&[u8], &Header),
    {
        if self.is_closed() {
            return 0;
        }
        let position = self.subscriber_position.get();
        let (term, term_offset) = self.term_for(position);
        let mut assembler = self.assembler.lock();
        let initial_term_id = self.initial_term_id;
        let bits = self.position_bits_to_shift;

        let outcome = reader::read(&term, term_offset, fragment_limit, |frame_offset, frame_length| {
            let payload = term.as_slice(frame_offset + HEADER_LENGTH, frame_length - HEADER_LENGTH);
            let flags = frame::frame_flags(&term, frame_offset);
            let header = Header::new(term, frame_offset, initial_term_id, bits);
            match assembler.on_fragment(payload, flags) {
                FragmentStatus::Unfragmented => handler(payload, &header),
                FragmentStatus::Complete => {
                    handler(assembler.message(), &header);
                    assembler.reset();
                }
                FragmentStatus::Incomplete => {}
            }
        });

        let new_position = position + (outcome.offset - term_offset) as i64;
        if new_position > position {
            self.subscriber_position.set(new_position);
        }
        outcome.fragments_read
    }

    /// Like [`Image::poll`], with the handler choosing per message whether to
    /// consume it, stop, commit the position, or abort and see it again.
    pub fn controlled_poll<F>(&self, mut handler: F, fragment_limit: usize) -> usize
    where
        F: FnMut(&[u8], &Header) -> ControlledAction,
    {
        if self.is_closed() {
            return 0;
        }
        let position = self.subscriber_position.get();
        let (term, term_offset) = self.term_for(position);
        let term_begin = position - term_offset as i64;
        let mut assembler = self.assembler.lock();
        let initial_term_id = self.initial_term_id;
        let bits = self.position_bits_to_shift;
        let subscriber_position = self.subscriber_position;

        let outcome = reader::controlled_read(
            &term,
            term_offset,
            fragment_limit,
            |frame_offset, frame_length| {
                let payload =
                    term.as_slice(frame_offset + HEADER_LENGTH, frame_length - HEADER_LENGTH);
                let flags = frame::frame_flags(&term, frame_offset);
                let header = Header::new(term, frame_offset, initial_term_id, bits);
                let prior_length = assembler.len();
                match assembler.on_fragment(payload, flags) {
                    FragmentStatus::Unfragmented => handler(payload, &header),
                    FragmentStatus::Complete => {
                        let action = handler(assembler.message(), &header);
                        if action == ControlledAction::Abort {
                            assembler.truncate(prior_length);
                        } else {
                            assembler.reset();
                        }
                        action
                    }
                    FragmentStatus::Incomplete => ControlledAction::Continue,
                }
            },
            |offset| subscriber_position.set(term_begin + offset as i64),
        );

        let new_position = term_begin + outcome.offset as i64;
        if new_position > subscriber_position.get() {
            subscriber_position.set(new_position);
        }
        outcome.fragments_read
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("correlation_id", &self.correlation_id)
            .field("session_id", &self.session_id)
            .field("stream_id", &self.stream_id)
            .field("subscription_registration_id", &self.subscription_registration_id)
            .field("position", &self.position())
            .field("closed", &self.is_closed())
            .finish()
    }
}
