use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::buffer_claim::BufferClaim;
use crate::client::conductor::ClientConductor;
use crate::client::ClientStatus;
use crate::cnc::CncFile;
use crate::concurrent::counters::AtomicCounter;
use crate::logbuffer::appender::{Append, TermAppender};
use crate::logbuffer::descriptor::{self, LogMetadata, PARTITION_COUNT};
use crate::logbuffer::frame::{DataHeader, HEADER_LENGTH};
use crate::logbuffer::log_buffers::LogBuffers;
use crate::{Error, Result};

/// Sends messages to a channel and stream through a shared log buffer.
///
/// `offer` and `try_claim` never block and never take the client lock;
/// any number of threads may use one publication concurrently.
pub struct Publication {
    conductor: Weak<Mutex<ClientConductor>>,
    status: Arc<ClientStatus>,
    log: Arc<LogBuffers>,
    _cnc: Arc<CncFile>,
    metadata: LogMetadata,
    appenders: [TermAppender; PARTITION_COUNT],
    header: DataHeader,
    publication_limit: AtomicCounter,
    correlation_id: i64,
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    channel: String,
    initial_term_id: i32,
    position_bits_to_shift: u32,
    max_payload_length: usize,
    max_message_length: usize,
    max_possible_position: i64,
    closed: AtomicBool,
}

impl Publication {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conductor: Weak<Mutex<ClientConductor>>,
        status: Arc<ClientStatus>,
        log: Arc<LogBuffers>,
        cnc: Arc<CncFile>,
        publication_limit: AtomicCounter,
        correlation_id: i64,
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        channel: String,
    ) -> Self {
        let metadata = log.metadata();
        let term_length = log.term_length();
        let appenders = [
            TermAppender::new(log.term_buffer(0), metadata, 0),
            TermAppender::new(log.term_buffer(1), metadata, 1),
            TermAppender::new(log.term_buffer(2), metadata, 2),
        ];
        Self {
            conductor,
            status,
            metadata,
            appenders,
            header: metadata.default_frame_header(),
            publication_limit,
            correlation_id,
            registration_id,
            session_id,
            stream_id,
            channel,
            initial_term_id: metadata.initial_term_id(),
            position_bits_to_shift: descriptor::position_bits_to_shift(term_length),
            max_payload_length: metadata.mtu_length() - HEADER_LENGTH,
            max_message_length: descriptor::max_message_length(term_length),
            max_possible_position: (term_length as i64) << 31,
            closed: AtomicBool::new(false),
            log,
            _cnc: cnc,
        }
    }

    /// The id returned by `add_publication`.
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    /// The driver's id for the shared log.
    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    pub fn term_buffer_length(&self) -> usize {
        self.log.term_length()
    }

    pub fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    pub fn publication_limit_id(&self) -> i32 {
        self.publication_limit.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True while the driver reports at least one subscriber. Keeps the last
    /// reported value if the driver stops.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.metadata.is_connected()
    }

    pub fn position(&self) -> Result<i64> {
        self.ensure_open()?;
        let term_count = self.metadata.active_term_count();
        let raw_tail = self
            .metadata
            .raw_tail_volatile(descriptor::index_by_term_count(term_count as i64));
        Ok(self.position_of(raw_tail))
    }

    pub fn position_limit(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.publication_limit.get())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedResource("publication"));
        }
        Ok(())
    }

    fn position_of(&self, raw_tail: i64) -> i64 {
        let term_offset = descriptor::term_offset(raw_tail, self.log.term_length());
        descriptor::compute_term_begin_position(
            descriptor::term_id(raw_tail),
            self.position_bits_to_shift,
            self.initial_term_id,
        ) + term_offset as i64
    }

    /// Common preamble of `offer` and `try_claim`: returns the active term
    /// index and current position, or the status that prevents appending.
    fn prepare(&self, length: usize) -> Result<(i32, usize, i64)> {
        self.ensure_open()?;
        if !self.status.is_driver_active() {
            return Err(Error::NotConnected);
        }
        let limit = self.publication_limit.get();
        let term_count = self.metadata.active_term_count();
        let index = descriptor::index_by_term_count(term_count as i64);
        let raw_tail = self.metadata.raw_tail_volatile(index);
        let term_id = descriptor::term_id(raw_tail);
        if term_count != term_id.wrapping_sub(self.initial_term_id) {
            return Err(Error::AdminAction);
        }
        let position = self.position_of(raw_tail);
        if position >= limit {
            return Err(self.back_pressure_status(position, length));
        }
        Ok((term_count, index, position))
    }

    fn back_pressure_status(&self, position: i64, length: usize) -> Error {
        if position + length as i64 >= self.max_possible_position {
            return Error::MaxPositionExceeded;
        }
        if self.metadata.is_connected() {
            Error::BackPressured
        } else {
            Error::NotConnected
        }
    }

    fn new_position(&self, term_count: i32, position: i64, append: Append) -> Result<i64> {
        match append {
            Append::Appended {
                term_id,
                resulting_offset,
                ..
            } => Ok(descriptor::compute_term_begin_position(
                term_id,
                self.position_bits_to_shift,
                self.initial_term_id,
            ) + resulting_offset as i64),
            Append::Tripped { term_id } => {
                let term_length = self.log.term_length() as i64;
                let term_begin = position - (position & (term_length - 1));
                if term_begin + term_length >= self.max_possible_position {
                    return Err(Error::MaxPositionExceeded);
                }
                self.metadata.rotate_log(term_count, term_id);
                Err(Error::AdminAction)
            }
        }
    }

    /// Appends `buffer` as one message and returns the new stream position.
    ///
    /// Messages longer than `max_payload_length` are split into fragments
    /// that subscribers reassemble.
    pub fn offer(&self, buffer: &[u8]) -> Result<i64> {
        if buffer.len() > self.max_message_length {
            self.ensure_open()?;
            return Err(Error::MessageTooLarge {
                length: buffer.len(),
                max: self.max_message_length,
            });
        }
        let (term_count, index, position) = self.prepare(buffer.len())?;
        let appender = &self.appenders[index];
        let append = if buffer.len() <= self.max_payload_length {
            appender.append_unfragmented(&self.header, buffer)
        } else {
            appender.append_fragmented(&self.header, buffer, self.max_payload_length)
        };
        self.new_position(term_count, position, append)
    }

    /// Reserves space for an unfragmented message of `length` bytes to be
    /// written in place.
    pub fn try_claim(&self, length: usize) -> Result<BufferClaim<'_>> {
        if length > self.max_payload_length {
            self.ensure_open()?;
            return Err(Error::MessageTooLarge {
                length,
                max: self.max_payload_length,
            });
        }
        let (term_count, index, position) = self.prepare(length)?;
        let append = self.appenders[index].claim(&self.header, length);
        let new_position = self.new_position(term_count, position, append)?;
        match append {
            Append::Appended { frame_offset, .. } => Ok(BufferClaim::new(
                self.log.term_buffer(index),
                frame_offset as usize,
                length + HEADER_LENGTH,
                new_position,
            )),
            Append::Tripped { .. } => Err(Error::AdminAction),
        }
    }

    /// Idempotent. The log stays mapped until the last reference is dropped.
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.conductor.upgrade() {
            Some(conductor) => conductor.lock().release_publication(self.correlation_id),
            None => {
                self.mark_closed();
                Ok(())
            }
        }
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("correlation_id", &self.correlation_id)
            .field("registration_id", &self.registration_id)
            .field("session_id", &self.session_id)
            .field("stream_id", &self.stream_id)
            .field("channel", &self.channel)
            .field("closed", &self.is_closed())
            .finish()
    }
}
