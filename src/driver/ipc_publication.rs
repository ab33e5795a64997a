//! Driver-side state of one shared IPC log: its publishers, its subscriber
//! positions, flow control and cleaning of consumed terms.

use std::path::{Path, PathBuf};

use crate::concurrent::counters::AtomicCounter;
use crate::logbuffer::descriptor::{self, LogMetadata};
use crate::logbuffer::log_buffers::LogBuffers;
use crate::Result;

/// A subscription attached to the log through its own position counter.
#[derive(Debug, Clone, Copy)]
pub struct SubscriberPosition {
    pub subscription_registration_id: i64,
    pub position: AtomicCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationState {
    Active,
    /// No publishers left; waiting for subscribers to reach end of stream.
    Draining { since_ms: i64 },
}

/// Geometry and identity of a new log.
#[derive(Debug, Clone)]
pub struct LogParams {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub term_length: usize,
    pub mtu: usize,
    pub term_window: usize,
}

pub struct IpcPublication {
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    channel: String,
    log: LogBuffers,
    log_path: PathBuf,
    metadata: LogMetadata,
    term_length: usize,
    initial_term_id: i32,
    position_bits_to_shift: u32,
    term_window: i64,
    publisher_limit: AtomicCounter,
    publisher_position: AtomicCounter,
    publishers: Vec<(i64, i64)>,
    subscribers: Vec<SubscriberPosition>,
    consumer_position: i64,
    clean_position: i64,
    state: PublicationState,
}

impl IpcPublication {
    pub fn create(
        path: &Path,
        channel: &str,
        params: &LogParams,
        publisher_limit: AtomicCounter,
        publisher_position: AtomicCounter,
    ) -> Result<Self> {
        let log = LogBuffers::create(path, params.term_length)?;
        let metadata = log.metadata();
        metadata.initialise(
            params.registration_id,
            params.initial_term_id,
            params.term_length,
            params.mtu,
            params.session_id,
            params.stream_id,
        );
        metadata.set_is_connected(false);
        publisher_limit.set(0);
        publisher_position.set(0);
        Ok(Self {
            registration_id: params.registration_id,
            session_id: params.session_id,
            stream_id: params.stream_id,
            channel: channel.to_string(),
            log,
            log_path: path.to_path_buf(),
            metadata,
            term_length: params.term_length,
            initial_term_id: params.initial_term_id,
            position_bits_to_shift: descriptor::position_bits_to_shift(params.term_length),
            term_window: params.term_window.min(params.term_length / 2) as i64,
            publisher_limit,
            publisher_position,
            publishers: Vec::new(),
            subscribers: Vec::new(),
            consumer_position: 0,
            clean_position: 0,
            state: PublicationState::Active,
        })
    }

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

    pub fn term_length(&self) -> usize {
        self.term_length
    }

    pub fn mtu(&self) -> usize {
        self.metadata.mtu_length()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn publisher_limit_id(&self) -> i32 {
        self.publisher_limit.id()
    }

    pub fn publisher_position_id(&self) -> i32 {
        self.publisher_position.id()
    }

    pub fn state(&self) -> PublicationState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == PublicationState::Active
    }

    /// Position of the next byte a publisher will claim.
    pub fn producer_position(&self) -> i64 {
        let term_count = self.metadata.active_term_count();
        let raw_tail = self
            .metadata
            .raw_tail_volatile(descriptor::index_by_term_count(term_count as i64));
        descriptor::compute_term_begin_position(
            descriptor::term_id(raw_tail),
            self.position_bits_to_shift,
            self.initial_term_id,
        ) + descriptor::term_offset(raw_tail, self.term_length) as i64
    }

    pub fn add_publisher(&mut self, client_id: i64, correlation_id: i64) {
        self.publishers.push((client_id, correlation_id));
    }

    pub fn has_publisher(&self, client_id: i64, correlation_id: i64) -> bool {
        self.publishers.contains(&(client_id, correlation_id))
    }

    /// Removes one publisher link. The last removal starts draining.
    pub fn remove_publisher(&mut self, client_id: i64, correlation_id: i64, now_ms: i64) -> bool {
        let before = self.publishers.len();
        self.publishers
            .retain(|&link| link != (client_id, correlation_id));
        let removed = self.publishers.len() != before;
        if removed && self.publishers.is_empty() {
            self.start_draining(now_ms);
        }
        removed
    }

    /// Removes every link held by `client_id`; returns how many were removed.
    pub fn remove_client(&mut self, client_id: i64, now_ms: i64) -> usize {
        let before = self.publishers.len();
        self.publishers.retain(|&(owner, _)| owner != client_id);
        let removed = before - self.publishers.len();
        if removed > 0 && self.publishers.is_empty() {
            self.start_draining(now_ms);
        }
        removed
    }

    fn start_draining(&mut self, now_ms: i64) {
        if self.state != PublicationState::Active {
            return;
        }
        let end_of_stream = self.producer_position();
        self.metadata.set_end_of_stream_position(end_of_stream);
        self.state = PublicationState::Draining { since_ms: now_ms };
        log::debug!(
            "ipc publication {} draining at position {end_of_stream}",
            self.registration_id
        );
    }

    /// Attaches a subscriber at the current producer position and returns
    /// that join position.
    pub fn add_subscriber(&mut self, subscription_registration_id: i64, position: AtomicCounter) -> i64 {
        let join_position = self.producer_position();
        position.set(join_position);
        self.subscribers.push(SubscriberPosition {
            subscription_registration_id,
            position,
        });
        join_position
    }

    pub fn remove_subscriber(&mut self, subscription_registration_id: i64) -> Option<SubscriberPosition> {
        let index = self
            .subscribers
            .iter()
            .position(|s| s.subscription_registration_id == subscription_registration_id)?;
        Some(self.subscribers.remove(index))
    }

    pub fn subscribers(&self) -> &[SubscriberPosition] {
        &self.subscribers
    }

    /// Moves the publisher limit to the slowest subscriber plus the term
    /// window and zeroes terms no subscriber can still read. Returns 1 if the
    /// limit moved.
    pub fn update_publisher_limit(&mut self) -> usize {
        self.publisher_position.set(self.producer_position());
        let connected = self.is_active() && !self.subscribers.is_empty();
        if self.metadata.is_connected() != connected {
            self.metadata.set_is_connected(connected);
        }

        let Some(min_position) = self.subscribers.iter().map(|s| s.position.get()).min() else {
            if self.publisher_limit.get() != self.consumer_position {
                self.publisher_limit.set(self.consumer_position);
                return 1;
            }
            return 0;
        };
        self.consumer_position = self.consumer_position.max(min_position);
        self.clean_buffer_to(min_position - self.term_length as i64);

        let proposed_limit = min_position + self.term_window;
        if proposed_limit > self.publisher_limit.get() {
            self.publisher_limit.set(proposed_limit);
            return 1;
        }
        0
    }

    fn clean_buffer_to(&mut self, position: i64) {
        let term_length = self.term_length as i64;
        while position > self.clean_position {
            let index = descriptor::index_by_position(self.clean_position, self.position_bits_to_shift);
            let term_offset = self.clean_position & (term_length - 1);
            let length = (position - self.clean_position).min(term_length - term_offset) as usize;
            let term = self.log.term_buffer(index);
            let offset = term_offset as usize;
            if length > 8 {
                term.set_memory(offset + 8, length - 8, 0);
            }
            term.put_i64_ordered(offset, 0);
            self.clean_position += length as i64;
        }
    }

    /// True once draining has finished: every subscriber reached end of
    /// stream, or the linger timeout passed.
    pub fn is_drained(&self, now_ms: i64, linger_ms: i64) -> bool {
        let PublicationState::Draining { since_ms } = self.state else {
            return false;
        };
        let end_of_stream = self.metadata.end_of_stream_position();
        let caught_up = self
            .subscribers
            .iter()
            .all(|s| s.position.get() >= end_of_stream);
        caught_up || now_ms - since_ms >= linger_ms
    }

    /// Unmaps and deletes the log file. Clients that still map it keep a
    /// valid (unlinked) mapping.
    pub fn delete(self) -> Result<()> {
        let path = self.log_path.clone();
        drop(self.log);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{IpcPublication, LogParams, PublicationState};
    use crate::concurrent::atomic_buffer::AtomicBuffer;
    use crate::concurrent::counters::{AtomicCounter, COUNTER_LENGTH};
    use crate::logbuffer::appender::TermAppender;
    use crate::logbuffer::descriptor::TERM_MIN_LENGTH;
    use tempfile::tempdir;

    fn counters(n: usize) -> (Vec<u64>, AtomicBuffer) {
        let len = n * COUNTER_LENGTH;
        let mut backing = vec![0u64; len / 8];
        let buffer = unsafe { AtomicBuffer::new(backing.as_mut_ptr() as *mut u8, len) };
        (backing, buffer)
    }

    fn params() -> LogParams {
        LogParams {
            registration_id: 7,
            session_id: 11,
            stream_id: 1001,
            initial_term_id: 100,
            term_length: TERM_MIN_LENGTH,
            mtu: 1408,
            term_window: usize::MAX,
        }
    }

    #[test]
    fn limit_follows_slowest_subscriber() {
        let dir = tempdir().expect("tempdir");
        let (_backing, values) = counters(4);
        let mut publication = IpcPublication::create(
            &dir.path().join("7.logbuffer"),
            "aeron:ipc",
            &params(),
            AtomicCounter::new(values, 0),
            AtomicCounter::new(values, 1),
        )
        .expect("create");
        publication.add_publisher(1, 7);

        publication.update_publisher_limit();
        assert_eq!(AtomicCounter::new(values, 0).get(), 0);

        let fast = AtomicCounter::new(values, 2);
        let slow = AtomicCounter::new(values, 3);
        assert_eq!(publication.add_subscriber(20, fast), 0);
        assert_eq!(publication.add_subscriber(21, slow), 0);
        fast.set(4096);
        slow.set(1024);

        assert_eq!(publication.update_publisher_limit(), 1);
        let window = (TERM_MIN_LENGTH / 2) as i64;
        assert_eq!(AtomicCounter::new(values, 0).get(), 1024 + window);

        publication.remove_subscriber(21).expect("slow subscriber");
        publication.update_publisher_limit();
        assert_eq!(AtomicCounter::new(values, 0).get(), 4096 + window);
    }

    #[test]
    fn drains_once_subscribers_reach_end_of_stream() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("7.logbuffer");
        let (_backing, values) = counters(3);
        let mut publication = IpcPublication::create(
            &path,
            "aeron:ipc",
            &params(),
            AtomicCounter::new(values, 0),
            AtomicCounter::new(values, 1),
        )
        .expect("create");
        publication.add_publisher(1, 7);
        let subscriber = AtomicCounter::new(values, 2);
        publication.add_subscriber(20, subscriber);

        let appender = TermAppender::new(
            publication.log.term_buffer(0),
            publication.metadata,
            0,
        );
        let header = publication.metadata.default_frame_header();
        appender.append_unfragmented(&header, b"last words");

        assert!(publication.remove_publisher(1, 7, 1_000));
        assert_eq!(publication.state(), PublicationState::Draining { since_ms: 1_000 });
        assert_eq!(publication.metadata.end_of_stream_position(), 64);
        assert!(!publication.is_drained(1_001, 5_000));

        subscriber.set(64);
        assert!(publication.is_drained(1_001, 5_000));
        publication.delete().expect("delete");
        assert!(!path.exists());
    }

    #[test]
    fn linger_expiry_drains_stuck_subscribers() {
        let dir = tempdir().expect("tempdir");
        let (_backing, values) = counters(3);
        let mut publication = IpcPublication::create(
            &dir.path().join("7.logbuffer"),
            "aeron:ipc",
            &params(),
            AtomicCounter::new(values, 0),
            AtomicCounter::new(values, 1),
        )
        .expect("create");
        publication.add_publisher(1, 7);
        publication.add_subscriber(20, AtomicCounter::new(values, 2));
        let appender = TermAppender::new(publication.log.term_buffer(0), publication.metadata, 0);
        appender.append_unfragmented(&publication.metadata.default_frame_header(), b"x");

        assert_eq!(publication.remove_client(1, 0), 1);
        assert!(!publication.is_drained(4_999, 5_000));
        assert!(publication.is_drained(5_000, 5_000));
    }
}
