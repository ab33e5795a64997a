//! One-to-many broadcast buffer carrying driver responses to every client.
//!
//! The transmitter never waits for receivers. A receiver that falls more than
//! one capacity behind is lapped; it detects this by comparing its cursor with
//! the tail intent counter and resynchronises on the latest record.

use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::concurrent::ring_buffer::align;
use crate::{Error, Result};

pub const RECORD_ALIGNMENT: usize = 8;
pub const HEADER_LENGTH: usize = 8;
pub const PADDING_MSG_TYPE_ID: i32 = -1;

pub const TAIL_INTENT_COUNTER_OFFSET: usize = 0;
pub const TAIL_COUNTER_OFFSET: usize = 8;
pub const LATEST_COUNTER_OFFSET: usize = 16;
pub const TRAILER_LENGTH: usize = 128;

fn capacity_of(buffer: &AtomicBuffer) -> Result<usize> {
    let capacity = buffer
        .capacity()
        .checked_sub(TRAILER_LENGTH)
        .ok_or(Error::InvalidConfig("broadcast buffer smaller than its trailer".into()))?;
    if !capacity.is_power_of_two() {
        return Err(Error::InvalidConfig(format!(
            "broadcast capacity must be a power of two: {capacity}"
        )));
    }
    Ok(capacity)
}

#[derive(Clone, Copy, Debug)]
pub struct BroadcastTransmitter {
    buffer: AtomicBuffer,
    capacity: usize,
    max_msg_length: usize,
}

impl BroadcastTransmitter {
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        let capacity = capacity_of(&buffer)?;
        Ok(Self {
            buffer,
            capacity,
            max_msg_length: capacity / 8,
        })
    }

    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    pub fn transmit(&self, msg_type_id: i32, payload: &[u8]) -> Result<()> {
        if msg_type_id < 1 {
            return Err(Error::Administration(format!(
                "message type id must be positive: {msg_type_id}"
            )));
        }
        if payload.len() > self.max_msg_length {
            return Err(Error::MessageTooLarge {
                length: payload.len(),
                max: self.max_msg_length,
            });
        }

        let tail_offset = self.capacity + TAIL_COUNTER_OFFSET;
        let mut current_tail = self.buffer.get_i64(tail_offset);
        let mut record_offset = (current_tail as usize) & (self.capacity - 1);
        let record_length = payload.len() + HEADER_LENGTH;
        let aligned_length = align(record_length, RECORD_ALIGNMENT);
        let new_tail = current_tail + aligned_length as i64;
        let to_end = self.capacity - record_offset;

        if to_end < aligned_length {
            self.signal_tail_intent(new_tail + to_end as i64);
            self.buffer.put_i32(record_offset, to_end as i32);
            self.buffer.put_i32(record_offset + 4, PADDING_MSG_TYPE_ID);
            current_tail += to_end as i64;
            record_offset = 0;
        } else {
            self.signal_tail_intent(new_tail);
        }

        self.buffer.put_i32(record_offset, record_length as i32);
        self.buffer.put_i32(record_offset + 4, msg_type_id);
        self.buffer.put_bytes(record_offset + HEADER_LENGTH, payload);
        self.buffer
            .put_i64(self.capacity + LATEST_COUNTER_OFFSET, current_tail);
        self.buffer
            .put_i64_ordered(tail_offset, current_tail + aligned_length as i64);
        Ok(())
    }

    fn signal_tail_intent(&self, new_tail: i64) {
        self.buffer
            .put_i64_ordered(self.capacity + TAIL_INTENT_COUNTER_OFFSET, new_tail);
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
    }
}

#[derive(Debug)]
pub struct BroadcastReceiver {
    buffer: AtomicBuffer,
    capacity: usize,
    cursor: i64,
    next_record: i64,
    record_offset: usize,
    lapped_count: u64,
}

impl BroadcastReceiver {
    /// Starts receiving from the latest transmitted position.
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        let capacity = capacity_of(&buffer)?;
        let tail = buffer.get_i64_volatile(capacity + TAIL_COUNTER_OFFSET);
        Ok(Self {
            buffer,
            capacity,
            cursor: tail,
            next_record: tail,
            record_offset: (tail as usize) & (capacity - 1),
            lapped_count: 0,
        })
    }

    pub fn lapped_count(&self) -> u64 {
        self.lapped_count
    }

    /// Advances to the next record if one is available.
    pub fn receive_next(&mut self) -> bool {
        let tail = self
            .buffer
            .get_i64_volatile(self.capacity + TAIL_COUNTER_OFFSET);
        let mut cursor = self.next_record;
        if tail <= cursor {
            return false;
        }

        let mask = self.capacity - 1;
        let mut record_offset = (cursor as usize) & mask;
        if !self.validate_at(cursor) {
            self.lapped_count += 1;
            cursor = self
                .buffer
                .get_i64(self.capacity + LATEST_COUNTER_OFFSET);
            record_offset = (cursor as usize) & mask;
        }

        self.cursor = cursor;
        self.next_record = cursor
            + align(self.buffer.get_i32(record_offset).max(0) as usize, RECORD_ALIGNMENT) as i64;

        if self.buffer.get_i32(record_offset + 4) == PADDING_MSG_TYPE_ID {
            record_offset = 0;
            self.cursor = self.next_record;
            self.next_record +=
                align(self.buffer.get_i32(0).max(0) as usize, RECORD_ALIGNMENT) as i64;
        }

        self.record_offset = record_offset;
        true
    }

    pub fn type_id(&self) -> i32 {
        self.buffer.get_i32(self.record_offset + 4)
    }

    pub fn length(&self) -> usize {
        (self.buffer.get_i32(self.record_offset).max(HEADER_LENGTH as i32) as usize)
            - HEADER_LENGTH
    }

    pub fn copy_payload(&self, dst: &mut Vec<u8>) {
        let len = self.length().min(self.capacity);
        dst.resize(len, 0);
        self.buffer
            .get_bytes(self.record_offset + HEADER_LENGTH, dst.as_mut_slice());
    }

    /// True if the current record has not been overwritten since it was read.
    pub fn validate(&self) -> bool {
        self.validate_at(self.cursor)
    }

    fn validate_at(&self, cursor: i64) -> bool {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        cursor + self.capacity as i64
            > self
                .buffer
                .get_i64_volatile(self.capacity + TAIL_INTENT_COUNTER_OFFSET)
    }
}

/// Receiver that copies each record out before handing it over, so a
/// transmitter overwrite mid-dispatch is detected instead of observed.
#[derive(Debug)]
pub struct CopyBroadcastReceiver {
    receiver: BroadcastReceiver,
    scratch: Vec<u8>,
}

impl CopyBroadcastReceiver {
    pub fn new(receiver: BroadcastReceiver) -> Self {
        Self {
            receiver,
            scratch: Vec::with_capacity(4096),
        }
    }

    /// Delivers at most one record. Returns the number delivered.
    pub fn receive<F>(&mut self, mut handler: F) -> Result<usize>
    where
        F: FnMut(i32, &[u8]),
    {
        let last_seen_lapped = self.receiver.lapped_count();
        if !self.receiver.receive_next() {
            return Ok(0);
        }
        if last_seen_lapped != self.receiver.lapped_count() {
            return Err(Error::ListenerLapped);
        }
        let msg_type_id = self.receiver.type_id();
        self.receiver.copy_payload(&mut self.scratch);
        if !self.receiver.validate() {
            return Err(Error::ListenerLapped);
        }
        handler(msg_type_id, &self.scratch);
        Ok(1)
    }
}
