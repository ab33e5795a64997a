//! Many-to-one ring buffer carrying client commands to the driver.
//!
//! Each record is `[length: i32][type: i32][payload]`, aligned to
//! [`RECORD_ALIGNMENT`]. Producers claim space with a CAS on the tail and
//! publish the record by an ordered store of its positive length; until then
//! the length is negative and the consumer stops in front of it.

use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::{Error, Result};

pub const RECORD_ALIGNMENT: usize = 8;
pub const HEADER_LENGTH: usize = 8;
pub const PADDING_MSG_TYPE_ID: i32 = -1;

pub const TAIL_POSITION_OFFSET: usize = 0;
pub const HEAD_CACHE_POSITION_OFFSET: usize = 128;
pub const HEAD_POSITION_OFFSET: usize = 256;
pub const CORRELATION_COUNTER_OFFSET: usize = 384;
pub const TRAILER_LENGTH: usize = 512;

#[inline]
pub(crate) fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[inline]
fn make_header(length: i32, msg_type_id: i32) -> i64 {
    ((msg_type_id as i64) << 32) | (length as u32 as i64)
}

#[derive(Clone, Copy, Debug)]
pub struct ManyToOneRingBuffer {
    buffer: AtomicBuffer,
    capacity: usize,
    max_msg_length: usize,
}

impl ManyToOneRingBuffer {
    /// Wraps a region of `capacity + TRAILER_LENGTH` bytes; capacity must be a
    /// power of two.
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        let capacity = buffer
            .capacity()
            .checked_sub(TRAILER_LENGTH)
            .ok_or(Error::InvalidConfig("ring buffer smaller than its trailer".into()))?;
        if !capacity.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "ring buffer capacity must be a power of two: {capacity}"
            )));
        }
        Ok(Self {
            buffer,
            capacity,
            max_msg_length: capacity / 8,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// Issues the next id from the shared correlation counter.
    pub fn next_correlation_id(&self) -> i64 {
        self.buffer
            .get_and_add_i64(self.capacity + CORRELATION_COUNTER_OFFSET, 1)
    }

    /// Bytes currently queued and not yet consumed.
    pub fn size(&self) -> usize {
        let head = self
            .buffer
            .get_i64_volatile(self.capacity + HEAD_POSITION_OFFSET);
        let tail = self
            .buffer
            .get_i64_volatile(self.capacity + TAIL_POSITION_OFFSET);
        (tail - head).max(0) as usize
    }

    /// Appends a record. Returns `Ok(false)` when there is not enough space.
    pub fn write(&self, msg_type_id: i32, payload: &[u8]) -> Result<bool> {
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
        let record_length = payload.len() + HEADER_LENGTH;
        let required = align(record_length, RECORD_ALIGNMENT);
        let Some(record_index) = self.claim_capacity(required) else {
            return Ok(false);
        };

        self.buffer
            .put_i64_ordered(record_index, make_header(-(record_length as i32), msg_type_id));
        self.buffer.put_bytes(record_index + HEADER_LENGTH, payload);
        self.buffer
            .put_i32_ordered(record_index, record_length as i32);
        Ok(true)
    }

    fn claim_capacity(&self, required: usize) -> Option<usize> {
        let mask = (self.capacity - 1) as i64;
        let capacity = self.capacity as i64;
        let required = required as i64;
        let head_cache_index = self.capacity + HEAD_CACHE_POSITION_OFFSET;
        let tail_index_offset = self.capacity + TAIL_POSITION_OFFSET;
        let head_index_offset = self.capacity + HEAD_POSITION_OFFSET;

        let mut head = self.buffer.get_i64_volatile(head_cache_index);
        loop {
            let tail = self.buffer.get_i64_volatile(tail_index_offset);
            let available = capacity - (tail - head);
            if required > available {
                head = self.buffer.get_i64_volatile(head_index_offset);
                if required > capacity - (tail - head) {
                    return None;
                }
                self.buffer.put_i64_ordered(head_cache_index, head);
            }

            let mut padding = 0;
            let tail_index = tail & mask;
            let to_end = capacity - tail_index;
            if required > to_end {
                let mut head_index = head & mask;
                if required > head_index {
                    head = self.buffer.get_i64_volatile(head_index_offset);
                    head_index = head & mask;
                    if required > head_index {
                        return None;
                    }
                    self.buffer.put_i64_ordered(head_cache_index, head);
                }
                padding = to_end;
            }

            if self.buffer.compare_and_set_i64(
                tail_index_offset,
                tail,
                tail + required + padding,
            ) {
                if padding != 0 {
                    let tail_index = tail_index as usize;
                    self.buffer.put_i64_ordered(
                        tail_index,
                        make_header(-(padding as i32), PADDING_MSG_TYPE_ID),
                    );
                    self.buffer.put_i32_ordered(tail_index, padding as i32);
                    return Some(0);
                }
                return Some(tail_index as usize);
            }
        }
    }

    /// Consumes up to `limit` records, handing `(msg_type_id, payload)` to the
    /// handler. Returns the number of records delivered.
    pub fn read<F>(&self, mut handler: F, limit: usize) -> usize
    where
        F: FnMut(i32, &[u8]),
    {
        let head_offset = self.capacity + HEAD_POSITION_OFFSET;
        let head = self.buffer.get_i64_volatile(head_offset);
        let head_index = (head & (self.capacity as i64 - 1)) as usize;
        let contiguous = self.capacity - head_index;
        let mut bytes_read = 0;
        let mut messages = 0;

        while bytes_read < contiguous && messages < limit {
            let record_index = head_index + bytes_read;
            let record_length = self.buffer.get_i32_volatile(record_index);
            if record_length <= 0 {
                break;
            }
            bytes_read += align(record_length as usize, RECORD_ALIGNMENT);
            let msg_type_id = self.buffer.get_i32(record_index + 4);
            if msg_type_id == PADDING_MSG_TYPE_ID {
                continue;
            }
            messages += 1;
            let payload = self
                .buffer
                .as_slice(record_index + HEADER_LENGTH, record_length as usize - HEADER_LENGTH);
            handler(msg_type_id, payload);
        }

        if bytes_read != 0 {
            self.buffer.set_memory(head_index, bytes_read, 0);
            self.buffer
                .put_i64_ordered(head_offset, head + bytes_read as i64);
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::{ManyToOneRingBuffer, TRAILER_LENGTH};
    use crate::concurrent::atomic_buffer::AtomicBuffer;

    fn ring(capacity: usize) -> (Vec<u64>, ManyToOneRingBuffer) {
        let len = capacity + TRAILER_LENGTH;
        let mut backing = vec![0u64; len / 8];
        let buffer = unsafe { AtomicBuffer::new(backing.as_mut_ptr() as *mut u8, len) };
        let ring = ManyToOneRingBuffer::new(buffer).expect("ring");
        (backing, ring)
    }

    #[test]
    fn records_are_read_in_write_order() {
        let (_backing, ring) = ring(1024);
        assert!(ring.write(1, b"first").expect("write"));
        assert!(ring.write(2, b"second").expect("write"));

        let mut seen = Vec::new();
        let count = ring.read(|t, m| seen.push((t, m.to_vec())), 10);
        assert_eq!(count, 2);
        assert_eq!(seen, vec![(1, b"first".to_vec()), (2, b"second".to_vec())]);
        assert_eq!(ring.size(), 0);
    }

    #[test]
    fn full_buffer_rejects_until_consumed() {
        let (_backing, ring) = ring(256);
        let payload = [7u8; 24];
        let mut written = 0;
        while ring.write(3, &payload).expect("write") {
            written += 1;
        }
        assert_eq!(written, 256 / 32);
        assert_eq!(ring.read(|_, _| {}, 1), 1);
        assert!(ring.write(3, &payload).expect("write after consume"));
    }

    #[test]
    fn wrap_inserts_padding_and_keeps_payloads_intact() {
        let (_backing, ring) = ring(1024);
        for _ in 0..7 {
            assert!(ring.write(1, &[1u8; 120]).expect("write"));
        }
        assert!(ring.write(1, &[2u8; 56]).expect("write"));
        assert_eq!(ring.read(|_, _| {}, 10), 8);

        // 960 bytes consumed; a 128-byte record does not fit in the last 64.
        assert!(ring.write(5, &[3u8; 120]).expect("write wraps"));
        let mut seen = Vec::new();
        // first read drains the padding at the end of the buffer
        let mut total = ring.read(|t, m| seen.push((t, m.to_vec())), 10);
        total += ring.read(|t, m| seen.push((t, m.to_vec())), 10);
        assert_eq!(total, 1);
        assert_eq!(seen, vec![(5, vec![3u8; 120])]);
    }

    #[test]
    fn correlation_ids_are_unique_and_increasing() {
        let (_backing, ring) = ring(128);
        let ids: Vec<i64> = (0..5).map(|_| ring.next_correlation_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }
}
