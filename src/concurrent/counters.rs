//! Shared counters: a metadata region describing each counter and a values
//! region holding the 64-bit values, one fixed-size slot per counter id.
//!
//! Metadata record (`METADATA_LENGTH` bytes):
//!
//! ```text
//! 0   record state      i32  (UNUSED / ALLOCATED / RECLAIMED)
//! 4   type id           i32
//! 8   free-for-reuse    i64  epoch ms after which a reclaimed id may be reused
//! 16  key               [u8; MAX_KEY_LENGTH]
//! 128 label length      i32
//! 132 label             [u8; MAX_LABEL_LENGTH]
//! ```
//!
//! Value record (`COUNTER_LENGTH` bytes): value i64 @0, registration id i64 @8,
//! owner id i64 @16. The registration id acts as the generation of a slot.

use std::collections::VecDeque;

use crate::concurrent::atomic_buffer::AtomicBuffer;
use crate::{Error, Result};

pub const METADATA_LENGTH: usize = 512;
pub const RECORD_STATE_OFFSET: usize = 0;
pub const TYPE_ID_OFFSET: usize = 4;
pub const FREE_FOR_REUSE_DEADLINE_OFFSET: usize = 8;
pub const KEY_OFFSET: usize = 16;
pub const MAX_KEY_LENGTH: usize = 112;
pub const LABEL_LENGTH_OFFSET: usize = 128;
pub const LABEL_OFFSET: usize = 132;
pub const MAX_LABEL_LENGTH: usize = METADATA_LENGTH - LABEL_OFFSET;

pub const COUNTER_LENGTH: usize = 128;
pub const VALUE_OFFSET: usize = 0;
pub const REGISTRATION_ID_OFFSET: usize = 8;
pub const OWNER_ID_OFFSET: usize = 16;

pub const RECORD_UNUSED: i32 = 0;
pub const RECORD_ALLOCATED: i32 = 1;
pub const RECORD_RECLAIMED: i32 = -1;

pub const DRIVER_HEARTBEAT_TYPE_ID: i32 = 0;
pub const PUBLISHER_LIMIT_TYPE_ID: i32 = 1;
pub const SUBSCRIBER_POSITION_TYPE_ID: i32 = 4;
pub const CLIENT_HEARTBEAT_TYPE_ID: i32 = 11;
pub const PUBLISHER_POSITION_TYPE_ID: i32 = 12;

/// Type ids the driver allocates for itself; clients may not claim them.
pub fn is_system_type_id(type_id: i32) -> bool {
    matches!(
        type_id,
        DRIVER_HEARTBEAT_TYPE_ID
            | PUBLISHER_LIMIT_TYPE_ID
            | SUBSCRIBER_POSITION_TYPE_ID
            | CLIENT_HEARTBEAT_TYPE_ID
            | PUBLISHER_POSITION_TYPE_ID
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterState {
    Unused,
    Allocated,
    Reclaimed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterMetadata {
    pub type_id: i32,
    pub label: String,
    pub key: Vec<u8>,
}

/// A counter id tagged with the type and registration id it was allocated
/// with. Reads through a handle fail once the slot is freed or reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterHandle {
    pub id: i32,
    pub type_id: i32,
    pub registration_id: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct CountersReader {
    metadata: AtomicBuffer,
    values: AtomicBuffer,
    max_counter_id: i32,
}

impl CountersReader {
    pub fn new(metadata: AtomicBuffer, values: AtomicBuffer) -> Self {
        let by_values = values.capacity() / COUNTER_LENGTH;
        let by_metadata = metadata.capacity() / METADATA_LENGTH;
        Self {
            metadata,
            values,
            max_counter_id: by_values.min(by_metadata) as i32 - 1,
        }
    }

    pub fn max_counter_id(&self) -> i32 {
        self.max_counter_id
    }

    pub fn values_buffer(&self) -> AtomicBuffer {
        self.values
    }

    fn metadata_offset(id: i32) -> usize {
        id as usize * METADATA_LENGTH
    }

    fn value_offset(id: i32) -> usize {
        id as usize * COUNTER_LENGTH
    }

    fn in_range(&self, id: i32) -> bool {
        (0..=self.max_counter_id).contains(&id)
    }

    pub fn counter_state(&self, id: i32) -> CounterState {
        if !self.in_range(id) {
            return CounterState::Unused;
        }
        match self
            .metadata
            .get_i32_volatile(Self::metadata_offset(id) + RECORD_STATE_OFFSET)
        {
            RECORD_ALLOCATED => CounterState::Allocated,
            RECORD_RECLAIMED => CounterState::Reclaimed,
            _ => CounterState::Unused,
        }
    }

    pub fn counter_value(&self, id: i32) -> i64 {
        if !self.in_range(id) {
            return 0;
        }
        self.values
            .get_i64_volatile(Self::value_offset(id) + VALUE_OFFSET)
    }

    pub fn counter_type_id(&self, id: i32) -> i32 {
        if !self.in_range(id) {
            return -1;
        }
        self.metadata
            .get_i32(Self::metadata_offset(id) + TYPE_ID_OFFSET)
    }

    pub fn counter_registration_id(&self, id: i32) -> i64 {
        if !self.in_range(id) {
            return 0;
        }
        self.values
            .get_i64_volatile(Self::value_offset(id) + REGISTRATION_ID_OFFSET)
    }

    pub fn counter_owner_id(&self, id: i32) -> i64 {
        if !self.in_range(id) {
            return 0;
        }
        self.values
            .get_i64_volatile(Self::value_offset(id) + OWNER_ID_OFFSET)
    }

    pub fn free_for_reuse_deadline(&self, id: i32) -> i64 {
        if !self.in_range(id) {
            return i64::MAX;
        }
        self.metadata
            .get_i64_volatile(Self::metadata_offset(id) + FREE_FOR_REUSE_DEADLINE_OFFSET)
    }

    pub fn counter_label(&self, id: i32) -> String {
        if !self.in_range(id) {
            return String::new();
        }
        let offset = Self::metadata_offset(id);
        let len = self
            .metadata
            .get_i32(offset + LABEL_LENGTH_OFFSET)
            .clamp(0, MAX_LABEL_LENGTH as i32) as usize;
        String::from_utf8_lossy(self.metadata.as_slice(offset + LABEL_OFFSET, len)).into_owned()
    }

    pub fn counter_key(&self, id: i32) -> Vec<u8> {
        if !self.in_range(id) {
            return Vec::new();
        }
        self.metadata
            .as_slice(Self::metadata_offset(id) + KEY_OFFSET, MAX_KEY_LENGTH)
            .to_vec()
    }

    pub fn metadata_for(&self, id: i32) -> Result<CounterMetadata> {
        if self.counter_state(id) != CounterState::Allocated {
            return Err(Error::Administration(format!("counter {id} is not allocated")));
        }
        Ok(CounterMetadata {
            type_id: self.counter_type_id(id),
            label: self.counter_label(id),
            key: self.counter_key(id),
        })
    }

    /// Captures the current generation of an allocated counter.
    pub fn handle(&self, id: i32) -> Option<CounterHandle> {
        if self.counter_state(id) != CounterState::Allocated {
            return None;
        }
        Some(CounterHandle {
            id,
            type_id: self.counter_type_id(id),
            registration_id: self.counter_registration_id(id),
        })
    }

    fn still_valid(&self, handle: &CounterHandle) -> bool {
        self.counter_state(handle.id) == CounterState::Allocated
            && self.counter_type_id(handle.id) == handle.type_id
            && self.counter_registration_id(handle.id) == handle.registration_id
    }

    /// Reads a counter only if the slot still holds the allocation the handle
    /// was taken from.
    pub fn value_of(&self, handle: &CounterHandle) -> Option<i64> {
        if !self.still_valid(handle) {
            return None;
        }
        let value = self.counter_value(handle.id);
        if !self.still_valid(handle) {
            return None;
        }
        Some(value)
    }

    /// Visits every allocated counter as `(id, type_id, key, label)`.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(i32, i32, &[u8], &str),
    {
        for id in 0..=self.max_counter_id {
            match self.counter_state(id) {
                CounterState::Allocated => {
                    let label = self.counter_label(id);
                    let key = self
                        .metadata
                        .as_slice(Self::metadata_offset(id) + KEY_OFFSET, MAX_KEY_LENGTH);
                    f(id, self.counter_type_id(id), key, &label);
                }
                CounterState::Reclaimed => continue,
                CounterState::Unused => break,
            }
        }
    }

    /// First allocated counter of `type_id` whose key starts with `key`.
    pub fn find_by_type_id_and_key(&self, type_id: i32, key: &[u8]) -> Option<i32> {
        let mut found = None;
        self.for_each(|id, counter_type, counter_key, _| {
            if found.is_none() && counter_type == type_id && counter_key.starts_with(key) {
                found = Some(id);
            }
        });
        found
    }

    pub fn counter(&self, id: i32) -> AtomicCounter {
        AtomicCounter::new(self.values, id)
    }
}

/// Direct access to one counter's value slot.
#[derive(Clone, Copy, Debug)]
pub struct AtomicCounter {
    values: AtomicBuffer,
    id: i32,
    offset: usize,
}

impl AtomicCounter {
    pub fn new(values: AtomicBuffer, id: i32) -> Self {
        Self {
            values,
            id,
            offset: id as usize * COUNTER_LENGTH + VALUE_OFFSET,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn get(&self) -> i64 {
        self.values.get_i64_volatile(self.offset)
    }

    pub fn set(&self, value: i64) {
        self.values.put_i64_ordered(self.offset, value);
    }

    pub fn increment(&self) -> i64 {
        self.values.get_and_add_i64(self.offset, 1)
    }

    pub fn get_and_add(&self, delta: i64) -> i64 {
        self.values.get_and_add_i64(self.offset, delta)
    }

    /// Raises the value to `proposed` if it is greater. Single writer only.
    pub fn propose_max(&self, proposed: i64) -> bool {
        if self.get() < proposed {
            self.set(proposed);
            true
        } else {
            false
        }
    }
}

/// Driver-side allocator for counter slots.
#[derive(Debug)]
pub struct CountersManager {
    reader: CountersReader,
    metadata: AtomicBuffer,
    values: AtomicBuffer,
    free_list: VecDeque<i32>,
    high_water_mark: i32,
    free_to_reuse_timeout_ms: i64,
}

impl CountersManager {
    pub fn new(metadata: AtomicBuffer, values: AtomicBuffer, free_to_reuse_timeout_ms: i64) -> Self {
        Self {
            reader: CountersReader::new(metadata, values),
            metadata,
            values,
            free_list: VecDeque::new(),
            high_water_mark: -1,
            free_to_reuse_timeout_ms,
        }
    }

    pub fn reader(&self) -> &CountersReader {
        &self.reader
    }

    pub fn allocate(
        &mut self,
        type_id: i32,
        key: &[u8],
        label: &str,
        registration_id: i64,
        owner_id: i64,
        now_ms: i64,
    ) -> Result<i32> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::Administration(format!(
                "counter key length {} exceeds {MAX_KEY_LENGTH}",
                key.len()
            )));
        }
        let id = self.next_counter_id(now_ms)?;
        let value_offset = id as usize * COUNTER_LENGTH;
        self.values.put_i64_ordered(value_offset + VALUE_OFFSET, 0);
        self.values
            .put_i64_ordered(value_offset + REGISTRATION_ID_OFFSET, registration_id);
        self.values
            .put_i64_ordered(value_offset + OWNER_ID_OFFSET, owner_id);

        let meta_offset = id as usize * METADATA_LENGTH;
        self.metadata.put_i32(meta_offset + TYPE_ID_OFFSET, type_id);
        self.metadata
            .put_i64_ordered(meta_offset + FREE_FOR_REUSE_DEADLINE_OFFSET, i64::MAX);
        self.metadata
            .set_memory(meta_offset + KEY_OFFSET, MAX_KEY_LENGTH, 0);
        self.metadata.put_bytes(meta_offset + KEY_OFFSET, key);
        let label = truncate_label(label);
        self.metadata
            .put_i32(meta_offset + LABEL_LENGTH_OFFSET, label.len() as i32);
        self.metadata
            .put_bytes(meta_offset + LABEL_OFFSET, label.as_bytes());
        self.metadata
            .put_i32_ordered(meta_offset + RECORD_STATE_OFFSET, RECORD_ALLOCATED);
        Ok(id)
    }

    fn next_counter_id(&mut self, now_ms: i64) -> Result<i32> {
        let reusable = self
            .free_list
            .iter()
            .position(|&id| self.reader.free_for_reuse_deadline(id) <= now_ms);
        if let Some(index) = reusable {
            if let Some(id) = self.free_list.remove(index) {
                return Ok(id);
            }
        }
        if self.high_water_mark >= self.reader.max_counter_id() {
            return Err(Error::CapacityExceeded("counters"));
        }
        self.high_water_mark += 1;
        Ok(self.high_water_mark)
    }

    pub fn free(&mut self, id: i32, now_ms: i64) {
        if self.reader.counter_state(id) != CounterState::Allocated {
            return;
        }
        let meta_offset = id as usize * METADATA_LENGTH;
        self.metadata.put_i64_ordered(
            meta_offset + FREE_FOR_REUSE_DEADLINE_OFFSET,
            now_ms.saturating_add(self.free_to_reuse_timeout_ms),
        );
        self.metadata
            .put_i32_ordered(meta_offset + RECORD_STATE_OFFSET, RECORD_RECLAIMED);
        self.free_list.push_back(id);
    }

    pub fn set_counter_value(&self, id: i32, value: i64) {
        self.values
            .put_i64_ordered(id as usize * COUNTER_LENGTH + VALUE_OFFSET, value);
    }

    pub fn counter(&self, id: i32) -> AtomicCounter {
        AtomicCounter::new(self.values, id)
    }
}

fn truncate_label(label: &str) -> &str {
    if label.len() <= MAX_LABEL_LENGTH {
        return label;
    }
    let mut end = MAX_LABEL_LENGTH;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    &label[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Region {
        _meta: Vec<u64>,
        _values: Vec<u64>,
        metadata: AtomicBuffer,
        values: AtomicBuffer,
    }

    fn region(counters: usize) -> Region {
        let mut meta = vec![0u64; counters * METADATA_LENGTH / 8];
        let mut values = vec![0u64; counters * COUNTER_LENGTH / 8];
        let metadata =
            unsafe { AtomicBuffer::new(meta.as_mut_ptr() as *mut u8, counters * METADATA_LENGTH) };
        let value_buffer =
            unsafe { AtomicBuffer::new(values.as_mut_ptr() as *mut u8, counters * COUNTER_LENGTH) };
        Region {
            _meta: meta,
            _values: values,
            metadata,
            values: value_buffer,
        }
    }

    #[test]
    fn allocated_counter_exposes_metadata_and_value() {
        let r = region(4);
        let mut manager = CountersManager::new(r.metadata, r.values, 1_000);
        let id = manager
            .allocate(PUBLISHER_LIMIT_TYPE_ID, &7i64.to_le_bytes(), "pub-lmt: 7", 7, 1, 0)
            .expect("allocate");
        manager.set_counter_value(id, 4096);

        let reader = CountersReader::new(r.metadata, r.values);
        assert_eq!(reader.counter_value(id), 4096);
        let meta = reader.metadata_for(id).expect("metadata");
        assert_eq!(meta.type_id, PUBLISHER_LIMIT_TYPE_ID);
        assert_eq!(meta.label, "pub-lmt: 7");
        assert!(meta.key.starts_with(&7i64.to_le_bytes()));
        assert_eq!(
            reader.find_by_type_id_and_key(PUBLISHER_LIMIT_TYPE_ID, &7i64.to_le_bytes()),
            Some(id)
        );
    }

    #[test]
    fn freed_ids_wait_for_the_reuse_deadline() {
        let r = region(2);
        let mut manager = CountersManager::new(r.metadata, r.values, 1_000);
        let first = manager.allocate(1, &[], "a", 10, 0, 0).expect("first");
        let second = manager.allocate(1, &[], "b", 11, 0, 0).expect("second");
        manager.free(first, 100);

        let err = manager.allocate(1, &[], "c", 12, 0, 500).expect_err("still cooling down");
        assert!(matches!(err, Error::CapacityExceeded(_)));

        let reused = manager.allocate(1, &[], "c", 12, 0, 1_100).expect("reuse");
        assert_eq!(reused, first);
        assert_ne!(reused, second);
    }

    #[test]
    fn stale_handle_detects_reuse() {
        let r = region(1);
        let mut manager = CountersManager::new(r.metadata, r.values, 0);
        let id = manager.allocate(4, &[], "sub-pos", 20, 0, 0).expect("allocate");
        let reader = CountersReader::new(r.metadata, r.values);
        let handle = reader.handle(id).expect("handle");
        manager.set_counter_value(id, 99);
        assert_eq!(reader.value_of(&handle), Some(99));

        manager.free(id, 0);
        assert_eq!(reader.value_of(&handle), None);

        let again = manager.allocate(4, &[], "sub-pos", 21, 0, 0).expect("reallocate");
        assert_eq!(again, id);
        assert_eq!(reader.value_of(&handle), None);
        assert_eq!(reader.handle(again).map(|h| h.registration_id), Some(21));
    }

    #[test]
    fn for_each_skips_reclaimed_slots() {
        let r = region(3);
        let mut manager = CountersManager::new(r.metadata, r.values, 10);
        let a = manager.allocate(1, &[], "a", 1, 0, 0).expect("a");
        manager.allocate(1, &[], "b", 2, 0, 0).expect("b");
        manager.free(a, 0);
        let reader = CountersReader::new(r.metadata, r.values);
        let mut labels = Vec::new();
        reader.for_each(|_, _, _, label| labels.push(label.to_string()));
        assert_eq!(labels, vec!["b".to_string()]);
    }
}
