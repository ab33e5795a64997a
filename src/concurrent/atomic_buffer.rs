use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

/// A bounds-checked view over shared memory.
///
/// `AtomicBuffer` does not own the bytes it points at; whoever hands one out
/// (an `MmapFile`, `LogBuffers`, the CnC file) keeps the mapping alive for as
/// long as views exist. Words shared with another actor must be accessed with
/// the `_volatile` / `_ordered` / CAS methods; plain accessors are for bytes
/// that are published by a later ordered store.
#[derive(Clone, Copy, Debug)]
pub struct AtomicBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: see type docs; the buffer is a window onto shared memory whose
// cross-thread protocol is expressed through atomic operations.
unsafe impl Send for AtomicBuffer {}
unsafe impl Sync for AtomicBuffer {}

impl AtomicBuffer {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the whole
    /// time the buffer (or any view derived from it) is used.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    /// A sub-view of `len` bytes starting at `offset`.
    pub fn view(&self, offset: usize, len: usize) -> AtomicBuffer {
        self.bounds_check(offset, len);
        // SAFETY: bounds checked above.
        unsafe { AtomicBuffer::new(self.ptr.add(offset), len) }
    }

    #[inline]
    fn bounds_check(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.len),
            "index out of bounds: offset={offset} len={len} capacity={}",
            self.len
        );
    }

    #[inline]
    fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        self.bounds_check(offset, 8);
        let ptr = unsafe { self.ptr.add(offset) };
        assert_eq!(ptr as usize % 8, 0, "unaligned atomic i64 at offset {offset}");
        // SAFETY: in bounds and 8-byte aligned.
        unsafe { &*(ptr as *const AtomicI64) }
    }

    #[inline]
    fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        self.bounds_check(offset, 4);
        let ptr = unsafe { self.ptr.add(offset) };
        assert_eq!(ptr as usize % 4, 0, "unaligned atomic i32 at offset {offset}");
        // SAFETY: in bounds and 4-byte aligned.
        unsafe { &*(ptr as *const AtomicI32) }
    }

    pub fn get_i64(&self, offset: usize) -> i64 {
        self.bounds_check(offset, 8);
        let raw = unsafe { (self.ptr.add(offset) as *const i64).read_unaligned() };
        i64::from_le(raw)
    }

    pub fn put_i64(&self, offset: usize, value: i64) {
        self.bounds_check(offset, 8);
        unsafe { (self.ptr.add(offset) as *mut i64).write_unaligned(value.to_le()) }
    }

    pub fn get_i32(&self, offset: usize) -> i32 {
        self.bounds_check(offset, 4);
        let raw = unsafe { (self.ptr.add(offset) as *const i32).read_unaligned() };
        i32::from_le(raw)
    }

    pub fn put_i32(&self, offset: usize, value: i32) {
        self.bounds_check(offset, 4);
        unsafe { (self.ptr.add(offset) as *mut i32).write_unaligned(value.to_le()) }
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        self.bounds_check(offset, 2);
        let raw = unsafe { (self.ptr.add(offset) as *const u16).read_unaligned() };
        u16::from_le(raw)
    }

    pub fn put_u16(&self, offset: usize, value: u16) {
        self.bounds_check(offset, 2);
        unsafe { (self.ptr.add(offset) as *mut u16).write_unaligned(value.to_le()) }
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.bounds_check(offset, 1);
        unsafe { self.ptr.add(offset).read() }
    }

    pub fn put_u8(&self, offset: usize, value: u8) {
        self.bounds_check(offset, 1);
        unsafe { self.ptr.add(offset).write(value) }
    }

    pub fn get_i64_volatile(&self, offset: usize) -> i64 {
        self.atomic_i64(offset).load(Ordering::Acquire)
    }

    pub fn put_i64_ordered(&self, offset: usize, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::Release);
    }

    pub fn get_and_add_i64(&self, offset: usize, delta: i64) -> i64 {
        self.atomic_i64(offset).fetch_add(delta, Ordering::AcqRel)
    }

    pub fn compare_and_set_i64(&self, offset: usize, expected: i64, update: i64) -> bool {
        self.atomic_i64(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn get_i32_volatile(&self, offset: usize) -> i32 {
        self.atomic_i32(offset).load(Ordering::Acquire)
    }

    pub fn put_i32_ordered(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::Release);
    }

    pub fn compare_and_set_i32(&self, offset: usize, expected: i32, update: i32) -> bool {
        self.atomic_i32(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn put_bytes(&self, offset: usize, src: &[u8]) {
        self.bounds_check(offset, src.len());
        // SAFETY: destination is in bounds; src cannot overlap a live &[u8]
        // into the same region because views never hand out mutable slices.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len());
        }
    }

    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.bounds_check(offset, dst.len());
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    pub fn set_memory(&self, offset: usize, len: usize, value: u8) {
        self.bounds_check(offset, len);
        unsafe { std::ptr::write_bytes(self.ptr.add(offset), value, len) }
    }

    /// Borrows `len` bytes at `offset`.
    ///
    /// The bytes are shared memory: callers only read regions whose
    /// publication they have already observed through an acquire load.
    pub fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
        self.bounds_check(offset, len);
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// Mutably borrows `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must hold the exclusive right to write the region (a claimed
    /// but unpublished frame) for the lifetime of the returned slice.
    pub unsafe fn as_mut_slice(&self, offset: usize, len: usize) -> &mut [u8] {
        self.bounds_check(offset, len);
        std::slice::from_raw_parts_mut(self.ptr.add(offset), len)
    }

    pub fn get_string(&self, offset: usize) -> String {
        let len = self.get_i32(offset).max(0) as usize;
        String::from_utf8_lossy(self.as_slice(offset + 4, len)).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::AtomicBuffer;

    fn with_buffer(len: usize, f: impl FnOnce(AtomicBuffer)) {
        let mut backing = vec![0u64; len / 8];
        let buffer = unsafe { AtomicBuffer::new(backing.as_mut_ptr() as *mut u8, len) };
        f(buffer);
    }

    #[test]
    fn cas_and_fetch_add_follow_atomic_semantics() {
        with_buffer(64, |buffer| {
            assert_eq!(buffer.get_and_add_i64(8, 5), 0);
            assert_eq!(buffer.get_and_add_i64(8, 5), 5);
            assert!(buffer.compare_and_set_i64(8, 10, 42));
            assert!(!buffer.compare_and_set_i64(8, 10, 43));
            assert_eq!(buffer.get_i64_volatile(8), 42);
        });
    }

    #[test]
    fn views_are_relative_to_their_offset() {
        with_buffer(128, |buffer| {
            let view = buffer.view(64, 64);
            view.put_i32(4, -7);
            assert_eq!(buffer.get_i32(68), -7);
            view.put_bytes(8, b"abc");
            assert_eq!(buffer.as_slice(72, 3), b"abc");
        });
    }

    #[test]
    #[should_panic(expected = "index out of bounds")]
    fn out_of_bounds_access_panics() {
        with_buffer(16, |buffer| {
            buffer.put_i64(12, 1);
        });
    }
}
