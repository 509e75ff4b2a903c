use alloc::{
    alloc::{Layout, alloc_zeroed, dealloc},
    sync::Arc,
    vec::Vec,
};
use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use kspin::SpinNoIrq;

use crate::{DriverError, DriverResult};

/// Smallest buffer a pool hands out, enough for a minimum Ethernet frame.
pub const MIN_BUFFER_LEN: usize = 32;
/// Largest buffer a pool hands out (the largest IP datagram).
pub const MAX_BUFFER_LEN: usize = 65535;
/// Default alignment of every buffer in a pool, one cache line.
pub const BUFFER_ALIGN: usize = 64;

/// How long an allocation may wait for a buffer to be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    /// Fail immediately. The only policy allowed in interrupt context.
    #[default]
    NoWait,
    /// Retry up to the given number of times, spinning between attempts.
    Spin(u32),
}

/// A snapshot of the pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of buffers the pool was created with.
    pub capacity: usize,
    /// Buffers currently free.
    pub available: usize,
    /// Highest number of buffers ever out at the same time.
    pub used_max: usize,
}

impl PoolStats {
    /// Buffers currently owned by someone outside the pool.
    pub const fn in_use(&self) -> usize {
        self.capacity - self.available
    }
}

/// A RAII network buffer.
///
/// It should be allocated from the [`NetBufPool`], and it will be
/// deallocated into the pool automatically when dropped.
///
/// The bytes that matter live in a window of the buffer. Headers are
/// written by moving the start of the window backwards into the headroom:
///
/// ```text
///   ______________________ capacity ______________________
///  /                                                      \
/// +------------------+------------------+------------------+
/// |     Headroom     |       Data       |     Tailroom     |
/// +------------------+------------------+------------------+
/// |\__ data_index __/ \__ data_len __/
/// |
/// base_ptr
/// ```
pub struct NetBuf {
    data_index: usize,
    data_len: usize,
    buf_len: usize,
    base_ptr: NonNull<u8>,
    slot: usize,
    pool: Arc<NetBufPool>,
}

unsafe impl Send for NetBuf {}
unsafe impl Sync for NetBuf {}

impl NetBuf {
    const unsafe fn get_slice(&self, start: usize, len: usize) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.base_ptr.as_ptr().add(start), len) }
    }

    const unsafe fn get_slice_mut(&mut self, start: usize, len: usize) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.base_ptr.as_ptr().add(start), len) }
    }

    /// Returns the capacity of the buffer.
    pub const fn capacity(&self) -> usize {
        self.buf_len
    }

    /// Offset of the first meaningful byte.
    pub const fn data_index(&self) -> usize {
        self.data_index
    }

    /// Number of meaningful bytes.
    pub const fn data_len(&self) -> usize {
        self.data_len
    }

    /// Returns true if the window is empty.
    pub const fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    /// Bytes available in front of the window.
    pub const fn headroom(&self) -> usize {
        self.data_index
    }

    /// Bytes available behind the window.
    pub const fn tailroom(&self) -> usize {
        self.buf_len - self.data_index - self.data_len
    }

    /// Returns the data window.
    pub const fn data(&self) -> &[u8] {
        unsafe { self.get_slice(self.data_index, self.data_len) }
    }

    /// Returns the mutable reference to the data window.
    pub const fn data_mut(&mut self) -> &mut [u8] {
        unsafe { self.get_slice_mut(self.data_index, self.data_len) }
    }

    /// Returns the entire buffer.
    pub const fn buffer(&self) -> &[u8] {
        unsafe { self.get_slice(0, self.buf_len) }
    }

    /// Returns the mutable reference to the entire buffer.
    pub const fn buffer_mut(&mut self) -> &mut [u8] {
        unsafe { self.get_slice_mut(0, self.buf_len) }
    }

    /// Moves the data window to `[index, index + len)`.
    pub fn set_window(&mut self, index: usize, len: usize) -> DriverResult {
        match index.checked_add(len) {
            Some(end) if end <= self.buf_len => {
                self.data_index = index;
                self.data_len = len;
                Ok(())
            }
            _ => Err(DriverError::InvalidInput),
        }
    }

    /// Sets the window length, keeping its start.
    pub fn set_data_len(&mut self, len: usize) -> DriverResult {
        self.set_window(self.data_index, len)
    }

    /// Grows the window `len` bytes to the front and returns the new bytes.
    pub fn push_header(&mut self, len: usize) -> DriverResult<&mut [u8]> {
        if len > self.data_index {
            return Err(DriverError::NoMemory);
        }
        self.data_index -= len;
        self.data_len += len;
        Ok(unsafe { self.get_slice_mut(self.data_index, len) })
    }

    /// Drops `len` bytes from the front of the window.
    pub fn pull_header(&mut self, len: usize) -> DriverResult {
        if len > self.data_len {
            return Err(DriverError::OutOfRange);
        }
        self.data_index += len;
        self.data_len -= len;
        Ok(())
    }

    /// Bus address of the first byte of the buffer.
    pub fn dma_addr(&self) -> usize {
        self.base_ptr.as_ptr() as usize
    }

    /// Bus address of the first byte of the data window.
    pub fn data_dma_addr(&self) -> usize {
        self.dma_addr() + self.data_index
    }

    /// The pool this buffer returns to.
    pub fn pool(&self) -> &Arc<NetBufPool> {
        &self.pool
    }
}

impl fmt::Debug for NetBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetBuf")
            .field("slot", &self.slot)
            .field("data_index", &self.data_index)
            .field("data_len", &self.data_len)
            .field("capacity", &self.buf_len)
            .finish()
    }
}

impl Drop for NetBuf {
    /// Deallocates the buffer into the [`NetBufPool`].
    fn drop(&mut self) {
        self.pool.release_slot(self.slot);
    }
}

/// A pool of [`NetBuf`]s to speed up buffer allocation.
///
/// It divides a large memory into several equal parts for each buffer.
/// Every part starts on the pool's alignment, so the stride between two
/// buffers is the buffer length rounded up to that alignment.
/// Allocation and release only take the free-list lock, so both are safe
/// in interrupt context.
pub struct NetBufPool {
    slot_count: usize,
    buf_len: usize,
    stride: usize,
    storage: NonNull<u8>,
    layout: Layout,
    free_slots: SpinNoIrq<Vec<usize>>,
    used_max: AtomicUsize,
}

unsafe impl Send for NetBufPool {}
unsafe impl Sync for NetBufPool {}

impl NetBufPool {
    /// Creates a new pool with the given `slot_count`, and all buffer lengths are
    /// set to `buf_len`. Buffers are aligned to [`BUFFER_ALIGN`].
    pub fn new(slot_count: usize, buf_len: usize) -> DriverResult<Arc<Self>> {
        Self::with_align(slot_count, buf_len, BUFFER_ALIGN)
    }

    /// Like [`NetBufPool::new`], with every buffer starting on a multiple
    /// of `align`, which must be a power of two.
    pub fn with_align(slot_count: usize, buf_len: usize, align: usize) -> DriverResult<Arc<Self>> {
        if slot_count == 0 || !align.is_power_of_two() {
            return Err(DriverError::InvalidInput);
        }
        if !(MIN_BUFFER_LEN..=MAX_BUFFER_LEN).contains(&buf_len) {
            return Err(DriverError::InvalidInput);
        }

        let stride = buf_len.next_multiple_of(align);
        let size = slot_count
            .checked_mul(stride)
            .ok_or(DriverError::InvalidInput)?;
        let layout =
            Layout::from_size_align(size, align).map_err(|_| DriverError::InvalidInput)?;
        let storage = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(DriverError::NoMemory)?;

        // Popped from the back, so slot 0 goes out first.
        let free_slots: Vec<usize> = (0..slot_count).rev().collect();
        Ok(Arc::new(Self {
            slot_count,
            buf_len,
            stride,
            storage,
            layout,
            free_slots: SpinNoIrq::new(free_slots),
            used_max: AtomicUsize::new(0),
        }))
    }

    /// Returns the capacity of the pool.
    pub const fn capacity(&self) -> usize {
        self.slot_count
    }

    /// Returns the length of each buffer.
    pub const fn buffer_len(&self) -> usize {
        self.buf_len
    }

    /// Alignment every buffer of the pool starts on.
    pub const fn align(&self) -> usize {
        self.layout.align()
    }

    /// Number of buffers currently free.
    pub fn available(&self) -> usize {
        self.free_slots.lock().len()
    }

    /// Returns a snapshot of the pool occupancy.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.slot_count,
            available: self.available(),
            used_max: self.used_max.load(Ordering::Relaxed),
        }
    }

    /// Allocates a buffer from the pool.
    ///
    /// Returns `None` if no buffer is available.
    pub fn alloc_buf(self: &Arc<Self>) -> Option<NetBuf> {
        let (slot, in_use) = {
            let mut free = self.free_slots.lock();
            let slot = free.pop()?;
            (slot, self.slot_count - free.len())
        };
        self.used_max.fetch_max(in_use, Ordering::Relaxed);
        let base_ptr = unsafe { self.storage.add(slot * self.stride) };
        Some(NetBuf {
            data_index: 0,
            data_len: 0,
            buf_len: self.buf_len,
            base_ptr,
            slot,
            pool: Arc::clone(self),
        })
    }

    /// Allocates a buffer, retrying as far as `policy` allows.
    pub fn alloc_with(self: &Arc<Self>, policy: AllocPolicy) -> Option<NetBuf> {
        let retries = match policy {
            AllocPolicy::NoWait => 0,
            AllocPolicy::Spin(n) => n,
        };
        for _ in 0..retries {
            if let Some(buf) = self.alloc_buf() {
                return Some(buf);
            }
            core::hint::spin_loop();
        }
        self.alloc_buf()
    }

    /// Returns a slot to the free list.
    fn release_slot(&self, slot: usize) {
        debug_assert!(slot < self.slot_count);
        let mut free = self.free_slots.lock();
        debug_assert!(!free.contains(&slot), "buffer slot {slot} released twice");
        free.push(slot);
    }
}

impl Drop for NetBufPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.storage.as_ptr(), self.layout) }
    }
}
