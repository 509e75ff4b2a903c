//! DMA descriptors and the descriptor table shared with the device.
//!
//! Every field of a [`DmaDesc`] is atomic because the DMA engine reads and
//! writes the table concurrently with the driver. The status word carries
//! the ownership bit and is published last (release) by whichever side
//! hands the descriptor over; the other fields are only touched by the
//! current owner.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Status and control bits of a descriptor.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u32 {
        /// The descriptor belongs to the DMA engine.
        const OWN = 1 << 31;
        /// Last descriptor of the table; the engine wraps to index 0.
        const WRAP = 1 << 30;
        /// The buffer holds the first part of a frame.
        const FIRST = 1 << 29;
        /// The buffer holds the last part of a frame (frame complete).
        const LAST = 1 << 28;
        /// The engine reported an error for this frame.
        const ERROR = 1 << 27;
    }
}

/// Which side may touch a descriptor right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The driver.
    Software,
    /// The DMA engine.
    Hardware,
}

/// Lifecycle state of a descriptor as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescState {
    /// No buffer bound.
    Free,
    /// Buffer bound and handed to the engine.
    Posted,
    /// The engine gave the descriptor back, not yet processed.
    Completed,
}

impl DescState {
    /// Derives the state from the owner and whether a buffer is bound.
    pub const fn of(owner: Owner, bound: bool) -> Self {
        match (owner, bound) {
            (Owner::Hardware, _) => DescState::Posted,
            (Owner::Software, true) => DescState::Completed,
            (Owner::Software, false) => DescState::Free,
        }
    }
}

/// Per-state descriptor counts of one ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescCensus {
    /// Descriptors with no buffer bound.
    pub free: usize,
    /// Descriptors the engine owns.
    pub posted: usize,
    /// Descriptors the engine handed back and the driver has not processed.
    pub completed: usize,
}

impl DescCensus {
    /// Every descriptor of the ring, whatever its state.
    pub const fn total(&self) -> usize {
        self.free + self.posted + self.completed
    }

    pub(crate) fn count(&mut self, state: DescState) {
        match state {
            DescState::Free => self.free += 1,
            DescState::Posted => self.posted += 1,
            DescState::Completed => self.completed += 1,
        }
    }
}

/// One DMA descriptor.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct DmaDesc {
    status: AtomicU32,
    capacity: AtomicU32,
    length: AtomicU32,
    addr: AtomicUsize,
}

impl DmaDesc {
    const fn new(last_in_ring: bool) -> Self {
        let status = if last_in_ring { DescFlags::WRAP.bits() } else { 0 };
        Self {
            status: AtomicU32::new(status),
            capacity: AtomicU32::new(0),
            length: AtomicU32::new(0),
            addr: AtomicUsize::new(0),
        }
    }

    /// Current status bits.
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    /// Side that may touch the descriptor, from the `OWN` bit.
    pub fn owner(&self) -> Owner {
        if self.flags().contains(DescFlags::OWN) {
            Owner::Hardware
        } else {
            Owner::Software
        }
    }

    /// Bus address of the bound buffer, 0 when none.
    pub fn addr(&self) -> usize {
        self.addr.load(Ordering::Relaxed)
    }

    /// Bytes the engine may write (RX) or must read (TX).
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed) as usize
    }

    /// Bytes the engine reported on completion (RX) or the frame part length (TX).
    pub fn length(&self) -> usize {
        self.length.load(Ordering::Relaxed) as usize
    }

    /// Whether the engine wraps to descriptor 0 after this one.
    pub fn is_last_in_ring(&self) -> bool {
        self.flags().contains(DescFlags::WRAP)
    }

    /// Whether this descriptor ends a frame.
    pub fn frame_complete(&self) -> bool {
        self.flags().contains(DescFlags::LAST)
    }

    /// Whether the engine flagged the frame part as damaged.
    pub fn frame_error(&self) -> bool {
        self.flags().contains(DescFlags::ERROR)
    }

    fn wrap_bit(&self) -> u32 {
        self.status.load(Ordering::Relaxed) & DescFlags::WRAP.bits()
    }

    /// Fills in a buffer while keeping the descriptor on the driver side.
    pub(crate) fn prepare(&self, addr: usize, capacity: usize, length: usize, flags: DescFlags) {
        self.addr.store(addr, Ordering::Relaxed);
        self.capacity.store(capacity as u32, Ordering::Relaxed);
        self.length.store(length as u32, Ordering::Relaxed);
        let control = (flags - DescFlags::OWN - DescFlags::WRAP).bits();
        self.status.store(control | self.wrap_bit(), Ordering::Release);
    }

    /// Hands a prepared descriptor to the engine.
    pub(crate) fn give_to_hardware(&self) {
        self.status.fetch_or(DescFlags::OWN.bits(), Ordering::Release);
    }

    /// Unbinds the buffer and returns the descriptor to its reset state.
    pub(crate) fn clear(&self) {
        self.addr.store(0, Ordering::Relaxed);
        self.capacity.store(0, Ordering::Relaxed);
        self.length.store(0, Ordering::Relaxed);
        self.status.store(self.wrap_bit(), Ordering::Release);
    }

    /// Device side: reports completion and gives the descriptor back.
    ///
    /// Only the DMA engine (or a model of it) calls this, and only on a
    /// descriptor it owns.
    pub fn complete(&self, length: usize, flags: DescFlags) {
        self.length.store(length as u32, Ordering::Relaxed);
        let status = (flags - DescFlags::OWN - DescFlags::WRAP).bits();
        self.status.store(status | self.wrap_bit(), Ordering::Release);
    }
}

/// A fixed-size table of descriptors, shared with the device by reference.
#[derive(Debug)]
pub struct DescRing {
    descs: Box<[DmaDesc]>,
}

impl DescRing {
    pub(crate) fn new(count: usize) -> Self {
        let descs: Vec<DmaDesc> = (0..count).map(|i| DmaDesc::new(i + 1 == count)).collect();
        Self {
            descs: descs.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// The descriptor at `index`, wrapping around the table.
    pub fn get(&self, index: usize) -> &DmaDesc {
        &self.descs[index % self.descs.len()]
    }

    /// Index following `index` in ring order.
    pub fn next_index(&self, index: usize) -> usize {
        if self.get(index).is_last_in_ring() {
            0
        } else {
            index + 1
        }
    }

    /// Bus address of the table, programmed into the ring base register.
    pub fn base_addr(&self) -> usize {
        self.descs.as_ptr() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = &DmaDesc> {
        self.descs.iter()
    }
}
