//! Descriptor-ring network drivers.
//!
//! A [`NetDevice`] owns a receive and a transmit ring of DMA descriptors
//! and a [`NetBufPool`] for each direction. The interrupt handler harvests
//! completed receive descriptors onto a ready list and reclaims sent
//! buffers; tasks pop received frames and post frames for transmission.
//! The register level of a particular controller is behind [`NetHal`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

#[doc(no_inline)]
pub use driver_base::{DeviceKind, DriverError, DriverOps, DriverResult};

mod config;
mod desc;
mod device;
mod hal;
mod list;
mod net_buf;
mod rx;
mod signal;
mod tx;

#[cfg(any(test, feature = "mock"))]
#[cfg_attr(doc, doc(cfg(feature = "mock")))]
pub mod mock;

#[cfg(test)]
mod tests;

pub use self::{
    config::NetDevConfig,
    desc::{DescCensus, DescFlags, DescRing, DescState, DmaDesc, Owner},
    device::{DevState, IrqReport, NetDevice},
    hal::{IrqCause, NetHal, RingKind},
    net_buf::{
        AllocPolicy, BUFFER_ALIGN, MAX_BUFFER_LEN, MIN_BUFFER_LEN, NetBuf, NetBufPool, PoolStats,
    },
    rx::{RxFrame, RxHarvest, RxStats},
    signal::{CompletionSignal, EventSignal},
    tx::{TxReclaim, TxRejected, TxStats},
};

/// The hardware (MAC) address of a NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

/// Operations that require a network device (NIC) driver to implement.
pub trait NetDriverOps: DriverOps {
    /// The hardware address of the NIC.
    fn mac(&self) -> MacAddress;

    /// Whether the device can transmit packets.
    fn can_tx(&self) -> bool;

    /// Whether received frames are waiting.
    fn can_rx(&self) -> bool;

    /// Size of the receive queue.
    fn rx_queue_len(&self) -> usize;

    /// Size of the transmit queue.
    fn tx_queue_len(&self) -> usize;

    /// Posts every receive descriptor and enables both directions.
    fn start(&mut self) -> DriverResult;

    /// Disables both directions and returns every buffer the rings hold to
    /// its pool. The interrupt source must be masked first.
    fn stop(&mut self) -> DriverResult;

    /// Interrupt handler: harvests receive completions and reclaims
    /// transmit completions according to the latched causes.
    ///
    /// [`DriverError::Corrupted`] means the ring no longer matches the
    /// device; recover with [`stop`](Self::stop) and [`start`](Self::start).
    fn handle_irq(&self) -> DriverResult<IrqReport>;

    /// Pops the oldest received frame, or `None` when the ready list is
    /// empty. Also tops up the spare buffers from the pool.
    fn get_next_received_frame(&self) -> Option<RxFrame>;

    /// Transmits a packet in the buffer to the network, without blocking.
    ///
    /// When the ring is full the buffer comes back in the error, with
    /// [`DriverError::ResourceBusy`] as reason.
    fn transmit(&self, buf: NetBuf) -> Result<(), TxRejected<NetBuf>>;

    /// Allocate a memory buffer of a specified size for network transmission.
    fn alloc_tx_buf(&self, size: usize) -> DriverResult<NetBuf>;
}
