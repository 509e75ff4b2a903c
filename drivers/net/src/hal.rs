//! Register-level hooks a NIC must provide to drive the descriptor rings.

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::{DriverResult, MacAddress, desc::DescRing};

/// Direction of a descriptor ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    Rx,
    Tx,
}

bitflags! {
    /// Interrupt causes latched by the device.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqCause: u32 {
        /// At least one receive descriptor completed.
        const RX = 1 << 0;
        /// At least one transmit descriptor completed.
        const TX = 1 << 1;
        /// The receive engine stalled on a descriptor it does not own.
        const RX_STALLED = 1 << 2;
        /// A bus or FIFO error was latched.
        const ERROR = 1 << 3;
    }
}

/// Register access of one network controller.
///
/// Implementations only move bits into and out of registers; ring
/// bookkeeping stays in [`NetDevice`](crate::NetDevice).
pub trait NetHal: Send {
    /// Device name used in logs.
    fn name(&self) -> &str;

    /// IRQ line of the device, if any.
    fn irq(&self) -> Option<usize> {
        None
    }

    /// The hardware address of the NIC.
    fn mac_address(&self) -> MacAddress;

    /// One-time controller reset, run when the device is constructed.
    fn reset(&mut self) -> DriverResult;

    /// Programs the base address and size of a descriptor table.
    ///
    /// The device keeps the table alive for as long as it may DMA into it.
    fn attach_ring(&mut self, kind: RingKind, ring: Arc<DescRing>);

    /// Starts or stops one DMA direction.
    fn set_enabled(&mut self, kind: RingKind, enabled: bool);

    /// Whether the transmit engine is still walking the ring.
    fn tx_running(&self) -> bool {
        false
    }

    /// Tells an idle transmit engine to poll the ring again.
    fn tx_doorbell(&mut self);

    /// Tells a stalled receive engine that descriptors were re-posted.
    fn rx_resume(&mut self) {}

    /// Reads and acknowledges the pending interrupt causes.
    fn take_irq_cause(&mut self) -> IrqCause;
}
