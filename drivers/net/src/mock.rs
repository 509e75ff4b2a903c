//! A simulated DMA engine for exercising the rings without hardware.
//!
//! [`MockNic`] is a cheap handle: give one clone to [`NetDevice`] as its
//! [`NetHal`] and keep another to play the device side, writing received
//! frames through descriptor addresses and consuming transmitted ones.
//!
//! [`NetDevice`]: crate::NetDevice

use alloc::{sync::Arc, vec::Vec};
use core::mem;

use kspin::SpinNoIrq;

use crate::{
    DriverResult, MacAddress,
    desc::{DescFlags, DescRing, Owner},
    hal::{IrqCause, NetHal, RingKind},
};

#[derive(Default)]
struct MockState {
    rx_ring: Option<Arc<DescRing>>,
    tx_ring: Option<Arc<DescRing>>,
    rx_enabled: bool,
    tx_enabled: bool,
    rx_cursor: usize,
    tx_cursor: usize,
    tx_running: bool,
    tx_fail_next: bool,
    tx_partial: Vec<u8>,
    sent: Vec<Vec<u8>>,
    pending: IrqCause,
    resets: usize,
    doorbells: usize,
    rx_resumes: usize,
    rx_missed: usize,
}

/// Device-side model of a descriptor-ring NIC.
#[derive(Clone)]
pub struct MockNic {
    mac: MacAddress,
    state: Arc<SpinNoIrq<MockState>>,
}

impl MockNic {
    pub fn new(mac: [u8; 6]) -> Self {
        Self {
            mac: MacAddress(mac),
            state: Arc::new(SpinNoIrq::new(MockState::default())),
        }
    }

    /// DMA-writes `frame` into the next receive descriptors.
    ///
    /// Returns `false`, like a real NIC counting a missed frame, when the
    /// receiver is off or not enough descriptors are posted.
    pub fn receive(&self, frame: &[u8]) -> bool {
        self.deliver(frame, DescFlags::empty())
    }

    /// Like [`MockNic::receive`] but flags the frame as damaged (CRC error).
    pub fn receive_damaged(&self, frame: &[u8]) -> bool {
        self.deliver(frame, DescFlags::ERROR)
    }

    fn deliver(&self, frame: &[u8], extra: DescFlags) -> bool {
        let mut st = self.state.lock();
        let Some(ring) = st.rx_ring.clone() else {
            return false;
        };
        if !st.rx_enabled || frame.is_empty() {
            return false;
        }

        // Check first so a frame is either fully written or not at all.
        let mut plan = Vec::new();
        let mut index = st.rx_cursor;
        let mut offset = 0;
        while offset < frame.len() {
            let desc = ring.get(index);
            if desc.owner() != Owner::Hardware || plan.len() == ring.len() {
                st.rx_missed += 1;
                st.pending |= IrqCause::RX_STALLED;
                return false;
            }
            let len = desc.capacity().min(frame.len() - offset);
            plan.push((index, offset, len));
            offset += len;
            index = ring.next_index(index);
        }

        let parts = plan.len();
        for (i, &(index, offset, len)) in plan.iter().enumerate() {
            let desc = ring.get(index);
            // SAFETY: the driver bound a buffer of at least `capacity` bytes
            // and gave up access to it when it set the ownership bit.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    frame[offset..].as_ptr(),
                    desc.addr() as *mut u8,
                    len,
                );
            }
            let mut flags = DescFlags::empty();
            if i == 0 {
                flags |= DescFlags::FIRST;
            }
            if i + 1 == parts {
                flags |= DescFlags::LAST | extra;
            }
            desc.complete(len, flags);
        }
        st.rx_cursor = index;
        st.pending |= IrqCause::RX;
        true
    }

    /// Completes receive descriptor `index` out of ring order, as a
    /// misbehaving device would.
    pub fn complete_rx_at(&self, index: usize, len: usize) {
        let st = self.state.lock();
        if let Some(ring) = st.rx_ring.as_ref() {
            ring.get(index).complete(len, DescFlags::FIRST | DescFlags::LAST);
        }
    }

    /// Lets the transmit engine work through up to `budget` descriptors.
    ///
    /// Only runs once the doorbell was rung; the engine goes idle again
    /// when it reaches a descriptor it does not own.
    pub fn process_tx(&self, budget: usize) -> usize {
        let mut st = self.state.lock();
        let Some(ring) = st.tx_ring.clone() else {
            return 0;
        };
        if !st.tx_enabled || !st.tx_running {
            return 0;
        }

        let mut done = 0;
        while done < budget {
            let index = st.tx_cursor;
            let desc = ring.get(index);
            if desc.owner() != Owner::Hardware {
                st.tx_running = false;
                break;
            }
            let flags = desc.flags();
            // SAFETY: the driver bound `length` readable bytes at `addr`.
            let bytes =
                unsafe { core::slice::from_raw_parts(desc.addr() as *const u8, desc.length()) };
            if flags.contains(DescFlags::FIRST) {
                st.tx_partial.clear();
            }
            st.tx_partial.extend_from_slice(bytes);

            let mut status = flags & (DescFlags::FIRST | DescFlags::LAST);
            if flags.contains(DescFlags::LAST) {
                if mem::take(&mut st.tx_fail_next) {
                    status |= DescFlags::ERROR;
                    st.tx_partial.clear();
                } else {
                    let frame = mem::take(&mut st.tx_partial);
                    st.sent.push(frame);
                }
            }
            desc.complete(desc.length(), status);
            st.tx_cursor = ring.next_index(index);
            done += 1;
        }
        if done > 0 {
            st.pending |= IrqCause::TX;
        }
        done
    }

    /// The next transmitted frame completes with an error and is not sent.
    pub fn fail_next_tx(&self) {
        self.state.lock().tx_fail_next = true;
    }

    /// Frames put on the wire since the last call.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        mem::take(&mut self.state.lock().sent)
    }

    /// Latches interrupt causes.
    pub fn raise(&self, cause: IrqCause) {
        self.state.lock().pending |= cause;
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    pub fn doorbells(&self) -> usize {
        self.state.lock().doorbells
    }

    pub fn rx_resumes(&self) -> usize {
        self.state.lock().rx_resumes
    }

    /// Frames lost because no receive descriptor was posted.
    pub fn rx_missed(&self) -> usize {
        self.state.lock().rx_missed
    }

    pub fn rx_enabled(&self) -> bool {
        self.state.lock().rx_enabled
    }

    pub fn tx_enabled(&self) -> bool {
        self.state.lock().tx_enabled
    }
}

impl NetHal for MockNic {
    fn name(&self) -> &str {
        "mock-eth"
    }

    fn irq(&self) -> Option<usize> {
        Some(33)
    }

    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn reset(&mut self) -> DriverResult {
        let mut st = self.state.lock();
        st.resets += 1;
        st.rx_enabled = false;
        st.tx_enabled = false;
        Ok(())
    }

    fn attach_ring(&mut self, kind: RingKind, ring: Arc<DescRing>) {
        let mut st = self.state.lock();
        match kind {
            RingKind::Rx => {
                st.rx_ring = Some(ring);
                st.rx_cursor = 0;
            }
            RingKind::Tx => {
                st.tx_ring = Some(ring);
                st.tx_cursor = 0;
                st.tx_running = false;
            }
        }
    }

    fn set_enabled(&mut self, kind: RingKind, enabled: bool) {
        let mut st = self.state.lock();
        match kind {
            RingKind::Rx => st.rx_enabled = enabled,
            RingKind::Tx => {
                st.tx_enabled = enabled;
                st.tx_running &= enabled;
            }
        }
    }

    fn tx_running(&self) -> bool {
        self.state.lock().tx_running
    }

    fn tx_doorbell(&mut self) {
        let mut st = self.state.lock();
        st.doorbells += 1;
        st.tx_running = st.tx_enabled;
    }

    fn rx_resume(&mut self) {
        self.state.lock().rx_resumes += 1;
    }

    fn take_irq_cause(&mut self) -> IrqCause {
        mem::take(&mut self.state.lock().pending)
    }
}
