//! A NIC driven through its receive and transmit descriptor rings.

use alloc::{string::String, sync::Arc, vec::Vec};

use kspin::SpinNoIrq;
use log::{debug, warn};

use crate::{
    DeviceKind, DriverError, DriverOps, DriverResult, MacAddress, NetBuf, NetBufPool,
    NetDriverOps,
    config::NetDevConfig,
    desc::DescCensus,
    hal::{IrqCause, NetHal, RingKind},
    net_buf::{AllocPolicy, PoolStats},
    rx::{RxFrame, RxHarvest, RxRing, RxStats},
    signal::{CompletionSignal, EventSignal},
    tx::{TxReclaim, TxRejected, TxRing, TxStats},
};

/// Lifecycle of a [`NetDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevState {
    /// Hardware reset done, rings never started.
    Reset,
    Started,
    Stopped,
}

/// Result of one interrupt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IrqReport {
    pub cause: IrqCause,
    pub rx: RxHarvest,
    pub tx: TxReclaim,
}

/// A NIC with one receive and one transmit ring.
///
/// `handle_irq` runs in interrupt context; `get_next_received_frame` and
/// `transmit` run in task context. Each ring sits behind its own
/// [`SpinNoIrq`], held only for the list and ownership updates. `start` and
/// `stop` take `&mut self`, so they can not overlap with the interrupt
/// handler or a transmit on the same device.
pub struct NetDevice<H: NetHal, S: CompletionSignal = EventSignal> {
    name: String,
    irq: Option<usize>,
    config: NetDevConfig,
    state: DevState,
    hal: SpinNoIrq<H>,
    rx: SpinNoIrq<RxRing>,
    tx: SpinNoIrq<TxRing>,
    rx_pool: Arc<NetBufPool>,
    tx_pool: Arc<NetBufPool>,
    /// Pool for transmit requests that fit a small buffer, if configured.
    tx_small_pool: Option<Arc<NetBufPool>>,
    signal: S,
}

impl<H: NetHal, S: CompletionSignal> NetDevice<H, S> {
    /// Resets the controller and allocates the rings and buffer pools.
    pub fn new(mut hal: H, config: NetDevConfig, signal: S) -> DriverResult<Self> {
        config.validate()?;
        hal.reset()?;
        let rx_pool = NetBufPool::with_align(
            config.rx_buf_count,
            config.rx_pool_buf_len(),
            config.rx_buf_align,
        )?;
        let tx_pool = NetBufPool::with_align(
            config.tx_buf_count,
            config.tx_pool_buf_len(),
            config.tx_buf_align,
        )?;
        let tx_small_pool = match config.tx_small_pool_buf_len() {
            Some(len) => Some(NetBufPool::with_align(
                config.tx_small_buf_count,
                len,
                config.tx_buf_align,
            )?),
            None => None,
        };
        let rx = RxRing::new(
            config.rx_desc_count,
            config.rx_spare_count(),
            config.rx_buf_ix_offset,
            rx_pool.clone(),
        );
        let tx = TxRing::new(config.tx_desc_count);
        debug!(
            "{}: reset done, {} rx descriptors, {} rx buffers, {} tx descriptors",
            hal.name(),
            config.rx_desc_count,
            config.rx_buf_count,
            config.tx_desc_count
        );
        Ok(Self {
            name: String::from(hal.name()),
            irq: hal.irq(),
            config,
            state: DevState::Reset,
            hal: SpinNoIrq::new(hal),
            rx: SpinNoIrq::new(rx),
            tx: SpinNoIrq::new(tx),
            rx_pool,
            tx_pool,
            tx_small_pool,
            signal,
        })
    }

    pub fn state(&self) -> DevState {
        self.state
    }

    pub fn config(&self) -> &NetDevConfig {
        &self.config
    }

    pub fn signal(&self) -> &S {
        &self.signal
    }

    pub fn rx_pool(&self) -> &Arc<NetBufPool> {
        &self.rx_pool
    }

    pub fn tx_pool(&self) -> &Arc<NetBufPool> {
        &self.tx_pool
    }

    pub fn tx_small_pool(&self) -> Option<&Arc<NetBufPool>> {
        self.tx_small_pool.as_ref()
    }

    /// Runs `f` with exclusive access to the register layer.
    pub fn with_hal<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        let mut hal = self.hal.lock();
        f(&mut *hal)
    }

    pub fn rx_stats(&self) -> RxStats {
        self.rx.lock().stats()
    }

    pub fn tx_stats(&self) -> TxStats {
        self.tx.lock().stats()
    }

    pub fn rx_census(&self) -> DescCensus {
        self.rx.lock().census()
    }

    pub fn tx_census(&self) -> DescCensus {
        self.tx.lock().census()
    }

    pub fn rx_pool_stats(&self) -> PoolStats {
        self.rx_pool.stats()
    }

    /// Index of the next receive descriptor to harvest.
    pub fn rx_cursor(&self) -> usize {
        self.rx.lock().cursor()
    }

    /// Binds a buffer to the free receive descriptor `index` and posts it.
    ///
    /// Takes a spare first, then the pool. Fails with
    /// [`DriverError::BadState`] unless the descriptor is free, and with
    /// [`DriverError::NoMemory`] when no buffer is left.
    pub fn post_receive_buffer(&self, index: usize) -> DriverResult {
        self.rx
            .lock()
            .post_receive_buffer(index, Some(self.config.rx_alloc))
    }

    /// Interrupt-context harvest of the receive ring.
    ///
    /// Frames harvested before an error are still announced and the
    /// receiver is still resumed.
    pub fn harvest_receive_completions(&self) -> DriverResult<RxHarvest> {
        let (harvest, result) = self.rx.lock().harvest_receive_completions();
        if harvest.descriptors > 0 {
            self.hal.lock().rx_resume();
        }
        if harvest.frames > 0 {
            self.signal.rx_ready();
        }
        result.map(|()| harvest)
    }

    /// Interrupt-context reclaim of the transmit ring.
    pub fn reclaim_transmit_completions(&self) -> DriverResult<TxReclaim> {
        let reclaim = self.tx.lock().reclaim_transmit_completions()?;
        if reclaim.descriptors > 0 {
            self.signal.tx_ready();
        }
        Ok(reclaim)
    }

    fn kick_tx(&self, was_idle: bool) {
        let mut hal = self.hal.lock();
        if was_idle || !hal.tx_running() {
            hal.tx_doorbell();
        }
    }

    /// Transmits one frame spread over several buffers.
    pub fn transmit_frame(&self, bufs: Vec<NetBuf>) -> Result<(), TxRejected<Vec<NetBuf>>> {
        if self.state != DevState::Started {
            return Err(TxRejected::new(DriverError::BadState, bufs));
        }
        let was_idle = self.tx.lock().post_transmit_frame(bufs)?;
        self.kick_tx(was_idle);
        Ok(())
    }
}

impl<H: NetHal, S: CompletionSignal> DriverOps for NetDevice<H, S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Net
    }

    fn irq(&self) -> Option<usize> {
        self.irq
    }
}

impl<H: NetHal, S: CompletionSignal> NetDriverOps for NetDevice<H, S> {
    fn mac(&self) -> MacAddress {
        self.hal.lock().mac_address()
    }

    fn can_tx(&self) -> bool {
        self.state == DevState::Started && self.tx.lock().free_descs() > 0
    }

    fn can_rx(&self) -> bool {
        self.state == DevState::Started && self.rx.lock().stats().ready_frames > 0
    }

    fn rx_queue_len(&self) -> usize {
        self.config.rx_desc_count
    }

    fn tx_queue_len(&self) -> usize {
        self.config.tx_desc_count
    }

    fn start(&mut self) -> DriverResult {
        if self.state == DevState::Started {
            return Err(DriverError::BadState);
        }
        let rx = self.rx.get_mut();
        let tx = self.tx.get_mut();
        rx.start(self.config.rx_alloc)?;

        let hal = self.hal.get_mut();
        hal.attach_ring(RingKind::Rx, rx.descs().clone());
        hal.attach_ring(RingKind::Tx, tx.descs().clone());
        hal.set_enabled(RingKind::Rx, true);
        hal.set_enabled(RingKind::Tx, true);
        self.state = DevState::Started;
        debug!(
            "{}: started, {} spare rx buffers",
            self.name,
            rx.stats().spares
        );
        Ok(())
    }

    fn stop(&mut self) -> DriverResult {
        if self.state != DevState::Started {
            return Err(DriverError::BadState);
        }
        let hal = self.hal.get_mut();
        hal.set_enabled(RingKind::Rx, false);
        hal.set_enabled(RingKind::Tx, false);

        let released = self.rx.get_mut().drain() + self.tx.get_mut().drain();
        self.state = DevState::Stopped;
        debug!("{}: stopped, {released} buffers released", self.name);
        Ok(())
    }

    fn handle_irq(&self) -> DriverResult<IrqReport> {
        let cause = self.hal.lock().take_irq_cause();
        let mut report = IrqReport {
            cause,
            ..Default::default()
        };
        if self.state != DevState::Started {
            return Ok(report);
        }
        if cause.contains(IrqCause::ERROR) {
            warn!("{}: device reported a bus error", self.name);
        }

        let rx = if cause.intersects(IrqCause::RX | IrqCause::RX_STALLED) {
            self.harvest_receive_completions()
        } else {
            Ok(RxHarvest::default())
        };
        let tx = if cause.contains(IrqCause::TX) {
            self.reclaim_transmit_completions()
        } else {
            Ok(TxReclaim::default())
        };
        report.rx = rx?;
        report.tx = tx?;
        Ok(report)
    }

    fn get_next_received_frame(&self) -> Option<RxFrame> {
        if self.state != DevState::Started {
            return None;
        }
        let (frame, wanted) = {
            let mut rx = self.rx.lock();
            let frame = rx.pop_frame();
            (frame, rx.spares_wanted())
        };
        if wanted > 0 {
            // Allocate outside the ring lock; a bounded spin must not run
            // with interrupts masked.
            let spares: Vec<NetBuf> = (0..wanted)
                .map_while(|_| self.rx_pool.alloc_with(self.config.rx_alloc))
                .collect();
            if !spares.is_empty() {
                let reposted = {
                    let mut rx = self.rx.lock();
                    rx.add_spares(spares);
                    rx.repost_free()
                };
                if reposted > 0 {
                    self.hal.lock().rx_resume();
                }
            }
        }
        frame
    }

    fn transmit(&self, buf: NetBuf) -> Result<(), TxRejected<NetBuf>> {
        if self.state != DevState::Started {
            return Err(TxRejected::new(DriverError::BadState, buf));
        }
        let was_idle = self.tx.lock().post_transmit(buf)?;
        self.kick_tx(was_idle);
        Ok(())
    }

    /// Takes a small buffer when `size` fits one and one is free, a large
    /// buffer otherwise. The data window starts after the transmit index
    /// offset and spans `size` bytes.
    fn alloc_tx_buf(&self, size: usize) -> DriverResult<NetBuf> {
        let offset = self.config.tx_buf_ix_offset;
        let total = size.checked_add(offset).ok_or(DriverError::InvalidInput)?;
        let small = self
            .tx_small_pool
            .as_ref()
            .filter(|pool| total <= pool.buffer_len())
            .and_then(|pool| pool.alloc_with(AllocPolicy::NoWait));
        let mut buf = match small {
            Some(buf) => buf,
            None if total <= self.tx_pool.buffer_len() => self
                .tx_pool
                .alloc_with(AllocPolicy::NoWait)
                .ok_or(DriverError::NoMemory)?,
            None => return Err(DriverError::InvalidInput),
        };
        buf.set_window(offset, size)?;
        Ok(buf)
    }
}

impl<H: NetHal, S: CompletionSignal> Drop for NetDevice<H, S> {
    fn drop(&mut self) {
        if self.state == DevState::Started {
            let _ = NetDriverOps::stop(self);
        }
    }
}
