//! Transmit descriptor ring.
//!
//! Buffers are bound to descriptors in ring order starting at `head` and
//! reclaimed in the same order starting at `tail`. `in_flight` counts the
//! descriptors between the two.

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use log::{error, trace, warn};

use crate::{
    DriverError, DriverResult, NetBuf,
    desc::{DescCensus, DescFlags, DescRing, DescState, Owner},
};

/// A transmit request the ring refused. The caller gets its buffers back.
pub struct TxRejected<T> {
    /// [`DriverError::ResourceBusy`] when the ring is full; other errors
    /// mean the request itself is unusable.
    pub reason: DriverError,
    pub buf: T,
}

impl<T> TxRejected<T> {
    pub(crate) const fn new(reason: DriverError, buf: T) -> Self {
        Self { reason, buf }
    }

    /// Whether the same request may succeed after completions are reclaimed.
    pub fn is_busy(&self) -> bool {
        self.reason == DriverError::ResourceBusy
    }

    pub fn into_inner(self) -> T {
        self.buf
    }
}

impl<T> fmt::Debug for TxRejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxRejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for TxRejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transmit rejected: {}", self.reason)
    }
}

/// What one reclaim pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxReclaim {
    /// Descriptors returned to the driver, their buffers freed.
    pub descriptors: usize,
    /// Of those, how many the device flagged with an error.
    pub errors: usize,
}

/// Counters of the transmit ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxStats {
    pub frames: u64,
    pub descriptors: u64,
    pub errors: u64,
    pub busy: u64,
    pub in_flight: usize,
}

pub(crate) struct TxRing {
    descs: Arc<DescRing>,
    bound: Vec<Option<NetBuf>>,
    head: usize,
    tail: usize,
    in_flight: usize,
    stats: TxStats,
}

impl TxRing {
    pub fn new(desc_count: usize) -> Self {
        Self {
            descs: Arc::new(DescRing::new(desc_count)),
            bound: (0..desc_count).map(|_| None).collect(),
            head: 0,
            tail: 0,
            in_flight: 0,
            stats: TxStats::default(),
        }
    }

    pub fn descs(&self) -> &Arc<DescRing> {
        &self.descs
    }

    /// Descriptors available for new frames.
    pub fn free_descs(&self) -> usize {
        self.descs.len() - self.in_flight
    }

    pub fn census(&self) -> DescCensus {
        let mut census = DescCensus::default();
        for (index, slot) in self.bound.iter().enumerate() {
            census.count(DescState::of(self.descs.get(index).owner(), slot.is_some()));
        }
        census
    }

    pub fn stats(&self) -> TxStats {
        TxStats {
            in_flight: self.in_flight,
            ..self.stats
        }
    }

    /// Whether the `count` descriptors from `head` on are all free.
    fn has_room(&self, count: usize) -> bool {
        if count > self.free_descs() {
            return false;
        }
        let mut index = self.head;
        for _ in 0..count {
            if self.bound[index].is_some() {
                return false;
            }
            index = self.descs.next_index(index);
        }
        true
    }

    /// Binds the data window of `buf` to the descriptor at `head`, without
    /// handing it over yet. Returns the descriptor index.
    fn bind(&mut self, buf: NetBuf, flags: DescFlags) -> usize {
        let index = self.head;
        self.descs
            .get(index)
            .prepare(buf.data_dma_addr(), buf.data_len(), buf.data_len(), flags);
        self.bound[index] = Some(buf);
        self.head = self.descs.next_index(index);
        self.in_flight += 1;
        index
    }

    /// Queues a single-buffer frame.
    ///
    /// Returns whether the caller must ring the doorbell, i.e. whether the
    /// ring was empty before.
    pub fn post_transmit(&mut self, buf: NetBuf) -> Result<bool, TxRejected<NetBuf>> {
        if buf.is_empty() {
            return Err(TxRejected::new(DriverError::InvalidInput, buf));
        }
        if !self.has_room(1) {
            self.stats.busy += 1;
            return Err(TxRejected::new(DriverError::ResourceBusy, buf));
        }
        let was_idle = self.in_flight == 0;
        let index = self.bind(buf, DescFlags::FIRST | DescFlags::LAST);
        self.descs.get(index).give_to_hardware();
        self.stats.frames += 1;
        self.stats.descriptors += 1;
        trace!("tx: posted descriptor {index}");
        Ok(was_idle)
    }

    /// Queues a frame spread over several buffers, all or nothing.
    ///
    /// Ownership is handed over from the last descriptor back to the first,
    /// so the device never starts on a frame whose tail is not posted yet.
    pub fn post_transmit_frame(
        &mut self,
        bufs: Vec<NetBuf>,
    ) -> Result<bool, TxRejected<Vec<NetBuf>>> {
        if bufs.is_empty() || bufs.iter().any(NetBuf::is_empty) {
            return Err(TxRejected::new(DriverError::InvalidInput, bufs));
        }
        if bufs.len() > self.descs.len() {
            return Err(TxRejected::new(DriverError::InvalidInput, bufs));
        }
        if !self.has_room(bufs.len()) {
            self.stats.busy += 1;
            return Err(TxRejected::new(DriverError::ResourceBusy, bufs));
        }

        let was_idle = self.in_flight == 0;
        let count = bufs.len();
        let mut posted = Vec::with_capacity(count);
        for (i, buf) in bufs.into_iter().enumerate() {
            let mut flags = DescFlags::empty();
            if i == 0 {
                flags |= DescFlags::FIRST;
            }
            if i + 1 == count {
                flags |= DescFlags::LAST;
            }
            posted.push(self.bind(buf, flags));
        }
        for &index in posted.iter().rev() {
            self.descs.get(index).give_to_hardware();
        }
        self.stats.frames += 1;
        self.stats.descriptors += count as u64;
        trace!("tx: posted {count} descriptors from {}", posted[0]);
        Ok(was_idle)
    }

    /// Frees the buffers of descriptors the device has finished with.
    ///
    /// Runs in interrupt context.
    pub fn reclaim_transmit_completions(&mut self) -> DriverResult<TxReclaim> {
        let mut out = TxReclaim::default();
        while self.in_flight > 0 {
            let index = self.tail;
            let desc = self.descs.get(index);
            if desc.owner() == Owner::Hardware {
                break;
            }
            let Some(buf) = self.bound[index].take() else {
                error!("tx: descriptor {index} in flight without a buffer");
                return Err(DriverError::Corrupted);
            };
            if desc.frame_error() {
                warn!("tx: descriptor {index} reported error");
                out.errors += 1;
            }
            desc.clear();
            drop(buf);
            self.tail = self.descs.next_index(index);
            self.in_flight -= 1;
            out.descriptors += 1;
        }
        self.stats.errors += out.errors as u64;
        if out.descriptors > 0 {
            trace!("tx: reclaimed {} descriptors", out.descriptors);
        }
        Ok(out)
    }

    /// Unbinds every descriptor, freeing buffers the device never sent.
    pub fn drain(&mut self) -> usize {
        let mut released = 0;
        for (index, slot) in self.bound.iter_mut().enumerate() {
            self.descs.get(index).clear();
            if slot.take().is_some() {
                released += 1;
            }
        }
        self.head = 0;
        self.tail = 0;
        self.in_flight = 0;
        released
    }
}

impl Drop for TxRing {
    fn drop(&mut self) {
        self.drain();
    }
}
