//! Receive descriptor ring.
//!
//! Every descriptor always has a buffer bound while the ring runs. On
//! completion the received buffer is swapped with a spare from the free
//! list, so the descriptor goes straight back to the device and the
//! received bytes wait on the ready list until a task pops them.
//!
//! The pooled receive buffers are partitioned at any instant between the
//! descriptors, the free list (spares), the ready list, the frame being
//! assembled, the tasks holding popped frames, and the pool itself.

use alloc::{sync::Arc, vec::Vec};

use log::{error, trace, warn};

use crate::{
    DriverError, DriverResult, NetBuf, NetBufPool,
    desc::{DescCensus, DescFlags, DescRing, DescState},
    list::{NodeArena, NodeList},
    net_buf::AllocPolicy,
};

/// One received frame, possibly spread over several buffers.
///
/// Each buffer's data window covers the bytes the device wrote into it.
/// Dropping the frame returns its buffers to the receive pool.
#[derive(Debug)]
pub struct RxFrame {
    bufs: Vec<NetBuf>,
    len: usize,
}

impl RxFrame {
    /// Total frame length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buffers(&self) -> &[NetBuf] {
        &self.bufs
    }

    pub fn into_buffers(self) -> Vec<NetBuf> {
        self.bufs
    }

    /// Copies the frame into `out`, returning how many bytes were copied.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for buf in &self.bufs {
            let n = buf.data_len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&buf.data()[..n]);
            copied += n;
            if copied == out.len() {
                break;
            }
        }
        copied
    }
}

/// What one harvest pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxHarvest {
    /// Descriptors processed and handed back to the device.
    pub descriptors: usize,
    /// Complete frames moved to the ready list.
    pub frames: usize,
    /// Frames dropped for lack of a spare buffer.
    pub dropped: usize,
    /// Frames discarded because the device flagged an error.
    pub errors: usize,
}

/// Counters and list occupancy of the receive ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxStats {
    pub frames: u64,
    pub dropped: u64,
    pub errors: u64,
    pub corruptions: u64,
    /// Spare buffers on the free list.
    pub spares: usize,
    /// Frames waiting on the ready list.
    pub ready_frames: usize,
    /// Buffers on the ready list.
    pub ready_bufs: usize,
    /// Buffers of the frame still being received.
    pub partial_bufs: usize,
    /// Buffers bound to descriptors.
    pub bound: usize,
    /// Spare slots waiting for a pool buffer.
    pub refill_pending: usize,
}

pub(crate) struct RxRing {
    descs: Arc<DescRing>,
    bound: Vec<Option<NetBuf>>,
    cursor: usize,
    nodes: NodeArena,
    /// Spare buffers ready to be swapped into a descriptor.
    free: NodeList,
    /// Complete frames; the node with `last` set ends each frame.
    ready: NodeList,
    /// Frame whose last descriptor has not completed yet.
    partial: NodeList,
    /// Skipping the remaining descriptors of a dropped frame.
    discarding: bool,
    /// Nodes without a buffer.
    idle: NodeList,
    ready_frames: usize,
    /// Octets left in front of the received data in every buffer.
    ix_offset: usize,
    pool: Arc<NetBufPool>,
    stats: RxStats,
}

impl RxRing {
    pub fn new(
        desc_count: usize,
        spare_count: usize,
        ix_offset: usize,
        pool: Arc<NetBufPool>,
    ) -> Self {
        let (nodes, idle) = NodeArena::new(spare_count);
        Self {
            descs: Arc::new(DescRing::new(desc_count)),
            bound: (0..desc_count).map(|_| None).collect(),
            cursor: 0,
            nodes,
            free: NodeList::new(),
            ready: NodeList::new(),
            partial: NodeList::new(),
            discarding: false,
            idle,
            ready_frames: 0,
            ix_offset,
            pool,
            stats: RxStats::default(),
        }
    }

    pub fn descs(&self) -> &Arc<DescRing> {
        &self.descs
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn state(&self, index: usize) -> DescState {
        DescState::of(self.descs.get(index).owner(), self.bound[index].is_some())
    }

    pub fn census(&self) -> DescCensus {
        let mut census = DescCensus::default();
        for index in 0..self.descs.len() {
            census.count(self.state(index));
        }
        census
    }

    pub fn stats(&self) -> RxStats {
        RxStats {
            spares: self.free.len(),
            ready_frames: self.ready_frames,
            ready_bufs: self.ready.len(),
            partial_bufs: self.partial.len(),
            bound: self.bound.iter().filter(|b| b.is_some()).count(),
            refill_pending: self.idle.len(),
            ..self.stats
        }
    }

    /// Binds every descriptor to a fresh buffer and fills the spare list.
    ///
    /// Fails with [`DriverError::NoMemory`] if a descriptor can not get a
    /// buffer; spares are best effort.
    pub fn start(&mut self, policy: AllocPolicy) -> DriverResult {
        for index in 0..self.descs.len() {
            if let Err(err) = self.post_receive_buffer(index, Some(policy)) {
                self.drain();
                return Err(err);
            }
        }
        self.refill(policy);
        Ok(())
    }

    /// Takes a spare from the free list, or from the pool when `pool` allows it.
    fn take_spare(&mut self, pool: Option<AllocPolicy>) -> Option<NetBuf> {
        if let Some(idx) = self.nodes.pop_front(&mut self.free) {
            let buf = self.nodes.node_mut(idx).buf.take();
            self.nodes.push_back(&mut self.idle, idx);
            if buf.is_some() {
                return buf;
            }
        }
        pool.and_then(|policy| self.pool.alloc_with(policy))
    }

    /// Binds a new buffer to the `Free` descriptor `index` and hands it to
    /// the device.
    ///
    /// The buffer comes from the free list first, then from the pool if
    /// `pool` is given (interrupt context passes `None` and never touches
    /// the pool). A `Posted` or `Completed` descriptor is refused with
    /// [`DriverError::BadState`]: the first belongs to the device and the
    /// second still holds a frame only the harvest may take. Without a
    /// buffer the descriptor stays free and [`DriverError::NoMemory`] is
    /// returned.
    pub fn post_receive_buffer(&mut self, index: usize, pool: Option<AllocPolicy>) -> DriverResult {
        if index >= self.descs.len() {
            return Err(DriverError::InvalidInput);
        }
        if self.state(index) != DescState::Free {
            return Err(DriverError::BadState);
        }
        let buf = self.take_spare(pool).ok_or(DriverError::NoMemory)?;
        self.post_with(index, buf);
        trace!("rx: posted descriptor {index}");
        Ok(())
    }

    /// Points descriptor `index` past the index offset of `buf`, binds it
    /// and hands it to the device. Returns the buffer bound before.
    fn post_with(&mut self, index: usize, buf: NetBuf) -> Option<NetBuf> {
        self.arm(index, &buf);
        let previous = self.bound[index].replace(buf);
        self.descs.get(index).give_to_hardware();
        previous
    }

    fn arm(&self, index: usize, buf: &NetBuf) {
        self.descs.get(index).prepare(
            buf.dma_addr() + self.ix_offset,
            buf.capacity() - self.ix_offset,
            0,
            DescFlags::empty(),
        );
    }

    /// Swaps the buffer of a completed descriptor with a spare and re-posts
    /// it, returning the received buffer.
    ///
    /// With no spare left the descriptor goes back to the device with its
    /// own buffer, whose content is lost, and [`DriverError::NoMemory`] is
    /// returned.
    fn swap_receive_buffer(&mut self, index: usize) -> DriverResult<NetBuf> {
        let Some(spare) = self.take_spare(None) else {
            self.rearm(index);
            return Err(DriverError::NoMemory);
        };
        self.post_with(index, spare).ok_or(DriverError::Corrupted)
    }

    /// Hands a completed descriptor back to the device with its current buffer.
    fn rearm(&mut self, index: usize) {
        if let Some(buf) = self.bound[index].as_ref() {
            self.arm(index, buf);
            self.descs.get(index).give_to_hardware();
        }
    }

    fn drop_partial(&mut self) -> bool {
        if self.partial.is_empty() {
            return false;
        }
        // The buffers become spares again; only the content is lost.
        while let Some(idx) = self.nodes.pop_front(&mut self.partial) {
            let node = self.nodes.node_mut(idx);
            node.len = 0;
            node.last = false;
            self.nodes.push_back(&mut self.free, idx);
        }
        true
    }

    /// A completed descriptor anywhere other than at the cursor.
    fn completed_out_of_order(&self) -> Option<usize> {
        (0..self.descs.len())
            .filter(|&index| index != self.cursor)
            .find(|&index| self.state(index) == DescState::Completed)
    }

    /// Moves completed descriptors to the ready list, in ring order.
    ///
    /// Runs in interrupt context: buffers only come from the free list.
    /// Stops at the first descriptor the device still owns. If a later
    /// descriptor has completed while the one at the cursor has not, the
    /// ring is out of sync with the device and [`DriverError::Corrupted`]
    /// is returned without moving the cursor.
    ///
    /// The harvest is returned even on error: frames moved to the ready
    /// list before the corruption was found stay there and are counted.
    pub fn harvest_receive_completions(&mut self) -> (RxHarvest, DriverResult) {
        let mut out = RxHarvest::default();
        let result = self.harvest_pass(&mut out);
        self.stats.frames += out.frames as u64;
        self.stats.dropped += out.dropped as u64;
        self.stats.errors += out.errors as u64;
        (out, result)
    }

    fn harvest_pass(&mut self, out: &mut RxHarvest) -> DriverResult {
        for _ in 0..self.descs.len() {
            let index = self.cursor;
            match self.state(index) {
                DescState::Completed => {}
                DescState::Free => break,
                DescState::Posted => {
                    if let Some(other) = self.completed_out_of_order() {
                        // The device may have finished the cursor meanwhile.
                        if self.state(index) != DescState::Completed {
                            error!(
                                "rx: descriptor {other} completed before descriptor {index} at the cursor"
                            );
                            self.stats.corruptions += 1;
                            return Err(DriverError::Corrupted);
                        }
                    } else {
                        break;
                    }
                }
            }
            self.harvest_one(index, out)?;
            self.cursor = self.descs.next_index(index);
            out.descriptors += 1;
        }
        Ok(())
    }

    fn harvest_one(&mut self, index: usize, out: &mut RxHarvest) -> DriverResult {
        let desc = self.descs.get(index);
        let flags = desc.flags();
        let len = desc.length();
        let capacity = desc.capacity();
        let first = flags.contains(DescFlags::FIRST);
        let last = flags.contains(DescFlags::LAST);

        if first {
            if self.drop_partial() {
                warn!("rx: frame without last descriptor dropped");
                out.errors += 1;
            }
            self.discarding = false;
        } else if self.discarding {
            // Tail of a frame that was already dropped.
            self.rearm(index);
            self.discarding = !last;
            return Ok(());
        } else if self.partial.is_empty() {
            warn!("rx: descriptor {index} continues no frame");
            self.rearm(index);
            self.discarding = !last;
            out.errors += 1;
            return Ok(());
        }

        if flags.contains(DescFlags::ERROR) || len == 0 || len > capacity {
            warn!("rx: descriptor {index} reported error, flags {flags:?}, length {len}");
            self.drop_partial();
            self.rearm(index);
            self.discarding = !last;
            out.errors += 1;
            return Ok(());
        }

        match self.swap_receive_buffer(index) {
            Ok(buf) => {
                let Some(idx) = self.nodes.pop_front(&mut self.idle) else {
                    error!("rx: no idle node for a swapped buffer");
                    self.stats.corruptions += 1;
                    return Err(DriverError::Corrupted);
                };
                let node = self.nodes.node_mut(idx);
                node.buf = Some(buf);
                node.len = len;
                node.last = last;
                self.nodes.push_back(&mut self.partial, idx);
                if last {
                    self.nodes.append(&mut self.ready, &mut self.partial);
                    self.ready_frames += 1;
                    out.frames += 1;
                }
            }
            Err(DriverError::NoMemory) => {
                warn!("rx: no spare buffer, frame on descriptor {index} dropped");
                self.drop_partial();
                self.discarding = !last;
                out.dropped += 1;
            }
            Err(err) => {
                error!("rx: completed descriptor {index} had no buffer");
                self.stats.corruptions += 1;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Pops the oldest complete frame from the ready list.
    pub fn pop_frame(&mut self) -> Option<RxFrame> {
        let mut bufs = Vec::new();
        let mut len = 0;
        while let Some(idx) = self.nodes.pop_front(&mut self.ready) {
            let node = self.nodes.node_mut(idx);
            let last = node.last;
            let part_len = node.len;
            let buf = node.buf.take();
            node.len = 0;
            node.last = false;
            self.nodes.push_back(&mut self.idle, idx);
            if let Some(mut buf) = buf {
                // The device never reports more than the capacity it was given.
                if buf.set_window(self.ix_offset, part_len).is_ok() {
                    len += part_len;
                    bufs.push(buf);
                }
            }
            if last {
                break;
            }
        }
        if bufs.is_empty() {
            return None;
        }
        self.ready_frames -= 1;
        Some(RxFrame { bufs, len })
    }

    /// Number of spare slots without a buffer.
    pub fn spares_wanted(&self) -> usize {
        self.idle.len()
    }

    /// Puts buffers on the free list, dropping those that find no slot.
    pub fn add_spares(&mut self, bufs: impl IntoIterator<Item = NetBuf>) -> usize {
        let mut added = 0;
        for buf in bufs {
            let Some(idx) = self.nodes.pop_front(&mut self.idle) else {
                break;
            };
            self.nodes.node_mut(idx).buf = Some(buf);
            self.nodes.push_back(&mut self.free, idx);
            added += 1;
        }
        added
    }

    /// Re-posts descriptors an earlier shortage left `Free`, from spares only.
    ///
    /// Returns how many went back to the device.
    pub fn repost_free(&mut self) -> usize {
        let mut posted = 0;
        for index in 0..self.descs.len() {
            if self.state(index) == DescState::Free
                && self.post_receive_buffer(index, None).is_ok()
            {
                posted += 1;
            }
        }
        posted
    }

    /// Gives every idle node a fresh buffer from the pool.
    ///
    /// Returns how many spares were added.
    pub fn refill(&mut self, policy: AllocPolicy) -> usize {
        let mut added = 0;
        while !self.idle.is_empty() {
            let Some(buf) = self.pool.alloc_with(policy) else {
                break;
            };
            added += self.add_spares(Some(buf));
        }
        added
    }

    /// Unbinds every descriptor and drops every buffer the ring holds.
    ///
    /// The device must have stopped receiving. Returns the number of
    /// buffers given back to the pool.
    pub fn drain(&mut self) -> usize {
        let mut released = 0;
        for (index, slot) in self.bound.iter_mut().enumerate() {
            self.descs.get(index).clear();
            if slot.take().is_some() {
                released += 1;
            }
        }
        released += self.nodes.release_all(&mut self.free, &mut self.idle);
        released += self.nodes.release_all(&mut self.partial, &mut self.idle);
        released += self.nodes.release_all(&mut self.ready, &mut self.idle);
        debug_assert_eq!(self.idle.len(), self.nodes.len());
        self.ready_frames = 0;
        self.discarding = false;
        self.cursor = 0;
        released
    }
}

impl Drop for RxRing {
    fn drop(&mut self) {
        self.drain();
    }
}
