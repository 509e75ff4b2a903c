//! Packets spread over a sequence of pooled buffers.

use alloc::{sync::Arc, vec, vec::Vec};

use driver_net::{AllocPolicy, DriverError, DriverResult, NetBuf, NetBufPool, RxFrame};
use log::trace;

use crate::segment::{HeaderKind, Segment};

/// One packet held in one or more [`Segment`]s.
///
/// Offsets given to [`read`](Chain::read), [`write`](Chain::write) and the
/// cursor are relative to the start of the first segment's data, as if the
/// chain were one contiguous buffer. Dropping the chain returns every
/// segment to its pool.
#[derive(Debug)]
pub struct Chain {
    segs: Vec<Segment>,
    cursor: usize,
}

impl Chain {
    /// Allocates a chain able to hold `total_len` bytes, failing at once if
    /// the pool runs dry. See [`Chain::acquire_with`].
    pub fn acquire(
        pool: &Arc<NetBufPool>,
        total_len: usize,
        header_reserve: usize,
        mtu: usize,
    ) -> DriverResult<Self> {
        Self::acquire_with(pool, total_len, header_reserve, mtu, AllocPolicy::NoWait)
    }

    /// Allocates a chain able to hold `total_len` bytes.
    ///
    /// No segment carries more than `mtu` bytes or the pool's buffer
    /// length, whichever is smaller. The first `header_reserve` bytes of the
    /// first segment are kept free for [`prepend`](Chain::prepend).
    ///
    /// When the pool can not supply a segment every segment taken by this
    /// call goes back before [`DriverError::NoMemory`] is returned.
    pub fn acquire_with(
        pool: &Arc<NetBufPool>,
        total_len: usize,
        header_reserve: usize,
        mtu: usize,
        policy: AllocPolicy,
    ) -> DriverResult<Self> {
        let seg_cap = pool.buffer_len().min(mtu);
        if header_reserve >= seg_cap {
            return Err(DriverError::InvalidInput);
        }

        let first = seg_cap - header_reserve;
        let count = 1 + total_len.saturating_sub(first).div_ceil(seg_cap);
        let mut segs = Vec::with_capacity(count);
        let mut left = total_len;
        let mut reserve = header_reserve;
        for _ in 0..count {
            let Some(mut buf) = pool.alloc_with(policy) else {
                trace!("chain: pool exhausted at segment {} of {count}", segs.len() + 1);
                return Err(DriverError::NoMemory);
            };
            let len = left.min(seg_cap - reserve);
            buf.set_window(reserve, len)?;
            segs.push(Segment::new(buf, HeaderKind::None));
            left -= len;
            reserve = 0;
        }
        debug_assert_eq!(left, 0);
        Ok(Self::from_segments(segs))
    }

    /// Wraps buffers as they are, keeping their data windows.
    pub fn from_bufs(bufs: Vec<NetBuf>, kind: HeaderKind) -> DriverResult<Self> {
        if bufs.is_empty() {
            return Err(DriverError::InvalidInput);
        }
        let segs = bufs
            .into_iter()
            .enumerate()
            .map(|(i, buf)| {
                let kind = if i == 0 { kind } else { HeaderKind::None };
                Segment::new(buf, kind)
            })
            .collect();
        Ok(Self::from_segments(segs))
    }

    /// Takes over the buffers of a received frame without copying.
    pub fn from_frame(frame: RxFrame) -> DriverResult<Self> {
        Self::from_bufs(frame.into_buffers(), HeaderKind::Ether)
    }

    /// Chain holding a copy of `bytes`.
    pub fn from_slice(
        pool: &Arc<NetBufPool>,
        bytes: &[u8],
        header_reserve: usize,
    ) -> DriverResult<Self> {
        let mut chain = Self::acquire(pool, bytes.len(), header_reserve, usize::MAX)?;
        chain.write(0, bytes)?;
        Ok(chain)
    }

    fn from_segments(segs: Vec<Segment>) -> Self {
        let mut chain = Self { segs, cursor: 0 };
        chain.update_totals();
        chain
    }

    /// Gives up the segments in order, e.g. to post them for transmission.
    pub fn into_bufs(self) -> Vec<NetBuf> {
        self.segs.into_iter().map(Segment::into_buf).collect()
    }

    fn update_totals(&mut self) {
        let mut total = 0;
        for seg in self.segs.iter_mut().rev() {
            total += seg.buf.data_len();
            seg.total_len = total;
        }
    }

    /// Total bytes in the chain.
    pub fn len(&self) -> usize {
        self.segs.first().map_or(0, Segment::total_len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    pub fn segments(&self) -> impl DoubleEndedIterator<Item = &Segment> + ExactSizeIterator {
        self.segs.iter()
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segs.get(index)
    }

    /// The segment after the one at `index`.
    pub fn next(&self, index: usize) -> Option<&Segment> {
        self.segs.get(index + 1)
    }

    /// The segment before the one at `index`.
    pub fn prev(&self, index: usize) -> Option<&Segment> {
        index.checked_sub(1).and_then(|i| self.segs.get(i))
    }

    /// Protocol of the bytes at the start of the chain.
    pub fn header_kind(&self) -> HeaderKind {
        self.segs.first().map_or(HeaderKind::None, Segment::header_kind)
    }

    pub fn set_header_kind(&mut self, kind: HeaderKind) {
        if let Some(first) = self.segs.first_mut() {
            first.kind = kind;
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> DriverResult {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(DriverError::OutOfRange),
        }
    }

    /// Segment index and offset inside it for a chain offset.
    fn locate(&self, offset: usize) -> (usize, usize) {
        let mut rest = offset;
        for (index, seg) in self.segs.iter().enumerate() {
            if rest < seg.data_len() {
                return (index, rest);
            }
            rest -= seg.data_len();
        }
        (self.segs.len(), 0)
    }

    /// Copies `bytes` into the chain starting at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> DriverResult {
        self.check_range(offset, bytes.len())?;
        let (mut index, mut skip) = self.locate(offset);
        let mut done = 0;
        while done < bytes.len() {
            let data = self.segs[index].buf.data_mut();
            let n = (data.len() - skip).min(bytes.len() - done);
            data[skip..skip + n].copy_from_slice(&bytes[done..done + n]);
            done += n;
            index += 1;
            skip = 0;
        }
        Ok(())
    }

    /// Fills `out` with the bytes starting at `offset`.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> DriverResult {
        self.check_range(offset, out.len())?;
        let (mut index, mut skip) = self.locate(offset);
        let mut done = 0;
        while done < out.len() {
            let data = self.segs[index].data();
            let n = (data.len() - skip).min(out.len() - done);
            out[done..done + n].copy_from_slice(&data[skip..skip + n]);
            done += n;
            index += 1;
            skip = 0;
        }
        Ok(())
    }

    /// Returns `len` bytes starting at `offset`.
    pub fn read_vec(&self, offset: usize, len: usize) -> DriverResult<Vec<u8>> {
        let mut out = vec![0; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    /// The whole chain as one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.segs.iter().flat_map(|seg| seg.data().iter().copied()).collect()
    }

    /// Current read/write position used by [`copy_chain_to_chain`].
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn seek(&mut self, position: usize) -> DriverResult {
        if position > self.len() {
            return Err(DriverError::OutOfRange);
        }
        self.cursor = position;
        Ok(())
    }

    /// Grows the chain `len` bytes to the front, into the header reserve of
    /// the first segment, and returns the new bytes.
    ///
    /// The cursor keeps pointing at the same byte.
    pub fn prepend(&mut self, len: usize) -> DriverResult<&mut [u8]> {
        let first = self.segs.first_mut().ok_or(DriverError::BadState)?;
        first.buf.push_header(len)?;
        self.update_totals();
        self.cursor += len;
        Ok(&mut self.segs[0].buf.data_mut()[..len])
    }

    /// Drops `len` bytes from the front, e.g. a parsed header.
    ///
    /// Segments left empty are released, except the last one.
    pub fn pull(&mut self, len: usize) -> DriverResult {
        self.check_range(0, len)?;
        let mut left = len;
        for seg in self.segs.iter_mut() {
            if left == 0 {
                break;
            }
            let n = left.min(seg.data_len());
            seg.buf.pull_header(n)?;
            left -= n;
        }
        while self.segs.len() > 1 && self.segs[0].data_len() == 0 {
            let kind = self.segs.remove(0).kind;
            self.segs[0].kind = kind;
        }
        self.update_totals();
        self.cursor = self.cursor.saturating_sub(len);
        Ok(())
    }

    /// Shortens the chain to `len` bytes, e.g. to cut link-layer padding.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len() {
            return;
        }
        let (index, keep) = self.locate(len);
        let keep_segs = if keep == 0 && index > 0 { index } else { index + 1 };
        self.segs.truncate(keep_segs);
        if let Some(last) = self.segs.last_mut() {
            let last_len = if keep == 0 && index > 0 {
                last.data_len()
            } else {
                keep
            };
            // Shrinking a window never leaves the buffer.
            let _ = last.buf.set_data_len(last_len);
        }
        self.update_totals();
        self.cursor = self.cursor.min(len);
    }
}

/// Copies `len` bytes from `src` into `dst`, each starting at its cursor,
/// and advances both cursors by `len`.
///
/// The copy walks both chains segment by segment; no contiguous buffer is
/// needed in between.
pub fn copy_chain_to_chain(dst: &mut Chain, src: &mut Chain, len: usize) -> DriverResult {
    src.check_range(src.cursor, len)?;
    dst.check_range(dst.cursor, len)?;

    let (mut si, mut so) = src.locate(src.cursor);
    let (mut di, mut doff) = dst.locate(dst.cursor);
    let mut left = len;
    while left > 0 {
        let from = &src.segs[si].data()[so..];
        let to = &mut dst.segs[di].buf.data_mut()[doff..];
        let n = from.len().min(to.len()).min(left);
        to[..n].copy_from_slice(&from[..n]);
        left -= n;
        so += n;
        doff += n;
        if so == src.segs[si].data_len() {
            si += 1;
            so = 0;
        }
        if doff == dst.segs[di].data_len() {
            di += 1;
            doff = 0;
        }
    }
    src.cursor += len;
    dst.cursor += len;
    Ok(())
}
