//! Splitting oversized datagrams into IPv6-style fragments.

use alloc::{sync::Arc, vec::Vec};

use driver_net::{DriverError, DriverResult, NetBufPool};
use log::debug;

use crate::{Chain, copy_chain_to_chain, segment::HeaderKind};

/// Length of the fragment extension header.
pub const FRAG_HEADER_LEN: usize = 8;

/// Fragmentation parameters of the owning protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragConfig {
    /// Every fragment but the last carries a multiple of this many bytes.
    pub unit: usize,
    /// Largest datagram a receiver can reassemble.
    pub max_datagram: usize,
    /// Room kept in front of each fragment header for the outer headers.
    pub header_reserve: usize,
}

impl FragConfig {
    /// 8-byte fragment unit, 65535-byte datagrams, room for the fixed
    /// IPv6 header and an Ethernet header.
    pub const IPV6: Self = Self {
        unit: 8,
        max_datagram: 65535,
        header_reserve: 40 + 14,
    };

    /// Payload bytes per fragment for a link of `unit_mtu`.
    pub fn payload_per_fragment(&self, unit_mtu: usize) -> usize {
        let room = unit_mtu.saturating_sub(FRAG_HEADER_LEN);
        room - room.checked_rem(self.unit).unwrap_or(0)
    }
}

impl Default for FragConfig {
    fn default() -> Self {
        Self::IPV6
    }
}

/// Fragment extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragHeader {
    /// Protocol of the fragmented payload.
    pub next_header: u8,
    /// Byte offset of this fragment in the original payload.
    pub offset: usize,
    /// More fragments follow.
    pub more: bool,
    /// Identifies the fragments of one datagram.
    pub ident: u32,
}

impl FragHeader {
    pub fn encode(&self, out: &mut [u8; FRAG_HEADER_LEN]) {
        let field = ((self.offset / 8) << 3) as u16 | self.more as u16;
        out[0] = self.next_header;
        out[1] = 0;
        out[2..4].copy_from_slice(&field.to_be_bytes());
        out[4..8].copy_from_slice(&self.ident.to_be_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; FRAG_HEADER_LEN] = bytes.get(..FRAG_HEADER_LEN)?.try_into().ok()?;
        let field = u16::from_be_bytes([bytes[2], bytes[3]]);
        Some(Self {
            next_header: bytes[0],
            offset: (field >> 3) as usize * 8,
            more: field & 1 != 0,
            ident: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

impl Chain {
    /// Splits the chain into fragments of at most `unit_mtu` bytes each,
    /// fragment header included.
    ///
    /// A chain that already fits is returned as the only element. Otherwise
    /// every fragment is a new chain from `pool` starting with its own
    /// [`FragHeader`], with `config.header_reserve` bytes free in front of
    /// it; every fragment but the last carries a multiple of `config.unit`
    /// bytes. Fails with [`DriverError::InvalidInput`] for a datagram larger
    /// than `config.max_datagram` or an MTU too small for one unit, and
    /// with [`DriverError::NoMemory`] if the pool runs dry, in which case
    /// the fragments built so far are released.
    pub fn fragment(
        mut self,
        pool: &Arc<NetBufPool>,
        unit_mtu: usize,
        config: &FragConfig,
        next_header: u8,
        ident: u32,
    ) -> DriverResult<Vec<Chain>> {
        let total = self.len();
        if total > config.max_datagram {
            return Err(DriverError::InvalidInput);
        }
        if total <= unit_mtu {
            return Ok(alloc::vec![self]);
        }
        // Offsets go on the wire in 8-byte units.
        if config.unit == 0 || config.unit % 8 != 0 {
            return Err(DriverError::InvalidInput);
        }
        let per = config.payload_per_fragment(unit_mtu);
        if per == 0 {
            return Err(DriverError::InvalidInput);
        }

        let count = total.div_ceil(per);
        let reserve = config.header_reserve + FRAG_HEADER_LEN;
        let mut frags = Vec::with_capacity(count);
        self.seek(0)?;
        for offset in (0..total).step_by(per) {
            let len = per.min(total - offset);
            let mut frag = Chain::acquire(pool, len, reserve, reserve + unit_mtu)?;
            copy_chain_to_chain(&mut frag, &mut self, len)?;

            let mut header = [0; FRAG_HEADER_LEN];
            FragHeader {
                next_header,
                offset,
                more: offset + len < total,
                ident,
            }
            .encode(&mut header);
            frag.prepend(FRAG_HEADER_LEN)?.copy_from_slice(&header);
            frag.set_header_kind(HeaderKind::Ipv6Frag);
            frag.seek(0)?;
            frags.push(frag);
        }
        debug!("frag: {total} bytes split into {count} fragments of up to {per}");
        Ok(frags)
    }
}
