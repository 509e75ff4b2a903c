//! Packets as chains of pooled network buffers.
//!
//! A [`Chain`] treats a sequence of [`NetBuf`](driver_net::NetBuf)s as one
//! packet: offsets, copies and checksums span segment boundaries, so
//! protocol code never needs the bytes to be contiguous. Received frames
//! become chains without copying ([`Chain::from_frame`]) and chains go out
//! the same way ([`Chain::into_bufs`]).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;

use driver_net::{DriverResult, NetBufPool};

mod chain;
mod checksum;
mod frag;
mod segment;

pub use self::{
    chain::{Chain, copy_chain_to_chain},
    checksum::{
        OnesComplement, ZeroChecksum, checksum, checksum_with, pseudo_header_v4, pseudo_header_v6,
        verify_checksum,
    },
    frag::{FRAG_HEADER_LEN, FragConfig, FragHeader},
    segment::{HeaderKind, Segment},
};

/// Allocates a chain; see [`Chain::acquire`].
pub fn acquire_chain(
    pool: &Arc<NetBufPool>,
    total_len: usize,
    header_reserve: usize,
    mtu: usize,
) -> DriverResult<Chain> {
    Chain::acquire(pool, total_len, header_reserve, mtu)
}
