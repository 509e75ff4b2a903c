//! Internet checksum over chains.
//!
//! The sum runs over the pseudo-header and then every segment in order.
//! Segment boundaries may fall on odd offsets, so an odd trailing byte is
//! carried into the next slice; only the very last byte of the whole
//! message is padded with zero.

use crate::Chain;

/// Running 16-bit ones' complement sum.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnesComplement {
    sum: u64,
    odd: Option<u8>,
}

impl OnesComplement {
    pub const fn new() -> Self {
        Self { sum: 0, odd: None }
    }

    /// Adds `data` as if it directly followed everything added before.
    pub fn add(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(hi) = self.odd.take() {
            self.sum += u16::from_be_bytes([hi, data[0]]) as u64;
            data = &data[1..];
        }
        let mut words = data.chunks_exact(2);
        for word in &mut words {
            self.sum += u16::from_be_bytes([word[0], word[1]]) as u64;
        }
        if let [last] = words.remainder() {
            self.odd = Some(*last);
        }
    }

    /// The folded sum, not complemented.
    pub fn sum(&self) -> u16 {
        let mut sum = self.sum;
        if let Some(hi) = self.odd {
            sum += (hi as u64) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    /// The checksum: complement of the folded sum.
    pub fn checksum(&self) -> u16 {
        !self.sum()
    }
}

/// What to send when the computed checksum is zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ZeroChecksum {
    /// Send zero (IPv4 header, ICMP, TCP).
    #[default]
    Keep,
    /// Send all ones, zero meaning "no checksum" (UDP).
    AllOnes,
}

fn sum_chain(chain: &Chain, pseudo_header: &[u8]) -> OnesComplement {
    let mut acc = OnesComplement::new();
    acc.add(pseudo_header);
    for seg in chain.segments() {
        acc.add(seg.data());
    }
    acc
}

/// Checksum of `pseudo_header` followed by the whole chain.
///
/// The value is numeric; `to_be_bytes` gives the order it goes on the wire.
pub fn checksum(chain: &Chain, pseudo_header: &[u8]) -> u16 {
    sum_chain(chain, pseudo_header).checksum()
}

/// Like [`checksum`], mapping a zero result as `zero` asks.
pub fn checksum_with(chain: &Chain, pseudo_header: &[u8], zero: ZeroChecksum) -> u16 {
    match (checksum(chain, pseudo_header), zero) {
        (0, ZeroChecksum::AllOnes) => 0xffff,
        (value, _) => value,
    }
}

/// Whether a received chain, checksum field included, sums to all ones.
pub fn verify_checksum(chain: &Chain, pseudo_header: &[u8]) -> bool {
    sum_chain(chain, pseudo_header).sum() == 0xffff
}

/// IPv4 pseudo-header for TCP and UDP.
pub fn pseudo_header_v4(src: [u8; 4], dst: [u8; 4], protocol: u8, len: u16) -> [u8; 12] {
    let mut ph = [0; 12];
    ph[0..4].copy_from_slice(&src);
    ph[4..8].copy_from_slice(&dst);
    ph[9] = protocol;
    ph[10..12].copy_from_slice(&len.to_be_bytes());
    ph
}

/// IPv6 pseudo-header for upper-layer checksums.
pub fn pseudo_header_v6(src: [u8; 16], dst: [u8; 16], next_header: u8, len: u32) -> [u8; 40] {
    let mut ph = [0; 40];
    ph[0..16].copy_from_slice(&src);
    ph[16..32].copy_from_slice(&dst);
    ph[32..36].copy_from_slice(&len.to_be_bytes());
    ph[39] = next_header;
    ph
}

impl Chain {
    /// See [`checksum`].
    pub fn checksum(&self, pseudo_header: &[u8]) -> u16 {
        checksum(self, pseudo_header)
    }

    /// See [`verify_checksum`].
    pub fn verify_checksum(&self, pseudo_header: &[u8]) -> bool {
        verify_checksum(self, pseudo_header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1071_example() {
        let mut acc = OnesComplement::new();
        acc.add(&[0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7]);
        assert_eq!(acc.sum(), 0xddf2);
        assert_eq!(acc.checksum(), !0xddf2);
    }

    #[test]
    fn odd_byte_carries_across_slices() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9a];
        let mut whole = OnesComplement::new();
        whole.add(&data);

        let mut split = OnesComplement::new();
        split.add(&data[..1]);
        split.add(&[]);
        split.add(&data[1..4]);
        split.add(&data[4..]);
        assert_eq!(split.sum(), whole.sum());
        // The trailing byte is padded on the right.
        assert_eq!(whole.sum(), 0x1234 + 0x5678 + 0x9a00);
    }

    #[test]
    fn ipv4_header_checksum() {
        // Header from RFC 1071 discussions, checksum field zeroed.
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let mut acc = OnesComplement::new();
        acc.add(&header);
        assert_eq!(acc.checksum(), 0xb861);
    }

    #[test]
    fn pseudo_headers() {
        let ph = pseudo_header_v4([10, 0, 0, 1], [10, 0, 0, 2], 17, 28);
        assert_eq!(ph, [10, 0, 0, 1, 10, 0, 0, 2, 0, 17, 0, 28]);
        let ph = pseudo_header_v6([1; 16], [2; 16], 58, 0x0102);
        assert_eq!(&ph[32..40], &[0, 0, 1, 2, 0, 0, 0, 58]);
    }
}
