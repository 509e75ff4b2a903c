use driver_net::NetBuf;

/// Protocol layer that interprets the bytes at the start of a segment's data.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Not parsed yet.
    #[default]
    None,
    Ether,
    Ipv4,
    Ipv6,
    /// IPv6 fragment extension header.
    Ipv6Frag,
    Icmpv4,
    Icmpv6,
    Udp,
    Tcp,
    /// Application payload.
    Data,
}

/// One pooled buffer inside a [`Chain`](crate::Chain).
///
/// The chain owns its segments in order; a segment's successor is the next
/// one in the chain and `total_len` caches the length of this segment plus
/// all segments after it.
#[derive(Debug)]
pub struct Segment {
    pub(crate) buf: NetBuf,
    pub(crate) total_len: usize,
    pub(crate) kind: HeaderKind,
}

impl Segment {
    pub(crate) fn new(buf: NetBuf, kind: HeaderKind) -> Self {
        Self {
            total_len: buf.data_len(),
            buf,
            kind,
        }
    }

    pub fn buf(&self) -> &NetBuf {
        &self.buf
    }

    pub fn data(&self) -> &[u8] {
        self.buf.data()
    }

    pub fn data_index(&self) -> usize {
        self.buf.data_index()
    }

    pub fn data_len(&self) -> usize {
        self.buf.data_len()
    }

    /// Length of this segment and every segment after it.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn header_kind(&self) -> HeaderKind {
        self.kind
    }

    pub fn into_buf(self) -> NetBuf {
        self.buf
    }
}
