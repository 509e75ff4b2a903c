use crate::{
    DriverError, DriverResult,
    net_buf::{AllocPolicy, BUFFER_ALIGN, MAX_BUFFER_LEN, MIN_BUFFER_LEN},
};

/// Geometry of the rings and buffer pools of one NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetDevConfig {
    /// Size of each receive buffer, not counting `rx_buf_ix_offset`.
    pub rx_buf_size: usize,
    /// Receive buffers in the pool. Those not bound to a descriptor are
    /// spares used to swap out completed descriptors.
    pub rx_buf_count: usize,
    pub rx_desc_count: usize,
    /// Alignment of the receive buffers, a power of two.
    pub rx_buf_align: usize,
    /// Octets reserved in front of every received frame.
    pub rx_buf_ix_offset: usize,
    /// Size of each large transmit buffer, not counting `tx_buf_ix_offset`.
    pub tx_buf_size: usize,
    pub tx_buf_count: usize,
    /// Size of each small transmit buffer. Requests that fit are served
    /// from the small pool first.
    pub tx_small_buf_size: usize,
    /// Small transmit buffers, `0` disables the small pool.
    pub tx_small_buf_count: usize,
    pub tx_desc_count: usize,
    pub tx_buf_align: usize,
    /// Headroom reserved in front of every transmit payload.
    pub tx_buf_ix_offset: usize,
    /// Wait policy when refilling receive spares in task context.
    pub rx_alloc: AllocPolicy,
}

impl Default for NetDevConfig {
    fn default() -> Self {
        Self {
            rx_buf_size: 1518,
            rx_buf_count: 10,
            rx_desc_count: 4,
            rx_buf_align: BUFFER_ALIGN,
            rx_buf_ix_offset: 0,
            tx_buf_size: 1518,
            tx_buf_count: 5,
            tx_small_buf_size: 60,
            tx_small_buf_count: 5,
            tx_desc_count: 4,
            tx_buf_align: BUFFER_ALIGN,
            tx_buf_ix_offset: 0,
            rx_alloc: AllocPolicy::NoWait,
        }
    }
}

impl NetDevConfig {
    /// Number of spare receive buffers kept outside the descriptors.
    pub const fn rx_spare_count(&self) -> usize {
        self.rx_buf_count.saturating_sub(self.rx_desc_count)
    }

    /// Length of each receive buffer in the pool, offset included.
    pub const fn rx_pool_buf_len(&self) -> usize {
        self.rx_buf_size + self.rx_buf_ix_offset
    }

    /// Length of each large transmit buffer in the pool, offset included.
    pub const fn tx_pool_buf_len(&self) -> usize {
        self.tx_buf_size + self.tx_buf_ix_offset
    }

    /// Length of each small transmit buffer in the pool, offset included.
    /// `None` when the small pool is disabled.
    pub const fn tx_small_pool_buf_len(&self) -> Option<usize> {
        if self.tx_small_buf_count == 0 {
            None
        } else {
            Some(self.tx_small_buf_size + self.tx_buf_ix_offset)
        }
    }

    pub fn validate(&self) -> DriverResult {
        let sizes = MIN_BUFFER_LEN..=MAX_BUFFER_LEN;
        let (Some(rx_len), Some(tx_len)) = (
            self.rx_buf_size.checked_add(self.rx_buf_ix_offset),
            self.tx_buf_size.checked_add(self.tx_buf_ix_offset),
        ) else {
            return Err(DriverError::InvalidInput);
        };
        if !sizes.contains(&self.rx_buf_size) || !sizes.contains(&self.tx_buf_size) {
            return Err(DriverError::InvalidInput);
        }
        if !sizes.contains(&rx_len) || !sizes.contains(&tx_len) {
            return Err(DriverError::InvalidInput);
        }
        if !self.rx_buf_align.is_power_of_two() || !self.tx_buf_align.is_power_of_two() {
            return Err(DriverError::InvalidInput);
        }
        if self.tx_small_buf_count > 0
            && !(MIN_BUFFER_LEN..=self.tx_buf_size).contains(&self.tx_small_buf_size)
        {
            return Err(DriverError::InvalidInput);
        }
        if self.rx_desc_count == 0 || self.tx_desc_count == 0 || self.tx_buf_count == 0 {
            return Err(DriverError::InvalidInput);
        }
        // Without spares every completed frame would be dropped.
        if self.rx_buf_count <= self.rx_desc_count {
            return Err(DriverError::InvalidInput);
        }
        Ok(())
    }
}
