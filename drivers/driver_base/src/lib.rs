//! Common traits and types shared by the device drivers of this workspace.
//!
//! - [`driver_net`][1]: descriptor rings, buffer pool and NIC interfaces.
//! - [`netchain`][2]: segment chains built on top of the network buffers.
//!
//! [1]: ../driver_net/index.html
//! [2]: ../netchain/index.html

#![no_std]

/// All supported device kinds.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceKind {
    /// Network device (e.g., ethernet card).
    Net,
}

/// The error type for driver operation failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DriverError {
    /// Try again, for non-blocking APIs.
    WouldBlock,
    /// Bad internal state.
    BadState,
    /// Invalid parameter/argument.
    InvalidInput,
    /// Not enough space/cannot allocate memory (DMA).
    NoMemory,
    /// Device or resource is busy.
    ResourceBusy,
    /// Offset or length beyond the end of the data.
    OutOfRange,
    /// Ownership of a descriptor ring no longer matches its cursors.
    Corrupted,
    /// This operation is unsupported or unimplemented.
    Unsupported,
}

impl DriverError {
    /// Stable error message for display/logging.
    pub const fn message(&self) -> &'static str {
        match self {
            DriverError::WouldBlock => "Try again",
            DriverError::BadState => "Bad state",
            DriverError::InvalidInput => "Invalid parameter",
            DriverError::NoMemory => "Not enough memory",
            DriverError::ResourceBusy => "Resource is busy",
            DriverError::OutOfRange => "Offset out of range",
            DriverError::Corrupted => "Descriptor ring corrupted",
            DriverError::Unsupported => "Unsupported operation",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::WouldBlock | DriverError::NoMemory | DriverError::ResourceBusy
        )
    }
}

impl core::fmt::Display for DriverError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.message())
    }
}

/// A specialized `Result` type for device operations.
pub type DriverResult<T = ()> = Result<T, DriverError>;

/// Common operations that require all device drivers to implement.
pub trait DriverOps: Send + Sync {
    /// The name of the device.
    fn name(&self) -> &str;

    /// The kind of the device.
    fn device_kind(&self) -> DeviceKind;

    /// The IRQ number of the device, if applicable.
    fn irq(&self) -> Option<usize> {
        None
    }
}
