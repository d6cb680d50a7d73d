//! Errors returned by the scheduler, its drivers, and the registry.
use core::fmt;

use crate::{
    driver::{Direction, TransferType},
    registry::DeviceId,
    RequestId,
};

/// Errors returned by [`Sdma::new`](crate::Sdma::new).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AllocError {
    /// One of the fixed pools could not be allocated.
    OutOfMemory,
    /// The settings asked for zero channels.
    NoChannels,
    /// The settings asked for zero requests.
    NoRequests,
    /// The settings asked for an empty LLI pool.
    NoLliPool,
    /// More channels or requests were requested than can be indexed.
    TooLarge(usize),
    /// The LLI alignment was not a power of two.
    BadAlignment(usize),
    /// The LLI pool would extend past the end of the address space.
    AddressOverflow,
}

/// Errors returned when preparing a transfer.
///
/// When preparation fails, nothing is queued on the request and every
/// hardware descriptor allocated along the way has been released.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PrepError {
    /// A transfer, or one of its scatter-gather segments, had length zero.
    ZeroLength,
    /// A scatter-gather transfer had no segments.
    EmptyScatterList,
    /// Slave transfers must go to or from a device.
    InvalidDirection(Direction),
    /// The driver does not support this kind of transfer.
    Unsupported(TransferType),
    /// The LLI pool has no free slots.
    PoolExhausted,
    /// The driver failed to initialize a hardware descriptor.
    Driver(DriverError),
    /// The request is not part of this pool.
    NoSuchRequest(RequestId),
}

/// Errors returned by the pause, resume, and terminate operations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlError {
    /// The driver does not provide this operation.
    Unsupported(Operation),
    /// The driver failed to perform the operation.
    Driver(DriverError),
    /// The request is not part of this pool.
    NoSuchRequest(RequestId),
}

/// A control operation, for [`ControlError::Unsupported`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    Pause,
    Resume,
    Terminate,
}

/// Errors returned by a [`Driver`](crate::Driver).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum DriverError {
    /// The driver does not implement this operation.
    Unsupported,
    /// The transfer parameters cannot be encoded for this hardware.
    InvalidConfig,
    /// The hardware refused the operation.
    Hardware,
}

/// Errors returned by the [`Registry`](crate::Registry).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegistryError {
    /// The device's capabilities and published operations disagree.
    InvalidDevice(&'static str),
    /// No device with this ID is registered.
    NotRegistered(DeviceId),
    /// The device has no request with this index.
    NoSuchRequest(RequestId),
}

// === impl AllocError ===

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory allocating DMA pools"),
            Self::NoChannels => f.write_str("a DMA pool needs at least one channel"),
            Self::NoRequests => f.write_str("a DMA pool needs at least one request"),
            Self::NoLliPool => f.write_str("a DMA pool needs at least one LLI slot"),
            Self::TooLarge(n) => write!(f, "pool size {n} exceeds the maximum of {}", u16::MAX),
            Self::BadAlignment(align) => {
                write!(f, "LLI alignment {align} is not a power of two")
            }
            Self::AddressOverflow => f.write_str("LLI pool does not fit in the address space"),
        }
    }
}

// === impl PrepError ===

impl fmt::Display for PrepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroLength => f.write_str("transfer length must not be zero"),
            Self::EmptyScatterList => f.write_str("scatter-gather list is empty"),
            Self::InvalidDirection(dir) => write!(f, "invalid direction {dir} for slave transfer"),
            Self::Unsupported(kind) => write!(f, "driver does not support {kind} transfers"),
            Self::PoolExhausted => f.write_str("no free LLI slots"),
            Self::Driver(error) => write!(f, "driver failed to build LLI: {error}"),
            Self::NoSuchRequest(req) => write!(f, "pool has no request {req}"),
        }
    }
}

impl From<DriverError> for PrepError {
    fn from(error: DriverError) -> Self {
        Self::Driver(error)
    }
}

// === impl ControlError ===

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(op) => write!(f, "driver does not support {op}"),
            Self::Driver(error) => fmt::Display::fmt(error, f),
            Self::NoSuchRequest(req) => write!(f, "pool has no request {req}"),
        }
    }
}

impl From<DriverError> for ControlError {
    fn from(error: DriverError) -> Self {
        Self::Driver(error)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pause => f.write_str("pause"),
            Self::Resume => f.write_str("resume"),
            Self::Terminate => f.write_str("terminate"),
        }
    }
}

// === impl DriverError ===

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => f.write_str("operation not supported by the driver"),
            Self::InvalidConfig => f.write_str("transfer cannot be encoded for this hardware"),
            Self::Hardware => f.write_str("hardware error"),
        }
    }
}

// === impl RegistryError ===

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDevice(why) => write!(f, "invalid DMA device: {why}"),
            Self::NotRegistered(id) => write!(f, "no DMA device registered as {id}"),
            Self::NoSuchRequest(req) => write!(f, "device has no request {req}"),
        }
    }
}
