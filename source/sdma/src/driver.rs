//! The hardware driver interface.
//!
//! A DMA controller driver plugs into the scheduler by implementing
//! [`Driver`]. The scheduler owns all of the bookkeeping (which request is
//! waiting, which channel is free, which transfer runs where); the driver only
//! knows how to encode transfers for its hardware and how to poke a channel.
use core::fmt;

use mycelium_bitfield::bitfield;

use crate::{errors::DriverError, lli::Descriptor, ChannelId, DmaAddr, RequestId};

/// Operations a DMA controller driver provides to the scheduler.
///
/// The driver value is shared by every channel of the pool: state stored in
/// it is *pool-wide*, not per-channel. A driver for a controller with several
/// independent register blocks must index its own state by [`ChannelId`].
///
/// The optional operations ([`channel_pause`](Driver::channel_pause),
/// [`channel_resume`](Driver::channel_resume),
/// [`channel_terminate`](Driver::channel_terminate)) default to returning
/// [`DriverError::Unsupported`]. A driver that implements one of them must
/// also advertise it in [`capabilities`](Driver::capabilities); the scheduler
/// only publishes the operations advertised there.
pub trait Driver: Send + Sync {
    /// The driver's hardware link-list item.
    ///
    /// One `Lli` describes one contiguous segment of a transfer. Scatter-gather
    /// transfers chain several of them together by device address.
    type Lli: Default + Send + Sync;

    /// Returns the capabilities of this driver.
    fn capabilities(&self) -> Capabilities;

    /// Populates a freshly allocated LLI for one transfer segment.
    ///
    /// If this returns an error, the transfer being prepared is abandoned and
    /// every LLI already allocated for it is released.
    fn lli_init(&self, lli: &mut Self::Lli, params: &LliParams<'_>) -> Result<(), DriverError>;

    /// Links `prev` to the LLI living at device address `next`.
    ///
    /// After this call, `next` is the tail of the chain.
    fn lli_link(&self, prev: &mut Self::Lli, next: DmaAddr);

    /// Returns the device address of the LLI following `lli`, if any.
    fn lli_next(&self, lli: &Self::Lli) -> Option<DmaAddr>;

    /// Returns `true` if another LLI follows `lli` in its chain.
    fn lli_has_next(&self, lli: &Self::Lli) -> bool {
        self.lli_next(lli).is_some()
    }

    /// Returns the number of bytes moved by `lli`.
    fn lli_size(&self, lli: &Self::Lli) -> usize;

    /// Returns `true` if `request` may be serviced by `channel`.
    ///
    /// This is only consulted if the driver advertises
    /// [`Capabilities::PAIRING`]. Otherwise, any request may run on any
    /// channel.
    fn validate_pairing(&self, channel: ChannelId, request: RequestId) -> bool {
        let _ = (channel, request);
        true
    }

    /// Starts `desc` on `channel`.
    ///
    /// The scheduler guarantees that `channel` is idle when this is called.
    fn channel_start(&self, channel: ChannelId, desc: &Descriptor<Self::Lli>);

    /// Halts the transfer running on `channel`, keeping its progress.
    fn channel_pause(&self, channel: ChannelId) -> Result<(), DriverError> {
        let _ = channel;
        Err(DriverError::Unsupported)
    }

    /// Resumes a transfer halted by [`channel_pause`](Driver::channel_pause).
    fn channel_resume(&self, channel: ChannelId) -> Result<(), DriverError> {
        let _ = channel;
        Err(DriverError::Unsupported)
    }

    /// Aborts the transfer running on `channel`.
    ///
    /// Once this returns, the scheduler treats `channel` as idle and may
    /// start another transfer on it. No completion should be reported for
    /// the aborted transfer.
    fn channel_terminate(&self, channel: ChannelId) -> Result<(), DriverError> {
        let _ = channel;
        Err(DriverError::Unsupported)
    }

    /// Returns the number of bytes the transfer currently running on
    /// `channel` has left to move.
    fn channel_residue(&self, channel: ChannelId) -> usize;
}

bitfield! {
    /// What a [`Driver`] supports.
    #[derive(Eq, PartialEq)]
    pub struct Capabilities<u8> {
        /// Memory-to-memory copies ([`Sdma::prep_memcpy`](crate::Sdma::prep_memcpy)).
        pub const MEMCPY: bool;
        /// Transfers to or from a peripheral
        /// ([`Sdma::prep_slave_sg`](crate::Sdma::prep_slave_sg)).
        pub const SLAVE: bool;
        /// [`Driver::channel_pause`] is implemented.
        pub const PAUSE: bool;
        /// [`Driver::channel_resume`] is implemented.
        pub const RESUME: bool;
        /// [`Driver::channel_terminate`] is implemented.
        pub const TERMINATE: bool;
        /// [`Driver::validate_pairing`] restricts which channels a request
        /// may run on.
        pub const PAIRING: bool;
    }
}

/// Whether a transfer is a plain memory copy or involves a peripheral.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferType {
    /// Memory to memory copy.
    Memcpy,
    /// Memory to device, or device to memory.
    Slave,
}

/// The direction of a DMA transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum Direction {
    #[default]
    MemToMem,
    MemToDev,
    DevToMem,
    DevToDev,
}

/// Width of a peripheral data register.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum BusWidth {
    #[default]
    Undefined,
    Bytes1,
    Bytes2,
    Bytes3,
    Bytes4,
    Bytes8,
    Bytes16,
    Bytes32,
    Bytes64,
}

/// Peripheral-side configuration of a request.
///
/// This is copied verbatim into the request by
/// [`Sdma::config`](crate::Sdma::config) and handed to the driver for every
/// slave transfer prepared on that request.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct SlaveConfig {
    /// Device address to read from, for [`Direction::DevToMem`] transfers.
    pub src_addr: DmaAddr,
    /// Device address to write to, for [`Direction::MemToDev`] transfers.
    pub dst_addr: DmaAddr,
    pub src_addr_width: BusWidth,
    pub dst_addr_width: BusWidth,
    /// Maximum number of words per burst when reading.
    pub src_maxburst: u32,
    /// Maximum number of words per burst when writing.
    pub dst_maxburst: u32,
    /// The peripheral, rather than the DMA controller, is the flow controller.
    pub device_fc: bool,
    /// Hardware request line, when the controller needs one.
    pub slave_id: u32,
}

/// One memory segment of a scatter-gather transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SgEntry {
    pub addr: DmaAddr,
    pub len: usize,
}

/// Everything [`Driver::lli_init`] needs to encode one transfer segment.
#[derive(Copy, Clone, Debug)]
pub struct LliParams<'a> {
    /// The request this transfer was prepared on.
    pub request: RequestId,
    pub kind: TransferType,
    pub direction: Direction,
    pub src: DmaAddr,
    pub dst: DmaAddr,
    pub len: usize,
    /// The request's slave configuration, for [`TransferType::Slave`]
    /// transfers.
    pub config: Option<&'a SlaveConfig>,
}

// === impl Capabilities ===

impl Capabilities {
    /// Returns `true` if transfers of type `kind` can be prepared.
    #[must_use]
    pub fn supports(&self, kind: TransferType) -> bool {
        match kind {
            TransferType::Memcpy => self.get(Self::MEMCPY),
            TransferType::Slave => self.get(Self::SLAVE),
        }
    }

    /// Returns `true` if every capability set in `other` is also set in
    /// `self`.
    #[must_use]
    pub fn contains(&self, other: Self) -> bool {
        self.bits() & other.bits() == other.bits()
    }
}

// === impl TransferType ===

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memcpy => f.write_str("memcpy"),
            Self::Slave => f.write_str("slave"),
        }
    }
}

// === impl Direction ===

impl Direction {
    /// Returns `true` for the directions a slave transfer may take.
    #[must_use]
    pub fn is_slave(self) -> bool {
        matches!(self, Self::MemToDev | Self::DevToMem)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemToMem => f.write_str("mem-to-mem"),
            Self::MemToDev => f.write_str("mem-to-dev"),
            Self::DevToMem => f.write_str("dev-to-mem"),
            Self::DevToDev => f.write_str("dev-to-dev"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_are_valid() {
        Capabilities::assert_valid();
    }

    #[test]
    fn capabilities_contains() {
        let caps = Capabilities::new()
            .with(Capabilities::MEMCPY, true)
            .with(Capabilities::PAUSE, true)
            .with(Capabilities::RESUME, true);
        assert!(caps.contains(Capabilities::new().with(Capabilities::MEMCPY, true)));
        assert!(caps.contains(Capabilities::new()));
        assert!(!caps.contains(Capabilities::new().with(Capabilities::SLAVE, true)));
        assert!(caps.supports(TransferType::Memcpy));
        assert!(!caps.supports(TransferType::Slave));
    }

    #[test]
    fn slave_directions() {
        assert!(Direction::MemToDev.is_slave());
        assert!(Direction::DevToMem.is_slave());
        assert!(!Direction::MemToMem.is_slave());
        assert!(!Direction::DevToDev.is_slave());
    }
}
