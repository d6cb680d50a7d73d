//! # Scheduled DMA
//!
//! Many DMA controllers expose fewer physical channels than there are
//! peripherals that want to perform DMA. This crate lets a driver present one
//! logical [request](RequestId) per peripheral endpoint, and schedules the
//! transfers queued on those requests onto whichever physical
//! [channels](ChannelId) are free.
//!
//! A hardware driver implements the [`Driver`] trait, which describes how to
//! build its link-list items (LLIs) and how to start, pause, resume and stop
//! a channel. The driver is handed to [`Sdma::new`], along with
//! [`SdmaSettings`] sizing the channel pool, the request pool and the LLI
//! pool.
//!
//! Clients then use a request roughly like this:
//!
//! 1. [`Sdma::config`] sets the peripheral-side configuration.
//! 2. [`Sdma::prep_memcpy`] or [`Sdma::prep_slave_sg`] builds a transfer and
//!    queues it, returning a [`Cookie`].
//! 3. [`Sdma::issue_pending`] makes everything queued so far eligible to run.
//!    If a channel is free, the first transfer starts right away; otherwise
//!    the request waits in the pending list.
//! 4. [`Sdma::tx_status`] or [`Sdma::wait_for`] observe completion.
//!
//! The driver's interrupt handler calls [`Sdma::report_transfer`] whenever a
//! channel finishes. That retires the finished transfer and returns the next
//! one to start on that channel, if there is one.
//!
//! ## Locking
//!
//! Every request has its own spinlock guarding its descriptor queue and
//! configuration. A single arbitration lock guards the list of available
//! channels, the list of pending requests, and which request owns which
//! channel. When both are needed, the request lock is always taken first.
//! Apart from [`Driver::validate_pairing`], which is the admission predicate
//! consulted during elections, driver callbacks are never invoked with the
//! arbitration lock held.
#![cfg_attr(not(any(feature = "use-std", test)), no_std)]

extern crate alloc;

use core::fmt;

pub mod driver;
pub mod errors;
pub mod lli;
pub(crate) mod loom;
pub mod registry;
mod sched;
#[allow(clippy::module_inception)]
mod sdma;
pub mod settings;
pub mod vchan;

#[cfg(test)]
mod test_util;

pub use self::{
    driver::{
        BusWidth, Capabilities, Direction, Driver, LliParams, SgEntry, SlaveConfig, TransferType,
    },
    lli::Descriptor,
    registry::{DeviceId, DeviceOps, DmaChan, DmaDevice, Registry, SlaveCaps},
    sdma::Sdma,
    settings::SdmaSettings,
    vchan::{Cookie, TxState, TxStatus},
};

/// A device-visible bus address.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct DmaAddr(pub u64);

/// Identifies one physical DMA channel within an [`Sdma`] pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(u16);

/// Identifies one logical DMA request within an [`Sdma`] pool.
///
/// This is what clients think of as "a DMA channel": the endpoint transfers
/// are queued on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(u16);

// === impl DmaAddr ===

impl DmaAddr {
    /// # Panics
    ///
    /// If the result does not fit in the address space.
    #[must_use]
    #[track_caller]
    pub const fn offset(self, bytes: u64) -> Self {
        match self.checked_offset(bytes) {
            Some(addr) => addr,
            None => panic!("DMA address overflow"),
        }
    }

    /// Returns `None` if the result does not fit in the address space.
    #[must_use]
    pub const fn checked_offset(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl fmt::Debug for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaAddr({:#x})", self.0)
    }
}

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// === impl ChannelId ===

impl ChannelId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u16)
    }

    /// Returns the hardware index of this channel.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan{}", self.0)
    }
}

// === impl RequestId ===

impl RequestId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u16)
    }

    /// Returns the index of this request within its pool.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}
