//! Pool sizing for an [`Sdma`](crate::Sdma) instance.
use alloc::string::String;
use core::fmt;

use serde::{Deserialize, Serialize};

/// Settings used to allocate an [`Sdma`](crate::Sdma).
///
/// Every pool is allocated once, when the `Sdma` is constructed, and never
/// grows afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SdmaSettings {
    /// Name of the device, used in diagnostics.
    #[serde(default = "SdmaSettings::default_name")]
    pub name: DeviceName,
    /// Number of physical channels provided by the hardware.
    #[serde(default = "SdmaSettings::default_channels")]
    pub channels: usize,
    /// Number of logical requests (client-visible endpoints).
    #[serde(default = "SdmaSettings::default_requests")]
    pub requests: usize,
    /// Number of hardware link-list item slots in the LLI pool.
    #[serde(default = "SdmaSettings::default_lli_pool_capacity")]
    pub lli_pool_capacity: usize,
    /// Alignment of each LLI slot, in bytes. Must be a power of two.
    #[serde(default = "SdmaSettings::default_lli_align")]
    pub lli_align: usize,
    /// Device-visible address of the first LLI slot.
    #[serde(default = "SdmaSettings::default_lli_base")]
    pub lli_base: u64,
}

impl SdmaSettings {
    pub const DEFAULT_NAME: &'static str = "sdma";
    pub const DEFAULT_CHANNELS: usize = 8;
    pub const DEFAULT_REQUESTS: usize = 32;
    pub const DEFAULT_LLI_POOL_CAPACITY: usize = 256;
    pub const DEFAULT_LLI_ALIGN: usize = 4;
    pub const DEFAULT_LLI_BASE: u64 = 0x4000_0000;

    /// Returns settings for `channels` channels and `requests` requests, with
    /// the default LLI pool.
    #[must_use]
    pub fn with_pools(channels: usize, requests: usize) -> Self {
        Self {
            channels,
            requests,
            ..Self::default()
        }
    }

    fn default_name() -> DeviceName {
        DeviceName::new(Self::DEFAULT_NAME)
    }

    const fn default_channels() -> usize {
        Self::DEFAULT_CHANNELS
    }

    const fn default_requests() -> usize {
        Self::DEFAULT_REQUESTS
    }

    const fn default_lli_pool_capacity() -> usize {
        Self::DEFAULT_LLI_POOL_CAPACITY
    }

    const fn default_lli_align() -> usize {
        Self::DEFAULT_LLI_ALIGN
    }

    const fn default_lli_base() -> u64 {
        Self::DEFAULT_LLI_BASE
    }
}

#[cfg(feature = "use-std")]
impl SdmaSettings {
    /// Parses settings from a TOML document. Missing fields take their
    /// defaults.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

impl Default for SdmaSettings {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            channels: Self::DEFAULT_CHANNELS,
            requests: Self::DEFAULT_REQUESTS,
            lli_pool_capacity: Self::DEFAULT_LLI_POOL_CAPACITY,
            lli_align: Self::DEFAULT_LLI_ALIGN,
            lli_base: Self::DEFAULT_LLI_BASE,
        }
    }
}

/// The name of a DMA device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceName(String);

impl DeviceName {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(String::from(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
