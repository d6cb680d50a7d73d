//! A registry of DMA devices, and the channels clients acquire from them.
//!
//! Drivers register each [`Sdma`](crate::Sdma) pool with a [`Registry`] as a
//! [`DmaDevice`]. Clients then acquire a [`DmaChan`] (one request on one
//! device) either by capability, or by naming a specific request, and release
//! it when they are done. Releasing the last handle to a request frees its
//! resources.
use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use maitake_sync::spin::Mutex;
use mycelium_bitfield::bitfield;

use crate::{
    driver::{Capabilities, Direction, SgEntry, SlaveConfig},
    errors::{ControlError, PrepError, RegistryError},
    vchan::{Cookie, TxState},
    DmaAddr, RequestId,
};

/// Identifies a device registered with a [`Registry`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeviceId(u32);

bitfield! {
    /// The entry points a [`DmaDevice`] publishes.
    #[derive(Eq, PartialEq)]
    pub struct DeviceOps<u16> {
        pub const CONFIG: bool;
        pub const STATUS: bool;
        pub const ISSUE_PENDING: bool;
        pub const FREE_RESOURCES: bool;
        pub const PAUSE: bool;
        pub const RESUME: bool;
        pub const TERMINATE: bool;
        pub const PREP_MEMCPY: bool;
        pub const PREP_SLAVE_SG: bool;
    }
}

/// A DMA device, as seen by the [`Registry`] and its clients.
///
/// Operations not listed in [`ops`](DmaDevice::ops) return an `Unsupported`
/// error when called.
pub trait DmaDevice: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn ops(&self) -> DeviceOps;

    /// The number of requests this device provides.
    fn requests(&self) -> usize;

    fn config(&self, request: RequestId, config: SlaveConfig);

    fn prep_memcpy(
        &self,
        request: RequestId,
        dst: DmaAddr,
        src: DmaAddr,
        len: usize,
    ) -> Result<Cookie, PrepError>;

    fn prep_slave_sg(
        &self,
        request: RequestId,
        sgl: &[SgEntry],
        direction: Direction,
    ) -> Result<Cookie, PrepError>;

    fn issue_pending(&self, request: RequestId);

    fn tx_status(&self, request: RequestId, cookie: Cookie) -> TxState;

    fn pause(&self, request: RequestId) -> Result<(), ControlError>;

    fn resume(&self, request: RequestId) -> Result<(), ControlError>;

    fn terminate(&self, request: RequestId) -> Result<(), ControlError>;

    fn free_resources(&self, request: RequestId);
}

/// What a slave channel can do, as reported by [`Registry::slave_caps`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlaveCaps {
    pub mem_to_dev: bool,
    pub dev_to_mem: bool,
    pub pause: bool,
    pub resume: bool,
    pub terminate: bool,
}

/// A client's handle to one request of a registered device.
///
/// Hand it back with [`Registry::release_channel`] when done.
#[must_use = "acquired channels must be released with `Registry::release_channel`"]
pub struct DmaChan {
    device_id: DeviceId,
    device: Arc<dyn DmaDevice>,
    request: RequestId,
}

/// The set of registered DMA devices.
pub struct Registry {
    inner: Mutex<Inner>,
}

struct Inner {
    devices: Vec<Entry>,
    next_id: u32,
}

struct Entry {
    id: DeviceId,
    device: Arc<dyn DmaDevice>,
    /// Client count per request.
    clients: Vec<u32>,
}

// === impl DeviceId ===

impl DeviceId {
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dma{}", self.0)
    }
}

// === impl Registry ===

impl Registry {
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Registers `device`, returning the ID it was assigned.
    ///
    /// Fails if the operations the device publishes do not back its
    /// capabilities.
    #[tracing::instrument(level = "debug", skip(self, device), fields(name = device.name()))]
    pub fn register_device(&self, device: Arc<dyn DmaDevice>) -> Result<DeviceId, RegistryError> {
        validate(&*device)?;

        let mut inner = self.inner.lock();
        let id = DeviceId(inner.next_id);
        inner.next_id += 1;
        let clients = alloc::vec![0; device.requests()];
        inner.devices.push(Entry {
            id,
            device,
            clients,
        });
        tracing::debug!(%id, "registered DMA device");
        Ok(id)
    }

    /// Removes a device from the registry, handing it back.
    ///
    /// Channels already acquired from the device keep working, but can no
    /// longer be released through the registry.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn unregister_device(&self, id: DeviceId) -> Result<Arc<dyn DmaDevice>, RegistryError> {
        let mut inner = self.inner.lock();
        let idx = inner
            .devices
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(RegistryError::NotRegistered(id))?;
        let entry = inner.devices.remove(idx);

        let in_use = entry.clients.iter().filter(|&&n| n > 0).count();
        if in_use > 0 {
            tracing::warn!(%id, in_use, "unregistering DMA device with channels still in use");
        }
        Ok(entry.device)
    }

    /// Acquires the first unused request, on the first device providing
    /// every capability in `caps`, that `filter` accepts.
    #[tracing::instrument(level = "debug", skip(self, filter))]
    pub fn acquire_channel(
        &self,
        caps: Capabilities,
        mut filter: impl FnMut(&dyn DmaDevice, RequestId) -> bool,
    ) -> Option<DmaChan> {
        let mut inner = self.inner.lock();
        for entry in inner.devices.iter_mut() {
            if !entry.device.capabilities().contains(caps) {
                continue;
            }
            for (idx, clients) in entry.clients.iter_mut().enumerate() {
                let request = RequestId::new(idx);
                if *clients == 0 && filter(&*entry.device, request) {
                    *clients = 1;
                    tracing::debug!(id = %entry.id, %request, "acquired DMA channel");
                    return Some(DmaChan {
                        device_id: entry.id,
                        device: entry.device.clone(),
                        request,
                    });
                }
            }
        }
        tracing::debug!("no matching DMA channel");
        None
    }

    /// Acquires a specific request of a specific device, whether or not it
    /// already has clients.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn acquire_specific(
        &self,
        id: DeviceId,
        request: RequestId,
    ) -> Result<DmaChan, RegistryError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .devices
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(RegistryError::NotRegistered(id))?;
        let clients = entry
            .clients
            .get_mut(request.index())
            .ok_or(RegistryError::NoSuchRequest(request))?;
        *clients += 1;
        Ok(DmaChan {
            device_id: id,
            device: entry.device.clone(),
            request,
        })
    }

    /// Releases a channel. When the request's last client releases it, its
    /// queued work is dropped and its channel freed.
    #[tracing::instrument(level = "debug", skip(self, chan), fields(id = %chan.device_id, request = %chan.request))]
    pub fn release_channel(&self, chan: DmaChan) {
        let last = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.devices.iter_mut().find(|e| e.id == chan.device_id) else {
                tracing::warn!("releasing a channel of an unregistered device");
                return;
            };
            let clients = &mut entry.clients[chan.request.index()];
            if *clients == 0 {
                tracing::warn!("releasing a DMA channel that has no clients");
            }
            *clients = clients.saturating_sub(1);
            *clients == 0
        };

        if last {
            chan.device.free_resources(chan.request);
        }
    }

    /// Issues pending work on every acquired request of every device.
    pub fn issue_pending_all(&self) {
        let acquired: Vec<_> = {
            let inner = self.inner.lock();
            inner
                .devices
                .iter()
                .flat_map(|entry| {
                    entry
                        .clients
                        .iter()
                        .enumerate()
                        .filter(|(_, &n)| n > 0)
                        .map(|(idx, _)| (entry.device.clone(), RequestId::new(idx)))
                })
                .collect()
        };
        for (device, request) in acquired {
            device.issue_pending(request);
        }
    }

    /// Reports what `chan` can do as a slave channel, or `None` if its
    /// device does not do slave transfers.
    #[must_use]
    pub fn slave_caps(&self, chan: &DmaChan) -> Option<SlaveCaps> {
        let caps = chan.device.capabilities();
        if !caps.get(Capabilities::SLAVE) {
            return None;
        }
        let ops = chan.device.ops();
        Some(SlaveCaps {
            mem_to_dev: true,
            dev_to_mem: true,
            pause: ops.get(DeviceOps::PAUSE),
            resume: ops.get(DeviceOps::RESUME),
            terminate: ops.get(DeviceOps::TERMINATE),
        })
    }

    /// Returns the number of clients of `request` on device `id`.
    #[must_use]
    pub fn clients(&self, id: DeviceId, request: RequestId) -> Option<u32> {
        let inner = self.inner.lock();
        let entry = inner.devices.iter().find(|entry| entry.id == id)?;
        entry.clients.get(request.index()).copied()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_list()
            .entries(inner.devices.iter().map(|e| (e.id, e.device.name())))
            .finish()
    }
}

impl Inner {
    const fn new() -> Self {
        Self {
            devices: Vec::new(),
            next_id: 0,
        }
    }
}

fn validate(device: &dyn DmaDevice) -> Result<(), RegistryError> {
    let caps = device.capabilities();
    let ops = device.ops();

    if device.requests() == 0 {
        return Err(RegistryError::InvalidDevice("device has no requests"));
    }
    if caps.get(Capabilities::MEMCPY) && !ops.get(DeviceOps::PREP_MEMCPY) {
        return Err(RegistryError::InvalidDevice(
            "memcpy capability without a memcpy prep operation",
        ));
    }
    if caps.get(Capabilities::SLAVE) && !ops.get(DeviceOps::PREP_SLAVE_SG) {
        return Err(RegistryError::InvalidDevice(
            "slave capability without a slave prep operation",
        ));
    }
    if !ops.get(DeviceOps::STATUS) {
        return Err(RegistryError::InvalidDevice("missing status operation"));
    }
    if !ops.get(DeviceOps::ISSUE_PENDING) {
        return Err(RegistryError::InvalidDevice("missing issue_pending operation"));
    }
    Ok(())
}

// === impl DmaChan ===

impl DmaChan {
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    #[must_use]
    pub fn request(&self) -> RequestId {
        self.request
    }

    #[must_use]
    pub fn device(&self) -> &dyn DmaDevice {
        &*self.device
    }

    pub fn config(&self, config: SlaveConfig) {
        self.device.config(self.request, config)
    }

    pub fn prep_memcpy(&self, dst: DmaAddr, src: DmaAddr, len: usize) -> Result<Cookie, PrepError> {
        self.device.prep_memcpy(self.request, dst, src, len)
    }

    pub fn prep_slave_sg(&self, sgl: &[SgEntry], direction: Direction) -> Result<Cookie, PrepError> {
        self.device.prep_slave_sg(self.request, sgl, direction)
    }

    pub fn issue_pending(&self) {
        self.device.issue_pending(self.request)
    }

    #[must_use]
    pub fn tx_status(&self, cookie: Cookie) -> TxState {
        self.device.tx_status(self.request, cookie)
    }

    pub fn pause(&self) -> Result<(), ControlError> {
        self.device.pause(self.request)
    }

    pub fn resume(&self) -> Result<(), ControlError> {
        self.device.resume(self.request)
    }

    pub fn terminate(&self) -> Result<(), ControlError> {
        self.device.terminate(self.request)
    }
}

impl fmt::Debug for DmaChan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaChan")
            .field("device_id", &self.device_id)
            .field("device", &self.device.name())
            .field("request", &self.request)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::{
        test_util::{trace_init, MockDriver},
        vchan::TxStatus,
        Sdma, SdmaSettings,
    };

    impl core::fmt::Debug for dyn DmaDevice {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("DmaDevice").field("name", &self.name()).finish()
        }
    }

    fn device(channels: usize, requests: usize, driver: MockDriver) -> Arc<Sdma<MockDriver>> {
        Arc::new(Sdma::new(SdmaSettings::with_pools(channels, requests), driver).unwrap())
    }

    #[test]
    fn ops_are_valid() {
        DeviceOps::assert_valid();
    }

    #[test]
    fn ids_are_monotonic() {
        trace_init();
        let registry = Registry::new();
        let a = registry
            .register_device(device(1, 1, MockDriver::default()))
            .unwrap();
        let b = registry
            .register_device(device(1, 1, MockDriver::default()))
            .unwrap();
        assert_eq!(a.get(), 0);
        assert_eq!(b.get(), 1);

        registry.unregister_device(a).unwrap();
        let c = registry
            .register_device(device(1, 1, MockDriver::default()))
            .unwrap();
        assert_eq!(c.get(), 2);
        assert_eq!(
            registry.unregister_device(a).unwrap_err(),
            RegistryError::NotRegistered(a)
        );
    }

    #[test]
    fn acquire_by_capability_and_filter() {
        trace_init();
        let registry = Registry::new();
        let memcpy_only = MockDriver::with_capabilities(Capabilities::new().with(Capabilities::MEMCPY, true));
        let memcpy_id = registry.register_device(device(1, 2, memcpy_only)).unwrap();
        let slave_id = registry
            .register_device(device(1, 3, MockDriver::default()))
            .unwrap();

        let slave = Capabilities::new().with(Capabilities::SLAVE, true);
        let chan = registry
            .acquire_channel(slave, |_, req| req.index() == 2)
            .unwrap();
        assert_eq!(chan.device_id(), slave_id);
        assert_eq!(chan.request().index(), 2);

        // request 2 is taken now.
        assert!(registry
            .acquire_channel(slave, |_, req| req.index() == 2)
            .is_none());

        let memcpy = Capabilities::new().with(Capabilities::MEMCPY, true);
        let chan2 = registry.acquire_channel(memcpy, |_, _| true).unwrap();
        assert_eq!(chan2.device_id(), memcpy_id);
        assert_eq!(chan2.request().index(), 0);

        registry.release_channel(chan);
        registry.release_channel(chan2);
        assert_eq!(registry.clients(slave_id, RequestId::new(2)), Some(0));
    }

    #[test]
    fn release_frees_resources_on_last_client() {
        trace_init();
        let registry = Registry::new();
        let sdma = device(1, 2, MockDriver::default());
        let id = registry.register_device(sdma.clone()).unwrap();

        let a = registry.acquire_specific(id, RequestId::new(0)).unwrap();
        let b = registry.acquire_specific(id, RequestId::new(0)).unwrap();
        assert_eq!(registry.clients(id, RequestId::new(0)), Some(2));

        let cookie = a
            .prep_memcpy(DmaAddr(0x1000), DmaAddr(0x2000), 64)
            .unwrap();
        registry.release_channel(a);
        // b still holds the request, so the queued work survives.
        assert_eq!(b.tx_status(cookie).status, TxStatus::InProgress);

        registry.release_channel(b);
        assert_eq!(registry.clients(id, RequestId::new(0)), Some(0));
        assert_eq!(sdma.tx_status(RequestId::new(0), cookie).status, TxStatus::Complete);
    }

    #[test]
    fn acquire_specific_rejects_unknown() {
        let registry = Registry::new();
        let id = registry
            .register_device(device(1, 2, MockDriver::default()))
            .unwrap();
        assert_eq!(
            registry
                .acquire_specific(id, RequestId::new(5))
                .unwrap_err(),
            RegistryError::NoSuchRequest(RequestId::new(5))
        );
        assert_eq!(
            registry
                .acquire_specific(DeviceId(9), RequestId::new(0))
                .unwrap_err(),
            RegistryError::NotRegistered(DeviceId(9))
        );
    }

    #[test]
    fn issue_pending_all_starts_acquired() {
        trace_init();
        let registry = Registry::new();
        let driver = MockDriver::default();
        let sdma = device(2, 2, driver.clone());
        let id = registry.register_device(sdma).unwrap();

        let chan = registry.acquire_specific(id, RequestId::new(1)).unwrap();
        chan.prep_memcpy(DmaAddr(0x1000), DmaAddr(0x2000), 64)
            .unwrap();
        assert!(driver.started().is_empty());

        registry.issue_pending_all();
        assert_eq!(driver.started().len(), 1);
        registry.release_channel(chan);
    }

    #[test]
    fn slave_caps_follow_ops() {
        let registry = Registry::new();
        let full = registry
            .register_device(device(1, 1, MockDriver::default()))
            .unwrap();
        let chan = registry.acquire_specific(full, RequestId::new(0)).unwrap();
        let caps = registry.slave_caps(&chan).unwrap();
        assert!(caps.pause && caps.resume && caps.terminate);
        registry.release_channel(chan);

        let memcpy_only = MockDriver::with_capabilities(Capabilities::new().with(Capabilities::MEMCPY, true));
        let memcpy = registry.register_device(device(1, 1, memcpy_only)).unwrap();
        let chan = registry.acquire_specific(memcpy, RequestId::new(0)).unwrap();
        assert_eq!(registry.slave_caps(&chan), None);
        registry.release_channel(chan);
    }

    struct Broken;

    impl DmaDevice for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::new().with(Capabilities::SLAVE, true)
        }
        fn ops(&self) -> DeviceOps {
            DeviceOps::new()
                .with(DeviceOps::STATUS, true)
                .with(DeviceOps::ISSUE_PENDING, true)
        }
        fn requests(&self) -> usize {
            1
        }
        fn config(&self, _: RequestId, _: SlaveConfig) {}
        fn prep_memcpy(&self, _: RequestId, _: DmaAddr, _: DmaAddr, _: usize) -> Result<Cookie, PrepError> {
            unimplemented!()
        }
        fn prep_slave_sg(&self, _: RequestId, _: &[SgEntry], _: Direction) -> Result<Cookie, PrepError> {
            unimplemented!()
        }
        fn issue_pending(&self, _: RequestId) {}
        fn tx_status(&self, _: RequestId, _: Cookie) -> TxState {
            unimplemented!()
        }
        fn pause(&self, _: RequestId) -> Result<(), ControlError> {
            unimplemented!()
        }
        fn resume(&self, _: RequestId) -> Result<(), ControlError> {
            unimplemented!()
        }
        fn terminate(&self, _: RequestId) -> Result<(), ControlError> {
            unimplemented!()
        }
        fn free_resources(&self, _: RequestId) {}
    }

    #[test]
    fn rejects_inconsistent_device() {
        let registry = Registry::new();
        assert!(matches!(
            registry.register_device(Arc::new(Broken)),
            Err(RegistryError::InvalidDevice(_))
        ));
    }
}
