#![cfg_attr(loom, allow(dead_code, unused_imports))]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::{
    driver::{Capabilities, Driver, LliParams},
    errors::DriverError,
    lli::Descriptor,
    vchan::Cookie,
    ChannelId, DmaAddr, RequestId, Sdma, SdmaSettings,
};

/// A driver that records every call the scheduler makes into it.
#[derive(Clone)]
pub(crate) struct MockDriver {
    inner: Arc<Inner>,
}

struct Inner {
    caps: Capabilities,
    pairing: Option<fn(ChannelId, RequestId) -> bool>,
    events: Mutex<Vec<Event>>,
    inits: AtomicUsize,
    fail_after: AtomicUsize,
    fail_terminate: AtomicBool,
    residue: AtomicUsize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Event {
    Init {
        src: DmaAddr,
        dst: DmaAddr,
        len: usize,
    },
    Start {
        channel: ChannelId,
        request: RequestId,
        cookie: Cookie,
    },
    Pause(ChannelId),
    Resume(ChannelId),
    Terminate(ChannelId),
}

#[derive(Debug, Default)]
pub(crate) struct MockLli {
    pub(crate) len: usize,
    pub(crate) next: Option<DmaAddr>,
}

#[cfg(not(loom))]
pub(crate) fn trace_init() {
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        prelude::*,
    };
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse("sdma=debug").unwrap()
    } else {
        builder.parse_lossy(env)
    };

    let _res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .without_time()
        .finish()
        .try_init();
}

/// Allocates a pool of `channels` channels and `requests` requests around
/// `driver`.
#[cfg(not(loom))]
pub(crate) fn sdma(channels: usize, requests: usize, driver: &MockDriver) -> Sdma<MockDriver> {
    trace_init();
    Sdma::new(SdmaSettings::with_pools(channels, requests), driver.clone()).unwrap()
}

// === impl MockDriver ===

impl MockDriver {
    pub(crate) fn with_capabilities(caps: Capabilities) -> Self {
        Self::build(caps, None)
    }

    /// Only lets requests run on channels `admit` accepts.
    pub(crate) fn with_pairing(admit: fn(ChannelId, RequestId) -> bool) -> Self {
        Self::build(
            Self::all_caps().with(Capabilities::PAIRING, true),
            Some(admit),
        )
    }

    fn all_caps() -> Capabilities {
        Capabilities::new()
            .with(Capabilities::MEMCPY, true)
            .with(Capabilities::SLAVE, true)
            .with(Capabilities::PAUSE, true)
            .with(Capabilities::RESUME, true)
            .with(Capabilities::TERMINATE, true)
    }

    fn build(caps: Capabilities, pairing: Option<fn(ChannelId, RequestId) -> bool>) -> Self {
        Self {
            inner: Arc::new(Inner {
                caps,
                pairing,
                events: Mutex::new(Vec::new()),
                inits: AtomicUsize::new(0),
                fail_after: AtomicUsize::new(usize::MAX),
                fail_terminate: AtomicBool::new(false),
                residue: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes `lli_init` fail once `n` more LLIs have been initialized.
    pub(crate) fn fail_lli_init_after(&self, n: usize) {
        let inits = self.inner.inits.load(Ordering::SeqCst);
        self.inner.fail_after.store(inits + n, Ordering::SeqCst);
    }

    /// Makes every `channel_terminate` fail, leaving the channel running.
    pub(crate) fn fail_terminate(&self) {
        self.inner.fail_terminate.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_residue(&self, residue: usize) {
        self.inner.residue.store(residue, Ordering::SeqCst);
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.inner.events.lock().unwrap().clone()
    }

    pub(crate) fn clear_events(&self) {
        self.inner.events.lock().unwrap().clear();
    }

    /// Every `channel_start`, in order.
    pub(crate) fn started(&self) -> Vec<(ChannelId, RequestId, Cookie)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Start {
                    channel,
                    request,
                    cookie,
                } => Some((channel, request, cookie)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        tracing::trace!(?event, "mock driver");
        self.inner.events.lock().unwrap().push(event);
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::build(Self::all_caps(), None)
    }
}

impl Driver for MockDriver {
    type Lli = MockLli;

    fn capabilities(&self) -> Capabilities {
        self.inner.caps
    }

    fn lli_init(&self, lli: &mut MockLli, params: &LliParams<'_>) -> Result<(), DriverError> {
        let n = self.inner.inits.fetch_add(1, Ordering::SeqCst);
        if n >= self.inner.fail_after.load(Ordering::SeqCst) {
            return Err(DriverError::Hardware);
        }
        lli.len = params.len;
        self.record(Event::Init {
            src: params.src,
            dst: params.dst,
            len: params.len,
        });
        Ok(())
    }

    fn lli_link(&self, prev: &mut MockLli, next: DmaAddr) {
        prev.next = Some(next);
    }

    fn lli_next(&self, lli: &MockLli) -> Option<DmaAddr> {
        lli.next
    }

    fn lli_size(&self, lli: &MockLli) -> usize {
        lli.len
    }

    fn validate_pairing(&self, channel: ChannelId, request: RequestId) -> bool {
        self.inner
            .pairing
            .map_or(true, |admit| admit(channel, request))
    }

    fn channel_start(&self, channel: ChannelId, desc: &Descriptor<MockLli>) {
        self.record(Event::Start {
            channel,
            request: desc.request(),
            cookie: desc.cookie(),
        });
    }

    fn channel_pause(&self, channel: ChannelId) -> Result<(), DriverError> {
        self.record(Event::Pause(channel));
        Ok(())
    }

    fn channel_resume(&self, channel: ChannelId) -> Result<(), DriverError> {
        self.record(Event::Resume(channel));
        Ok(())
    }

    fn channel_terminate(&self, channel: ChannelId) -> Result<(), DriverError> {
        self.record(Event::Terminate(channel));
        if self.inner.fail_terminate.load(Ordering::SeqCst) {
            return Err(DriverError::Hardware);
        }
        Ok(())
    }

    fn channel_residue(&self, _: ChannelId) -> usize {
        self.inner.residue.load(Ordering::SeqCst)
    }
}
