use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{fmt, mem};

use maitake_sync::{spin::Mutex, WaitQueue};

use crate::{
    driver::{Capabilities, Direction, Driver, LliParams, SgEntry, SlaveConfig, TransferType},
    errors::{AllocError, ControlError, Operation, PrepError},
    lli::{ChainBuilder, Descriptor, LliPool},
    registry::{DeviceOps, DmaDevice},
    sched::{ChannelState, HandOff, Scheduler},
    settings::SdmaSettings,
    vchan::{Cookie, DescQueue, TxState, TxStatus},
    ChannelId, DmaAddr, RequestId,
};

/// A scheduled DMA pool: `D`'s physical channels, shared by a fixed set of
/// logical requests.
///
/// See the [crate-level documentation](crate) for an overview.
pub struct Sdma<D: Driver> {
    driver: D,
    settings: SdmaSettings,
    caps: Capabilities,
    pool: Arc<LliPool>,
    requests: Box<[Request<D::Lli>]>,
    /// The arbitration lock.
    sched: Mutex<Scheduler<D::Lli>>,
}

struct Request<L> {
    state: Mutex<RequestState<L>>,
    /// Woken whenever a transfer on this request completes or is flushed.
    done: WaitQueue,
}

struct RequestState<L> {
    config: SlaveConfig,
    queue: DescQueue<Arc<Descriptor<L>>>,
    paused: bool,
    /// The transfer running on this request's channel was abandoned by a
    /// reset that did not stop it, and its completion must not be accounted.
    orphaned: bool,
}

type Desc<D> = Arc<Descriptor<<D as Driver>::Lli>>;

// === impl Sdma ===

impl<D: Driver> Sdma<D> {
    /// Allocates a scheduled DMA pool for `driver`, sized by `settings`.
    ///
    /// Every channel starts out available, and every request starts out
    /// idle, with an empty queue.
    pub fn new(settings: SdmaSettings, driver: D) -> Result<Self, AllocError> {
        if settings.channels == 0 {
            return Err(AllocError::NoChannels);
        }
        if settings.requests == 0 {
            return Err(AllocError::NoRequests);
        }
        for n in [settings.channels, settings.requests] {
            if n > u16::MAX as usize {
                return Err(AllocError::TooLarge(n));
            }
        }

        let pool = LliPool::new(
            settings.lli_pool_capacity,
            DmaAddr(settings.lli_base),
            mem::size_of::<D::Lli>(),
            settings.lli_align,
        )?;

        let mut requests = Vec::new();
        requests
            .try_reserve_exact(settings.requests)
            .map_err(|_| AllocError::OutOfMemory)?;
        requests.extend((0..settings.requests).map(|_| Request::new()));

        let sched = Scheduler::new(settings.channels, settings.requests)?;
        let caps = driver.capabilities();

        tracing::info!(
            name = %settings.name,
            channels = settings.channels,
            requests = settings.requests,
            lli_slots = settings.lli_pool_capacity,
            ?caps,
            "allocated scheduled DMA pool"
        );

        Ok(Self {
            driver,
            settings,
            caps,
            pool: Arc::new(pool),
            requests: requests.into_boxed_slice(),
            sched: Mutex::new(sched),
        })
    }

    /// Returns the entry points this pool publishes to a
    /// [`Registry`](crate::Registry).
    ///
    /// The control and prep operations only appear when the driver
    /// advertises the matching capability.
    #[must_use]
    pub fn ops(&self) -> DeviceOps {
        let caps = self.caps;
        DeviceOps::new()
            .with(DeviceOps::CONFIG, true)
            .with(DeviceOps::STATUS, true)
            .with(DeviceOps::ISSUE_PENDING, true)
            .with(DeviceOps::FREE_RESOURCES, true)
            .with(DeviceOps::PAUSE, caps.get(Capabilities::PAUSE))
            .with(DeviceOps::RESUME, caps.get(Capabilities::RESUME))
            .with(DeviceOps::TERMINATE, caps.get(Capabilities::TERMINATE))
            .with(DeviceOps::PREP_MEMCPY, caps.get(Capabilities::MEMCPY))
            .with(DeviceOps::PREP_SLAVE_SG, caps.get(Capabilities::SLAVE))
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    #[must_use]
    pub fn settings(&self) -> &SdmaSettings {
        &self.settings
    }

    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    #[must_use]
    pub fn lli_pool(&self) -> &LliPool {
        &self.pool
    }

    /// Returns the ID of channel `index`, if this pool has that many
    /// channels.
    #[must_use]
    pub fn channel(&self, index: usize) -> Option<ChannelId> {
        (index < self.settings.channels).then(|| ChannelId::new(index))
    }

    /// Returns the ID of request `index`, if this pool has that many
    /// requests.
    #[must_use]
    pub fn request(&self, index: usize) -> Option<RequestId> {
        (index < self.requests.len()).then(|| RequestId::new(index))
    }

    /// Replaces the slave configuration of `request`.
    ///
    /// Transfers prepared afterwards use the new configuration; transfers
    /// already prepared keep the one they were built with.
    #[tracing::instrument(level = "debug", skip(self, config), fields(name = %self.settings.name))]
    pub fn config(&self, request: RequestId, config: SlaveConfig) {
        if let Some(req) = self.lookup(request) {
            req.state.lock().config = config;
        }
    }

    /// Prepares a memory-to-memory copy of `len` bytes on `request`.
    ///
    /// The transfer is queued, but does not run until the next
    /// [`issue_pending`](Self::issue_pending).
    #[tracing::instrument(level = "debug", skip(self), fields(name = %self.settings.name))]
    pub fn prep_memcpy(
        &self,
        request: RequestId,
        dst: DmaAddr,
        src: DmaAddr,
        len: usize,
    ) -> Result<Cookie, PrepError> {
        let req = self
            .lookup(request)
            .ok_or(PrepError::NoSuchRequest(request))?;
        if !self.caps.supports(TransferType::Memcpy) {
            return Err(PrepError::Unsupported(TransferType::Memcpy));
        }
        if len == 0 {
            return Err(PrepError::ZeroLength);
        }

        let mut chain = ChainBuilder::new(&self.pool, 1)?;
        chain.push(
            &self.driver,
            &LliParams {
                request,
                kind: TransferType::Memcpy,
                direction: Direction::MemToMem,
                src,
                dst,
                len,
                config: None,
            },
        )?;

        let cookie = req.state.lock().queue.enqueue_descriptor(|cookie| {
            Arc::new(chain.finish(
                cookie,
                request,
                TransferType::Memcpy,
                Direction::MemToMem,
            ))
        });
        tracing::debug!(%cookie, "prepared memcpy");
        Ok(cookie)
    }

    /// Prepares a scatter-gather transfer between memory and the peripheral
    /// configured on `request`, one LLI per entry of `sgl`.
    ///
    /// For [`Direction::DevToMem`], every segment reads from the configured
    /// [`src_addr`](SlaveConfig::src_addr); for [`Direction::MemToDev`],
    /// every segment writes to the configured
    /// [`dst_addr`](SlaveConfig::dst_addr).
    #[tracing::instrument(
        level = "debug",
        skip(self, sgl),
        fields(name = %self.settings.name, segments = sgl.len())
    )]
    pub fn prep_slave_sg(
        &self,
        request: RequestId,
        sgl: &[SgEntry],
        direction: Direction,
    ) -> Result<Cookie, PrepError> {
        let req = self
            .lookup(request)
            .ok_or(PrepError::NoSuchRequest(request))?;
        if !self.caps.supports(TransferType::Slave) {
            return Err(PrepError::Unsupported(TransferType::Slave));
        }
        if !direction.is_slave() {
            return Err(PrepError::InvalidDirection(direction));
        }
        if sgl.is_empty() {
            return Err(PrepError::EmptyScatterList);
        }
        if sgl.iter().any(|entry| entry.len == 0) {
            return Err(PrepError::ZeroLength);
        }

        // held across the build, so a concurrent `config` can't change the
        // peripheral mid-chain.
        let mut state = req.state.lock();
        let mut chain = ChainBuilder::new(&self.pool, sgl.len())?;
        for entry in sgl {
            let (src, dst) = match direction {
                Direction::DevToMem => (state.config.src_addr, entry.addr),
                _ => (entry.addr, state.config.dst_addr),
            };
            chain.push(
                &self.driver,
                &LliParams {
                    request,
                    kind: TransferType::Slave,
                    direction,
                    src,
                    dst,
                    len: entry.len,
                    config: Some(&state.config),
                },
            )?;
        }

        let cookie = state.queue.enqueue_descriptor(|cookie| {
            Arc::new(chain.finish(cookie, request, TransferType::Slave, direction))
        });
        tracing::debug!(%cookie, "prepared slave transfer");
        Ok(cookie)
    }

    /// Makes every transfer prepared on `request` so far eligible to run.
    ///
    /// If the request already owns a channel, the new work runs after what
    /// is already running there. Otherwise, a channel is elected for the
    /// request and its first transfer is started; if no channel is free, the
    /// request is added to the pending list.
    #[tracing::instrument(level = "debug", skip(self), fields(name = %self.settings.name))]
    pub fn issue_pending(&self, request: RequestId) {
        let Some(req) = self.lookup(request) else {
            return;
        };
        let mut state = req.state.lock();
        if !state.queue.issue_pending() {
            tracing::trace!("nothing to issue");
            return;
        }
        if state.paused {
            tracing::debug!("request is paused");
            return;
        }

        let (channel, desc) = {
            let mut sched = self.sched.lock();
            if let Some(channel) = sched.assigned(request) {
                tracing::trace!(%channel, "request already owns a channel");
                return;
            }
            if sched.is_pending(request) {
                tracing::trace!("request already pending");
                return;
            }
            match sched.dispatch(request, &mut state.queue, self.admit()) {
                Some(started) => started,
                None => {
                    sched.enqueue_pending(request);
                    tracing::debug!("no channel available, request is pending");
                    return;
                }
            }
        };

        tracing::debug!(%channel, cookie = %desc.cookie(), "starting transfer");
        self.driver.channel_start(channel, &desc);
    }

    /// Reports that the transfer running on `channel` has completed.
    ///
    /// This is meant to be called from the driver's interrupt handler. The
    /// finished transfer is retired, and new work is elected for the
    /// channel: the next transfer of the same request if it has one,
    /// otherwise the first eligible pending request. The returned
    /// descriptor, if any, is now current on `channel`, and the caller must
    /// start it with [`Driver::channel_start`]. If `None` is returned, the
    /// channel is idle.
    pub fn report_transfer(&self, channel: ChannelId) -> Option<Desc<D>> {
        if !self.has_channel(channel) {
            return None;
        }
        let owner = match self.sched.lock().state(channel) {
            ChannelState::Running { request, .. } => *request,
            _ => {
                tracing::warn!(%channel, "spurious completion on idle channel");
                return None;
            }
        };

        let req = self.req(owner);
        let handoff = {
            let mut state = req.state.lock();
            let mut sched = self.sched.lock();
            let done = match sched.state(channel) {
                ChannelState::Running { request, desc } if *request == owner => desc.cookie(),
                _ => {
                    tracing::warn!(%channel, request = %owner, "stale completion");
                    return None;
                }
            };

            if mem::take(&mut state.orphaned) {
                tracing::trace!(%channel, request = %owner, cookie = %done, "abandoned transfer complete");
            } else {
                state.queue.mark_complete(done);
                tracing::trace!(%channel, request = %owner, cookie = %done, "transfer complete");
            }

            let next = if state.paused {
                None
            } else {
                state.queue.next_ready_descriptor()
            };
            match next {
                Some(next) => {
                    // the owner still has work, so it keeps the channel.
                    sched.run(channel, owner, next.clone());
                    drop(sched);
                    drop(state);
                    req.done.wake_all();
                    tracing::trace!(%channel, request = %owner, cookie = %next.cookie(), "next transfer");
                    return Some(next);
                }
                None => {
                    sched.unbind(channel);
                    sched.hand_off(channel, self.admit())
                }
            }
        };
        req.done.wake_all();

        match handoff {
            HandOff::Idle => {
                tracing::trace!(%channel, "channel idle");
                None
            }
            HandOff::Claimed(request) => self.take_claimed(channel, request),
        }
    }

    /// Pauses `request`.
    ///
    /// If the request's transfer is running, the channel is paused in
    /// hardware and stays assigned. Otherwise, the request leaves the pending
    /// list, and nothing it queues is dispatched until it is resumed.
    #[tracing::instrument(level = "debug", skip(self), fields(name = %self.settings.name))]
    pub fn pause(&self, request: RequestId) -> Result<(), ControlError> {
        if !self.caps.get(Capabilities::PAUSE) {
            return Err(ControlError::Unsupported(Operation::Pause));
        }

        let req = self
            .lookup(request)
            .ok_or(ControlError::NoSuchRequest(request))?;
        let mut state = req.state.lock();
        let running = {
            let mut sched = self.sched.lock();
            if sched.remove_pending(request) {
                tracing::debug!("removed from pending list");
            }
            self.running_channel(&sched, request)
        };
        if let Some(channel) = running {
            self.driver.channel_pause(channel)?;
            tracing::debug!(%channel, "paused channel");
        }
        state.paused = true;
        Ok(())
    }

    /// Resumes a request paused by [`pause`](Self::pause).
    ///
    /// A running transfer is resumed in hardware. Otherwise, if the request
    /// has issued work, it goes through admission again: it is started on a
    /// free channel, or added to the pending list.
    #[tracing::instrument(level = "debug", skip(self), fields(name = %self.settings.name))]
    pub fn resume(&self, request: RequestId) -> Result<(), ControlError> {
        if !self.caps.get(Capabilities::RESUME) {
            return Err(ControlError::Unsupported(Operation::Resume));
        }

        let req = self
            .lookup(request)
            .ok_or(ControlError::NoSuchRequest(request))?;
        let mut state = req.state.lock();
        if !state.paused {
            tracing::trace!("request is not paused");
            return Ok(());
        }

        let mut running = None;
        let mut start = None;
        {
            let mut sched = self.sched.lock();
            match sched.assigned(request) {
                Some(_) => running = self.running_channel(&sched, request),
                None => {
                    start = sched.dispatch(request, &mut state.queue, self.admit());
                    if start.is_none() && state.queue.has_ready() {
                        sched.enqueue_pending(request);
                        tracing::debug!("no channel available, request is pending");
                    }
                }
            }
        }

        if let Some(channel) = running {
            self.driver.channel_resume(channel)?;
            tracing::debug!(%channel, "resumed channel");
        }
        state.paused = false;

        if let Some((channel, desc)) = start {
            tracing::debug!(%channel, cookie = %desc.cookie(), "starting transfer");
            self.driver.channel_start(channel, &desc);
        }
        Ok(())
    }

    /// Aborts everything on `request`.
    ///
    /// A running transfer is stopped in hardware, and its channel is handed
    /// to the next eligible pending request. Every queued transfer is
    /// dropped, the cookie space is reset, and the request leaves the
    /// pending list. Waiters are woken.
    #[tracing::instrument(level = "debug", skip(self), fields(name = %self.settings.name))]
    pub fn terminate(&self, request: RequestId) -> Result<(), ControlError> {
        if !self.caps.get(Capabilities::TERMINATE) {
            return Err(ControlError::Unsupported(Operation::Terminate));
        }
        if self.lookup(request).is_none() {
            return Err(ControlError::NoSuchRequest(request));
        }
        self.reset(request, true).map(|_| ())
    }

    /// Releases everything `request` holds, returning it to its initial
    /// state.
    ///
    /// Like [`terminate`](Self::terminate), except that it is always
    /// available: if the driver cannot terminate a running transfer, that
    /// transfer is left to finish, and retired by its completion.
    #[tracing::instrument(level = "debug", skip(self), fields(name = %self.settings.name))]
    pub fn free_resources(&self, request: RequestId) {
        if self.lookup(request).is_none() {
            return;
        }
        let terminate = self.caps.get(Capabilities::TERMINATE);
        match self.reset(request, terminate) {
            Ok(0) => {}
            Ok(dropped) => {
                tracing::warn!(dropped, "freed a request with outstanding work");
            }
            Err(error) => {
                tracing::warn!(%error, "failed to terminate transfer while freeing request, leaving it to complete");
            }
        }
    }

    /// Returns the status of transfer `cookie` on `request`.
    ///
    /// For a transfer still waiting in the queue, the residue is the size of
    /// its whole LLI chain. For the transfer currently running, it is what
    /// the driver reports for the channel.
    ///
    /// A request that is not part of this pool reports [`TxStatus::Error`].
    #[must_use]
    pub fn tx_status(&self, request: RequestId, cookie: Cookie) -> TxState {
        let Some(req) = self.lookup(request) else {
            return TxState {
                status: TxStatus::Error,
                last: Cookie::MIN,
                used: Cookie::MIN,
                residue: 0,
            };
        };
        let state = req.state.lock();
        let mut tx = state.queue.status(cookie);
        if tx.status == TxStatus::Complete {
            return tx;
        }

        if let Some(desc) = state.queue.find_descriptor_by_cookie(cookie) {
            tx.residue = desc.size(&self.driver);
        } else {
            let running = {
                let sched = self.sched.lock();
                self.running_channel(&sched, request).filter(|&channel| {
                    matches!(
                        sched.state(channel),
                        ChannelState::Running { desc, .. } if desc.cookie() == cookie
                    )
                })
            };
            if let Some(channel) = running {
                tx.residue = self.driver.channel_residue(channel);
            }
        }

        if state.paused {
            tx.status = TxStatus::Paused;
        }
        tx
    }

    /// Waits until transfer `cookie` on `request` is complete.
    ///
    /// A transfer dropped by [`terminate`](Self::terminate) or
    /// [`free_resources`](Self::free_resources) also counts as complete.
    /// Returns [`TxStatus::Error`] right away if `request` is not part of
    /// this pool.
    pub async fn wait_for(&self, request: RequestId, cookie: Cookie) -> TxStatus {
        let Some(req) = self.lookup(request) else {
            return TxStatus::Error;
        };
        let done = &req.done;
        loop {
            let wait = done.wait();
            futures::pin_mut!(wait);
            // register before checking, so a completion in between isn't
            // missed.
            let _ = wait.as_mut().subscribe();

            let status = self.tx_status(request, cookie).status;
            if status == TxStatus::Complete {
                return status;
            }

            wait.await
                .expect("request wait queues are never closed");
        }
    }

    /// Returns the requests waiting for a channel, in election order.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<RequestId> {
        self.sched.lock().pending()
    }

    /// Returns the idle channels, in election order.
    #[must_use]
    pub fn available_channels(&self) -> Vec<ChannelId> {
        self.sched.lock().available()
    }

    /// Returns the channel `request` currently owns.
    #[must_use]
    pub fn assigned_channel(&self, request: RequestId) -> Option<ChannelId> {
        self.lookup(request)?;
        self.sched.lock().assigned(request)
    }

    /// Returns the request and cookie of the transfer running on `channel`.
    #[must_use]
    pub fn running(&self, channel: ChannelId) -> Option<(RequestId, Cookie)> {
        if !self.has_channel(channel) {
            return None;
        }
        match self.sched.lock().state(channel) {
            ChannelState::Running { request, desc } => Some((*request, desc.cookie())),
            _ => None,
        }
    }

    /// Returns the number of transfers queued on `request` that have not
    /// started yet.
    #[must_use]
    pub fn queued(&self, request: RequestId) -> usize {
        self.lookup(request)
            .map_or(0, |req| req.state.lock().queue.len())
    }

    /// Checks that the scheduler's lists agree with every request's state.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (idx, req) in self.requests.iter().enumerate() {
            let request = RequestId::new(idx);
            let state = req.state.lock();
            let sched = self.sched.lock();
            let waiting = state.queue.has_ready() && !state.paused && sched.assigned(request).is_none();
            assert_eq!(
                sched.is_pending(request),
                waiting,
                "{request} must be pending iff it has ready work, no channel, and is not paused"
            );
            if let Some(channel) = sched.assigned(request) {
                assert!(
                    !matches!(sched.state(channel), ChannelState::Claimed { .. }),
                    "{channel} left claimed by {request}"
                );
            }
        }
        self.sched.lock().assert_consistent();
    }

    fn req(&self, request: RequestId) -> &Request<D::Lli> {
        &self.requests[request.index()]
    }

    /// Like `req`, for IDs coming in from outside. IDs minted by a larger
    /// pool are rejected.
    fn lookup(&self, request: RequestId) -> Option<&Request<D::Lli>> {
        let req = self.requests.get(request.index());
        if req.is_none() {
            tracing::warn!(%request, requests = self.requests.len(), "request is not from this pool");
        }
        req
    }

    fn has_channel(&self, channel: ChannelId) -> bool {
        let known = channel.index() < self.settings.channels;
        if !known {
            tracing::warn!(%channel, channels = self.settings.channels, "channel is not from this pool");
        }
        known
    }

    /// The admission predicate: which requests may run on which channels.
    fn admit(&self) -> impl Fn(ChannelId, RequestId) -> bool + '_ {
        let constrained = self.caps.get(Capabilities::PAIRING);
        move |channel, request| !constrained || self.driver.validate_pairing(channel, request)
    }

    fn running_channel(&self, sched: &Scheduler<D::Lli>, request: RequestId) -> Option<ChannelId> {
        let channel = sched.assigned(request)?;
        matches!(sched.state(channel), ChannelState::Running { .. }).then_some(channel)
    }

    /// Starts work on a channel claimed for `request`.
    ///
    /// If the request has nothing to run any more (it was paused or flushed
    /// while the channel was claimed), the channel is handed to the next
    /// eligible pending request, and so on. Returns the descriptor made
    /// current on `channel`, if any.
    fn take_claimed(&self, channel: ChannelId, mut request: RequestId) -> Option<Desc<D>> {
        loop {
            let mut state = self.req(request).state.lock();
            let mut sched = self.sched.lock();
            debug_assert!(
                matches!(sched.state(channel), ChannelState::Claimed { request: r } if *r == request),
                "{channel} is not claimed by {request}"
            );

            let next = if state.paused {
                None
            } else {
                state.queue.next_ready_descriptor()
            };
            if let Some(desc) = next {
                sched.run(channel, request, desc.clone());
                tracing::trace!(%channel, %request, cookie = %desc.cookie(), "channel handed over");
                return Some(desc);
            }

            tracing::trace!(%channel, %request, "claimed request has nothing to run");
            sched.unbind(channel);
            match sched.hand_off(channel, self.admit()) {
                HandOff::Idle => return None,
                HandOff::Claimed(next) => request = next,
            }
        }
    }

    /// Detaches `request` from the pending list and its channel, and drops
    /// its queue. Returns the number of queued transfers dropped.
    ///
    /// If terminating the running transfer fails, it is abandoned instead,
    /// and the queue is still dropped before the error is returned.
    fn reset(&self, request: RequestId, terminate_running: bool) -> Result<usize, ControlError> {
        let req = self.req(request);
        let mut handoff = None;
        let mut result = Ok(());
        let dropped = {
            let mut state = req.state.lock();
            let running = {
                let mut sched = self.sched.lock();
                if sched.remove_pending(request) {
                    tracing::debug!("removed from pending list");
                }
                self.running_channel(&sched, request)
            };

            match running {
                Some(channel) if terminate_running => match self.driver.channel_terminate(channel) {
                    Ok(()) => {
                        tracing::debug!(%channel, "terminated channel");
                        state.orphaned = false;
                        state.paused = false;
                        let mut sched = self.sched.lock();
                        sched.unbind(channel);
                        handoff = Some((channel, sched.hand_off(channel, self.admit())));
                    }
                    Err(error) => {
                        tracing::warn!(%channel, %error, "failed to terminate channel");
                        self.abandon(channel, &mut state);
                        result = Err(error.into());
                    }
                },
                Some(channel) => self.abandon(channel, &mut state),
                None => state.paused = false,
            }

            state.queue.flush()
        };
        req.done.wake_all();

        if let Some((channel, HandOff::Claimed(next))) = handoff {
            if let Some(desc) = self.take_claimed(channel, next) {
                tracing::debug!(%channel, request = %desc.request(), cookie = %desc.cookie(), "starting transfer");
                self.driver.channel_start(channel, &desc);
            }
        }
        result.map(|()| dropped)
    }

    /// Leaves the transfer running on `channel` to finish on its own. Its
    /// completion retires it without touching the request's cookies, and
    /// then frees the channel.
    ///
    /// A paused channel would never complete, so it is resumed first. If
    /// that fails, the request stays paused, and a later
    /// [`resume`](Self::resume) retries it.
    fn abandon(&self, channel: ChannelId, state: &mut RequestState<D::Lli>) {
        tracing::debug!(%channel, "leaving running transfer to complete");
        state.orphaned = true;
        if !state.paused {
            return;
        }

        if !self.caps.get(Capabilities::RESUME) {
            tracing::warn!(%channel, "driver cannot resume abandoned transfer, channel stays paused");
            state.paused = false;
            return;
        }
        match self.driver.channel_resume(channel) {
            Ok(()) => {
                tracing::debug!(%channel, "resumed abandoned transfer");
                state.paused = false;
            }
            Err(error) => {
                tracing::warn!(%channel, %error, "failed to resume abandoned transfer, request stays paused");
            }
        }
    }
}

impl<D: Driver> DmaDevice for Sdma<D> {
    fn name(&self) -> &str {
        self.settings.name.as_str()
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn ops(&self) -> DeviceOps {
        Sdma::ops(self)
    }

    fn requests(&self) -> usize {
        self.requests.len()
    }

    fn config(&self, request: RequestId, config: SlaveConfig) {
        Sdma::config(self, request, config)
    }

    fn prep_memcpy(
        &self,
        request: RequestId,
        dst: DmaAddr,
        src: DmaAddr,
        len: usize,
    ) -> Result<Cookie, PrepError> {
        Sdma::prep_memcpy(self, request, dst, src, len)
    }

    fn prep_slave_sg(
        &self,
        request: RequestId,
        sgl: &[SgEntry],
        direction: Direction,
    ) -> Result<Cookie, PrepError> {
        Sdma::prep_slave_sg(self, request, sgl, direction)
    }

    fn issue_pending(&self, request: RequestId) {
        Sdma::issue_pending(self, request)
    }

    fn tx_status(&self, request: RequestId, cookie: Cookie) -> TxState {
        Sdma::tx_status(self, request, cookie)
    }

    fn pause(&self, request: RequestId) -> Result<(), ControlError> {
        Sdma::pause(self, request)
    }

    fn resume(&self, request: RequestId) -> Result<(), ControlError> {
        Sdma::resume(self, request)
    }

    fn terminate(&self, request: RequestId) -> Result<(), ControlError> {
        Sdma::terminate(self, request)
    }

    fn free_resources(&self, request: RequestId) {
        Sdma::free_resources(self, request)
    }
}

impl<D: Driver> fmt::Debug for Sdma<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sdma")
            .field("name", &self.settings.name)
            .field("caps", &self.caps)
            .field("pool", &self.pool)
            .field("sched", &*self.sched.lock())
            .finish_non_exhaustive()
    }
}

// === impl Request ===

impl<L> Request<L> {
    fn new() -> Self {
        Self {
            state: Mutex::new(RequestState {
                config: SlaveConfig::default(),
                queue: DescQueue::new(),
                paused: false,
                orphaned: false,
            }),
            done: WaitQueue::new(),
        }
    }
}

#[cfg(test)]
mod loom_tests {
    use super::*;
    use crate::{
        loom::{self, sync::Arc},
        test_util::MockDriver,
    };

    #[test]
    fn issue_races_completion_with_pending_request() {
        loom::model(|| {
            let driver = MockDriver::default();
            let settings = SdmaSettings {
                lli_pool_capacity: 4,
                ..SdmaSettings::with_pools(1, 3)
            };
            let sdma = Arc::new(Sdma::new(settings, driver.clone()).unwrap());
            let chan = sdma.channel(0).unwrap();
            let [running, b, a] = [0, 1, 2].map(|i| sdma.request(i).unwrap());

            sdma.prep_memcpy(running, DmaAddr(0x100), DmaAddr(0x200), 8).unwrap();
            sdma.issue_pending(running);
            let b_cookie = sdma.prep_memcpy(b, DmaAddr(0x300), DmaAddr(0x400), 8).unwrap();
            sdma.issue_pending(b);
            sdma.prep_memcpy(a, DmaAddr(0x500), DmaAddr(0x600), 8).unwrap();
            assert_eq!(sdma.pending_requests(), [b]);

            let t1 = loom::thread::spawn({
                let sdma = sdma.clone();
                move || sdma.issue_pending(a)
            });

            if let Some(desc) = sdma.report_transfer(chan) {
                sdma.driver().channel_start(chan, &desc);
            }
            t1.join().unwrap();

            // b was waiting first, so it gets the channel whichever side won.
            assert_eq!(sdma.running(chan), Some((b, b_cookie)));
            assert_eq!(sdma.pending_requests(), [a]);
            assert_eq!(sdma.assigned_channel(a), None);
            sdma.assert_consistent();
        })
    }
}
