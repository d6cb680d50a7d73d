//! The arbitration core.
//!
//! A [`Scheduler`] tracks which physical channels are free, which requests
//! are waiting for one, and which request owns which channel. It lives behind
//! the arbitration lock in [`Sdma`](crate::Sdma), and every method here
//! assumes that lock is held. Nothing in this module calls into the driver.
use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::fmt;

use crate::{errors::AllocError, lli::Descriptor, vchan::DescQueue, ChannelId, RequestId};

pub(crate) struct Scheduler<L> {
    /// Channels that are idle and may be elected, in election order.
    avail: VecDeque<ChannelId>,
    /// Requests with issued work waiting for a channel, in election order.
    pending: VecDeque<RequestId>,
    /// Indexed by request.
    in_pending: Box<[bool]>,
    /// Indexed by request.
    assigned: Box<[Option<ChannelId>]>,
    /// Indexed by channel.
    channels: Box<[ChannelState<L>]>,
}

/// What a physical channel is doing.
pub(crate) enum ChannelState<L> {
    /// Idle, and on the available list.
    Available,
    /// Elected for `request`, which has not started anything on it yet.
    ///
    /// A channel is claimed when it is elected while the request's lock
    /// cannot be taken (the completion path, which already holds another
    /// request's lock). Whoever claimed it must then either start the
    /// request's next descriptor or hand the channel on.
    Claimed { request: RequestId },
    /// Running `desc` on behalf of `request`.
    Running {
        request: RequestId,
        desc: Arc<Descriptor<L>>,
    },
}

/// A channel freed by [`Scheduler::hand_off`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum HandOff {
    /// No eligible request was pending, and the channel went idle.
    Idle,
    /// The channel was claimed for this request.
    Claimed(RequestId),
}

// === impl Scheduler ===

impl<L> Scheduler<L> {
    pub(crate) fn new(channels: usize, requests: usize) -> Result<Self, AllocError> {
        let mut avail = VecDeque::new();
        avail
            .try_reserve_exact(channels)
            .map_err(|_| AllocError::OutOfMemory)?;
        avail.extend((0..channels).map(ChannelId::new));

        let mut pending = VecDeque::new();
        pending
            .try_reserve_exact(requests)
            .map_err(|_| AllocError::OutOfMemory)?;

        Ok(Self {
            avail,
            pending,
            in_pending: boxed_slice(requests, || false)?,
            assigned: boxed_slice(requests, || None)?,
            channels: boxed_slice(channels, || ChannelState::Available)?,
        })
    }

    /// Elects an available channel for `request`.
    ///
    /// The available list is scanned in order, and the first channel that
    /// `admit` accepts is removed from it and returned. Returns `None` if no
    /// available channel is admitted; that is the normal outcome when every
    /// channel is busy.
    pub(crate) fn elect_channel_for_request(
        &mut self,
        request: RequestId,
        mut admit: impl FnMut(ChannelId, RequestId) -> bool,
    ) -> Option<ChannelId> {
        let idx = self.avail.iter().position(|&ch| admit(ch, request))?;
        self.avail.remove(idx)
    }

    /// Elects a pending request for `channel`.
    ///
    /// The dual of [`elect_channel_for_request`](Self::elect_channel_for_request):
    /// the first pending request that `admit` accepts is removed from the
    /// pending list and returned.
    pub(crate) fn elect_request_for_channel(
        &mut self,
        channel: ChannelId,
        mut admit: impl FnMut(ChannelId, RequestId) -> bool,
    ) -> Option<RequestId> {
        let idx = self.pending.iter().position(|&req| admit(channel, req))?;
        let request = self.pending.remove(idx)?;
        self.in_pending[request.index()] = false;
        Some(request)
    }

    /// Adds `request` to the back of the pending list, unless it is already
    /// there. Returns `true` if it was added.
    pub(crate) fn enqueue_pending(&mut self, request: RequestId) -> bool {
        debug_assert!(
            self.assigned[request.index()].is_none(),
            "{request} owns a channel and cannot be pending"
        );
        let queued = &mut self.in_pending[request.index()];
        if *queued {
            return false;
        }
        *queued = true;
        self.pending.push_back(request);
        true
    }

    /// Removes `request` from the pending list. Returns `true` if it was
    /// there.
    pub(crate) fn remove_pending(&mut self, request: RequestId) -> bool {
        let queued = &mut self.in_pending[request.index()];
        if !*queued {
            return false;
        }
        *queued = false;
        self.pending.retain(|&req| req != request);
        true
    }

    pub(crate) fn is_pending(&self, request: RequestId) -> bool {
        self.in_pending[request.index()]
    }

    /// The channel `request` owns, claimed or running.
    pub(crate) fn assigned(&self, request: RequestId) -> Option<ChannelId> {
        self.assigned[request.index()]
    }

    pub(crate) fn state(&self, channel: ChannelId) -> &ChannelState<L> {
        &self.channels[channel.index()]
    }

    /// Binds an elected `channel` to `request` without starting anything.
    pub(crate) fn claim(&mut self, channel: ChannelId, request: RequestId) {
        debug_assert!(
            matches!(self.channels[channel.index()], ChannelState::Available),
            "{channel} claimed while busy"
        );
        debug_assert!(!self.in_pending[request.index()], "{request} claimed while pending");
        self.assigned[request.index()] = Some(channel);
        self.channels[channel.index()] = ChannelState::Claimed { request };
    }

    /// Makes `desc` the current descriptor of `channel`, which must be bound
    /// to `request`.
    ///
    /// Returns the descriptor that was current before, if any.
    pub(crate) fn run(
        &mut self,
        channel: ChannelId,
        request: RequestId,
        desc: Arc<Descriptor<L>>,
    ) -> Option<Arc<Descriptor<L>>> {
        debug_assert_eq!(self.assigned[request.index()], Some(channel));
        let prev = core::mem::replace(
            &mut self.channels[channel.index()],
            ChannelState::Running { request, desc },
        );
        match prev {
            ChannelState::Running { desc, .. } => Some(desc),
            _ => None,
        }
    }

    /// Elects a channel for `request` and runs the next ready descriptor from
    /// its `queue` on it.
    ///
    /// Returns `None`, leaving everything untouched, if the queue has nothing
    /// ready or no channel is admitted.
    pub(crate) fn dispatch(
        &mut self,
        request: RequestId,
        queue: &mut DescQueue<Arc<Descriptor<L>>>,
        admit: impl FnMut(ChannelId, RequestId) -> bool,
    ) -> Option<(ChannelId, Arc<Descriptor<L>>)> {
        if !queue.has_ready() {
            return None;
        }
        let channel = self.elect_channel_for_request(request, admit)?;
        let desc = queue.next_ready_descriptor()?;
        self.claim(channel, request);
        self.run(channel, request, desc.clone());
        Some((channel, desc))
    }

    /// Detaches `channel` from its request, if it has one.
    ///
    /// The channel is *not* returned to the available list; follow up with
    /// [`hand_off`](Self::hand_off). Returns the request and the descriptor
    /// that was running, if any.
    pub(crate) fn unbind(
        &mut self,
        channel: ChannelId,
    ) -> Option<(RequestId, Option<Arc<Descriptor<L>>>)> {
        let state = core::mem::replace(
            &mut self.channels[channel.index()],
            ChannelState::Available,
        );
        let (request, desc) = match state {
            ChannelState::Available => return None,
            ChannelState::Claimed { request } => (request, None),
            ChannelState::Running { request, desc } => (request, Some(desc)),
        };
        debug_assert_eq!(self.assigned[request.index()], Some(channel));
        self.assigned[request.index()] = None;
        Some((request, desc))
    }

    /// Finds new work for an unbound `channel`.
    ///
    /// If a pending request is admitted, the channel is claimed for it.
    /// Otherwise, the channel goes back on the available list.
    pub(crate) fn hand_off(
        &mut self,
        channel: ChannelId,
        admit: impl FnMut(ChannelId, RequestId) -> bool,
    ) -> HandOff {
        debug_assert!(
            matches!(self.channels[channel.index()], ChannelState::Available),
            "{channel} handed off while bound"
        );
        match self.elect_request_for_channel(channel, admit) {
            Some(request) => {
                self.claim(channel, request);
                HandOff::Claimed(request)
            }
            None => {
                self.avail.push_back(channel);
                HandOff::Idle
            }
        }
    }

    pub(crate) fn pending(&self) -> Vec<RequestId> {
        self.pending.iter().copied().collect()
    }

    pub(crate) fn available(&self) -> Vec<ChannelId> {
        self.avail.iter().copied().collect()
    }

    /// Checks the structural invariants relating the lists and the
    /// assignment table.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (idx, state) in self.channels.iter().enumerate() {
            let channel = ChannelId::new(idx);
            let listed = self.avail.iter().filter(|&&ch| ch == channel).count();
            match state {
                ChannelState::Available => {
                    assert_eq!(listed, 1, "idle {channel} must be available exactly once")
                }
                ChannelState::Claimed { request } | ChannelState::Running { request, .. } => {
                    assert_eq!(listed, 0, "bound {channel} must not be available");
                    assert_eq!(self.assigned[request.index()], Some(channel));
                }
            }
        }

        for (idx, assigned) in self.assigned.iter().enumerate() {
            let request = RequestId::new(idx);
            let listed = self.pending.iter().filter(|&&req| req == request).count();
            assert_eq!(listed, usize::from(self.in_pending[idx]));
            if let Some(channel) = assigned {
                assert!(listed == 0, "{request} is pending while owning {channel}");
                assert!(!matches!(
                    self.channels[channel.index()],
                    ChannelState::Available
                ));
            }
        }
    }
}

impl<L> fmt::Debug for Scheduler<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("avail", &self.avail)
            .field("pending", &self.pending)
            .field("assigned", &self.assigned)
            .finish()
    }
}

fn boxed_slice<T>(len: usize, mut f: impl FnMut() -> T) -> Result<Box<[T]>, AllocError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| AllocError::OutOfMemory)?;
    v.extend((0..len).map(|_| f()));
    Ok(v.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockLli;

    type Sched = Scheduler<MockLli>;

    fn any(_: ChannelId, _: RequestId) -> bool {
        true
    }

    fn ch(i: usize) -> ChannelId {
        ChannelId::new(i)
    }

    fn req(i: usize) -> RequestId {
        RequestId::new(i)
    }

    /// Unbinds a channel that was only claimed, returning its request.
    fn unbound(sched: &mut Sched, channel: ChannelId) -> Option<RequestId> {
        let (request, desc) = sched.unbind(channel)?;
        assert!(desc.is_none());
        Some(request)
    }

    #[test]
    fn channels_start_available_in_order() {
        let sched = Sched::new(3, 4).unwrap();
        assert_eq!(sched.available(), [ch(0), ch(1), ch(2)]);
        assert!(sched.pending().is_empty());
        sched.assert_consistent();
    }

    #[test]
    fn unconstrained_election_is_fifo() {
        let mut sched = Sched::new(2, 2).unwrap();
        assert_eq!(sched.elect_channel_for_request(req(0), any), Some(ch(0)));
        assert_eq!(sched.elect_channel_for_request(req(1), any), Some(ch(1)));
        assert_eq!(sched.elect_channel_for_request(req(1), any), None);
    }

    #[test]
    fn channel_election_respects_predicate() {
        let mut sched = Sched::new(3, 2).unwrap();
        let only_chan2 = |c: ChannelId, _| c == ch(2);
        assert_eq!(
            sched.elect_channel_for_request(req(0), only_chan2),
            Some(ch(2))
        );
        // the rejected channels stay available, in order.
        assert_eq!(sched.available(), [ch(0), ch(1)]);
        assert_eq!(sched.elect_channel_for_request(req(0), only_chan2), None);
    }

    #[test]
    fn request_election_respects_predicate() {
        let mut sched = Sched::new(2, 3).unwrap();
        sched.enqueue_pending(req(0));
        sched.enqueue_pending(req(1));
        sched.enqueue_pending(req(2));

        let odd = |_, r: RequestId| r.index() % 2 == 1;
        assert_eq!(sched.elect_request_for_channel(ch(0), odd), Some(req(1)));
        assert_eq!(sched.elect_request_for_channel(ch(0), odd), None);
        assert_eq!(sched.pending(), [req(0), req(2)]);
        assert!(!sched.is_pending(req(1)));
        sched.assert_consistent();
    }

    #[test]
    fn pending_never_duplicates() {
        let mut sched = Sched::new(1, 2).unwrap();
        assert!(sched.enqueue_pending(req(1)));
        assert!(!sched.enqueue_pending(req(1)));
        assert_eq!(sched.pending(), [req(1)]);
        assert!(sched.remove_pending(req(1)));
        assert!(!sched.remove_pending(req(1)));
        assert!(sched.pending().is_empty());
    }

    #[test]
    fn hand_off_claims_or_idles() {
        let mut sched = Sched::new(1, 2).unwrap();
        let channel = sched.elect_channel_for_request(req(0), any).unwrap();
        sched.claim(channel, req(0));
        sched.enqueue_pending(req(1));
        sched.assert_consistent();

        assert_eq!(unbound(&mut sched, channel), Some(req(0)));
        assert_eq!(sched.hand_off(channel, any), HandOff::Claimed(req(1)));
        assert_eq!(sched.assigned(req(1)), Some(channel));
        assert_eq!(sched.assigned(req(0)), None);
        sched.assert_consistent();

        assert_eq!(unbound(&mut sched, channel), Some(req(1)));
        assert_eq!(sched.hand_off(channel, any), HandOff::Idle);
        assert_eq!(sched.available(), [channel]);
        sched.assert_consistent();
    }

    #[test]
    fn unbind_idle_channel_is_noop() {
        let mut sched = Sched::new(1, 1).unwrap();
        assert_eq!(unbound(&mut sched, ch(0)), None);
    }
}
