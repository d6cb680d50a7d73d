//! Per-request descriptor queues and completion cookies.
//!
//! Every request owns one [`DescQueue`]. Prepared transfers are placed on the
//! queue's *submitted* list and assigned a [`Cookie`]. Issuing moves them to
//! the *issued* list, from which the scheduler pulls them, in order, when the
//! request gets a channel. Completion is tracked by recording the cookie of
//! the last completed transfer: since cookies are handed out in order, that
//! is enough to answer "is cookie N done?" for every transfer on the queue.
use alloc::collections::VecDeque;
use core::fmt;

/// Identifies one transfer queued on a request.
///
/// Cookies are handed out in increasing order per request. A fresh or
/// flushed queue sits at [`Cookie::MIN`], so the first cookie handed out is
/// the one after it. After `i32::MAX`, cookies wrap back around to `MIN`.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Cookie(i32);

/// The completion status of a transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxStatus {
    /// The transfer has finished, or was flushed by a terminate.
    Complete,
    /// The transfer is queued or running.
    InProgress,
    /// The transfer is queued or running on a paused request.
    Paused,
    /// The request is not part of the pool that was asked.
    Error,
}

/// The status of a transfer, as reported by
/// [`Sdma::tx_status`](crate::Sdma::tx_status).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TxState {
    pub status: TxStatus,
    /// The last completed cookie on the request.
    pub last: Cookie,
    /// The last cookie handed out on the request.
    pub used: Cookie,
    /// Bytes left to transfer. Zero for completed transfers.
    pub residue: usize,
}

/// A FIFO of transfer descriptors with cookie bookkeeping.
pub struct DescQueue<T> {
    /// The last cookie handed out.
    used: Cookie,
    /// The last cookie completed.
    completed: Cookie,
    submitted: VecDeque<Queued<T>>,
    issued: VecDeque<Queued<T>>,
}

struct Queued<T> {
    cookie: Cookie,
    desc: T,
}

// === impl Cookie ===

impl Cookie {
    /// The smallest valid cookie.
    pub const MIN: Self = Self(1);

    #[must_use]
    pub const fn get(self) -> i32 {
        self.0
    }

    #[must_use]
    fn next(self) -> Self {
        match self.0.checked_add(1) {
            Some(next) => Self(next),
            None => Self::MIN,
        }
    }

    /// Returns `true` if `self` is done, given the last completed and the
    /// last used cookie. Handles the used cookie having wrapped around while
    /// the completed one has not.
    fn is_complete(self, completed: Cookie, used: Cookie) -> bool {
        if completed.0 <= used.0 {
            self.0 <= completed.0 || self.0 > used.0
        } else {
            self.0 <= completed.0 && self.0 > used.0
        }
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({})", self.0)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// === impl DescQueue ===

impl<T> DescQueue<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            used: Cookie::MIN,
            completed: Cookie::MIN,
            submitted: VecDeque::new(),
            issued: VecDeque::new(),
        }
    }

    /// Assigns the next cookie and places the descriptor built by `build` on
    /// the submitted list.
    ///
    /// The descriptor does not become ready until the next
    /// [`issue_pending`](Self::issue_pending).
    pub fn enqueue_descriptor(&mut self, build: impl FnOnce(Cookie) -> T) -> Cookie {
        let cookie = self.used.next();
        self.used = cookie;
        self.submitted.push_back(Queued {
            cookie,
            desc: build(cookie),
        });
        cookie
    }

    /// Moves every submitted descriptor to the issued list.
    ///
    /// Returns `true` if there is at least one issued descriptor waiting to
    /// run.
    pub fn issue_pending(&mut self) -> bool {
        self.issued.append(&mut self.submitted);
        !self.issued.is_empty()
    }

    /// Returns `true` if an issued descriptor is waiting to run.
    #[must_use]
    pub fn has_ready(&self) -> bool {
        !self.issued.is_empty()
    }

    /// Takes the oldest issued descriptor off the queue.
    pub fn next_ready_descriptor(&mut self) -> Option<T> {
        self.issued.pop_front().map(|q| q.desc)
    }

    /// Records that the transfer identified by `cookie` finished.
    pub fn mark_complete(&mut self, cookie: Cookie) {
        debug_assert!(
            cookie.0 >= Cookie::MIN.0,
            "completed cookie {cookie:?} was never handed out"
        );
        self.completed = cookie;
    }

    /// Finds a descriptor that is still queued (submitted or issued, but not
    /// yet started).
    #[must_use]
    pub fn find_descriptor_by_cookie(&self, cookie: Cookie) -> Option<&T> {
        self.issued
            .iter()
            .chain(self.submitted.iter())
            .find(|q| q.cookie == cookie)
            .map(|q| &q.desc)
    }

    /// Returns the completion state of `cookie`, with a residue of zero.
    #[must_use]
    pub fn status(&self, cookie: Cookie) -> TxState {
        let status = if cookie.is_complete(self.completed, self.used) {
            TxStatus::Complete
        } else {
            TxStatus::InProgress
        };
        TxState {
            status,
            last: self.completed,
            used: self.used,
            residue: 0,
        }
    }

    /// Drops every queued descriptor and resets the cookie space.
    ///
    /// Returns the number of descriptors dropped.
    pub fn flush(&mut self) -> usize {
        let flushed = self.len();
        self.submitted.clear();
        self.issued.clear();
        self.used = Cookie::MIN;
        self.completed = Cookie::MIN;
        flushed
    }

    /// Returns the number of queued descriptors, submitted and issued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.submitted.len() + self.issued.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.submitted.is_empty() && self.issued.is_empty()
    }
}

impl<T> Default for DescQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for DescQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescQueue")
            .field("used", &self.used)
            .field("completed", &self.completed)
            .field("submitted", &self.submitted.len())
            .field("issued", &self.issued.len())
            .finish()
    }
}
