#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(all(test, loom))]
mod inner {
    pub(crate) use loom::*;
}

#[cfg(not(all(test, loom)))]
mod inner {
    #![allow(dead_code)]

    pub(crate) mod sync {
        pub(crate) use alloc::sync::Arc;

        pub(crate) mod atomic {
            pub(crate) use portable_atomic::{AtomicU64, Ordering};
        }
    }

    #[cfg(test)]
    pub(crate) mod thread {
        pub(crate) use std::thread::{spawn, yield_now, JoinHandle};
    }

    /// Runs `f` once, on the current thread.
    #[cfg(test)]
    pub(crate) fn model(f: impl Fn() + Sync + Send + 'static) {
        f()
    }
}
