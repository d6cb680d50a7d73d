//! Hardware link-list items (LLIs) and the descriptors built from them.
//!
//! LLIs are the in-memory structures a DMA controller reads to learn what to
//! transfer. Each one needs a device-visible address, so they are carved out
//! of a fixed [`LliPool`] of equally sized slots allocated along with the
//! rest of the scheduler. A [`Descriptor`] owns the chain of LLIs making up
//! one transfer, and returns its slots to the pool when it is dropped.
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{fmt, mem};

use crate::{
    loom::sync::atomic::{AtomicU64, Ordering::*},
    driver::{Direction, Driver, LliParams, TransferType},
    errors::{AllocError, PrepError},
    vchan::Cookie,
    DmaAddr, RequestId,
};

/// A fixed pool of LLI slots.
///
/// Slots are handed out by a lock-free bitmap, so allocation is safe from any
/// context, including interrupt handlers.
pub struct LliPool {
    bitmap: Box<[AtomicU64]>,
    capacity: usize,
    base: DmaAddr,
    stride: u64,
}

/// One allocated LLI slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LliSlot {
    index: usize,
    addr: DmaAddr,
}

/// One hardware LLI, living in a pool slot.
pub struct Lli<L> {
    slot: LliSlot,
    hw: L,
}

/// A prepared transfer: a chain of hardware LLIs plus the bookkeeping needed
/// to schedule it.
///
/// Descriptors are created by [`Sdma::prep_memcpy`](crate::Sdma::prep_memcpy)
/// and [`Sdma::prep_slave_sg`](crate::Sdma::prep_slave_sg), and handed to
/// [`Driver::channel_start`] when they are dispatched. Dropping a descriptor
/// releases its LLI slots back to the pool.
pub struct Descriptor<L> {
    cookie: Cookie,
    request: RequestId,
    kind: TransferType,
    direction: Direction,
    /// Never empty.
    llis: Vec<Lli<L>>,
    pool: Arc<LliPool>,
}

/// Builds an LLI chain, releasing every slot it allocated if it is dropped
/// before [`ChainBuilder::finish`].
pub(crate) struct ChainBuilder<L> {
    llis: Vec<Lli<L>>,
    pool: Arc<LliPool>,
}

const WORD_BITS: usize = u64::BITS as usize;

// === impl LliPool ===

impl LliPool {
    /// Allocates a pool of `capacity` slots, each large enough for
    /// `elem_size` bytes aligned to `align`, with slot 0 at device address
    /// `base`.
    pub fn new(
        capacity: usize,
        base: DmaAddr,
        elem_size: usize,
        align: usize,
    ) -> Result<Self, AllocError> {
        if capacity == 0 {
            return Err(AllocError::NoLliPool);
        }
        if !align.is_power_of_two() {
            return Err(AllocError::BadAlignment(align));
        }

        // a zero-sized LLI still needs its own address.
        let stride = core::cmp::max(elem_size, 1)
            .checked_add(align - 1)
            .map(|size| size & !(align - 1))
            .ok_or(AllocError::AddressOverflow)? as u64;
        // every slot address must be representable, so `addr_of` can't
        // overflow.
        (capacity as u64 - 1)
            .checked_mul(stride)
            .and_then(|last| base.checked_offset(last))
            .and_then(|last| last.checked_offset(stride - 1))
            .ok_or(AllocError::AddressOverflow)?;

        let words = (capacity + WORD_BITS - 1) / WORD_BITS;
        let mut bitmap = Vec::new();
        bitmap
            .try_reserve_exact(words)
            .map_err(|_| AllocError::OutOfMemory)?;
        for word in 0..words {
            // bits past the end of the pool are permanently allocated.
            let valid = core::cmp::min(capacity - word * WORD_BITS, WORD_BITS);
            let reserved = if valid == WORD_BITS {
                0
            } else {
                !0u64 << valid
            };
            bitmap.push(AtomicU64::new(reserved));
        }

        Ok(Self {
            bitmap: bitmap.into_boxed_slice(),
            capacity,
            base,
            stride,
        })
    }

    /// Allocates a slot, or returns `None` if the pool is exhausted.
    #[must_use]
    pub fn allocate(&self) -> Option<LliSlot> {
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            let mut bits = word.load(Acquire);
            while let Some(bit) = find_zero(bits) {
                match word.compare_exchange_weak(bits, bits | (1 << bit), AcqRel, Acquire) {
                    Ok(_) => {
                        let index = word_idx * WORD_BITS + bit;
                        return Some(LliSlot {
                            index,
                            addr: self.addr_of(index),
                        });
                    }
                    Err(actual) => bits = actual,
                }
            }
        }
        None
    }

    /// Returns a slot to the pool.
    pub fn free(&self, slot: LliSlot) {
        debug_assert!(slot.index < self.capacity, "{slot:?} is not from this pool");
        let word = &self.bitmap[slot.index / WORD_BITS];
        let prev = word.fetch_and(!(1 << (slot.index % WORD_BITS)), Release);
        debug_assert!(
            prev & (1 << (slot.index % WORD_BITS)) != 0,
            "double free of {slot:?}"
        );
    }

    /// The total number of slots in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of slots currently allocated.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        let total: usize = self
            .bitmap
            .iter()
            .map(|word| word.load(Acquire).count_ones() as usize)
            .sum();
        // minus the permanently reserved tail bits
        total - (self.bitmap.len() * WORD_BITS - self.capacity)
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.capacity - self.allocated_count()
    }

    fn addr_of(&self, index: usize) -> DmaAddr {
        self.base.offset(index as u64 * self.stride)
    }
}

impl fmt::Debug for LliPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LliPool")
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated_count())
            .field("base", &self.base)
            .field("stride", &self.stride)
            .finish()
    }
}

fn find_zero(bits: u64) -> Option<usize> {
    let trailing_ones = bits.trailing_ones() as usize;
    if trailing_ones == WORD_BITS {
        None
    } else {
        Some(trailing_ones)
    }
}

// === impl LliSlot ===

impl LliSlot {
    #[must_use]
    pub fn addr(&self) -> DmaAddr {
        self.addr
    }
}

// === impl Lli ===

impl<L> Lli<L> {
    /// The device-visible address of this LLI.
    #[must_use]
    pub fn addr(&self) -> DmaAddr {
        self.slot.addr
    }

    /// The driver's hardware representation.
    #[must_use]
    pub fn hw(&self) -> &L {
        &self.hw
    }
}

// === impl Descriptor ===

impl<L> Descriptor<L> {
    #[must_use]
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// The request this transfer was prepared on.
    #[must_use]
    pub fn request(&self) -> RequestId {
        self.request
    }

    #[must_use]
    pub fn kind(&self) -> TransferType {
        self.kind
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The device-visible address of the first LLI, which is what gets
    /// written to the channel's descriptor address register.
    #[must_use]
    pub fn lli_addr(&self) -> DmaAddr {
        self.llis[0].addr()
    }

    /// The first LLI of the chain.
    #[must_use]
    pub fn first(&self) -> &L {
        &self.llis[0].hw
    }

    /// Looks up an LLI of this chain by device address.
    #[must_use]
    pub fn lli_at(&self, addr: DmaAddr) -> Option<&L> {
        self.llis.iter().find(|lli| lli.addr() == addr).map(Lli::hw)
    }

    /// Iterates over the chain, in transfer order.
    pub fn llis(&self) -> impl Iterator<Item = &Lli<L>> + '_ {
        self.llis.iter()
    }

    /// Returns the total number of bytes this descriptor transfers, by
    /// following the hardware links from the first LLI.
    pub fn size<D>(&self, driver: &D) -> usize
    where
        D: Driver<Lli = L>,
    {
        let mut bytes = 0;
        let mut lli = self.first();
        // a corrupt chain could loop; it can never be longer than what we built.
        for _ in 0..self.llis.len() {
            bytes += driver.lli_size(lli);
            if !driver.lli_has_next(lli) {
                break;
            }
            let next = driver.lli_next(lli).and_then(|addr| self.lli_at(addr));
            match next {
                Some(next) => lli = next,
                None => {
                    tracing::warn!(cookie = %self.cookie, "LLI links outside of its descriptor");
                    break;
                }
            }
        }
        bytes
    }
}

impl<L> Drop for Descriptor<L> {
    fn drop(&mut self) {
        for lli in self.llis.drain(..) {
            self.pool.free(lli.slot);
        }
    }
}

impl<L> fmt::Debug for Descriptor<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("cookie", &self.cookie)
            .field("request", &self.request)
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .field("lli_addr", &self.lli_addr())
            .field("llis", &self.llis.len())
            .finish()
    }
}

// === impl ChainBuilder ===

impl<L: Default> ChainBuilder<L> {
    pub(crate) fn new(pool: &Arc<LliPool>, len: usize) -> Result<Self, PrepError> {
        let mut llis = Vec::new();
        llis.try_reserve_exact(len)
            .map_err(|_| PrepError::PoolExhausted)?;
        Ok(Self {
            llis,
            pool: pool.clone(),
        })
    }

    /// Allocates an LLI, has the driver initialize it, and appends it to the
    /// chain.
    pub(crate) fn push<D>(&mut self, driver: &D, params: &LliParams<'_>) -> Result<(), PrepError>
    where
        D: Driver<Lli = L>,
    {
        let slot = self.pool.allocate().ok_or(PrepError::PoolExhausted)?;
        let mut hw = L::default();
        if let Err(error) = driver.lli_init(&mut hw, params) {
            self.pool.free(slot);
            return Err(error.into());
        }

        if let Some(tail) = self.llis.last_mut() {
            driver.lli_link(&mut tail.hw, slot.addr);
        }
        self.llis.push(Lli { slot, hw });
        Ok(())
    }

    pub(crate) fn finish(
        mut self,
        cookie: Cookie,
        request: RequestId,
        kind: TransferType,
        direction: Direction,
    ) -> Descriptor<L> {
        debug_assert!(!self.llis.is_empty(), "finished an empty LLI chain");
        Descriptor {
            cookie,
            request,
            kind,
            direction,
            llis: mem::take(&mut self.llis),
            pool: self.pool.clone(),
        }
    }
}

impl<L> Drop for ChainBuilder<L> {
    fn drop(&mut self) {
        for lli in self.llis.drain(..) {
            self.pool.free(lli.slot);
        }
    }
}


#[cfg(test)]
mod loom_tests {
    use super::*;
    use crate::loom::{self, sync::Arc};

    #[test]
    fn concurrent_allocations_are_unique() {
        loom::model(|| {
            let pool = Arc::new(LliPool::new(2, DmaAddr(0x1000), 16, 4).unwrap());
            let t1 = loom::thread::spawn({
                let pool = pool.clone();
                move || pool.allocate().expect("one slot per thread")
            });

            let mine = pool.allocate().expect("one slot per thread");
            let theirs = t1.join().unwrap();
            assert_ne!(mine, theirs);
            assert!(pool.allocate().is_none());

            pool.free(mine);
            pool.free(theirs);
            assert_eq!(pool.free_count(), 2);
        })
    }

    #[test]
    fn free_races_allocate() {
        loom::model(|| {
            let pool = Arc::new(LliPool::new(1, DmaAddr(0x1000), 16, 4).unwrap());
            let slot = pool.allocate().unwrap();
            let t1 = loom::thread::spawn({
                let pool = pool.clone();
                move || pool.allocate()
            });

            pool.free(slot);
            let theirs = t1.join().unwrap();
            // either the other thread saw the freed slot, or it is still free.
            match theirs {
                Some(theirs) => {
                    assert_eq!(theirs, slot);
                    assert_eq!(pool.free_count(), 0);
                }
                None => assert_eq!(pool.free_count(), 1),
            }
        })
    }
}
