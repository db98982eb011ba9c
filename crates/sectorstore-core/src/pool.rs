//! Fixed-capacity sector pool
//!
//! All sectors are the same size, so the pool is an arena of slots with an
//! intrusive free list: a free slot's buffer stores the index of the next
//! free slot in its first four bytes. Allocation and free are O(1) and the
//! pool cannot fragment.
//!
//! ## Memory Usage
//!
//! - Constrained profile: 32 × 256 bytes = 8 KB, preallocated at init
//! - Filesystem profile: up to 1024 × 4096 bytes = 4 MB, grown lazily
//!
//! The pool raises a pressure signal the first time usage reaches the
//! configured threshold and re-arms once usage falls below it again. It never
//! evicts anything itself; the storage manager decides what to flush or drop.

extern crate alloc;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use log::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::sector::{Sector, SlotId};

const NIL: u32 = u32::MAX;

/// Counters reported by [`SectorPool::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    /// Slots that currently own a buffer (lazily grown pools only)
    pub materialized: usize,
    pub pressure_events: u32,
    pub exhausted_events: u32,
}

struct PoolInner {
    /// Parked buffers of free slots, `None` while the slot is handed out
    slots: Vec<Option<Box<[u8]>>>,
    free_head: u32,
    in_use: usize,
    pressure_latched: bool,
    pressure_pending: bool,
    pressure_events: u32,
    exhausted_events: u32,
}

impl PoolInner {
    fn push_free(&mut self, slot: SlotId, mut buf: Box<[u8]>) {
        buf[0..4].copy_from_slice(&self.free_head.to_le_bytes());
        self.slots[slot as usize] = Some(buf);
        self.free_head = slot;
    }

    fn pop_free(&mut self) -> Option<(SlotId, Box<[u8]>)> {
        if self.free_head == NIL {
            return None;
        }
        let slot = self.free_head;
        let mut buf = self.slots[slot as usize].take()?;

        let mut next = [0u8; 4];
        next.copy_from_slice(&buf[0..4]);
        self.free_head = u32::from_le_bytes(next);

        buf.fill(0);
        Some((slot, buf))
    }
}

/// Pool of equal-size sector buffers guarded by one pool-level lock
pub struct SectorPool<M: RawMutex> {
    sector_size: usize,
    capacity: usize,
    threshold_pct: u8,
    inner: Mutex<M, RefCell<PoolInner>>,
}

impl<M: RawMutex> SectorPool<M> {
    /// Creates a pool of `capacity` sectors of `sector_size` bytes
    ///
    /// Fixed pools allocate every buffer up front; growable pools create
    /// buffers on first use and keep them parked in the free list after.
    pub fn new(sector_size: usize, capacity: usize, threshold_pct: u8, growable: bool) -> Self {
        let mut inner = PoolInner {
            slots: Vec::with_capacity(capacity),
            free_head: NIL,
            in_use: 0,
            pressure_latched: false,
            pressure_pending: false,
            pressure_events: 0,
            exhausted_events: 0,
        };

        if !growable {
            inner.slots.resize_with(capacity, || None);
            // Push in reverse so slot 0 is handed out first
            for slot in (0..capacity as SlotId).rev() {
                inner.push_free(slot, vec![0u8; sector_size].into_boxed_slice());
            }
        }

        Self {
            sector_size,
            capacity,
            threshold_pct,
            inner: Mutex::new(RefCell::new(inner)),
        }
    }

    pub const fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of sectors at which the pressure signal fires
    pub fn threshold_sectors(&self) -> usize {
        (self.capacity * self.threshold_pct as usize).div_ceil(100)
    }

    /// Takes one zeroed sector out of the pool
    pub fn allocate(&self) -> StoreResult<Sector> {
        let threshold = self.threshold_sectors();
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();

            let (slot, buf) = match inner.pop_free() {
                Some(free) => free,
                None if inner.slots.len() < self.capacity => {
                    let slot = inner.slots.len() as SlotId;
                    inner.slots.push(None);
                    (slot, vec![0u8; self.sector_size].into_boxed_slice())
                }
                None => {
                    inner.exhausted_events += 1;
                    debug!("Sector pool exhausted ({} sectors)", self.capacity);
                    return Err(StoreError::PoolExhausted {
                        capacity: self.capacity,
                    });
                }
            };

            inner.in_use += 1;
            if inner.in_use >= threshold && !inner.pressure_latched {
                inner.pressure_latched = true;
                inner.pressure_pending = true;
                inner.pressure_events += 1;
                warn!(
                    "Sector pool under pressure: {}/{} sectors in use",
                    inner.in_use, self.capacity
                );
            }

            Ok(Sector::from_parts(slot, buf))
        })
    }

    /// Returns a sector to the free list
    pub fn free(&self, sector: Sector) {
        let threshold = self.threshold_sectors();
        let (slot, buf) = sector.into_parts();
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            inner.push_free(slot, buf);
            inner.in_use = inner.in_use.saturating_sub(1);
            if inner.in_use < threshold {
                inner.pressure_latched = false;
            }
        })
    }

    /// Frees every sector yielded by `sectors`
    pub fn free_all(&self, sectors: impl IntoIterator<Item = Sector>) {
        for sector in sectors {
            self.free(sector);
        }
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock(|cell| cell.borrow().in_use)
    }

    /// Fraction of the pool handed out, in `[0, 1]`
    pub fn usage(&self) -> f32 {
        self.in_use() as f32 / self.capacity as f32
    }

    /// Usage as a whole percentage
    pub fn usage_pct(&self) -> u8 {
        ((self.in_use() * 100) / self.capacity) as u8
    }

    pub fn is_over_threshold(&self) -> bool {
        self.in_use() >= self.threshold_sectors()
    }

    /// Consumes the pending pressure signal, if one was raised
    pub fn take_pressure_signal(&self) -> bool {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            core::mem::replace(&mut inner.pressure_pending, false)
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock(|cell| {
            let inner = cell.borrow();
            PoolStats {
                capacity: self.capacity,
                in_use: inner.in_use,
                materialized: inner.slots.len(),
                pressure_events: inner.pressure_events,
                exhausted_events: inner.exhausted_events,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    type TestPool = SectorPool<CriticalSectionRawMutex>;

    #[test]
    fn test_fixed_pool_exhausts() {
        let pool = TestPool::new(256, 4, 80, false);
        let sectors: Vec<Sector> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(
            pool.allocate().unwrap_err(),
            StoreError::PoolExhausted { capacity: 4 }
        );
        assert_eq!(pool.stats().exhausted_events, 1);

        pool.free_all(sectors);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn test_free_list_is_lifo() {
        let pool = TestPool::new(256, 8, 100, false);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(a.slot(), 0);
        assert_eq!(b.slot(), 1);

        let b_slot = b.slot();
        pool.free(b);
        let c = pool.allocate().unwrap();
        assert_eq!(c.slot(), b_slot);
        pool.free(a);
        pool.free(c);
    }

    #[test]
    fn test_allocated_sector_is_zeroed() {
        let pool = TestPool::new(128, 2, 100, false);
        let first = pool.allocate().unwrap();
        pool.free(first);
        let again = pool.allocate().unwrap();
        assert!(again.image().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_growable_pool_materializes_lazily() {
        let pool = TestPool::new(4096, 16, 80, true);
        assert_eq!(pool.stats().materialized, 0);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(pool.stats().materialized, 2);

        pool.free(a);
        let c = pool.allocate().unwrap();
        assert_eq!(pool.stats().materialized, 2);
        pool.free(b);
        pool.free(c);
    }

    #[test]
    fn test_pressure_signal_fires_once_per_crossing() {
        let pool = TestPool::new(256, 10, 80, false);
        let mut held = Vec::new();
        for _ in 0..7 {
            held.push(pool.allocate().unwrap());
        }
        assert!(!pool.take_pressure_signal());

        // The 8th sector reaches 80%
        held.push(pool.allocate().unwrap());
        assert!(pool.take_pressure_signal());
        assert_eq!(pool.stats().pressure_events, 1);

        held.push(pool.allocate().unwrap());
        assert!(!pool.take_pressure_signal());
        assert_eq!(pool.stats().pressure_events, 1);

        // Dropping to 8 keeps the latch, 7 re-arms it
        pool.free(held.pop().unwrap());
        held.push(pool.allocate().unwrap());
        assert_eq!(pool.stats().pressure_events, 1);

        pool.free(held.pop().unwrap());
        pool.free(held.pop().unwrap());
        assert_eq!(pool.in_use(), 7);
        held.push(pool.allocate().unwrap());
        assert!(pool.take_pressure_signal());
        assert_eq!(pool.stats().pressure_events, 2);

        pool.free_all(held);
    }

    #[test]
    fn test_usage() {
        let pool = TestPool::new(256, 4, 50, false);
        let a = pool.allocate().unwrap();
        assert_eq!(pool.usage_pct(), 25);
        assert!((pool.usage() - 0.25).abs() < f32::EPSILON);
        assert!(!pool.is_over_threshold());
        let b = pool.allocate().unwrap();
        assert!(pool.is_over_threshold());
        pool.free(a);
        pool.free(b);
    }
}
