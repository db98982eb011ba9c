//! Per-sensor store: cursors, write path and consumption path
//!
//! Every record of a sensor has a logical index that only ever grows. Three
//! cursors partition the retained records:
//!
//! ```text
//!   tail            pending               head
//!    │  in flight      │   not consumed     │
//!    ▼─────────────────▼────────────────────▼
//! ```
//!
//! - `tail`: oldest record not yet acknowledged
//! - `pending`: first record not yet handed to a consumer
//! - `head`: index the next append will get
//!
//! `tail <= pending <= head` holds after every operation. Consumption moves
//! `pending` only; acknowledgment moves `tail` up to `pending` and trims the
//! sectors left behind. `pending` is a hint: rolling it back to `tail` makes
//! the in-flight records deliverable again, so delivery is at-least-once.
//!
//! All state sits behind one lock per sensor. Methods here never take the
//! pool lock; sectors to free are handed back to the caller instead.
//!
//! Metadata writes have a second, outer lock per sensor. The snapshot is
//! taken and written while it is held, so writes land in snapshot order and
//! the persisted cursors never move backwards. The sensor lock is only taken
//! inside it, never the other way round.

extern crate alloc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::SensorId;
use crate::backend::{META_VERSION, SectorBackend, SensorKey, SensorMeta};
use crate::chain::{Location, SectorChain, Trimmed};
use crate::error::{StoreError, StoreResult};
use crate::record::{Record, RecordKind};
use crate::sector::{Sector, SectorHeader, SectorView};

/// Upper bound on the flush retry delay
const MAX_BACKOFF_TICKS: u32 = 16;

/// Consecutive flush failures before a sensor is reported degraded
const DEGRADED_AFTER_FAILURES: u8 = 3;

/// Logical cursor triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursors {
    pub tail: u64,
    pub pending: u64,
    pub head: u64,
}

impl Cursors {
    /// Records handed out but not acknowledged
    pub const fn in_flight(&self) -> u64 {
        self.pending - self.tail
    }

    /// Records never handed out
    pub const fn unconsumed(&self) -> u64 {
        self.head - self.pending
    }

    pub const fn is_ordered(&self) -> bool {
        self.tail <= self.pending && self.pending <= self.head
    }
}

/// Per-sensor counters, persisted with the metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorStats {
    pub appended: u64,
    pub consumed: u64,
    pub erased: u64,
    pub dropped_records: u64,
    pub dropped_sectors: u32,
    pub sealed_sectors: u32,
    pub flushed_sectors: u32,
    pub bytes_flushed: u64,
    pub crc_failures: u32,
    pub write_failures: u32,
    pub read_failures: u32,
    pub lease_expirations: u32,
}

/// Flush state machine of one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Active,
    /// A sector image is being written with the lock released
    Flushing,
}

/// Record handed to a consumer together with its logical index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumedRecord {
    pub index: u64,
    pub record: Record,
}

/// Contiguous run of records in write order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumedBatch {
    /// Logical index of `records[0]`
    pub first_index: u64,
    pub records: Vec<Record>,
}

impl ConsumedBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records paired with their logical indices
    pub fn indexed(&self) -> impl Iterator<Item = ConsumedRecord> + '_ {
        self.records
            .iter()
            .enumerate()
            .map(|(i, record)| ConsumedRecord {
                index: self.first_index + i as u64,
                record: *record,
            })
    }
}

pub(crate) enum AppendOutcome {
    Appended,
    NeedsSector,
}

/// Copy of a sealed sector taken for writing outside the lock
pub(crate) struct FlushJob {
    pub seq: u32,
    pub slot: u32,
    pub image: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Backoff {
    failures: u8,
    retry_at: u32,
    degraded: bool,
}

/// Last spilled sector read back from the backend, already validated
struct ReadCache {
    header: SectorHeader,
    image: Vec<u8>,
}

struct SensorState {
    chain: SectorChain,
    cursors: Cursors,
    stats: SensorStats,
    chain_state: ChainState,
    last_append_tick: u32,
    pending_since: Option<u32>,
    meta_dirty: bool,
    backoff: Backoff,
    read_cache: Option<ReadCache>,
}

impl SensorState {
    fn record_appended(&mut self, tick: u32) {
        self.cursors.head += 1;
        self.stats.appended += 1;
        self.last_append_tick = tick;
    }

    fn advance_pending(&mut self, tick: u32) {
        if self.cursors.pending == self.cursors.tail {
            self.pending_since = Some(tick);
        }
        self.cursors.pending += 1;
    }

    /// Moves `tail` (and `pending` with it) past `end`, counting the loss
    fn discard_through(&mut self, end: u64) -> u64 {
        let lost = end.saturating_sub(self.cursors.tail);
        self.cursors.tail = self.cursors.tail.max(end);
        self.cursors.pending = self.cursors.pending.max(self.cursors.tail);
        if self.cursors.pending == self.cursors.tail {
            self.pending_since = None;
        }
        self.stats.dropped_records += lost;
        self.stats.dropped_sectors += 1;
        self.meta_dirty = true;
        lost
    }

    fn flush_due(&self, tick: u32) -> bool {
        self.chain_state == ChainState::Active && tick >= self.backoff.retry_at
    }

    fn read_record<B: SectorBackend>(
        &mut self,
        backend: &B,
        key: SensorKey,
        sector_size: usize,
        index: u64,
    ) -> StoreResult<Record> {
        let SensorState {
            chain,
            read_cache,
            stats,
            ..
        } = self;

        let (spilled, pos) = match chain.locate(index) {
            Some(Location::Resident(sector, pos)) => return sector.record_at(pos),
            Some(Location::Spilled(spilled, pos)) => (spilled, pos),
            None => {
                return Err(StoreError::CorruptSector {
                    reason: "record index outside the chain",
                });
            }
        };

        let cached = read_cache
            .as_ref()
            .is_some_and(|c| c.header.seq == spilled.seq);
        if !cached {
            let mut image = match read_cache.take() {
                Some(old) => old.image,
                None => vec![0u8; sector_size],
            };
            if let Err(err) = backend.read_sector(key, spilled.slot, &mut image) {
                stats.read_failures += 1;
                return Err(err);
            }
            let header = match SectorView::new(&image, sector_size, key.id) {
                Ok(view) => *view.header(),
                Err(err) => {
                    if matches!(err, StoreError::CrcMismatch { .. }) {
                        stats.crc_failures += 1;
                    }
                    return Err(err);
                }
            };
            if header.seq != spilled.seq || header.first_index != spilled.first_index {
                return Err(StoreError::CorruptSector {
                    reason: "file slot holds a different sector",
                });
            }
            *read_cache = Some(ReadCache { header, image });
        }

        match read_cache {
            Some(cache) => SectorView::trusted(cache.header, &cache.image).record_at(pos),
            None => Err(StoreError::CorruptSector {
                reason: "read cache empty",
            }),
        }
    }

    /// Moves `pending` forward over records the chain no longer holds
    fn skip_pending_to(&mut self, index: u64, tick: u32) {
        if self.cursors.pending == self.cursors.tail {
            self.pending_since = Some(tick);
        }
        self.cursors.pending = index;
    }

    /// Discards a spilled sector that cannot be decoded
    ///
    /// The sector leaves the chain, so its records are counted as dropped
    /// once and a later rollback steps over them instead of reading the
    /// sector again. Returns `false` for errors that may go away on retry.
    fn discard_unreadable(&mut self, index: u64, err: StoreError, tick: u32) -> bool {
        if !matches!(
            err,
            StoreError::CrcMismatch { .. } | StoreError::CorruptSector { .. }
        ) {
            return false;
        }
        let Some(Location::Spilled(spilled, _)) = self.chain.locate(index) else {
            return false;
        };
        self.chain.discard_spilled(spilled.seq);

        let end = spilled.end_index();
        let lost = if spilled.first_index <= self.cursors.tail {
            self.discard_through(end)
        } else {
            // In-flight records before it stay deliverable
            let lost = end - spilled.first_index;
            self.skip_pending_to(end, tick);
            self.stats.dropped_records += lost;
            self.stats.dropped_sectors += 1;
            self.meta_dirty = true;
            lost
        };
        warn!(
            "Discarded unreadable sector {} ({}), {} records lost",
            spilled.seq, err, lost
        );
        true
    }
}

/// One sensor's sector chain, cursors and counters behind its own lock
pub struct SensorStore<M: RawMutex> {
    key: SensorKey,
    kind: RecordKind,
    sector_size: usize,
    state: Mutex<M, RefCell<SensorState>>,
    /// Held across snapshot and backend write of the metadata
    meta_write: Mutex<M, ()>,
}

impl<M: RawMutex> SensorStore<M> {
    pub fn new(key: SensorKey, kind: RecordKind, sector_size: usize) -> Self {
        Self::restore(
            key,
            kind,
            sector_size,
            SectorChain::new(key.id, kind),
            Cursors::default(),
            SensorStats::default(),
        )
    }

    /// Rebuilds a store from recovered state
    pub fn restore(
        key: SensorKey,
        kind: RecordKind,
        sector_size: usize,
        chain: SectorChain,
        cursors: Cursors,
        stats: SensorStats,
    ) -> Self {
        Self {
            key,
            kind,
            sector_size,
            state: Mutex::new(RefCell::new(SensorState {
                chain,
                cursors,
                stats,
                chain_state: ChainState::Active,
                last_append_tick: 0,
                pending_since: None,
                meta_dirty: false,
                backoff: Backoff::default(),
                read_cache: None,
            })),
            meta_write: Mutex::new(()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SensorState) -> R) -> R {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            let out = f(&mut state);
            debug_assert!(state.cursors.is_ordered(), "cursor order violated");
            out
        })
    }

    pub const fn id(&self) -> SensorId {
        self.key.id
    }

    pub const fn key(&self) -> SensorKey {
        self.key
    }

    pub const fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn cursors(&self) -> Cursors {
        self.with(|s| s.cursors)
    }

    pub fn stats(&self) -> SensorStats {
        self.with(|s| s.stats)
    }

    pub fn chain_state(&self) -> ChainState {
        self.with(|s| s.chain_state)
    }

    pub fn is_degraded(&self) -> bool {
        self.with(|s| s.backoff.degraded)
    }

    /// (resident, spilled) sector counts
    pub fn sector_counts(&self) -> (usize, usize) {
        self.with(|s| (s.chain.resident_len(), s.chain.spilled_len()))
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Appends into the open head, or reports that a new sector is needed
    pub(crate) fn try_append(&self, record: &Record, tick: u32) -> StoreResult<AppendOutcome> {
        if record.kind() != self.kind {
            return Err(StoreError::KindMismatch {
                sensor_id: self.key.id,
            });
        }
        self.with(|s| {
            if s.chain.needs_sector() {
                return Ok(AppendOutcome::NeedsSector);
            }
            s.chain.push(record)?;
            s.record_appended(tick);
            Ok(AppendOutcome::Appended)
        })
    }

    /// Grows the chain with `sector` (sealing the old head) and appends
    ///
    /// If another writer grew the chain in the meantime the sector is not
    /// needed and comes back as the first element for the caller to free.
    pub(crate) fn append_with_sector(
        &self,
        sector: Sector,
        record: &Record,
        tick: u32,
    ) -> (Option<Sector>, StoreResult<()>) {
        self.with(|s| {
            let spare = if s.chain.needs_sector() {
                if s.chain.attach(sector, s.cursors.head, tick) {
                    s.stats.sealed_sectors += 1;
                }
                None
            } else {
                Some(sector)
            };

            let result = s.chain.push(record);
            if result.is_ok() {
                s.record_appended(tick);
            }
            (spare, result)
        })
    }

    // ------------------------------------------------------------------
    // Consumption path
    // ------------------------------------------------------------------

    /// Hands out up to `max` records starting at `pending`
    pub(crate) fn consume_batch<B: SectorBackend>(
        &self,
        backend: &B,
        max: usize,
        tick: u32,
    ) -> StoreResult<ConsumedBatch> {
        self.with(|s| {
            let mut batch = ConsumedBatch {
                first_index: s.cursors.pending,
                records: Vec::new(),
            };

            while batch.records.len() < max && s.cursors.pending < s.cursors.head {
                let index = s.chain.next_held_index(s.cursors.pending).unwrap_or(s.cursors.head);
                if index != s.cursors.pending {
                    // A batch is contiguous, so it ends at a discarded range
                    if !batch.records.is_empty() {
                        break;
                    }
                    s.skip_pending_to(index, tick);
                    continue;
                }

                match s.read_record(backend, self.key, self.sector_size, index) {
                    Ok(record) => {
                        if batch.records.is_empty() {
                            batch.first_index = index;
                        }
                        batch.records.push(record);
                        s.advance_pending(tick);
                    }
                    Err(err) => {
                        let discarded = s.discard_unreadable(index, err, tick);
                        if !discarded && batch.records.is_empty() {
                            return Err(err);
                        }
                        // Hand out what was read; a retryable error comes back
                        // on the next call
                        if !batch.records.is_empty() {
                            break;
                        }
                    }
                }
            }

            if batch.records.is_empty() {
                batch.first_index = s.cursors.pending;
            }
            s.stats.consumed += batch.records.len() as u64;
            Ok(batch)
        })
    }

    /// Acknowledges everything in flight and trims the sectors behind `tail`
    ///
    /// Returns the number of records erased and the trimmed sectors; the
    /// caller frees the resident ones to the pool.
    pub(crate) fn erase_all_pending(&self) -> (u64, Trimmed) {
        self.with(|s| {
            let erased = s.cursors.in_flight();
            if erased == 0 {
                return (0, Trimmed::default());
            }

            s.cursors.tail = s.cursors.pending;
            s.pending_since = None;
            s.stats.erased += erased;
            s.meta_dirty = true;

            let trimmed = s.chain.trim(s.cursors.tail);
            debug!(
                "Sensor {} erased {} records, trimmed {} resident and {} spilled sectors",
                self.key.id,
                erased,
                trimmed.freed.len(),
                trimmed.spilled
            );
            (erased, trimmed)
        })
    }

    /// Reads a retained record without touching the cursors
    pub(crate) fn diagnostic_read_at<B: SectorBackend>(
        &self,
        backend: &B,
        index: u64,
    ) -> StoreResult<Option<Record>> {
        self.with(|s| {
            if index < s.cursors.tail
                || index >= s.cursors.head
                || s.chain.next_held_index(index) != Some(index)
            {
                return Ok(None);
            }
            s.read_record(backend, self.key, self.sector_size, index)
                .map(Some)
        })
    }

    /// Makes every in-flight record deliverable again
    pub(crate) fn rollback_pending(&self) -> u64 {
        self.with(|s| {
            let reverted = s.cursors.in_flight();
            s.cursors.pending = s.cursors.tail;
            s.pending_since = None;
            reverted
        })
    }

    // ------------------------------------------------------------------
    // Maintenance (tick and shutdown)
    // ------------------------------------------------------------------

    /// Reverts `pending` when in-flight records outlived the lease
    pub(crate) fn expire_lease(&self, tick: u32, lease_ticks: u32) -> bool {
        self.with(|s| match s.pending_since {
            Some(since) if tick.wrapping_sub(since) >= lease_ticks => {
                let reverted = s.cursors.in_flight();
                s.cursors.pending = s.cursors.tail;
                s.pending_since = None;
                s.stats.lease_expirations += 1;
                warn!(
                    "Sensor {}: lease expired, {} in-flight records will be resent",
                    self.key.id, reverted
                );
                true
            }
            _ => false,
        })
    }

    /// Seals the open head if nothing was appended for `idle_ticks`
    pub(crate) fn seal_if_idle(&self, tick: u32, idle_ticks: u32) -> bool {
        self.with(|s| {
            if !s.chain.head_is_sealable() || tick.wrapping_sub(s.last_append_tick) < idle_ticks {
                return false;
            }
            let sealed = s.chain.seal_head(tick);
            if sealed {
                s.stats.sealed_sectors += 1;
                debug!("Sensor {}: sealed idle head sector", self.key.id);
            }
            sealed
        })
    }

    /// Seals the open head regardless of idleness
    pub(crate) fn seal_head(&self, tick: u32) -> bool {
        self.with(|s| {
            let sealed = s.chain.seal_head(tick);
            if sealed {
                s.stats.sealed_sectors += 1;
            }
            sealed
        })
    }

    /// `(sealed_tick, seq)` of the sector the next flush would write
    pub(crate) fn flush_candidate(&self, tick: u32) -> Option<(u32, u32)> {
        self.with(|s| {
            if !s.flush_due(tick) {
                return None;
            }
            s.chain
                .oldest_sealed_resident()
                .map(|sector| (sector.header().sealed_tick, sector.seq()))
        })
    }

    /// `(sealed_tick, seq)` of the oldest sealed resident sector
    pub(crate) fn eviction_candidate(&self) -> Option<(u32, u32)> {
        self.with(|s| {
            s.chain
                .oldest_sealed_resident()
                .map(|sector| (sector.header().sealed_tick, sector.seq()))
        })
    }

    /// `(sealed_tick, seq)` of the oldest live sector on the backend
    pub(crate) fn oldest_spilled(&self) -> Option<(u32, u32)> {
        self.with(|s| {
            if s.chain_state == ChainState::Flushing {
                return None;
            }
            s.chain.oldest_spilled().map(|spilled| (spilled.sealed_tick, spilled.seq))
        })
    }

    /// Copies the oldest sealed sector out and marks the chain as flushing
    ///
    /// `force` ignores the retry backoff of a failing sensor.
    pub(crate) fn begin_flush(&self, tick: u32, force: bool) -> Option<FlushJob> {
        self.with(|s| {
            if s.chain_state == ChainState::Flushing || !(force || s.flush_due(tick)) {
                return None;
            }
            let sector = s.chain.oldest_sealed_resident()?;
            let job = FlushJob {
                seq: sector.seq(),
                slot: s.chain.file_slots(),
                image: sector.image().to_vec(),
            };
            s.chain_state = ChainState::Flushing;
            Some(job)
        })
    }

    /// Records a durable sector write and returns the buffer to free
    ///
    /// Leaves the metadata dirty; the caller persists it after the sector.
    pub(crate) fn finish_flush(&self, job: &FlushJob) -> Option<Sector> {
        self.with(|s| {
            s.chain_state = ChainState::Active;
            let freed = s.chain.spill_front(job.seq, job.slot);
            if freed.is_some() {
                s.stats.flushed_sectors += 1;
                s.stats.bytes_flushed += job.image.len() as u64;
            }
            if s.backoff.degraded {
                info!("Sensor {}: flushing again, no longer degraded", self.key.id);
            }
            s.backoff = Backoff::default();
            s.meta_dirty = true;
            freed
        })
    }

    /// Defers the next flush of this sensor with bounded backoff
    pub(crate) fn flush_failed(&self, tick: u32) {
        self.with(|s| {
            s.chain_state = ChainState::Active;
            s.stats.write_failures += 1;

            let backoff = &mut s.backoff;
            backoff.failures = backoff.failures.saturating_add(1);
            let delay = (1u32 << backoff.failures.min(5)).min(MAX_BACKOFF_TICKS);
            backoff.retry_at = tick.saturating_add(delay);
            if backoff.failures >= DEGRADED_AFTER_FAILURES && !backoff.degraded {
                backoff.degraded = true;
                warn!(
                    "Sensor {}: {} consecutive flush failures, marked degraded",
                    self.key.id, backoff.failures
                );
            }
        })
    }

    /// Evicts the oldest sealed resident sector to make room in the pool
    pub(crate) fn evict_oldest_resident(&self) -> Option<Sector> {
        self.with(|s| {
            let (sector, end) = s.chain.drop_oldest_resident()?;
            let lost = s.discard_through(end);
            warn!(
                "Sensor {}: evicted sector {} from RAM, {} records lost",
                self.key.id,
                sector.seq(),
                lost
            );
            Some(sector)
        })
    }

    /// Rewrites the data file without its dead prefix
    ///
    /// Unless `force` is set, only runs when the whole file is dead or the
    /// dead prefix is at least half of it. Holds the sensor lock throughout
    /// so readers never see slots shift under them.
    pub(crate) fn compact<B: SectorBackend>(&self, backend: &B, force: bool) -> StoreResult<u32> {
        self.with(|s| {
            if s.chain_state == ChainState::Flushing {
                return Ok(0);
            }
            let dead = s.chain.dead_slots();
            let total = s.chain.file_slots();
            if dead == 0 || (!force && dead != total && dead * 2 < total) {
                return Ok(0);
            }

            if let Err(err) = backend.discard_front(self.key, dead, total) {
                s.stats.write_failures += 1;
                return Err(err);
            }
            s.chain.compacted(dead);
            s.meta_dirty = true;
            debug!(
                "Sensor {}: reclaimed {} dead sectors from data file",
                self.key.id, dead
            );
            Ok(dead)
        })
    }

    /// Drops the oldest live sector on the backend to get under quota
    pub(crate) fn drop_oldest_spilled<B: SectorBackend>(&self, backend: &B) -> StoreResult<Option<u64>> {
        self.with(|s| {
            if s.chain_state == ChainState::Flushing {
                return Ok(None);
            }
            let Some(spilled) = s.chain.drop_oldest_spilled() else {
                return Ok(None);
            };
            let lost = s.discard_through(spilled.end_index());

            let dead = s.chain.dead_slots();
            let total = s.chain.file_slots();
            if let Err(err) = backend.discard_front(self.key, dead, total) {
                s.stats.write_failures += 1;
                return Err(err);
            }
            s.chain.compacted(dead);
            Ok(Some(lost))
        })
    }

    /// Snapshots the metadata and writes it to `backend`
    ///
    /// With `dirty_only` nothing is written unless cursors or topology
    /// changed since the last snapshot. Returns whether a write happened. A
    /// failed write leaves the metadata dirty for the next attempt.
    pub(crate) fn persist_meta<B: SectorBackend>(&self, backend: &B, dirty_only: bool) -> StoreResult<bool> {
        self.meta_write.lock(|_| {
            let snapshot = self.with(|s| {
                if dirty_only && !s.meta_dirty {
                    return None;
                }
                s.meta_dirty = false;
                Some(self.meta_of(s))
            });
            let Some(meta) = snapshot else {
                return Ok(false);
            };
            match backend.write_meta(self.key, &meta) {
                Ok(()) => Ok(true),
                Err(err) => {
                    self.meta_write_failed();
                    Err(err)
                }
            }
        })
    }

    pub(crate) fn mark_meta_dirty(&self) {
        self.with(|s| s.meta_dirty = true)
    }

    /// Keeps the metadata dirty so the next tick retries the write
    fn meta_write_failed(&self) {
        self.with(|s| {
            s.meta_dirty = true;
            s.stats.write_failures += 1;
        })
    }

    /// Counts a record the writer's append had to drop
    pub(crate) fn record_rejected(&self) {
        self.with(|s| s.stats.dropped_records += 1)
    }

    fn meta_of(&self, s: &SensorState) -> SensorMeta {
        SensorMeta {
            version: META_VERSION,
            sensor_id: self.key.id,
            class: self.key.class,
            kind: self.kind,
            sector_size: self.sector_size as u32,
            tail: s.cursors.tail,
            pending: s.cursors.pending,
            head: s.cursors.head,
            file_slots: s.chain.file_slots(),
            next_seq: s.chain.next_seq(),
            stats: s.stats,
        }
    }

    /// Gives up every resident buffer, used at shutdown
    pub(crate) fn release_resident(&self) -> Vec<Sector> {
        self.with(|s| {
            s.read_cache = None;
            s.chain.release_resident()
        })
    }
}
