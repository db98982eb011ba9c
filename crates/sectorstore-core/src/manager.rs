//! Storage manager
//!
//! One explicitly constructed [`StorageManager`] owns the sector pool, the
//! backend and every [`SensorStore`]. Producers call [`StorageManager::append`],
//! the uploader drains sensors through the consumption API, and the host
//! drives maintenance by calling [`StorageManager::tick`] periodically:
//!
//! 1. seal head sectors idle past `seal_idle_ticks`, expire pending leases
//! 2. under pool pressure, flush sealed sectors oldest-first until usage is
//!    below the threshold, then apply the drop policy if still over
//! 3. compact data files and enforce the per-class disk quota
//! 4. persist changed metadata and refresh the [`HealthReport`]
//!
//! ## Locking
//!
//! The sensor table, the pool and each sensor have their own lock and none
//! of them is ever held while taking another. Disk I/O of a flush runs with
//! the sensor lock released; the chain is marked `Flushing` meanwhile and the
//! write is reconciled against the chain when the lock is taken again.
//! Metadata writes of one sensor are serialized by a lock of their own that
//! is taken before the sensor lock.

extern crate alloc;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use log::{debug, error, info, warn};

use crate::backend::{RecoveredSensor, SectorBackend, SensorKey};
use crate::chain::SectorChain;
use crate::config::{OverflowPolicy, Platform, SourceClass, StorageConfig};
use crate::error::{StoreError, StoreResult};
use crate::health::{HealthReport, LifecycleState, TickReport};
use crate::pool::{PoolStats, SectorPool};
use crate::record::{Record, RecordKind};
use crate::sector::Sector;
use crate::store::{AppendOutcome, ConsumedBatch, ConsumedRecord, Cursors, SensorStats, SensorStore};
use crate::{MAX_SENSORS, SensorId};

type SensorTable<M> = heapless::Vec<Arc<SensorStore<M>>, MAX_SENSORS>;

enum FlushOutcome {
    Flushed,
    Failed,
    Idle,
}

/// Owner of the pool, the backend and all sensor stores
pub struct StorageManager<M: RawMutex, B: SectorBackend> {
    config: StorageConfig,
    pool: SectorPool<M>,
    backend: B,
    sensors: Mutex<M, RefCell<SensorTable<M>>>,
    state: Mutex<M, Cell<LifecycleState>>,
    health: Mutex<M, Cell<HealthReport>>,
    ticks: AtomicU32,
    quota_drops: AtomicU32,
    recovery_discards: u32,
    recovery_io_failures: u32,
}

impl<M: RawMutex, B: SectorBackend> StorageManager<M, B> {
    /// Validates `config`, creates the pool and restores persisted sensors
    pub fn new(config: StorageConfig, backend: B) -> StoreResult<Self> {
        config.validate()?;
        match (config.platform, backend.is_durable()) {
            (Platform::Filesystem, false) => {
                return Err(StoreError::InvalidConfig {
                    reason: "filesystem platform needs a durable backend",
                });
            }
            (Platform::Constrained, true) => {
                return Err(StoreError::InvalidConfig {
                    reason: "constrained platform keeps sectors in RAM only",
                });
            }
            _ => {}
        }

        let mut table = SensorTable::new();
        let mut recovery_discards = 0;
        let mut recovery_io_failures = 0;
        for found in backend.recover()? {
            recovery_discards += found.discarded_sectors;
            recovery_io_failures += found.io_failures;
            let Some(store) = restore_sensor(&config, found)? else {
                continue;
            };
            table
                .push(Arc::new(store))
                .map_err(|_| StoreError::TooManySensors { max: MAX_SENSORS })?;
        }

        info!(
            "Storage manager ready: {:?} platform, {} x {} B sectors, {} sensors recovered",
            config.platform,
            config.pool_capacity,
            config.sector_size,
            table.len()
        );

        let manager = Self {
            pool: SectorPool::new(
                config.sector_size,
                config.pool_capacity,
                config.ram_threshold_pct,
                config.growable_pool(),
            ),
            config,
            backend,
            sensors: Mutex::new(RefCell::new(table)),
            state: Mutex::new(Cell::new(LifecycleState::Running)),
            health: Mutex::new(Cell::new(HealthReport::default())),
            ticks: AtomicU32::new(0),
            quota_drops: AtomicU32::new(0),
            recovery_discards,
            recovery_io_failures,
        };
        manager.refresh_health(&manager.snapshot());
        Ok(manager)
    }

    pub const fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub const fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> LifecycleState {
        self.state.lock(Cell::get)
    }

    /// Fraction of the pool in use, in `[0, 1]`
    pub fn pool_usage(&self) -> f32 {
        self.pool.usage()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Health snapshot taken by the last tick (or by shutdown)
    pub fn health(&self) -> HealthReport {
        self.health.lock(Cell::get)
    }

    fn current_tick(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn ensure_running(&self) -> StoreResult<()> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            _ => Err(StoreError::NotRunning),
        }
    }

    fn ensure_not_stopped(&self) -> StoreResult<()> {
        match self.state() {
            LifecycleState::Stopped => Err(StoreError::NotRunning),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Sensor table
    // ------------------------------------------------------------------

    fn sensor(&self, id: SensorId) -> Option<Arc<SensorStore<M>>> {
        self.sensors
            .lock(|cell| cell.borrow().iter().find(|s| s.id() == id).cloned())
    }

    fn sensor_or_create(&self, id: SensorId, kind: RecordKind) -> StoreResult<Arc<SensorStore<M>>> {
        self.sensors.lock(|cell| {
            let mut table = cell.borrow_mut();
            if let Some(store) = table.iter().find(|s| s.id() == id) {
                return Ok(store.clone());
            }

            let key = SensorKey {
                id,
                class: self.config.source_class(id),
            };
            let store = Arc::new(SensorStore::new(key, kind, self.config.sector_size));
            table
                .push(store.clone())
                .map_err(|_| StoreError::TooManySensors { max: MAX_SENSORS })?;
            info!("Created store for sensor {} ({:?}, {})", id, kind, key.class);
            Ok(store)
        })
    }

    fn snapshot(&self) -> Vec<Arc<SensorStore<M>>> {
        self.sensors.lock(|cell| cell.borrow().iter().cloned().collect())
    }

    /// Ids of every known sensor, in creation order
    pub fn sensor_ids(&self) -> heapless::Vec<SensorId, MAX_SENSORS> {
        self.sensors
            .lock(|cell| cell.borrow().iter().map(|s| s.id()).collect())
    }

    pub fn cursors(&self, id: SensorId) -> Option<Cursors> {
        self.sensor(id).map(|s| s.cursors())
    }

    pub fn sensor_stats(&self, id: SensorId) -> Option<SensorStats> {
        self.sensor(id).map(|s| s.stats())
    }

    /// (resident, spilled) sector counts of a sensor
    pub fn sector_counts(&self, id: SensorId) -> Option<(usize, usize)> {
        self.sensor(id).map(|s| s.sector_counts())
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Appends one record to a sensor, creating the sensor on first write
    ///
    /// Returns `PoolExhausted` when the chain cannot grow and the overflow
    /// policy could not free a sector; the record is dropped and counted.
    pub fn append(&self, sensor_id: SensorId, record: Record) -> StoreResult<()> {
        self.ensure_running()?;
        record.validate()?;
        let store = self.sensor_or_create(sensor_id, record.kind())?;
        let tick = self.current_tick();

        if let AppendOutcome::Appended = store.try_append(&record, tick)? {
            return Ok(());
        }

        let sector = match self.pool.allocate() {
            Ok(sector) => sector,
            Err(err @ StoreError::PoolExhausted { .. }) => self.allocate_under_overflow(&store, err, tick)?,
            Err(err) => return Err(err),
        };

        let (spare, result) = store.append_with_sector(sector, &record, tick);
        if let Some(spare) = spare {
            self.pool.free(spare);
        }
        result
    }

    /// Applies the overflow policy once and retries the allocation once
    fn allocate_under_overflow(
        &self,
        store: &SensorStore<M>,
        err: StoreError,
        tick: u32,
    ) -> StoreResult<Sector> {
        let relieved = match self.config.overflow {
            OverflowPolicy::RejectNew => false,
            OverflowPolicy::DropOldest => self.evict_oldest(&self.snapshot()),
            OverflowPolicy::FlushToBackend => {
                let sensors = self.snapshot();
                match oldest_flushable(&sensors, tick) {
                    Some(victim) => matches!(self.flush_sector(victim, tick, false), FlushOutcome::Flushed),
                    None => false,
                }
            }
        };

        let retried = if relieved { self.pool.allocate() } else { Err(err) };
        if retried.is_err() {
            store.record_rejected();
            debug!(
                "Sensor {}: record dropped, pool exhausted ({:?})",
                store.id(),
                self.config.overflow
            );
        }
        retried
    }

    /// Evicts the globally oldest sealed resident sector
    fn evict_oldest(&self, sensors: &[Arc<SensorStore<M>>]) -> bool {
        let victim = sensors
            .iter()
            .filter_map(|s| s.eviction_candidate().map(|age| (age, s)))
            .min_by_key(|(age, _)| *age)
            .map(|(_, s)| s);

        match victim.and_then(|s| s.evict_oldest_resident()) {
            Some(sector) => {
                self.pool.free(sector);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Consumption path
    // ------------------------------------------------------------------

    /// Hands out the next unconsumed record, marking it in flight
    pub fn consume_next(&self, sensor_id: SensorId) -> StoreResult<Option<ConsumedRecord>> {
        let batch = self.consume_batch(sensor_id, 1)?;
        Ok(batch.indexed().next())
    }

    /// Hands out up to `max` contiguous records in write order
    ///
    /// A spilled sector that fails validation is discarded and counted once
    /// rather than returned as an error. A batch never spans the gap it
    /// leaves.
    pub fn consume_batch(&self, sensor_id: SensorId, max: usize) -> StoreResult<ConsumedBatch> {
        self.ensure_running()?;
        match self.sensor(sensor_id) {
            Some(store) => store.consume_batch(&self.backend, max, self.current_tick()),
            None => Ok(ConsumedBatch::default()),
        }
    }

    /// Acknowledges every in-flight record of a sensor
    ///
    /// Moves `tail` to `pending`, frees trimmed resident sectors and reclaims
    /// data-file space right away when the dead prefix is large enough.
    /// Calling it again without consuming in between is a no-op.
    pub fn erase_all_pending(&self, sensor_id: SensorId) -> StoreResult<u64> {
        self.ensure_not_stopped()?;
        let Some(store) = self.sensor(sensor_id) else {
            return Ok(0);
        };

        let (erased, trimmed) = store.erase_all_pending();
        self.pool.free_all(trimmed.freed);
        if trimmed.spilled > 0 && self.backend.is_durable() {
            if let Err(err) = store.compact(&self.backend, false) {
                warn!("Sensor {}: compaction after erase failed: {}", sensor_id, err);
            }
        }
        Ok(erased)
    }

    /// Reads a retained record without moving any cursor
    ///
    /// Returns `None` for indices outside `[tail, head)` or unknown sensors.
    pub fn diagnostic_read_at(&self, sensor_id: SensorId, index: u64) -> StoreResult<Option<Record>> {
        self.ensure_not_stopped()?;
        match self.sensor(sensor_id) {
            Some(store) => store.diagnostic_read_at(&self.backend, index),
            None => Ok(None),
        }
    }

    /// Resets `pending` to `tail` so in-flight records are delivered again
    pub fn rollback_pending(&self, sensor_id: SensorId) -> StoreResult<u64> {
        self.ensure_not_stopped()?;
        Ok(self.sensor(sensor_id).map_or(0, |s| s.rollback_pending()))
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Runs one maintenance pass
    pub fn tick(&self) -> TickReport {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };
        if self.state() != LifecycleState::Running {
            return report;
        }
        let sensors = self.snapshot();

        // 1. Idle seals and lease expiry
        let retention = self.config.retention;
        for store in &sensors {
            if store.seal_if_idle(tick, retention.seal_idle_ticks) {
                report.sealed += 1;
            }
            if let Some(lease) = retention.pending_lease_ticks {
                if store.expire_lease(tick, lease) {
                    report.leases_expired += 1;
                }
            }
        }

        // 2. Pool pressure
        let signalled = self.pool.take_pressure_signal();
        if signalled || self.pool.is_over_threshold() {
            self.relieve_pressure(&sensors, tick, &mut report);
        }

        // 3. Disk quota
        if self.backend.is_durable() {
            for class in SourceClass::ALL {
                self.enforce_quota(&sensors, class, &mut report);
            }
        }

        // 4. Metadata and health
        if self.backend.is_durable() {
            report.meta_written = self.persist_dirty_meta(&sensors);
        }
        self.refresh_health(&sensors);

        if report.flushed > 0 || report.evicted > 0 || report.quota_drops > 0 {
            debug!("Tick {}: {:?}", tick, report);
        }
        report
    }

    fn relieve_pressure(&self, sensors: &[Arc<SensorStore<M>>], tick: u32, report: &mut TickReport) {
        let threshold = self.pool.threshold_sectors();
        // Each round frees a sector or backs a failing sensor off, so this
        // bounds the loop even if the pool keeps refilling concurrently
        let mut budget = self.pool.capacity();

        if self.backend.is_durable() {
            while budget > 0 && self.pool.in_use() >= threshold {
                budget -= 1;
                let Some(store) = oldest_flushable(sensors, tick) else {
                    break;
                };
                match self.flush_sector(store, tick, false) {
                    FlushOutcome::Flushed => report.flushed += 1,
                    FlushOutcome::Failed => report.flush_failures += 1,
                    FlushOutcome::Idle => {}
                }
            }
        }

        // Dropping only runs while strictly over the threshold. At a 100 %
        // threshold that never happens and eviction is left to the append
        // that finds the pool exhausted
        if self.config.overflow == OverflowPolicy::DropOldest {
            while budget > 0 && self.pool.in_use() > threshold {
                budget -= 1;
                if !self.evict_oldest(sensors) {
                    break;
                }
                report.evicted += 1;
            }
        }

        if self.pool.in_use() >= threshold {
            debug!(
                "Pool still at {}% after relief, nothing left to flush or drop",
                self.pool.usage_pct()
            );
        }
    }

    /// Writes the oldest sealed sector of `store` to the backend
    ///
    /// The image is copied out under the sensor lock and written without it.
    fn flush_sector(&self, store: &SensorStore<M>, tick: u32, force: bool) -> FlushOutcome {
        let Some(job) = store.begin_flush(tick, force) else {
            return FlushOutcome::Idle;
        };

        if let Err(err) = self.backend.write_sector(store.key(), job.slot, &job.image) {
            error!("Sensor {}: flush of sector {} failed: {}", store.id(), job.seq, err);
            store.flush_failed(tick);
            return FlushOutcome::Failed;
        }

        if let Some(sector) = store.finish_flush(&job) {
            self.pool.free(sector);
        }
        debug!(
            "Sensor {}: flushed sector {} to slot {}",
            store.id(),
            job.seq,
            job.slot
        );

        // Sector first, then metadata: a crash in between leaves a valid
        // sector the recovery scan picks up on its own
        if let Err(err) = store.persist_meta(&self.backend, true) {
            error!("Sensor {}: metadata update failed: {}", store.id(), err);
        }
        FlushOutcome::Flushed
    }

    fn enforce_quota(&self, sensors: &[Arc<SensorStore<M>>], class: SourceClass, report: &mut TickReport) {
        let quota = self.config.disk_quota_bytes;
        let members: Vec<&Arc<SensorStore<M>>> = sensors.iter().filter(|s| s.key().class == class).collect();
        if members.is_empty() {
            return;
        }

        let over = quota > 0 && self.backend.class_usage(class) > quota;
        for store in &members {
            match store.compact(&self.backend, over) {
                Ok(slots) => report.compacted_slots += slots,
                Err(err) => warn!("Sensor {}: compaction failed: {}", store.id(), err),
            }
        }
        if quota == 0 {
            return;
        }

        while self.backend.class_usage(class) > quota {
            let victim = members
                .iter()
                .filter_map(|s| s.oldest_spilled().map(|age| (age, *s)))
                .min_by_key(|(age, _)| *age)
                .map(|(_, s)| s);
            let Some(store) = victim else {
                warn!(
                    "{}",
                    StoreError::QuotaExceeded {
                        class: class.dir_name()
                    }
                );
                break;
            };

            match store.drop_oldest_spilled(&self.backend) {
                Ok(Some(lost)) => {
                    report.quota_drops += 1;
                    self.quota_drops.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Sensor {}: {} directory over quota, dropped oldest sector ({} records)",
                        store.id(),
                        class,
                        lost
                    );
                }
                Ok(None) => break,
                Err(err) => {
                    error!("Sensor {}: quota drop failed: {}", store.id(), err);
                    break;
                }
            }
        }
    }

    fn persist_dirty_meta(&self, sensors: &[Arc<SensorStore<M>>]) -> u32 {
        let mut written = 0;
        for store in sensors {
            match store.persist_meta(&self.backend, true) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(err) => error!("Sensor {}: metadata update failed: {}", store.id(), err),
            }
        }
        written
    }

    fn refresh_health(&self, sensors: &[Arc<SensorStore<M>>]) {
        let pool = self.pool.stats();
        let mut report = HealthReport {
            state: self.state(),
            ticks: self.current_tick(),
            sensors: sensors.len(),
            pool_usage_pct: self.pool.usage_pct(),
            pool_pressure_events: pool.pressure_events,
            pool_exhausted_events: pool.exhausted_events,
            quota_drops: self.quota_drops.load(Ordering::Relaxed),
            read_failures: self.recovery_io_failures,
            recovery_discards: self.recovery_discards,
            ..HealthReport::default()
        };

        for store in sensors {
            let stats = store.stats();
            report.crc_failures += stats.crc_failures;
            report.write_failures += stats.write_failures;
            report.read_failures += stats.read_failures;
            report.dropped_records += stats.dropped_records;
            report.dropped_sectors += stats.dropped_sectors;
            report.lease_expirations += stats.lease_expirations;
            if store.is_degraded() {
                report.degraded_sensors += 1;
            }
        }

        self.health.lock(|cell| cell.set(report));
    }

    /// Seals every open head, flushes what the backend can take and stops
    ///
    /// Appends are refused from the moment this is called. On a durable
    /// backend every sealed sector gets one write attempt regardless of
    /// backoff, then the metadata of every sensor is written. Resident
    /// sectors go back to the pool and consumption stops.
    pub fn shutdown(&self) -> HealthReport {
        let started = self.state.lock(|cell| {
            if cell.get() != LifecycleState::Running {
                return false;
            }
            cell.set(LifecycleState::ShuttingDown);
            true
        });
        if !started {
            return self.health();
        }

        let tick = self.current_tick();
        let sensors = self.snapshot();
        info!("Shutting down storage, {} sensors", sensors.len());

        for store in &sensors {
            store.seal_head(tick);
        }

        if self.backend.is_durable() {
            let mut flushed = 0u32;
            for store in &sensors {
                loop {
                    match self.flush_sector(store, tick, true) {
                        FlushOutcome::Flushed => flushed += 1,
                        FlushOutcome::Failed => {
                            warn!(
                                "Sensor {}: unflushed sectors will be lost at shutdown",
                                store.id()
                            );
                            break;
                        }
                        FlushOutcome::Idle => break,
                    }
                }
                if let Err(err) = store.persist_meta(&self.backend, false) {
                    error!("Sensor {}: final metadata update failed: {}", store.id(), err);
                }
            }
            info!("Flushed {} sectors at shutdown", flushed);
        }

        for store in &sensors {
            self.pool.free_all(store.release_resident());
        }

        self.state.lock(|cell| cell.set(LifecycleState::Stopped));
        self.refresh_health(&sensors);
        self.health()
    }
}

/// Sensor holding the globally oldest sealed sector that is due for flushing
fn oldest_flushable<M: RawMutex>(sensors: &[Arc<SensorStore<M>>], tick: u32) -> Option<&SensorStore<M>> {
    sensors
        .iter()
        .filter_map(|s| s.flush_candidate(tick).map(|age| (age, s)))
        .min_by_key(|(age, _)| *age)
        .map(|(_, s)| s.as_ref())
}

/// Rebuilds one sensor from what the recovery scan found
///
/// Cursors follow the metadata where the data file agrees with it: `tail` is
/// clamped into the recovered sectors, `head` ends at the last valid sector
/// and `pending` restarts at `tail`. Records that only ever lived in RAM are
/// counted as dropped.
fn restore_sensor<M: RawMutex>(
    config: &StorageConfig,
    found: RecoveredSensor,
) -> StoreResult<Option<SensorStore<M>>> {
    let RecoveredSensor {
        key,
        meta,
        kind,
        sectors,
        file_slots,
        discarded_sectors,
        crc_failure,
        ..
    } = found;

    let Some(kind) = kind else {
        debug!("Sensor {}: no usable sectors or metadata", key.id);
        return Ok(None);
    };
    if meta.is_some_and(|m| m.sector_size as usize != config.sector_size) {
        return Err(StoreError::InvalidConfig {
            reason: "persisted sector size differs from configuration",
        });
    }
    if key.class != config.source_class(key.id) {
        warn!(
            "Sensor {} found under {} but configured as {}",
            key.id,
            key.class,
            config.source_class(key.id)
        );
    }

    let (first, end) = match (sectors.first(), sectors.last()) {
        (Some(first), Some(last)) => (first.first_index, last.end_index()),
        _ => (0, 0),
    };
    let (meta_tail, meta_head) = meta.map_or((first, end), |m| (m.tail, m.head));

    let tail = meta_tail.max(first);
    let (cursors, lost) = if tail >= end {
        // Everything on disk is acknowledged; keep counting from the old head
        let head = meta_head.max(end);
        (
            Cursors {
                tail: head,
                pending: head,
                head,
            },
            meta_head.saturating_sub(meta_tail.max(end)),
        )
    } else {
        (
            Cursors {
                tail,
                pending: tail,
                head: end,
            },
            meta_head.saturating_sub(end),
        )
    };

    let mut stats = meta.map(|m| m.stats).unwrap_or_default();
    stats.dropped_records += lost;
    stats.dropped_sectors += discarded_sectors;
    if crc_failure {
        stats.crc_failures += 1;
    }

    let spilled = sectors.len();
    let mut chain = SectorChain::recovered(key.id, kind, sectors, file_slots, meta.map_or(0, |m| m.next_seq));
    chain.trim(cursors.tail);

    if lost > 0 || discarded_sectors > 0 {
        warn!(
            "Sensor {}: recovery lost {} records and discarded {} sectors",
            key.id, lost, discarded_sectors
        );
    }
    info!(
        "Recovered sensor {} ({}): {} sectors on disk, tail {} head {}",
        key.id, key.class, spilled, cursors.tail, cursors.head
    );

    let store = SensorStore::restore(key, kind, config.sector_size, chain, cursors, stats);
    store.mark_meta_dirty();
    Ok(Some(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec;

    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    use crate::backend::{META_VERSION, MemoryBackend, SensorMeta};
    use crate::chain::SpilledSector;
    use crate::config::RetentionPolicy;

    const SECTOR: usize = 128;
    /// Time-series records per 128-byte sector
    const PER_SECTOR: u64 = 22;

    #[derive(Default)]
    struct Disk {
        files: BTreeMap<SensorId, Vec<Vec<u8>>>,
        metas: BTreeMap<SensorId, SensorMeta>,
        /// Every metadata write in the order it landed
        meta_log: Vec<SensorMeta>,
        fail_writes: bool,
        recovered: Vec<RecoveredSensor>,
    }

    /// Durable backend keeping "files" in memory
    #[derive(Clone)]
    struct TestBackend {
        disk: Arc<Mutex<CriticalSectionRawMutex, RefCell<Disk>>>,
    }

    impl Default for TestBackend {
        fn default() -> Self {
            Self {
                disk: Arc::new(Mutex::new(RefCell::new(Disk::default()))),
            }
        }
    }

    impl TestBackend {
        fn with<R>(&self, f: impl FnOnce(&mut Disk) -> R) -> R {
            self.disk.lock(|cell| f(&mut cell.borrow_mut()))
        }

        fn slots(&self, id: SensorId) -> usize {
            self.with(|d| d.files.get(&id).map_or(0, Vec::len))
        }
    }

    impl SectorBackend for TestBackend {
        fn is_durable(&self) -> bool {
            true
        }

        fn write_sector(&self, key: SensorKey, slot: u32, image: &[u8]) -> StoreResult<()> {
            self.with(|d| {
                if d.fail_writes {
                    return Err(StoreError::DiskWriteFailed {
                        sensor_id: key.id,
                        op: "write sector",
                    });
                }
                let file = d.files.entry(key.id).or_default();
                if file.len() <= slot as usize {
                    file.resize(slot as usize + 1, Vec::new());
                }
                file[slot as usize] = image.to_vec();
                Ok(())
            })
        }

        fn read_sector(&self, key: SensorKey, slot: u32, out: &mut [u8]) -> StoreResult<()> {
            self.with(|d| {
                let image = d
                    .files
                    .get(&key.id)
                    .and_then(|f| f.get(slot as usize))
                    .filter(|image| image.len() == out.len())
                    .ok_or(StoreError::DiskReadFailed {
                        sensor_id: key.id,
                        op: "read sector",
                    })?;
                out.copy_from_slice(image);
                Ok(())
            })
        }

        fn write_meta(&self, key: SensorKey, meta: &SensorMeta) -> StoreResult<()> {
            self.with(|d| {
                if d.fail_writes {
                    return Err(StoreError::DiskWriteFailed {
                        sensor_id: key.id,
                        op: "write metadata",
                    });
                }
                d.metas.insert(key.id, *meta);
                d.meta_log.push(*meta);
                Ok(())
            })
        }

        fn discard_front(&self, key: SensorKey, slots: u32, total: u32) -> StoreResult<()> {
            self.with(|d| {
                let file = d.files.entry(key.id).or_default();
                file.truncate(total as usize);
                let dead = (slots as usize).min(file.len());
                file.drain(..dead);
                Ok(())
            })
        }

        fn class_usage(&self, class: SourceClass) -> u64 {
            if class == SourceClass::Bus {
                return 0;
            }
            self.with(|d| d.files.values().map(|f| (f.len() * SECTOR) as u64).sum())
        }

        fn recover(&self) -> StoreResult<Vec<RecoveredSensor>> {
            Ok(self.with(|d| core::mem::take(&mut d.recovered)))
        }
    }

    type RamManager = StorageManager<CriticalSectionRawMutex, MemoryBackend>;
    type DiskManager = StorageManager<CriticalSectionRawMutex, TestBackend>;

    fn constrained(capacity: usize, overflow: OverflowPolicy) -> RamManager {
        let config = StorageConfig {
            sector_size: SECTOR,
            pool_capacity: capacity,
            overflow,
            ..StorageConfig::constrained()
        };
        RamManager::new(config, MemoryBackend).unwrap()
    }

    fn filesystem(capacity: usize, threshold_pct: u8, quota: u64) -> (DiskManager, TestBackend) {
        let backend = TestBackend::default();
        let config = StorageConfig {
            sector_size: SECTOR,
            pool_capacity: capacity,
            ram_threshold_pct: threshold_pct,
            disk_quota_bytes: quota,
            retention: RetentionPolicy {
                seal_idle_ticks: 1_000,
                pending_lease_ticks: None,
            },
            ..StorageConfig::filesystem()
        };
        (DiskManager::new(config, backend.clone()).unwrap(), backend)
    }

    fn fill<B: SectorBackend>(manager: &StorageManager<CriticalSectionRawMutex, B>, id: SensorId, n: u64) {
        for i in 0..n {
            manager.append(id, Record::time_series(i as f32)).unwrap();
        }
    }

    #[test]
    fn test_platform_and_backend_must_agree() {
        let config = StorageConfig {
            sector_size: SECTOR,
            ..StorageConfig::filesystem()
        };
        assert!(matches!(
            RamManager::new(config, MemoryBackend),
            Err(StoreError::InvalidConfig { .. })
        ));
        assert!(matches!(
            DiskManager::new(StorageConfig::constrained(), TestBackend::default()),
            Err(StoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_drop_oldest_frees_exactly_one_sector() {
        let manager = constrained(4, OverflowPolicy::DropOldest);
        fill(&manager, 1, 4 * PER_SECTOR);
        assert_eq!(manager.pool_stats().in_use, 4);

        manager.append(1, Record::time_series(-1.0)).unwrap();

        let stats = manager.sensor_stats(1).unwrap();
        assert_eq!(manager.pool_stats().in_use, 4);
        assert_eq!(manager.pool_stats().exhausted_events, 1);
        assert_eq!(stats.dropped_sectors, 1);
        assert_eq!(stats.dropped_records, PER_SECTOR);
        assert_eq!(
            manager.cursors(1).unwrap(),
            Cursors {
                tail: PER_SECTOR,
                pending: PER_SECTOR,
                head: 4 * PER_SECTOR + 1,
            }
        );
        assert_eq!(
            manager.consume_next(1).unwrap().unwrap(),
            ConsumedRecord {
                index: PER_SECTOR,
                record: Record::time_series(PER_SECTOR as f32),
            }
        );
    }

    #[test]
    fn test_tick_on_full_idle_pool_keeps_data() {
        let manager = constrained(4, OverflowPolicy::DropOldest);
        fill(&manager, 1, 4 * PER_SECTOR);
        assert_eq!(manager.pool_stats().in_use, 4);

        for _ in 0..3 {
            assert_eq!(manager.tick().evicted, 0);
        }
        assert_eq!(manager.sensor_stats(1).unwrap().dropped_records, 0);
        assert_eq!(
            manager.cursors(1).unwrap(),
            Cursors {
                tail: 0,
                pending: 0,
                head: 4 * PER_SECTOR,
            }
        );

        // The next record still costs exactly one sector
        manager.append(1, Record::time_series(-1.0)).unwrap();
        assert_eq!(manager.sensor_stats(1).unwrap().dropped_records, PER_SECTOR);
        assert_eq!(manager.cursors(1).unwrap().tail, PER_SECTOR);
    }

    #[test]
    fn test_drop_oldest_picks_globally_oldest_sector() {
        let manager = constrained(4, OverflowPolicy::DropOldest);
        fill(&manager, 1, PER_SECTOR + 1);
        manager.tick();
        fill(&manager, 2, 2 * PER_SECTOR);

        manager.append(2, Record::time_series(0.5)).unwrap();
        assert_eq!(manager.sensor_stats(1).unwrap().dropped_sectors, 1);
        assert_eq!(manager.sensor_stats(2).unwrap().dropped_sectors, 0);
    }

    #[test]
    fn test_reject_new_keeps_existing_data() {
        let manager = constrained(4, OverflowPolicy::RejectNew);
        fill(&manager, 1, 4 * PER_SECTOR);

        assert_eq!(
            manager.append(1, Record::time_series(1.0)),
            Err(StoreError::PoolExhausted { capacity: 4 })
        );
        let stats = manager.sensor_stats(1).unwrap();
        assert_eq!(stats.dropped_records, 1);
        assert_eq!(manager.cursors(1).unwrap().head, 4 * PER_SECTOR);
        assert_eq!(manager.cursors(1).unwrap().tail, 0);
    }

    #[test]
    fn test_invalid_and_mismatched_records_rejected() {
        let manager = constrained(4, OverflowPolicy::DropOldest);
        assert!(matches!(
            manager.append(1, Record::time_series(f32::NAN)),
            Err(StoreError::InvalidRecord { .. })
        ));
        manager.append(1, Record::time_series(1.0)).unwrap();
        assert_eq!(
            manager.append(1, Record::event(1.0, 5)),
            Err(StoreError::KindMismatch { sensor_id: 1 })
        );
        assert_eq!(manager.cursors(1).unwrap().head, 1);
    }

    #[test]
    fn test_sensor_table_is_bounded() {
        let manager = constrained(MAX_SENSORS + 1, OverflowPolicy::DropOldest);
        for id in 0..MAX_SENSORS as SensorId {
            manager.append(id, Record::time_series(0.0)).unwrap();
        }
        assert_eq!(
            manager.append(MAX_SENSORS as SensorId, Record::time_series(0.0)),
            Err(StoreError::TooManySensors { max: MAX_SENSORS })
        );
        assert_eq!(manager.sensor_ids().len(), MAX_SENSORS);
    }

    #[test]
    fn test_consume_erase_cycle_returns_sectors() {
        let manager = constrained(8, OverflowPolicy::DropOldest);
        fill(&manager, 3, 60);
        assert_eq!(manager.pool_stats().in_use, 3);

        let batch = manager.consume_batch(3, 50).unwrap();
        assert_eq!(batch.first_index, 0);
        assert_eq!(batch.len(), 50);
        assert_eq!(manager.erase_all_pending(3).unwrap(), 50);
        assert_eq!(manager.erase_all_pending(3).unwrap(), 0);

        // Sectors 0 and 1 lie entirely behind tail
        assert_eq!(manager.pool_stats().in_use, 1);
        assert_eq!(manager.cursors(3).unwrap().tail, 50);
    }

    #[test]
    fn test_unknown_sensor_reads_empty() {
        let manager = constrained(4, OverflowPolicy::DropOldest);
        assert!(manager.consume_next(9).unwrap().is_none());
        assert!(manager.consume_batch(9, 10).unwrap().is_empty());
        assert_eq!(manager.erase_all_pending(9).unwrap(), 0);
        assert_eq!(manager.diagnostic_read_at(9, 0).unwrap(), None);
        assert!(manager.cursors(9).is_none());
    }

    #[test]
    fn test_lease_expiry_on_tick() {
        let config = StorageConfig {
            sector_size: SECTOR,
            retention: RetentionPolicy {
                seal_idle_ticks: 100,
                pending_lease_ticks: Some(3),
            },
            ..StorageConfig::constrained()
        };
        let manager = RamManager::new(config, MemoryBackend).unwrap();
        fill(&manager, 1, 10);
        manager.consume_batch(1, 4).unwrap();

        let mut expired = 0;
        for _ in 0..3 {
            expired += manager.tick().leases_expired;
        }
        assert_eq!(expired, 1);
        assert_eq!(manager.cursors(1).unwrap().pending, 0);
        assert_eq!(manager.health().lease_expirations, 1);
    }

    #[test]
    fn test_idle_head_is_sealed_by_tick() {
        let config = StorageConfig {
            sector_size: SECTOR,
            retention: RetentionPolicy {
                seal_idle_ticks: 2,
                pending_lease_ticks: None,
            },
            ..StorageConfig::constrained()
        };
        let manager = RamManager::new(config, MemoryBackend).unwrap();
        fill(&manager, 1, 5);
        assert_eq!(manager.tick().sealed, 0);
        assert_eq!(manager.tick().sealed, 1);
        assert_eq!(manager.sensor_stats(1).unwrap().sealed_sectors, 1);
    }

    #[test]
    fn test_pressure_flushes_oldest_until_below_threshold() {
        let (manager, backend) = filesystem(8, 50, 0);
        fill(&manager, 1, 5 * PER_SECTOR);
        assert_eq!(manager.pool_stats().in_use, 5);

        let report = manager.tick();
        assert_eq!(report.flushed, 2);
        assert_eq!(manager.pool_stats().in_use, 3);
        assert_eq!(manager.sector_counts(1), Some((3, 2)));
        assert_eq!(backend.slots(1), 2);
        assert_eq!(backend.with(|d| d.metas[&1].file_slots), 2);

        // Reads cross from the data file into RAM transparently
        let batch = manager.consume_batch(1, 50).unwrap();
        assert_eq!(batch.len(), 50);
        for record in batch.indexed() {
            assert_eq!(record.record, Record::time_series(record.index as f32));
        }
        assert_eq!(
            manager.diagnostic_read_at(1, 3).unwrap(),
            Some(Record::time_series(3.0))
        );
    }

    #[test]
    fn test_corrupt_spilled_sector_is_dropped_once() {
        let backend = TestBackend::default();
        let config = StorageConfig {
            sector_size: SECTOR,
            pool_capacity: 8,
            ram_threshold_pct: 50,
            disk_quota_bytes: 0,
            retention: RetentionPolicy {
                seal_idle_ticks: 1_000,
                pending_lease_ticks: Some(2),
            },
            ..StorageConfig::filesystem()
        };
        let manager = DiskManager::new(config, backend.clone()).unwrap();
        fill(&manager, 1, 5 * PER_SECTOR);
        assert_eq!(manager.tick().flushed, 2);

        // Flip one payload bit of slot 0
        backend.with(|d| d.files.get_mut(&1).unwrap()[0][100] ^= 0x04);

        let batch = manager.consume_batch(1, 10).unwrap();
        assert_eq!(batch.first_index, PER_SECTOR);
        assert_eq!(batch.len(), 10);
        assert_eq!(
            manager.cursors(1).unwrap(),
            Cursors {
                tail: PER_SECTOR,
                pending: PER_SECTOR + 10,
                head: 5 * PER_SECTOR,
            }
        );

        assert_eq!(manager.rollback_pending(1).unwrap(), 10);
        let again = manager.consume_batch(1, 10).unwrap();
        assert_eq!(again.first_index, PER_SECTOR);
        let stats = manager.sensor_stats(1).unwrap();
        assert_eq!(stats.dropped_records, PER_SECTOR);
        assert_eq!(stats.dropped_sectors, 1);
        assert_eq!(stats.crc_failures, 1);

        // Records handed out after the discard are still leased
        let expired: u32 = (0..3).map(|_| manager.tick().leases_expired).sum();
        assert_eq!(expired, 1);
        assert_eq!(manager.cursors(1).unwrap().pending, PER_SECTOR);
    }

    #[test]
    fn test_corrupt_sector_behind_in_flight_records() {
        let (manager, backend) = filesystem(8, 50, 0);
        fill(&manager, 1, 5 * PER_SECTOR);
        assert_eq!(manager.tick().flushed, 2);
        backend.with(|d| d.files.get_mut(&1).unwrap()[1][100] ^= 0x04);

        let first = manager.consume_batch(1, 30).unwrap();
        assert_eq!((first.first_index, first.len()), (0, PER_SECTOR as usize));
        let second = manager.consume_batch(1, 30).unwrap();
        assert_eq!((second.first_index, second.len()), (2 * PER_SECTOR, 30));

        // Redelivery steps over the discarded range without counting it again
        assert_eq!(manager.rollback_pending(1).unwrap(), 2 * PER_SECTOR + 30);
        let resent = manager.consume_batch(1, 30).unwrap();
        assert_eq!((resent.first_index, resent.len()), (0, PER_SECTOR as usize));
        assert_eq!(manager.consume_batch(1, 30).unwrap().first_index, 2 * PER_SECTOR);
        assert_eq!(manager.diagnostic_read_at(1, PER_SECTOR + 3).unwrap(), None);

        let stats = manager.sensor_stats(1).unwrap();
        assert_eq!(stats.dropped_records, PER_SECTOR);
        assert_eq!(stats.dropped_sectors, 1);
        assert_eq!(stats.crc_failures, 1);

        assert_eq!(manager.erase_all_pending(1).unwrap(), 2 * PER_SECTOR + 30);
        assert_eq!(manager.cursors(1).unwrap().tail, 2 * PER_SECTOR + 30);
    }

    #[test]
    fn test_flush_to_backend_on_exhaustion() {
        let (manager, backend) = filesystem(4, 100, 0);
        fill(&manager, 1, 4 * PER_SECTOR);
        manager.append(1, Record::time_series(7.0)).unwrap();

        assert_eq!(backend.slots(1), 1);
        assert_eq!(manager.sensor_stats(1).unwrap().dropped_records, 0);
        assert_eq!(manager.cursors(1).unwrap().tail, 0);
    }

    #[test]
    fn test_failing_flushes_back_off_and_degrade() {
        let (manager, backend) = filesystem(8, 50, 0);
        fill(&manager, 1, 5 * PER_SECTOR);
        backend.with(|d| d.fail_writes = true);

        // Attempts at ticks 1, 3 and 7
        let failures: u32 = (0..7).map(|_| manager.tick().flush_failures).sum();
        assert_eq!(failures, 3);
        let health = manager.health();
        assert_eq!(health.degraded_sensors, 1);
        assert_eq!(health.write_failures, 3);
        assert_eq!(manager.pool_stats().in_use, 5);

        backend.with(|d| d.fail_writes = false);
        let flushed: u32 = (7..15).map(|_| manager.tick().flushed).sum();
        assert_eq!(flushed, 2);
        assert_eq!(manager.health().degraded_sensors, 0);
    }

    #[test]
    fn test_metadata_writes_land_in_snapshot_order() {
        extern crate std;
        use core::sync::atomic::AtomicBool;

        const TOTAL: u64 = 40 * PER_SECTOR;
        // Appends flush inline while ticks and acknowledgements race them
        let (manager, backend) = filesystem(4, 100, 0);
        let drained = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut index = 0;
                while index < TOTAL {
                    match manager.append(1, Record::time_series(index as f32)) {
                        Ok(()) => index += 1,
                        Err(StoreError::PoolExhausted { .. }) => std::thread::yield_now(),
                        Err(err) => panic!("append failed: {err}"),
                    }
                }
            });
            scope.spawn(|| {
                for _ in 0..1_000_000 {
                    if manager.cursors(1).is_some_and(|c| c.tail == TOTAL) {
                        break;
                    }
                    if !manager.consume_batch(1, 32).unwrap().is_empty() {
                        manager.erase_all_pending(1).unwrap();
                    }
                }
                drained.store(true, Ordering::Release);
            });
            scope.spawn(|| {
                for _ in 0..1_000_000 {
                    if drained.load(Ordering::Acquire) {
                        break;
                    }
                    manager.tick();
                }
            });
        });
        assert_eq!(manager.cursors(1).unwrap().tail, TOTAL);
        manager.tick();

        let tails: Vec<u64> = backend.with(|d| d.meta_log.iter().map(|m| m.tail).collect());
        assert!(tails.len() > 1);
        assert!(tails.windows(2).all(|w| w[0] <= w[1]), "persisted tail went backwards");
        assert_eq!(backend.with(|d| d.metas[&1].tail), TOTAL);
    }

    #[test]
    fn test_quota_drops_oldest_spilled_sectors() {
        let quota = 2 * SECTOR as u64;
        let (manager, backend) = filesystem(8, 25, quota);
        fill(&manager, 1, 6 * PER_SECTOR);

        let report = manager.tick();
        assert_eq!(report.flushed, 5);
        assert_eq!(report.quota_drops, 3);
        assert!(backend.class_usage(SourceClass::Host) <= quota);

        let stats = manager.sensor_stats(1).unwrap();
        assert_eq!(stats.dropped_records, 3 * PER_SECTOR);
        assert_eq!(manager.cursors(1).unwrap().tail, 3 * PER_SECTOR);
        assert_eq!(manager.health().quota_drops, 3);

        let next = manager.consume_next(1).unwrap().unwrap();
        assert_eq!(next.index, 3 * PER_SECTOR);
    }

    #[test]
    fn test_erase_compacts_fully_dead_file() {
        let (manager, backend) = filesystem(8, 25, 0);
        fill(&manager, 1, 3 * PER_SECTOR);
        manager.tick();
        assert_eq!(backend.slots(1), 2);

        manager.consume_batch(1, 2 * PER_SECTOR as usize).unwrap();
        manager.erase_all_pending(1).unwrap();
        assert_eq!(backend.slots(1), 0);
        assert_eq!(manager.sector_counts(1), Some((1, 0)));
    }

    #[test]
    fn test_shutdown_seals_and_flushes_everything() {
        let (manager, backend) = filesystem(8, 80, 0);
        fill(&manager, 1, 30);
        fill(&manager, 2, 5);

        let health = manager.shutdown();
        assert_eq!(health.state, LifecycleState::Stopped);
        assert_eq!(manager.pool_stats().in_use, 0);
        assert_eq!(backend.slots(1), 2);
        assert_eq!(backend.slots(2), 1);
        assert_eq!(backend.with(|d| d.metas[&1].head), 30);

        assert_eq!(
            manager.append(1, Record::time_series(0.0)),
            Err(StoreError::NotRunning)
        );
        assert_eq!(manager.consume_next(1), Err(StoreError::NotRunning));
        // A second shutdown is harmless
        assert_eq!(manager.shutdown().state, LifecycleState::Stopped);
    }

    #[test]
    fn test_recovery_clamps_cursors() {
        let backend = TestBackend::default();
        let key = SensorKey {
            id: 3,
            class: SourceClass::Host,
        };
        let sectors = vec![
            SpilledSector {
                seq: 0,
                slot: 0,
                first_index: 0,
                count: PER_SECTOR as u32,
                sealed_tick: 1,
            },
            SpilledSector {
                seq: 1,
                slot: 1,
                first_index: PER_SECTOR,
                count: PER_SECTOR as u32,
                sealed_tick: 2,
            },
        ];
        let meta = SensorMeta {
            version: META_VERSION,
            sensor_id: 3,
            class: SourceClass::Host,
            kind: RecordKind::TimeSeries,
            sector_size: SECTOR as u32,
            tail: 5,
            pending: 30,
            head: 100,
            file_slots: 2,
            next_seq: 3,
            stats: SensorStats::default(),
        };
        backend.with(|d| {
            d.recovered.push(RecoveredSensor {
                key,
                meta: Some(meta),
                kind: Some(RecordKind::TimeSeries),
                sectors,
                file_slots: 2,
                discarded_sectors: 1,
                crc_failure: true,
                io_failures: 0,
            })
        });

        let config = StorageConfig {
            sector_size: SECTOR,
            ..StorageConfig::filesystem()
        };
        let manager = DiskManager::new(config, backend.clone()).unwrap();

        assert_eq!(
            manager.cursors(3).unwrap(),
            Cursors {
                tail: 5,
                pending: 5,
                head: 2 * PER_SECTOR,
            }
        );
        let stats = manager.sensor_stats(3).unwrap();
        assert_eq!(stats.dropped_records, 100 - 2 * PER_SECTOR);
        assert_eq!(stats.crc_failures, 1);
        assert_eq!(manager.health().recovery_discards, 1);

        manager.append(3, Record::time_series(1.0)).unwrap();
        assert_eq!(manager.cursors(3).unwrap().head, 2 * PER_SECTOR + 1);
        assert_eq!(manager.sector_counts(3), Some((1, 2)));

        // Recovered metadata is rewritten on the first tick
        assert_eq!(manager.tick().meta_written, 1);
        assert_eq!(backend.with(|d| d.metas[&3].pending), 5);
    }

    #[test]
    fn test_recovery_of_fully_acknowledged_sensor() {
        let backend = TestBackend::default();
        let meta = SensorMeta {
            version: META_VERSION,
            sensor_id: 4,
            class: SourceClass::Host,
            kind: RecordKind::Event,
            sector_size: SECTOR as u32,
            tail: 40,
            pending: 40,
            head: 40,
            file_slots: 0,
            next_seq: 6,
            stats: SensorStats::default(),
        };
        backend.with(|d| {
            d.recovered.push(RecoveredSensor {
                key: SensorKey {
                    id: 4,
                    class: SourceClass::Host,
                },
                meta: Some(meta),
                kind: Some(RecordKind::Event),
                sectors: Vec::new(),
                file_slots: 0,
                discarded_sectors: 0,
                crc_failure: false,
                io_failures: 0,
            })
        });
        let config = StorageConfig {
            sector_size: SECTOR,
            ..StorageConfig::filesystem()
        };
        let manager = DiskManager::new(config, backend).unwrap();

        // Indices keep counting from the persisted head
        manager.append(4, Record::event(2.0, 1_700_000_000_000)).unwrap();
        let next = manager.consume_next(4).unwrap().unwrap();
        assert_eq!(next.index, 40);
        assert!(manager.health().is_clean());
    }
}
