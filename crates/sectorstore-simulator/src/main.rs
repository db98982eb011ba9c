//! Desktop simulator for the sectorstore engine.
//!
//! Drives a storage manager the way gateway firmware would: producer threads
//! append synthetic sensor readings, an uploader thread drains and
//! acknowledges them, and the main thread ticks maintenance until the run
//! ends and the manager shuts down.
//!
//! Two runs are made back to back:
//!
//! | Run         | Lock                       | Backend         |
//! |-------------|----------------------------|-----------------|
//! | constrained | `CriticalSectionRawMutex`  | `MemoryBackend` |
//! | filesystem  | `StdRawMutex`              | `DiskBackend`   |
//!
//! Environment:
//!
//! - `RUST_LOG` controls verbosity (`info` is a good start)
//! - `SECTORSTORE_DIR` sets the storage root of the filesystem run; it
//!   defaults to a directory under the system temp dir and is reused, so a
//!   second run recovers what the first one left behind
//! - `SECTORSTORE_RUN_SECS` sets the length of each run

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use log::{debug, error, info, warn};

use sectorstore_core::{
    HealthReport, MemoryBackend, OverflowPolicy, Record, SectorBackend, SensorId, StorageConfig,
    StorageManager, StoreError, infer_timestamp,
};
use sectorstore_fs::open_host;

// ---------------------------------------------------------------------------
// Timing constants
// ---------------------------------------------------------------------------

/// Interval between maintenance ticks.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Sampling interval of the time-series sensors.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(5);

/// Interval between uploader passes.
const UPLOAD_INTERVAL: Duration = Duration::from_millis(250);

/// Records requested per `consume_batch` call.
const UPLOAD_BATCH: usize = 128;

/// Every n-th upload "fails" and is rolled back instead of acknowledged.
const FAILED_UPLOAD_EVERY: u32 = 7;

const DEFAULT_RUN_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Synthetic sensors
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Signal {
    /// 20–26 °C sinusoid with slow drift
    Temperature,
    /// 40–60 % with a different period
    Humidity,
    /// Door contact toggling every few seconds
    Door,
}

#[derive(Clone, Copy)]
struct MockSensor {
    id: SensorId,
    signal: Signal,
}

impl MockSensor {
    /// Record for the sample taken `t` seconds into the run.
    fn sample(&self, t: f64) -> Option<Record> {
        match self.signal {
            Signal::Temperature => {
                let value = 23.0 + 3.0 * (t / 2.0).sin() + 0.5 * (t / 0.7).cos();
                Some(Record::time_series(value as f32))
            }
            Signal::Humidity => {
                let value = 50.0 + 10.0 * (t / 3.0).sin() + 2.0 * (t / 0.4).cos();
                Some(Record::time_series(value as f32))
            }
            Signal::Door => {
                // One event per state change
                let open = (t / 1.5) as u64 % 2;
                let previous = ((t - SAMPLE_INTERVAL.as_secs_f64()) / 1.5).max(0.0) as u64 % 2;
                (open != previous).then(|| Record::event(open as f32, now_ms()))
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn sensors(bus_id_floor: SensorId) -> [MockSensor; 3] {
    [
        MockSensor {
            id: 1,
            signal: Signal::Temperature,
        },
        MockSensor {
            id: 2,
            signal: Signal::Humidity,
        },
        MockSensor {
            id: bus_id_floor + 1,
            signal: Signal::Door,
        },
    ]
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Appends samples of `sensor` until `stop` is raised.
fn produce<M, B>(manager: &StorageManager<M, B>, sensor: MockSensor, stop: &AtomicBool, rejected: &AtomicU64)
where
    M: RawMutex,
    B: SectorBackend,
{
    let started = Instant::now();
    while !stop.load(Ordering::Acquire) {
        if let Some(record) = sensor.sample(started.elapsed().as_secs_f64()) {
            match manager.append(sensor.id, record) {
                Ok(()) => {}
                Err(StoreError::PoolExhausted { .. }) => {
                    rejected.fetch_add(1, Ordering::Relaxed);
                }
                Err(StoreError::NotRunning) => break,
                Err(err) => {
                    error!("Sensor {}: append failed: {}", sensor.id, err);
                    break;
                }
            }
        }
        thread::sleep(SAMPLE_INTERVAL);
    }
}

/// Drains every sensor in batches until `stop` is raised.
///
/// Time-series records carry no timestamp; it is rebuilt from the run's
/// anchor and the record index.
fn upload<M, B>(manager: &StorageManager<M, B>, ids: &[SensorId], anchor_ms: u64, stop: &AtomicBool) -> u64
where
    M: RawMutex,
    B: SectorBackend,
{
    let interval_ms = SAMPLE_INTERVAL.as_millis() as u64;
    let mut uploads = 0u32;
    let mut delivered = 0u64;

    while !stop.load(Ordering::Acquire) {
        for &id in ids {
            let batch = match manager.consume_batch(id, UPLOAD_BATCH) {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => batch,
                Err(StoreError::NotRunning) => return delivered,
                Err(err) => {
                    warn!("Sensor {}: read failed: {}", id, err);
                    continue;
                }
            };

            uploads += 1;
            if uploads % FAILED_UPLOAD_EVERY == 0 {
                let reverted = manager.rollback_pending(id).unwrap_or(0);
                warn!("Sensor {}: upload failed, {} records will be resent", id, reverted);
                continue;
            }

            if let Some(first) = batch.indexed().next() {
                let at = match first.record {
                    Record::Event(event) => event.timestamp_ms,
                    Record::TimeSeries(_) => infer_timestamp(anchor_ms, interval_ms, first.index),
                };
                debug!(
                    "Sensor {}: uploading {} records from #{} (t={} ms)",
                    id,
                    batch.len(),
                    first.index,
                    at
                );
            }

            match manager.erase_all_pending(id) {
                Ok(erased) => delivered += erased,
                Err(err) => warn!("Sensor {}: acknowledge failed: {}", id, err),
            }
        }
        thread::sleep(UPLOAD_INTERVAL);
    }
    delivered
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

fn run<M, B>(name: &str, manager: &StorageManager<M, B>, duration: Duration) -> HealthReport
where
    M: RawMutex + Send + Sync,
    B: SectorBackend + Sync,
{
    let config = manager.config();
    info!(
        "[{}] {:?} platform, {} sectors of {} B, overflow {:?}",
        name, config.platform, config.pool_capacity, config.sector_size, config.overflow
    );

    let sensors = sensors(config.bus_id_floor);
    let ids: Vec<SensorId> = sensors.iter().map(|s| s.id).collect();
    let anchor_ms = now_ms();
    let stop_producers = AtomicBool::new(false);
    let stop_uploader = AtomicBool::new(false);
    let rejected = AtomicU64::new(0);

    let delivered = thread::scope(|scope| {
        for sensor in sensors {
            let (stop, rejected) = (&stop_producers, &rejected);
            scope.spawn(move || produce(manager, sensor, stop, rejected));
        }
        let uploader = scope.spawn(|| upload(manager, &ids, anchor_ms, &stop_uploader));

        let started = Instant::now();
        while started.elapsed() < duration {
            let report = manager.tick();
            if report.flushed > 0 || report.evicted > 0 || report.quota_drops > 0 {
                info!(
                    "[{}] tick {}: flushed {}, evicted {}, quota drops {}, pool {}%",
                    name,
                    report.tick,
                    report.flushed,
                    report.evicted,
                    report.quota_drops,
                    manager.health().pool_usage_pct
                );
            }
            thread::sleep(TICK_INTERVAL);
        }

        stop_producers.store(true, Ordering::Release);
        // Let the uploader catch up on the tail before stopping it
        thread::sleep(UPLOAD_INTERVAL * 2);
        stop_uploader.store(true, Ordering::Release);
        uploader.join().unwrap_or_else(|_| {
            error!("[{}] uploader panicked", name);
            0
        })
    });

    for &id in &ids {
        if let (Some(cursors), Some(stats)) = (manager.cursors(id), manager.sensor_stats(id)) {
            info!(
                "[{}] sensor {}: tail {} pending {} head {}, appended {}, flushed {} sectors",
                name,
                id,
                cursors.tail,
                cursors.pending,
                cursors.head,
                stats.appended,
                stats.flushed_sectors
            );
        }
    }

    let health = manager.shutdown();
    info!(
        "[{}] delivered {} records, {} appends rejected",
        name,
        delivered,
        rejected.load(Ordering::Relaxed)
    );
    health
}

fn log_health(name: &str, health: &HealthReport) {
    info!("[{}] health: {:?}", name, health);
    if !health.is_clean() {
        warn!(
            "[{}] data lost: {} records, {} sectors ({} CRC failures, {} write failures)",
            name, health.dropped_records, health.dropped_sectors, health.crc_failures, health.write_failures
        );
    }
}

fn storage_dir() -> PathBuf {
    std::env::var_os("SECTORSTORE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("sectorstore-simulator"))
}

fn run_duration() -> Duration {
    let secs = std::env::var("SECTORSTORE_RUN_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_RUN_SECS);
    Duration::from_secs(secs)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    info!("Starting sectorstore simulator");
    let duration = run_duration();

    // --- Constrained: small pool, RAM only, oldest data dropped ------------
    let constrained = StorageConfig {
        pool_capacity: 16,
        overflow: OverflowPolicy::DropOldest,
        ..StorageConfig::constrained()
    };
    match StorageManager::<CriticalSectionRawMutex, _>::new(constrained, MemoryBackend) {
        Ok(manager) => {
            let health = run("constrained", &manager, duration);
            log_health("constrained", &health);
        }
        Err(err) => error!("Constrained manager failed to start: {}", err),
    }

    // --- Filesystem: growable pool flushed to disk ---------------------------
    let root = storage_dir();
    let filesystem = StorageConfig {
        sector_size: 1024,
        pool_capacity: 32,
        disk_quota_bytes: 256 * 1024,
        ..StorageConfig::filesystem()
    };
    info!("Storage root: {}", root.display());
    match open_host(&root, filesystem) {
        Ok(manager) => {
            let recovered = manager.sensor_ids();
            if !recovered.is_empty() {
                info!("Recovered sensors from previous run: {:?}", recovered);
            }
            let health = run("filesystem", &manager, duration);
            log_health("filesystem", &health);
        }
        Err(err) => error!("Filesystem manager failed to start: {}", err),
    }

    info!("Simulator exiting");
}
