//! Disk-backed sector persistence
//!
//! Layout under the storage root, one subdirectory per source class:
//!
//! ```text
//! <root>/host/sensor_<id>.dat    sealed sector images, one per slot
//! <root>/host/sensor_<id>.meta   postcard metadata + CRC32C trailer
//! <root>/bus/...
//! ```
//!
//! Data files only grow at the end. Slot `n` lives at byte `n * sector_size`
//! and is written with a positional write followed by `sync_data`, so a torn
//! write stays inside one slot and fails its CRC on the next scan. Metadata
//! and compacted data files are written to a temporary file, synced and
//! renamed over the live file, then the directory is synced.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use sectorstore_core::backend::{RecoveredSensor, SectorBackend, SensorKey, SensorMeta};
use sectorstore_core::chain::SpilledSector;
use sectorstore_core::config::SourceClass;
use sectorstore_core::sector::validate_image;
use sectorstore_core::{SensorId, StoreError, StoreResult};

const DATA_EXT: &str = "dat";
const META_EXT: &str = "meta";
const TMP_SUFFIX: &str = ".tmp";

fn write_failed(key: SensorKey, op: &'static str, err: io::Error) -> StoreError {
    error!("Sensor {} ({}): {} failed: {}", key.id, key.class, op, err);
    StoreError::DiskWriteFailed {
        sensor_id: key.id,
        op,
    }
}

fn read_failed(key: SensorKey, op: &'static str, err: io::Error) -> StoreError {
    error!("Sensor {} ({}): {} failed: {}", key.id, key.class, op, err);
    StoreError::DiskReadFailed {
        sensor_id: key.id,
        op,
    }
}

/// Syncs a directory so renames and new entries in it are durable
fn fsync_dir(path: &Path) -> io::Result<()> {
    match File::open(path).and_then(|dir| dir.sync_all()) {
        Ok(()) => Ok(()),
        // Some filesystems refuse fsync on directories
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
            ) =>
        {
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Parses `sensor_<id>.dat` / `sensor_<id>.meta`
fn parse_sensor_file(name: &str) -> Option<SensorId> {
    let (stem, ext) = name.strip_prefix("sensor_")?.rsplit_once('.')?;
    if ext != DATA_EXT && ext != META_EXT {
        return None;
    }
    stem.parse().ok()
}

/// [`SectorBackend`] over per-sensor files in class subdirectories
#[derive(Debug, Clone)]
pub struct DiskBackend {
    root: PathBuf,
    sector_size: usize,
}

impl DiskBackend {
    /// Opens (creating if needed) a storage root for `sector_size` sectors
    ///
    /// Directory failures have no sensor to blame and report sensor id 0.
    pub fn open(root: impl AsRef<Path>, sector_size: usize) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        for class in SourceClass::ALL {
            let dir = root.join(class.dir_name());
            fs::create_dir_all(&dir).map_err(|err| {
                error!("Creating {} failed: {}", dir.display(), err);
                StoreError::DiskWriteFailed {
                    sensor_id: 0,
                    op: "create storage directory",
                }
            })?;
        }
        if let Err(err) = fsync_dir(&root) {
            warn!("Syncing {} failed: {}", root.display(), err);
        }
        Ok(Self { root, sector_size })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn class_dir(&self, class: SourceClass) -> PathBuf {
        self.root.join(class.dir_name())
    }

    pub fn data_path(&self, key: SensorKey) -> PathBuf {
        self.class_dir(key.class)
            .join(format!("sensor_{}.{}", key.id, DATA_EXT))
    }

    pub fn meta_path(&self, key: SensorKey) -> PathBuf {
        self.class_dir(key.class)
            .join(format!("sensor_{}.{}", key.id, META_EXT))
    }

    fn slot_offset(&self, slot: u32) -> u64 {
        slot as u64 * self.sector_size as u64
    }

    /// Temp file next to `target`, removed on drop unless persisted
    fn temp_for(&self, key: SensorKey, target: &Path) -> StoreResult<tempfile::NamedTempFile> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tempfile::Builder::new()
            .prefix(&format!("{name}."))
            .suffix(TMP_SUFFIX)
            .tempfile_in(self.class_dir(key.class))
            .map_err(|err| write_failed(key, "create temp file", err))
    }

    /// Syncs `temp`, renames it over `target` and syncs the directory
    fn persist(&self, key: SensorKey, temp: tempfile::NamedTempFile, target: &Path) -> StoreResult<()> {
        temp.as_file()
            .sync_all()
            .map_err(|err| write_failed(key, "sync temp file", err))?;
        temp.persist(target)
            .map_err(|err| write_failed(key, "rename temp file", err.error))?;
        fsync_dir(&self.class_dir(key.class)).map_err(|err| write_failed(key, "sync directory", err))
    }

    fn read_meta(&self, key: SensorKey) -> StoreResult<Option<SensorMeta>> {
        match fs::read(self.meta_path(key)) {
            Ok(bytes) => match SensorMeta::decode(&bytes, key.id) {
                Ok(meta) => Ok(Some(meta)),
                Err(err) => {
                    warn!("Sensor {}: {}, rebuilding from data file", key.id, err);
                    Ok(None)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(read_failed(key, "read metadata", err)),
        }
    }

    /// Validates the data file slot by slot and cuts it at the first bad one
    ///
    /// I/O errors stay inside this sensor: an unreadable metadata file is
    /// treated as missing, and a data file that cannot be opened or read is
    /// cut at the failing slot. Each one is logged and counted.
    fn recover_sensor(&self, key: SensorKey) -> RecoveredSensor {
        let mut found = RecoveredSensor {
            key,
            meta: None,
            kind: None,
            sectors: Vec::new(),
            file_slots: 0,
            discarded_sectors: 0,
            crc_failure: false,
            io_failures: 0,
        };
        match self.read_meta(key) {
            Ok(meta) => found.meta = meta,
            Err(_) => found.io_failures += 1,
        }
        let meta = found.meta;

        let path = self.data_path(key);
        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .and_then(|file| file.metadata().map(|stat| (file, stat.len())));
        let (file, len) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    error!("Sensor {} ({}): opening data file failed: {}", key.id, key.class, err);
                    found.io_failures += 1;
                }
                found.kind = meta.map(|m| m.kind);
                return found;
            }
        };
        let whole_slots = (len / self.sector_size as u64) as u32;
        let torn_tail = len % self.sector_size as u64 != 0;

        let mut image = vec![0u8; self.sector_size];
        let mut previous: Option<(u32, u64)> = None;
        let mut valid_slots = 0;
        let mut unreadable = false;
        for slot in 0..whole_slots {
            if let Err(err) = file.read_exact_at(&mut image, self.slot_offset(slot)) {
                error!("Sensor {}: reading slot {} failed: {}, cutting the chain there", key.id, slot, err);
                found.io_failures += 1;
                unreadable = true;
                break;
            }

            let header = match validate_image(&image, self.sector_size, key.id) {
                Ok(header) => header,
                Err(err) => {
                    found.crc_failure = matches!(err, StoreError::CrcMismatch { .. });
                    warn!(
                        "Sensor {}: slot {} of {} is invalid ({}), discarding it and all later slots",
                        key.id, slot, whole_slots, err
                    );
                    break;
                }
            };
            if found.kind.is_some_and(|kind| kind != header.kind) {
                warn!("Sensor {}: record kind changes at slot {}", key.id, slot);
                break;
            }
            if let Some((seq, end)) = previous {
                if header.seq <= seq || header.first_index < end {
                    warn!(
                        "Sensor {}: slot {} is out of sequence (seq {} after {})",
                        key.id, slot, header.seq, seq
                    );
                    break;
                }
                if header.first_index > end {
                    // Older sectors were dropped from RAM before this one was
                    // flushed; they are dead space now
                    found.sectors.clear();
                }
            }

            found.kind = Some(header.kind);
            previous = Some((header.seq, header.end_index()));
            found.sectors.push(SpilledSector {
                seq: header.seq,
                slot,
                first_index: header.first_index,
                count: header.record_count as u32,
                sealed_tick: header.sealed_tick,
            });
            valid_slots = slot + 1;
        }

        // Slots past the cut are overwritten by the next flush either way;
        // unreadable ones are left on disk instead of being truncated
        found.file_slots = valid_slots;
        found.discarded_sectors = whole_slots - valid_slots + u32::from(torn_tail);
        if found.discarded_sectors > 0 && !unreadable {
            if let Err(err) = file
                .set_len(self.slot_offset(valid_slots))
                .and_then(|()| file.sync_all())
            {
                error!("Sensor {}: truncating data file failed: {}", key.id, err);
                found.io_failures += 1;
            }
        }

        match (found.kind, meta) {
            (None, Some(meta)) => found.kind = Some(meta.kind),
            (Some(kind), Some(meta)) if kind != meta.kind => {
                warn!("Sensor {}: metadata disagrees with sectors on record kind", key.id);
            }
            _ => {}
        }
        found
    }

    /// Removes leftovers of writes interrupted by a crash
    fn remove_stale_temp(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => info!("Removed stale temp file {}", path.display()),
            Err(err) => warn!("Removing {} failed: {}", path.display(), err),
        }
    }
}

impl SectorBackend for DiskBackend {
    fn is_durable(&self) -> bool {
        true
    }

    fn write_sector(&self, key: SensorKey, slot: u32, image: &[u8]) -> StoreResult<()> {
        if image.len() != self.sector_size {
            return Err(StoreError::CorruptSector {
                reason: "image length differs from sector size",
            });
        }

        let path = self.data_path(key);
        let created = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| write_failed(key, "open data file", err))?;
        file.write_all_at(image, self.slot_offset(slot))
            .map_err(|err| write_failed(key, "write sector", err))?;
        file.sync_data()
            .map_err(|err| write_failed(key, "sync sector", err))?;

        if created {
            fsync_dir(&self.class_dir(key.class)).map_err(|err| write_failed(key, "sync directory", err))?;
        }
        Ok(())
    }

    fn read_sector(&self, key: SensorKey, slot: u32, out: &mut [u8]) -> StoreResult<()> {
        let file = File::open(self.data_path(key)).map_err(|err| read_failed(key, "open data file", err))?;
        file.read_exact_at(out, self.slot_offset(slot))
            .map_err(|err| read_failed(key, "read sector", err))
    }

    fn write_meta(&self, key: SensorKey, meta: &SensorMeta) -> StoreResult<()> {
        let bytes = meta.encode()?;
        let target = self.meta_path(key);
        let mut temp = self.temp_for(key, &target)?;
        temp.write_all(&bytes)
            .map_err(|err| write_failed(key, "write metadata", err))?;
        self.persist(key, temp, &target)
    }

    fn discard_front(&self, key: SensorKey, slots: u32, total: u32) -> StoreResult<()> {
        if slots == 0 {
            return Ok(());
        }
        let path = self.data_path(key);

        if slots >= total {
            return match OpenOptions::new().write(true).open(&path) {
                Ok(file) => file
                    .set_len(0)
                    .and_then(|()| file.sync_all())
                    .map_err(|err| write_failed(key, "truncate data file", err)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(write_failed(key, "open data file", err)),
            };
        }

        let mut source = File::open(&path).map_err(|err| read_failed(key, "open data file", err))?;
        source
            .seek(SeekFrom::Start(self.slot_offset(slots)))
            .map_err(|err| read_failed(key, "seek data file", err))?;

        let mut temp = self.temp_for(key, &path)?;
        let live = self.slot_offset(total - slots);
        let copied = io::copy(&mut Read::take(&mut source, live), temp.as_file_mut())
            .map_err(|err| write_failed(key, "copy live sectors", err))?;
        if copied != live {
            warn!(
                "Sensor {}: data file shorter than expected ({} of {} bytes kept)",
                key.id, copied, live
            );
        }
        self.persist(key, temp, &path)
    }

    fn class_usage(&self, class: SourceClass) -> u64 {
        let dir = self.class_dir(class);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Listing {} failed: {}", dir.display(), err);
                return 0;
            }
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }

    fn recover(&self) -> StoreResult<Vec<RecoveredSensor>> {
        let mut recovered = Vec::new();
        for class in SourceClass::ALL {
            let dir = self.class_dir(class);
            let entries = fs::read_dir(&dir).map_err(|err| {
                error!("Scanning {} failed: {}", dir.display(), err);
                StoreError::DiskReadFailed {
                    sensor_id: 0,
                    op: "scan directory",
                }
            })?;

            let mut ids = BTreeSet::new();
            for entry in entries.filter_map(Result::ok) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(TMP_SUFFIX) {
                    self.remove_stale_temp(&entry.path());
                } else if let Some(id) = parse_sensor_file(&name) {
                    ids.insert(id);
                }
            }

            for id in ids {
                let found = self.recover_sensor(SensorKey { id, class });
                info!(
                    "Scanned sensor {} ({}): {} valid sectors, {} discarded, {} I/O errors",
                    id,
                    class,
                    found.sectors.len(),
                    found.discarded_sectors,
                    found.io_failures
                );
                recovered.push(found);
            }
        }
        Ok(recovered)
    }
}
