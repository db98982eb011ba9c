//! Sector persistence backends
//!
//! The platform split is a capability: the storage manager is generic over a
//! [`SectorBackend`] picked at construction time. [`MemoryBackend`] is the
//! microcontroller case with nothing behind the pool; the `sectorstore-fs`
//! crate provides the disk-backed implementation.
//!
//! Metadata files hold a [`SensorMeta`] encoded with postcard and followed by
//! a CRC32C trailer, so a torn or foreign file is rejected as a whole.

extern crate alloc;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::SensorId;
use crate::chain::SpilledSector;
use crate::config::SourceClass;
use crate::error::{StoreError, StoreResult};
use crate::record::RecordKind;
use crate::sector::crc32c;
use crate::store::SensorStats;

/// Current metadata layout version
pub const META_VERSION: u8 = 1;

/// Identifies a sensor's files on a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorKey {
    pub id: SensorId,
    pub class: SourceClass,
}

/// Cursor triple and chain topology persisted per sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorMeta {
    pub version: u8,
    pub sensor_id: SensorId,
    pub class: SourceClass,
    pub kind: RecordKind,
    pub sector_size: u32,
    pub tail: u64,
    pub pending: u64,
    pub head: u64,
    /// Sector images in the data file when the snapshot was taken
    pub file_slots: u32,
    pub next_seq: u32,
    pub stats: SensorStats,
}

impl SensorMeta {
    /// Postcard body followed by a little-endian CRC32C of the body
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut bytes = postcard::to_allocvec(self).map_err(|_| StoreError::CorruptMetadata {
            sensor_id: self.sensor_id,
        })?;
        let crc = crc32c(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8], sensor_id: SensorId) -> StoreResult<Self> {
        let corrupt = StoreError::CorruptMetadata { sensor_id };
        if bytes.len() < 4 {
            return Err(corrupt);
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(trailer);
        if crc32c(body) != u32::from_le_bytes(crc) {
            return Err(corrupt);
        }

        let meta: SensorMeta = postcard::from_bytes(body).map_err(|_| corrupt)?;
        if meta.version != META_VERSION || meta.sensor_id != sensor_id {
            return Err(corrupt);
        }
        Ok(meta)
    }
}

/// Everything the recovery scan found for one sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredSensor {
    pub key: SensorKey,
    /// Metadata, if present and intact
    pub meta: Option<SensorMeta>,
    /// Record kind taken from the sector headers or, failing that, the metadata
    pub kind: Option<RecordKind>,
    /// Valid sectors in file order
    pub sectors: Vec<SpilledSector>,
    /// Sector images kept in the data file after truncating at the first bad one
    pub file_slots: u32,
    /// Sectors cut off at and after the first failed validation
    pub discarded_sectors: u32,
    /// Whether the first failed validation was a CRC mismatch
    pub crc_failure: bool,
    /// Reads and truncations of this sensor's files that failed during the scan
    pub io_failures: u32,
}

/// Capability interface over the storage behind the pool
///
/// All methods take `&self` and may be called concurrently, including a
/// sector write racing reads of other slots of the same sensor.
pub trait SectorBackend {
    /// Whether sectors written here survive a restart
    fn is_durable(&self) -> bool;

    /// Writes and syncs one sealed sector image at `slot`
    fn write_sector(&self, key: SensorKey, slot: u32, image: &[u8]) -> StoreResult<()>;

    /// Reads the sector image at `slot` into `out`
    fn read_sector(&self, key: SensorKey, slot: u32, out: &mut [u8]) -> StoreResult<()>;

    /// Atomically replaces the sensor's metadata
    fn write_meta(&self, key: SensorKey, meta: &SensorMeta) -> StoreResult<()>;

    /// Removes the first `slots` images of a data file holding `total` images
    fn discard_front(&self, key: SensorKey, slots: u32, total: u32) -> StoreResult<()>;

    /// Bytes used by one source class
    fn class_usage(&self, class: SourceClass) -> u64;

    /// Scans persisted sensors after a restart
    ///
    /// Only a failure to list the storage itself is an error. Problems with
    /// one sensor's files are reported through [`RecoveredSensor`].
    fn recover(&self) -> StoreResult<Vec<RecoveredSensor>>;
}

/// Backend of the constrained platform: nothing leaves RAM
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBackend;

impl SectorBackend for MemoryBackend {
    fn is_durable(&self) -> bool {
        false
    }

    fn write_sector(&self, _key: SensorKey, _slot: u32, _image: &[u8]) -> StoreResult<()> {
        Err(StoreError::NotDurable)
    }

    fn read_sector(&self, _key: SensorKey, _slot: u32, _out: &mut [u8]) -> StoreResult<()> {
        Err(StoreError::NotDurable)
    }

    fn write_meta(&self, _key: SensorKey, _meta: &SensorMeta) -> StoreResult<()> {
        Err(StoreError::NotDurable)
    }

    fn discard_front(&self, _key: SensorKey, _slots: u32, _total: u32) -> StoreResult<()> {
        Err(StoreError::NotDurable)
    }

    fn class_usage(&self, _class: SourceClass) -> u64 {
        0
    }

    fn recover(&self) -> StoreResult<Vec<RecoveredSensor>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SensorMeta {
        SensorMeta {
            version: META_VERSION,
            sensor_id: 17,
            class: SourceClass::Host,
            kind: RecordKind::Event,
            sector_size: 4096,
            tail: 10,
            pending: 25,
            head: 400,
            file_slots: 3,
            next_seq: 5,
            stats: SensorStats {
                appended: 400,
                ..SensorStats::default()
            },
        }
    }

    #[test]
    fn test_meta_roundtrip() {
        let bytes = meta().encode().unwrap();
        assert_eq!(SensorMeta::decode(&bytes, 17).unwrap(), meta());
    }

    #[test]
    fn test_meta_rejects_corruption() {
        let mut bytes = meta().encode().unwrap();
        bytes[2] ^= 0x40;
        assert_eq!(
            SensorMeta::decode(&bytes, 17),
            Err(StoreError::CorruptMetadata { sensor_id: 17 })
        );
    }

    #[test]
    fn test_meta_rejects_truncation_and_foreign_sensor() {
        let bytes = meta().encode().unwrap();
        assert!(SensorMeta::decode(&bytes[..bytes.len() - 1], 17).is_err());
        assert!(SensorMeta::decode(&[], 17).is_err());
        assert!(SensorMeta::decode(&bytes, 18).is_err());
    }

    #[test]
    fn test_memory_backend_is_not_durable() {
        let backend = MemoryBackend;
        let key = SensorKey {
            id: 1,
            class: SourceClass::Host,
        };
        assert!(!backend.is_durable());
        assert_eq!(backend.write_sector(key, 0, &[0; 4]), Err(StoreError::NotDurable));
        assert_eq!(backend.class_usage(SourceClass::Bus), 0);
        assert!(backend.recover().unwrap().is_empty());
    }
}
