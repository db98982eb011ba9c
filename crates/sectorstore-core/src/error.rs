//! Error taxonomy for the storage engine
//!
//! Only [`StoreError::PoolExhausted`], [`StoreError::InvalidRecord`] and
//! [`StoreError::KindMismatch`] are ever returned to a writer. Everything the
//! tick and the disk layer run into is contained to one sector or one sensor
//! and surfaces through the health counters instead.

use thiserror_no_std::Error;

use crate::SensorId;

/// Error types for storage operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// No free sector left in the pool
    #[error("Sector pool exhausted ({capacity} sectors in use)")]
    PoolExhausted {
        /// Pool capacity in sectors
        capacity: usize,
    },

    /// Sealed sector failed CRC validation
    #[error("CRC mismatch in sector {seq} of sensor {sensor_id}")]
    CrcMismatch {
        /// Owning sensor
        sensor_id: SensorId,
        /// Per-sensor sector sequence number
        seq: u32,
    },

    /// Sector header is not a valid sealed sector
    #[error("Corrupt sector: {reason}")]
    CorruptSector {
        /// What failed to validate
        reason: &'static str,
    },

    /// Metadata file could not be decoded
    #[error("Corrupt metadata for sensor {sensor_id}")]
    CorruptMetadata {
        /// Owning sensor
        sensor_id: SensorId,
    },

    /// Write, sync or rename failed on the backing store
    #[error("Disk write failed for sensor {sensor_id} during {op}")]
    DiskWriteFailed {
        /// Owning sensor
        sensor_id: SensorId,
        /// Operation that failed
        op: &'static str,
    },

    /// Read from the backing store failed
    #[error("Disk read failed for sensor {sensor_id} during {op}")]
    DiskReadFailed {
        /// Owning sensor
        sensor_id: SensorId,
        /// Operation that failed
        op: &'static str,
    },

    /// A source-class directory is over its byte quota
    #[error("Disk quota exceeded for {class} sensors")]
    QuotaExceeded {
        /// Subdirectory name of the source class
        class: &'static str,
    },

    /// Record rejected before it reached a sector
    #[error("Invalid record: {reason}")]
    InvalidRecord {
        /// Why the record was rejected
        reason: &'static str,
    },

    /// Record shape differs from the one the sensor was created with
    #[error("Sensor {sensor_id} stores a different record kind")]
    KindMismatch {
        /// Sensor that rejected the record
        sensor_id: SensorId,
    },

    /// Configuration rejected at initialization
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Offending setting
        reason: &'static str,
    },

    /// Sensor table is full
    #[error("Sensor table full (max: {max})")]
    TooManySensors {
        /// Table capacity
        max: usize,
    },

    /// Manager is shutting down or stopped
    #[error("Storage manager is not running")]
    NotRunning,

    /// Operation needs a durable backend
    #[error("Backend has no persistent storage")]
    NotDurable,
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
