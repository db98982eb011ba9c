//! Hardware-independent core of the sectorstore engine
//!
//! This crate holds the dual-tier sensor record store: a pool of fixed-size
//! sectors, one sector chain per sensor with tail/pending/head cursors, the
//! record and sector codecs, and the storage manager that drives sealing,
//! flushing, quota enforcement and shutdown.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! microcontrollers (memory-only, [`backend::MemoryBackend`]) and Linux hosts,
//! where `sectorstore-fs` supplies a disk-backed [`backend::SectorBackend`].

#![no_std]

extern crate alloc;

pub mod backend;
pub mod chain;
pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod pool;
pub mod record;
pub mod sector;
pub mod store;

/// Sensor identifier, unique per gateway
pub type SensorId = u16;

/// Size of the sensor table
pub const MAX_SENSORS: usize = 64;

pub use backend::{MemoryBackend, SectorBackend, SensorKey, SensorMeta};
pub use config::{OverflowPolicy, Platform, RetentionPolicy, SourceClass, SsInitCfg, StorageConfig};
pub use error::{StoreError, StoreResult};
pub use health::{HealthReport, LifecycleState, TickReport};
pub use manager::StorageManager;
pub use record::{EventRecord, Record, RecordKind, TimeSeriesRecord, infer_timestamp};
pub use store::{ConsumedBatch, ConsumedRecord, Cursors, SensorStats};
