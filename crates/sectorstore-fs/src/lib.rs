//! Linux host support for the sectorstore engine
//!
//! Provides the disk-backed [`DiskBackend`], a thread-blocking
//! [`StdRawMutex`] for the engine's locks, and [`open_host`] which wires
//! both into a [`StorageManager`] and recovers whatever the previous run
//! left on disk.

pub mod disk;
pub mod lock;

use std::path::Path;

pub use disk::DiskBackend;
pub use lock::StdRawMutex;

use sectorstore_core::{StorageConfig, StorageManager, StoreResult};

/// Storage manager as used on Linux gateways
pub type HostStorageManager = StorageManager<StdRawMutex, DiskBackend>;

/// Opens (or creates) the storage root at `root` and recovers its sensors
pub fn open_host(root: impl AsRef<Path>, config: StorageConfig) -> StoreResult<HostStorageManager> {
    let backend = DiskBackend::open(root, config.sector_size)?;
    StorageManager::new(config, backend)
}
