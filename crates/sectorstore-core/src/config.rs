//! Engine configuration
//!
//! [`StorageConfig`] is handed to the storage manager once at startup and
//! never changes afterwards. Two presets cover the supported deployments:
//!
//! | preset | sector | pool | backend |
//! |--------|--------|------|---------|
//! | [`StorageConfig::constrained`] | 256 B | 32 sectors, preallocated | memory only |
//! | [`StorageConfig::filesystem`] | 4 KB | 1024 sectors, grown lazily | data files |

use core::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::SensorId;
use crate::error::{StoreError, StoreResult};
use crate::record::EVENT_RECORD_SIZE;
use crate::sector::HEADER_SIZE;

/// Smallest accepted sector size
pub const MIN_SECTOR_SIZE: usize = 128;

/// Largest accepted sector size
pub const MAX_SECTOR_SIZE: usize = 65536;

/// Deployment profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    /// Microcontroller with kilobytes of RAM and no filesystem
    Constrained,
    /// Linux host with a filesystem
    Filesystem,
}

/// What a writer's append does when the pool has no free sector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Evict the globally oldest sealed sector, then retry
    DropOldest,
    /// Drop the incoming record and report `PoolExhausted`
    RejectNew,
    /// Flush the oldest sealed sector to the backend, then retry
    FlushToBackend,
}

/// Source class of a sensor; each class gets its own subdirectory and quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceClass {
    /// Values produced by applications on the gateway itself
    Host,
    /// Values decoded from field buses
    Bus,
}

impl SourceClass {
    pub const ALL: [SourceClass; 2] = [SourceClass::Host, SourceClass::Bus];

    /// Subdirectory name under the storage root
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Bus => "bus",
        }
    }
}

impl Display for SourceClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Sealing and acknowledgment timing, in ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Seal an open head that has seen no append for this many ticks
    pub seal_idle_ticks: u32,
    /// Revert `pending` to `tail` when records stay in flight this long
    pub pending_lease_ticks: Option<u32>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            seal_idle_ticks: 30,
            pending_lease_ticks: None,
        }
    }
}

/// Storage engine initialization settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub platform: Platform,
    /// Bytes per sector, header included
    pub sector_size: usize,
    /// Sectors in the pool
    pub pool_capacity: usize,
    /// Pool usage percentage that triggers flushing (or dropping)
    pub ram_threshold_pct: u8,
    /// Byte quota for each source-class subdirectory, 0 for none
    pub disk_quota_bytes: u64,
    pub retention: RetentionPolicy,
    pub overflow: OverflowPolicy,
    /// Sensor ids at or above this value are [`SourceClass::Bus`]
    pub bus_id_floor: SensorId,
}

/// Name used by the gateway firmware for the init configuration
pub type SsInitCfg = StorageConfig;

impl StorageConfig {
    /// Microcontroller profile: small sectors, RAM only, oldest data dropped first
    pub const fn constrained() -> Self {
        Self {
            platform: Platform::Constrained,
            sector_size: 256,
            pool_capacity: 32,
            ram_threshold_pct: 100,
            disk_quota_bytes: 0,
            retention: RetentionPolicy {
                seal_idle_ticks: 30,
                pending_lease_ticks: None,
            },
            overflow: OverflowPolicy::DropOldest,
            bus_id_floor: 0x8000,
        }
    }

    /// Linux profile: 4 KB sectors flushed to disk at 80% pool usage
    pub const fn filesystem() -> Self {
        Self {
            platform: Platform::Filesystem,
            sector_size: 4096,
            pool_capacity: 1024,
            ram_threshold_pct: 80,
            disk_quota_bytes: 64 * 1024 * 1024,
            retention: RetentionPolicy {
                seal_idle_ticks: 30,
                pending_lease_ticks: None,
            },
            overflow: OverflowPolicy::FlushToBackend,
            bus_id_floor: 0x8000,
        }
    }

    /// Whether the pool grows on demand instead of preallocating
    pub const fn growable_pool(&self) -> bool {
        matches!(self.platform, Platform::Filesystem)
    }

    pub const fn source_class(&self, sensor_id: SensorId) -> SourceClass {
        if sensor_id >= self.bus_id_floor {
            SourceClass::Bus
        } else {
            SourceClass::Host
        }
    }

    /// Checks every setting; called by the manager before anything is allocated
    pub fn validate(&self) -> StoreResult<()> {
        if !self.sector_size.is_power_of_two()
            || !(MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&self.sector_size)
        {
            return Err(StoreError::InvalidConfig {
                reason: "sector size must be a power of two between 128 and 65536",
            });
        }
        if self.sector_size < HEADER_SIZE + EVENT_RECORD_SIZE {
            return Err(StoreError::InvalidConfig {
                reason: "sector cannot hold a single record",
            });
        }
        if self.pool_capacity < 2 || self.pool_capacity > u32::MAX as usize - 1 {
            return Err(StoreError::InvalidConfig {
                reason: "pool capacity out of range",
            });
        }
        if self.ram_threshold_pct == 0 || self.ram_threshold_pct > 100 {
            return Err(StoreError::InvalidConfig {
                reason: "RAM threshold must be within 1..=100 percent",
            });
        }
        if self.platform == Platform::Constrained && self.overflow == OverflowPolicy::FlushToBackend {
            return Err(StoreError::InvalidConfig {
                reason: "constrained platform has no backend to flush to",
            });
        }
        if self.disk_quota_bytes != 0 && self.disk_quota_bytes < self.sector_size as u64 {
            return Err(StoreError::InvalidConfig {
                reason: "disk quota smaller than one sector",
            });
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::constrained()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(StorageConfig::constrained().validate().is_ok());
        assert!(StorageConfig::filesystem().validate().is_ok());
    }

    #[test]
    fn test_sector_size_checks() {
        let mut cfg = StorageConfig::constrained();
        cfg.sector_size = 300;
        assert!(cfg.validate().is_err());
        cfg.sector_size = 64;
        assert!(cfg.validate().is_err());
        cfg.sector_size = 131072;
        assert!(cfg.validate().is_err());
        cfg.sector_size = 65536;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_flush_policy_needs_filesystem() {
        let mut cfg = StorageConfig::constrained();
        cfg.overflow = OverflowPolicy::FlushToBackend;
        assert_eq!(
            cfg.validate(),
            Err(StoreError::InvalidConfig {
                reason: "constrained platform has no backend to flush to"
            })
        );
    }

    #[test]
    fn test_threshold_bounds() {
        let mut cfg = StorageConfig::filesystem();
        cfg.ram_threshold_pct = 0;
        assert!(cfg.validate().is_err());
        cfg.ram_threshold_pct = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_source_class() {
        let cfg = StorageConfig::filesystem();
        assert_eq!(cfg.source_class(12), SourceClass::Host);
        assert_eq!(cfg.source_class(0x8000), SourceClass::Bus);
        assert_eq!(cfg.source_class(u16::MAX), SourceClass::Bus);
    }
}
