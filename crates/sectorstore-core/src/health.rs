//! Health and tick reporting
//!
//! Nothing in the engine is fatal. Failures the writer never sees (CRC
//! discards, flush errors, quota drops) are only visible here, so the host is
//! expected to poll [`HealthReport`] and act on it.

/// Global lifecycle of the storage manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Running,
    /// Sealing and flushing; new appends are refused
    ShuttingDown,
    Stopped,
}

/// Snapshot refreshed at the end of every tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthReport {
    pub state: LifecycleState,
    pub ticks: u32,
    pub sensors: usize,
    pub pool_usage_pct: u8,
    pub pool_pressure_events: u32,
    pub pool_exhausted_events: u32,
    pub crc_failures: u32,
    pub write_failures: u32,
    /// Backend reads that failed, including I/O errors of the recovery scan
    pub read_failures: u32,
    pub dropped_records: u64,
    pub dropped_sectors: u32,
    /// Sectors dropped to get a class directory back under quota
    pub quota_drops: u32,
    pub lease_expirations: u32,
    /// Sensors whose flushes keep failing
    pub degraded_sensors: usize,
    /// Sectors cut off by the recovery scan at startup
    pub recovery_discards: u32,
}

impl HealthReport {
    /// True when nothing has been lost or failed so far
    pub fn is_clean(&self) -> bool {
        self.crc_failures == 0
            && self.write_failures == 0
            && self.read_failures == 0
            && self.dropped_records == 0
            && self.degraded_sensors == 0
            && self.recovery_discards == 0
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u32,
    pub sealed: u32,
    pub flushed: u32,
    pub flush_failures: u32,
    /// Resident sectors dropped because flushing could not relieve the pool
    pub evicted: u32,
    pub compacted_slots: u32,
    pub quota_drops: u32,
    pub leases_expired: u32,
    pub meta_written: u32,
}
