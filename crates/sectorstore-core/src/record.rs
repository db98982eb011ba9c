//! Fixed-size record codecs.
//!
//! Two record shapes exist, and a sensor stores exactly one of them:
//!
//! - [`TimeSeriesRecord`]: 4 bytes, the scalar value only
//! - [`EventRecord`]: 12 bytes, value followed by a millisecond timestamp
//!
//! Binary format (little-endian):
//! - time-series: value 4 bytes (f32 bits)
//! - event: value 4 bytes (f32 bits), timestamp 8 bytes (u64)
//!
//! Records are always written at offsets that are a multiple of their size
//! from the start of the sector payload, and are read back field by field
//! with `from_le_bytes`, so no unaligned loads are ever issued.
//!
//! # Time-series timestamps
//!
//! Time-series records carry no timestamp. The consumer reconstructs it from
//! the record's logical index and the sensor's sampling interval, see
//! [`infer_timestamp`]. An inline timestamp would at least double the size of
//! every record.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Encoded size of a [`TimeSeriesRecord`]
pub const TIME_SERIES_RECORD_SIZE: usize = 4;

/// Encoded size of an [`EventRecord`]
pub const EVENT_RECORD_SIZE: usize = 12;

/// Record shape stored by a sensor
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// Scalar sample at a fixed sampling interval
    TimeSeries = 1,
    /// Discrete event with its own timestamp
    Event = 2,
}

impl RecordKind {
    /// Encoded size of one record of this kind
    pub const fn size(self) -> usize {
        match self {
            Self::TimeSeries => TIME_SERIES_RECORD_SIZE,
            Self::Event => EVENT_RECORD_SIZE,
        }
    }

    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::TimeSeries),
            2 => Some(Self::Event),
            _ => None,
        }
    }
}

/// Scalar sample; the timestamp is implied by position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSeriesRecord {
    pub value: f32,
}

/// Discrete event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventRecord {
    pub value: f32,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// A record of either shape
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Record {
    TimeSeries(TimeSeriesRecord),
    Event(EventRecord),
}

impl Record {
    pub const fn time_series(value: f32) -> Self {
        Self::TimeSeries(TimeSeriesRecord { value })
    }

    pub const fn event(value: f32, timestamp_ms: u64) -> Self {
        Self::Event(EventRecord {
            value,
            timestamp_ms,
        })
    }

    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::TimeSeries(_) => RecordKind::TimeSeries,
            Self::Event(_) => RecordKind::Event,
        }
    }

    /// Value carried by either shape
    pub const fn value(&self) -> f32 {
        match self {
            Self::TimeSeries(r) => r.value,
            Self::Event(r) => r.value,
        }
    }

    /// Rejects records that could never be decoded back to themselves
    pub fn validate(&self) -> StoreResult<()> {
        if !self.value().is_finite() {
            return Err(StoreError::InvalidRecord {
                reason: "value is not finite",
            });
        }
        Ok(())
    }

    /// Writes the record into `out`, which must be exactly one record long
    pub fn encode_into(&self, out: &mut [u8]) -> StoreResult<()> {
        if out.len() != self.kind().size() {
            return Err(StoreError::InvalidRecord {
                reason: "output slot does not match record size",
            });
        }

        match self {
            Self::TimeSeries(r) => {
                out.copy_from_slice(&r.value.to_le_bytes());
            }
            Self::Event(r) => {
                out[0..4].copy_from_slice(&r.value.to_le_bytes());
                out[4..12].copy_from_slice(&r.timestamp_ms.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Reads one record of `kind` from `bytes`
    pub fn decode(kind: RecordKind, bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() != kind.size() {
            return Err(StoreError::InvalidRecord {
                reason: "input slot does not match record size",
            });
        }

        let mut value_bytes = [0u8; 4];
        value_bytes.copy_from_slice(&bytes[0..4]);
        let value = f32::from_le_bytes(value_bytes);

        match kind {
            RecordKind::TimeSeries => Ok(Self::time_series(value)),
            RecordKind::Event => {
                let mut ts_bytes = [0u8; 8];
                ts_bytes.copy_from_slice(&bytes[4..12]);
                Ok(Self::event(value, u64::from_le_bytes(ts_bytes)))
            }
        }
    }
}

/// Timestamp of the time-series record at `index`
///
/// `anchor_ms` is the timestamp the consumer associates with logical index 0
/// of the sensor and `interval_ms` its sampling interval.
pub const fn infer_timestamp(anchor_ms: u64, interval_ms: u64, index: u64) -> u64 {
    anchor_ms.saturating_add(interval_ms.saturating_mul(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(RecordKind::TimeSeries.size(), 4);
        assert_eq!(RecordKind::Event.size(), 12);
    }

    #[test]
    fn test_event_roundtrip() {
        let record = Record::event(-12.75, 1_700_000_000_123);
        let mut buf = [0u8; EVENT_RECORD_SIZE];
        record.encode_into(&mut buf).unwrap();

        assert_eq!(Record::decode(RecordKind::Event, &buf).unwrap(), record);
    }

    #[test]
    fn test_time_series_roundtrip() {
        for value in [0.0f32, -0.0, 1.5, f32::MAX, f32::MIN_POSITIVE, -273.15] {
            let record = Record::time_series(value);
            let mut buf = [0u8; TIME_SERIES_RECORD_SIZE];
            record.encode_into(&mut buf).unwrap();
            let decoded = Record::decode(RecordKind::TimeSeries, &buf).unwrap();
            assert_eq!(decoded.value().to_bits(), value.to_bits());
        }
    }

    #[test]
    fn test_event_layout_is_little_endian() {
        let record = Record::event(1.0, 0x0102_0304_0506_0708);
        let mut buf = [0u8; EVENT_RECORD_SIZE];
        record.encode_into(&mut buf).unwrap();

        assert_eq!(&buf[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&buf[4..12], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_wrong_slot_size_rejected() {
        let record = Record::time_series(3.0);
        let mut buf = [0u8; EVENT_RECORD_SIZE];
        assert!(matches!(
            record.encode_into(&mut buf),
            Err(StoreError::InvalidRecord { .. })
        ));
        assert!(Record::decode(RecordKind::Event, &buf[..4]).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(Record::time_series(f32::NAN).validate().is_err());
        assert!(Record::time_series(f32::INFINITY).validate().is_err());
        assert!(Record::event(f32::NEG_INFINITY, 5).validate().is_err());
        // Any timestamp is accepted, the epoch itself included
        assert!(Record::event(1.0, 0).validate().is_ok());
        assert!(Record::event(1.0, u64::MAX).validate().is_ok());
        assert!(Record::time_series(-40.0).validate().is_ok());
    }

    #[test]
    fn test_infer_timestamp() {
        assert_eq!(infer_timestamp(1_000, 10_000, 0), 1_000);
        assert_eq!(infer_timestamp(1_000, 10_000, 6), 61_000);
        assert_eq!(infer_timestamp(u64::MAX - 1, 10, 5), u64::MAX);
    }
}
