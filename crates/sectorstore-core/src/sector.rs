//! Sector layout, sealing and validation.
//!
//! A sector is one fixed-size buffer: a 40-byte header followed by payload
//! space for records of a single kind. The image of a sealed sector is
//! byte-identical in RAM and on disk.
//!
//! Header format (little-endian):
//! - magic: 4 bytes (`SSEC`)
//! - crc: 4 bytes (CRC32C over bytes 8.. of the image)
//! - state: 1 byte
//! - kind: 1 byte
//! - record_count: 2 bytes
//! - sensor_id: 2 bytes
//! - version: 1 byte
//! - reserved: 1 byte
//! - seq: 4 bytes (per-sensor sector sequence)
//! - prev: 4 bytes (seq of the previous sector, or [`NO_LINK`])
//! - next: 4 bytes (seq of the next sector, or [`NO_LINK`])
//! - sealed_tick: 4 bytes
//! - first_index: 8 bytes (logical index of the first record)
//!
//! The CRC covers everything but the magic and itself, so the links and
//! record count are protected together with the payload. Open sectors are
//! never checked; the CRC only exists once the sector is sealed.

extern crate alloc;
use alloc::boxed::Box;

use crc::{CRC_32_ISCSI, Crc};

use crate::SensorId;
use crate::error::{StoreError, StoreResult};
use crate::record::{Record, RecordKind};

/// Size of the sector header in bytes
pub const HEADER_SIZE: usize = 40;

/// Link value for "no neighbour"
pub const NO_LINK: u32 = u32::MAX;

const MAGIC: [u8; 4] = *b"SSEC";
const FORMAT_VERSION: u8 = 1;
const CRC_START: usize = 8;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Index of a slot in the sector pool
pub type SlotId = u32;

/// CRC32C of `bytes`
pub fn crc32c(bytes: &[u8]) -> u32 {
    CASTAGNOLI.checksum(bytes)
}

/// Lifecycle state stamped into the header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SectorState {
    /// Sitting in the pool free list
    #[default]
    Free = 0,
    /// Head of a chain, accepting records
    Open = 1,
    /// Immutable and CRC-stamped
    Sealed = 2,
}

impl SectorState {
    const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Open),
            2 => Some(Self::Sealed),
            _ => None,
        }
    }
}

/// Decoded sector header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHeader {
    pub crc: u32,
    pub state: SectorState,
    pub kind: RecordKind,
    pub record_count: u16,
    pub sensor_id: SensorId,
    pub seq: u32,
    pub prev: u32,
    pub next: u32,
    pub sealed_tick: u32,
    pub first_index: u64,
}

impl SectorHeader {
    fn blank() -> Self {
        Self {
            crc: 0,
            state: SectorState::Free,
            kind: RecordKind::TimeSeries,
            record_count: 0,
            sensor_id: 0,
            seq: 0,
            prev: NO_LINK,
            next: NO_LINK,
            sealed_tick: 0,
            first_index: 0,
        }
    }

    /// Logical index one past the last record
    pub const fn end_index(&self) -> u64 {
        self.first_index + self.record_count as u64
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.crc.to_le_bytes());
        buf[8] = self.state as u8;
        buf[9] = self.kind as u8;
        buf[10..12].copy_from_slice(&self.record_count.to_le_bytes());
        buf[12..14].copy_from_slice(&self.sensor_id.to_le_bytes());
        buf[14] = FORMAT_VERSION;
        buf[15] = 0;
        buf[16..20].copy_from_slice(&self.seq.to_le_bytes());
        buf[20..24].copy_from_slice(&self.prev.to_le_bytes());
        buf[24..28].copy_from_slice(&self.next.to_le_bytes());
        buf[28..32].copy_from_slice(&self.sealed_tick.to_le_bytes());
        buf[32..40].copy_from_slice(&self.first_index.to_le_bytes());
    }

    pub fn read(buf: &[u8]) -> StoreResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StoreError::CorruptSector {
                reason: "image shorter than header",
            });
        }
        if buf[0..4] != MAGIC {
            return Err(StoreError::CorruptSector {
                reason: "bad magic",
            });
        }
        if buf[14] != FORMAT_VERSION {
            return Err(StoreError::CorruptSector {
                reason: "unsupported format version",
            });
        }
        let state = SectorState::from_u8(buf[8]).ok_or(StoreError::CorruptSector {
            reason: "unknown sector state",
        })?;
        let kind = RecordKind::from_u8(buf[9]).ok_or(StoreError::CorruptSector {
            reason: "unknown record kind",
        })?;

        Ok(Self {
            crc: read_u32(buf, 4),
            state,
            kind,
            record_count: u16::from_le_bytes([buf[10], buf[11]]),
            sensor_id: u16::from_le_bytes([buf[12], buf[13]]),
            seq: read_u32(buf, 16),
            prev: read_u32(buf, 20),
            next: read_u32(buf, 24),
            sealed_tick: read_u32(buf, 28),
            first_index: read_u64(buf, 32),
        })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

/// Records that fit in the payload of a sector of `sector_size` bytes
pub const fn records_per_sector(sector_size: usize, kind: RecordKind) -> usize {
    sector_size.saturating_sub(HEADER_SIZE) / kind.size()
}

fn decode_slot(image: &[u8], header: &SectorHeader, index: usize) -> StoreResult<Record> {
    if index >= header.record_count as usize {
        return Err(StoreError::InvalidRecord {
            reason: "record index beyond sector",
        });
    }
    let size = header.kind.size();
    let offset = HEADER_SIZE + index * size;
    Record::decode(header.kind, &image[offset..offset + size])
}

/// One pool slot holding a sector buffer
///
/// A `Sector` owns its buffer while it belongs to a chain and gives it back
/// when freed to the pool, so a slot can never be referenced twice.
#[derive(Debug)]
pub struct Sector {
    slot: SlotId,
    header: SectorHeader,
    buf: Box<[u8]>,
}

impl Sector {
    pub(crate) fn from_parts(slot: SlotId, buf: Box<[u8]>) -> Self {
        Self {
            slot,
            header: SectorHeader::blank(),
            buf,
        }
    }

    pub(crate) fn into_parts(self) -> (SlotId, Box<[u8]>) {
        (self.slot, self.buf)
    }

    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    pub const fn header(&self) -> &SectorHeader {
        &self.header
    }

    pub const fn seq(&self) -> u32 {
        self.header.seq
    }

    pub const fn state(&self) -> SectorState {
        self.header.state
    }

    pub const fn is_sealed(&self) -> bool {
        matches!(self.header.state, SectorState::Sealed)
    }

    pub const fn record_count(&self) -> usize {
        self.header.record_count as usize
    }

    pub const fn first_index(&self) -> u64 {
        self.header.first_index
    }

    pub const fn end_index(&self) -> u64 {
        self.header.end_index()
    }

    /// Record capacity for the kind this sector was opened with
    pub fn capacity(&self) -> usize {
        records_per_sector(self.buf.len(), self.header.kind)
    }

    pub fn is_full(&self) -> bool {
        self.record_count() >= self.capacity()
    }

    /// Turns a freshly allocated slot into the open head of a chain
    pub fn open(&mut self, sensor_id: SensorId, kind: RecordKind, seq: u32, prev: u32, first_index: u64) {
        self.header = SectorHeader {
            crc: 0,
            state: SectorState::Open,
            kind,
            record_count: 0,
            sensor_id,
            seq,
            prev,
            next: NO_LINK,
            sealed_tick: 0,
            first_index,
        };
        self.header.write(&mut self.buf);
    }

    /// Links this sector forward to `next`; only valid before sealing
    pub fn link_next(&mut self, next: u32) {
        if self.header.state == SectorState::Open {
            self.header.next = next;
        }
    }

    /// Appends one record at the next record-aligned offset
    pub fn push_record(&mut self, record: &Record) -> StoreResult<()> {
        if self.header.state != SectorState::Open {
            return Err(StoreError::InvalidRecord {
                reason: "sector is not open",
            });
        }
        if record.kind() != self.header.kind {
            return Err(StoreError::KindMismatch {
                sensor_id: self.header.sensor_id,
            });
        }

        let size = self.header.kind.size();
        let offset = HEADER_SIZE + self.record_count() * size;
        if offset + size > self.buf.len() {
            return Err(StoreError::InvalidRecord {
                reason: "record would straddle sector boundary",
            });
        }

        record.encode_into(&mut self.buf[offset..offset + size])?;
        self.header.record_count += 1;
        Ok(())
    }

    /// Record at position `index` within this sector
    pub fn record_at(&self, index: usize) -> StoreResult<Record> {
        decode_slot(&self.buf, &self.header, index)
    }

    /// Makes the sector immutable and stamps its CRC
    ///
    /// Returns `false` if the sector was not open.
    pub fn seal(&mut self, tick: u32) -> bool {
        if self.header.state != SectorState::Open {
            return false;
        }
        self.header.state = SectorState::Sealed;
        self.header.sealed_tick = tick;
        self.header.crc = 0;
        self.header.write(&mut self.buf);

        self.header.crc = crc32c(&self.buf[CRC_START..]);
        self.buf[4..8].copy_from_slice(&self.header.crc.to_le_bytes());
        true
    }

    /// Full sector image; matches the on-disk format once sealed
    pub fn image(&self) -> &[u8] {
        &self.buf
    }

    #[cfg(test)]
    pub(crate) fn image_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Validates a sealed sector image read back from storage
///
/// Checks length, magic, version, state, record count, owner and CRC, in
/// that order. No payload byte should be trusted before this returns `Ok`.
pub fn validate_image(image: &[u8], sector_size: usize, sensor_id: SensorId) -> StoreResult<SectorHeader> {
    if image.len() != sector_size {
        return Err(StoreError::CorruptSector {
            reason: "image length differs from sector size",
        });
    }
    let header = SectorHeader::read(image)?;
    if header.state != SectorState::Sealed {
        return Err(StoreError::CorruptSector {
            reason: "sector is not sealed",
        });
    }
    if header.record_count as usize > records_per_sector(sector_size, header.kind) {
        return Err(StoreError::CorruptSector {
            reason: "record count exceeds capacity",
        });
    }
    if header.sensor_id != sensor_id {
        return Err(StoreError::CorruptSector {
            reason: "sector belongs to another sensor",
        });
    }

    let mut scratch = [0u8; 4];
    scratch.copy_from_slice(&image[4..8]);
    if crc32c(&image[CRC_START..]) != u32::from_le_bytes(scratch) {
        return Err(StoreError::CrcMismatch {
            sensor_id,
            seq: header.seq,
        });
    }
    Ok(header)
}

/// Validated sealed image, borrowed from a read buffer
pub struct SectorView<'a> {
    header: SectorHeader,
    image: &'a [u8],
}

impl<'a> SectorView<'a> {
    pub fn new(image: &'a [u8], sector_size: usize, sensor_id: SensorId) -> StoreResult<Self> {
        let header = validate_image(image, sector_size, sensor_id)?;
        Ok(Self { header, image })
    }

    /// Wraps an image whose header was already validated
    pub(crate) const fn trusted(header: SectorHeader, image: &'a [u8]) -> Self {
        Self { header, image }
    }

    pub const fn header(&self) -> &SectorHeader {
        &self.header
    }

    pub fn record_at(&self, index: usize) -> StoreResult<Record> {
        decode_slot(self.image, &self.header, index)
    }
}
