//! Per-sensor sector chain
//!
//! The chain is the sensor's sequence of sectors ordered oldest to newest.
//! Older sectors may have been flushed to the backend ("spilled") and are
//! only tracked by descriptor; newer ones are resident in pool buffers. The
//! newest resident sector is the only one that may be open.
//!
//! ```text
//!  spilled (on disk)            resident (pool)
//! [seq 4][seq 5][seq 6] ──▶ [seq 7 sealed][seq 8 open]
//!   ▲ chain front                               ▲ head
//! ```
//!
//! Each sector header carries `prev`/`next` sequence links, so the ring order
//! can be rebuilt from the images alone.

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use log::debug;

use crate::SensorId;
use crate::error::{StoreError, StoreResult};
use crate::record::{Record, RecordKind};
use crate::sector::{NO_LINK, Sector, SectorState};

/// Descriptor of a sealed sector that lives in the sensor's data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpilledSector {
    pub seq: u32,
    /// Position of the sector image within the data file
    pub slot: u32,
    pub first_index: u64,
    pub count: u32,
    pub sealed_tick: u32,
}

impl SpilledSector {
    pub const fn end_index(&self) -> u64 {
        self.first_index + self.count as u64
    }
}

/// Where the record with a given logical index lives
#[derive(Debug)]
pub enum Location<'a> {
    Resident(&'a Sector, usize),
    Spilled(SpilledSector, usize),
}

/// Sectors released by a trim
#[derive(Debug, Default)]
pub struct Trimmed {
    /// Resident buffers to hand back to the pool
    pub freed: Vec<Sector>,
    /// Spilled sectors that became dead file slots
    pub spilled: u32,
}

/// Sector ring of one sensor
#[derive(Debug)]
pub struct SectorChain {
    sensor_id: SensorId,
    kind: RecordKind,
    spilled: VecDeque<SpilledSector>,
    resident: VecDeque<Sector>,
    /// Sector images in the data file, dead prefix included
    file_slots: u32,
    next_seq: u32,
}

impl SectorChain {
    pub fn new(sensor_id: SensorId, kind: RecordKind) -> Self {
        Self {
            sensor_id,
            kind,
            spilled: VecDeque::new(),
            resident: VecDeque::new(),
            file_slots: 0,
            next_seq: 0,
        }
    }

    /// Rebuilds a chain from sectors found in the data file
    pub fn recovered(
        sensor_id: SensorId,
        kind: RecordKind,
        spilled: Vec<SpilledSector>,
        file_slots: u32,
        next_seq: u32,
    ) -> Self {
        let next_seq = spilled
            .last()
            .map(|s| s.seq.wrapping_add(1))
            .map_or(next_seq, |after_last| after_last.max(next_seq));
        Self {
            sensor_id,
            kind,
            spilled: spilled.into(),
            resident: VecDeque::new(),
            file_slots,
            next_seq,
        }
    }

    pub const fn kind(&self) -> RecordKind {
        self.kind
    }

    pub const fn file_slots(&self) -> u32 {
        self.file_slots
    }

    pub const fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn resident_len(&self) -> usize {
        self.resident.len()
    }

    pub fn spilled_len(&self) -> usize {
        self.spilled.len()
    }

    pub fn spilled(&self) -> impl Iterator<Item = &SpilledSector> {
        self.spilled.iter()
    }

    /// Logical index of the oldest record still held by the chain
    pub fn first_index(&self) -> Option<u64> {
        self.spilled
            .front()
            .map(|s| s.first_index)
            .or_else(|| self.resident.front().map(Sector::first_index))
    }

    /// True when the next record needs a fresh sector
    pub fn needs_sector(&self) -> bool {
        !matches!(
            self.resident.back(),
            Some(head) if head.state() == SectorState::Open && !head.is_full()
        )
    }

    /// Writes into the open head sector
    pub fn push(&mut self, record: &Record) -> StoreResult<()> {
        match self.resident.back_mut() {
            Some(head) if head.state() == SectorState::Open => head.push_record(record),
            _ => Err(StoreError::InvalidRecord {
                reason: "chain has no open head sector",
            }),
        }
    }

    fn last_seq(&self) -> Option<u32> {
        self.resident
            .back()
            .map(Sector::seq)
            .or_else(|| self.spilled.back().map(|s| s.seq))
    }

    /// Links `sector` after the head, sealing the previous head first
    ///
    /// Returns `true` if an open head was sealed in the process.
    pub fn attach(&mut self, mut sector: Sector, first_index: u64, tick: u32) -> bool {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let prev = self.last_seq().unwrap_or(NO_LINK);

        let mut sealed = false;
        if let Some(head) = self.resident.back_mut() {
            head.link_next(seq);
            sealed = head.seal(tick);
            if sealed {
                debug!(
                    "Sensor {} sealed sector {} ({} records)",
                    self.sensor_id,
                    head.seq(),
                    head.record_count()
                );
            }
        }

        sector.open(self.sensor_id, self.kind, seq, prev, first_index);
        self.resident.push_back(sector);
        sealed
    }

    /// Seals the open head if it holds at least one record
    ///
    /// The head is linked to the sequence number the next attached sector
    /// will get, so idle and shutdown seals leave the same links as a seal
    /// by `attach`.
    pub fn seal_head(&mut self, tick: u32) -> bool {
        let next = self.next_seq;
        match self.resident.back_mut() {
            Some(head) if head.record_count() > 0 => {
                head.link_next(next);
                head.seal(tick)
            }
            _ => false,
        }
    }

    /// Whether the head is open with records and could be sealed
    pub fn head_is_sealable(&self) -> bool {
        matches!(
            self.resident.back(),
            Some(head) if head.state() == SectorState::Open && head.record_count() > 0
        )
    }

    /// Removes every sealed sector whose records all lie before `tail`
    pub fn trim(&mut self, tail: u64) -> Trimmed {
        let mut trimmed = Trimmed::default();

        while self.spilled.front().is_some_and(|s| s.end_index() <= tail) {
            self.spilled.pop_front();
            trimmed.spilled += 1;
        }

        if self.spilled.is_empty() {
            while self
                .resident
                .front()
                .is_some_and(|s| s.is_sealed() && s.end_index() <= tail)
            {
                if let Some(sector) = self.resident.pop_front() {
                    trimmed.freed.push(sector);
                }
            }
        }

        trimmed
    }

    /// Finds the sector holding logical record `index`
    pub fn locate(&self, index: u64) -> Option<Location<'_>> {
        let pos = self.spilled.partition_point(|s| s.end_index() <= index);
        if let Some(spilled) = self.spilled.get(pos) {
            if spilled.first_index <= index {
                return Some(Location::Spilled(*spilled, (index - spilled.first_index) as usize));
            }
            return None;
        }

        let pos = self.resident.partition_point(|s| s.end_index() <= index);
        let sector = self.resident.get(pos)?;
        if sector.first_index() <= index && index < sector.end_index() {
            Some(Location::Resident(sector, (index - sector.first_index()) as usize))
        } else {
            None
        }
    }

    /// First index at or after `index` that the chain still holds
    ///
    /// Differs from `index` only when it falls into the range of a sector
    /// discarded as unreadable.
    pub fn next_held_index(&self, index: u64) -> Option<u64> {
        if self.locate(index).is_some() {
            return Some(index);
        }
        self.spilled
            .iter()
            .map(|s| s.first_index)
            .chain(self.resident.iter().map(Sector::first_index))
            .find(|&first| first > index)
    }

    /// Removes the spilled sector `seq` from the chain
    ///
    /// Its file slot stays behind as dead space until compaction reaches it.
    pub fn discard_spilled(&mut self, seq: u32) -> Option<SpilledSector> {
        let pos = self.spilled.iter().position(|s| s.seq == seq)?;
        self.spilled.remove(pos)
    }

    /// Oldest resident sector if it is sealed and so eligible for flushing
    pub fn oldest_sealed_resident(&self) -> Option<&Sector> {
        self.resident.front().filter(|s| s.is_sealed())
    }

    pub fn oldest_spilled(&self) -> Option<&SpilledSector> {
        self.spilled.front()
    }

    /// Records that the sector `seq` was written to file slot `slot`
    ///
    /// Moves the sector from resident to spilled and returns its buffer. When
    /// the sector was trimmed while the write was in flight the slot is
    /// still accounted for, as dead space.
    pub fn spill_front(&mut self, seq: u32, slot: u32) -> Option<Sector> {
        self.file_slots = self.file_slots.max(slot + 1);

        let front = self.resident.front()?;
        if front.seq() != seq || !front.is_sealed() {
            return None;
        }
        let sector = self.resident.pop_front()?;
        self.spilled.push_back(SpilledSector {
            seq,
            slot,
            first_index: sector.first_index(),
            count: sector.record_count() as u32,
            sealed_tick: sector.header().sealed_tick,
        });
        Some(sector)
    }

    /// Drops the oldest spilled sector, returning its record range end
    pub fn drop_oldest_spilled(&mut self) -> Option<SpilledSector> {
        self.spilled.pop_front()
    }

    /// Drops the oldest sealed resident sector and everything older
    ///
    /// Spilled sectors precede every resident one, so they are discarded too
    /// to keep the chain contiguous. Returns the buffer and the index one past
    /// the last dropped record.
    pub fn drop_oldest_resident(&mut self) -> Option<(Sector, u64)> {
        if !self.resident.front().is_some_and(Sector::is_sealed) {
            return None;
        }
        self.spilled.clear();
        let sector = self.resident.pop_front()?;
        let end = sector.end_index();
        Some((sector, end))
    }

    /// File slots in front of the first live spilled sector
    pub fn dead_slots(&self) -> u32 {
        self.spilled.front().map_or(self.file_slots, |s| s.slot)
    }

    /// Applies a compaction that removed `slots` images from the file front
    pub fn compacted(&mut self, slots: u32) {
        self.file_slots = self.file_slots.saturating_sub(slots);
        for spilled in self.spilled.iter_mut() {
            spilled.slot -= slots;
        }
    }

    /// Gives up every resident buffer, open head included
    pub fn release_resident(&mut self) -> Vec<Sector> {
        self.resident.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn blank(slot: u32) -> Sector {
        Sector::from_parts(slot, vec![0u8; 128].into_boxed_slice())
    }

    /// Fills a chain of 128-byte sectors (22 time-series records each)
    fn filled_chain(records: u64) -> SectorChain {
        let mut chain = SectorChain::new(3, RecordKind::TimeSeries);
        let mut slot = 0;
        for index in 0..records {
            if chain.needs_sector() {
                chain.attach(blank(slot), index, index as u32);
                slot += 1;
            }
            chain.push(&Record::time_series(index as f32)).unwrap();
        }
        chain
    }

    #[test]
    fn test_attach_seals_and_links() {
        let chain = filled_chain(50);
        assert_eq!(chain.resident_len(), 3);

        let sectors: Vec<&Sector> = chain.resident.iter().collect();
        assert!(sectors[0].is_sealed());
        assert!(sectors[1].is_sealed());
        assert_eq!(sectors[2].state(), SectorState::Open);

        assert_eq!(sectors[0].header().prev, NO_LINK);
        assert_eq!(sectors[0].header().next, 1);
        assert_eq!(sectors[1].header().prev, 0);
        assert_eq!(sectors[1].header().next, 2);
        assert_eq!(sectors[2].header().prev, 1);
        assert_eq!(sectors[2].first_index(), 44);
    }

    #[test]
    fn test_idle_seal_links_to_next_sector() {
        let mut chain = filled_chain(30);
        assert!(chain.seal_head(40));
        assert!(chain.needs_sector());

        chain.attach(blank(9), 30, 41);
        let sectors: Vec<&Sector> = chain.resident.iter().collect();
        assert_eq!(sectors[1].header().next, sectors[2].seq());
        assert_eq!(sectors[2].header().prev, sectors[1].seq());
        // Sealed before the attach, so the image carries the link
        let header = crate::sector::validate_image(sectors[1].image(), 128, 3).unwrap();
        assert_eq!(header.next, 2);
    }

    #[test]
    fn test_locate() {
        let chain = filled_chain(50);
        match chain.locate(23) {
            Some(Location::Resident(sector, pos)) => {
                assert_eq!(sector.seq(), 1);
                assert_eq!(pos, 1);
                assert_eq!(sector.record_at(pos).unwrap(), Record::time_series(23.0));
            }
            other => panic!("unexpected location {other:?}"),
        }
        assert!(chain.locate(50).is_none());
    }

    #[test]
    fn test_trim_keeps_open_head() {
        let mut chain = filled_chain(50);
        let trimmed = chain.trim(30);
        assert_eq!(trimmed.freed.len(), 1);
        assert_eq!(chain.first_index(), Some(22));

        // The open head is never trimmed even when fully consumed
        let trimmed = chain.trim(50);
        assert_eq!(trimmed.freed.len(), 1);
        assert_eq!(chain.resident_len(), 1);
    }

    #[test]
    fn test_spill_and_locate_spilled() {
        let mut chain = filled_chain(50);
        let freed = chain.spill_front(0, 0).unwrap();
        assert_eq!(freed.seq(), 0);
        assert_eq!(chain.file_slots(), 1);

        match chain.locate(5) {
            Some(Location::Spilled(spilled, pos)) => {
                assert_eq!(spilled.seq, 0);
                assert_eq!(pos, 5);
            }
            other => panic!("unexpected location {other:?}"),
        }

        // Resident sectors behind a live spilled one are not trimmed
        let trimmed = chain.trim(21);
        assert_eq!(trimmed.spilled, 0);
        assert!(trimmed.freed.is_empty());
    }

    #[test]
    fn test_spill_of_trimmed_sector_counts_dead_slot() {
        let mut chain = filled_chain(50);
        let trimmed = chain.trim(22);
        assert_eq!(trimmed.freed.len(), 1);

        assert!(chain.spill_front(0, 0).is_none());
        assert_eq!(chain.file_slots(), 1);
        assert_eq!(chain.dead_slots(), 1);
    }

    #[test]
    fn test_compaction_shifts_slots() {
        let mut chain = filled_chain(70);
        chain.spill_front(0, 0).unwrap();
        chain.spill_front(1, 1).unwrap();
        chain.spill_front(2, 2).unwrap();

        let trimmed = chain.trim(44);
        assert_eq!(trimmed.spilled, 2);
        assert_eq!(chain.dead_slots(), 2);

        chain.compacted(2);
        assert_eq!(chain.file_slots(), 1);
        assert_eq!(chain.oldest_spilled().unwrap().slot, 0);
        assert_eq!(chain.dead_slots(), 0);
    }

    #[test]
    fn test_discarded_spilled_sector_leaves_gap() {
        let mut chain = filled_chain(70);
        chain.spill_front(0, 0).unwrap();
        chain.spill_front(1, 1).unwrap();

        let discarded = chain.discard_spilled(1).unwrap();
        assert_eq!((discarded.first_index, discarded.end_index()), (22, 44));
        assert!(chain.discard_spilled(1).is_none());

        assert!(chain.locate(30).is_none());
        assert_eq!(chain.next_held_index(5), Some(5));
        assert_eq!(chain.next_held_index(22), Some(44));
        assert_eq!(chain.next_held_index(43), Some(44));
        assert_eq!(chain.next_held_index(70), None);
        // The slot stays in the file until compaction
        assert_eq!(chain.file_slots(), 2);
    }

    #[test]
    fn test_drop_oldest_resident_discards_spilled() {
        let mut chain = filled_chain(70);
        chain.spill_front(0, 0).unwrap();
        let (sector, end) = chain.drop_oldest_resident().unwrap();
        assert_eq!(sector.seq(), 1);
        assert_eq!(end, 44);
        assert_eq!(chain.spilled_len(), 0);
        assert_eq!(chain.first_index(), Some(44));
    }

    #[test]
    fn test_recovered_next_seq_never_regresses() {
        let spilled = vec![SpilledSector {
            seq: 9,
            slot: 0,
            first_index: 0,
            count: 4,
            sealed_tick: 1,
        }];
        let chain = SectorChain::recovered(1, RecordKind::Event, spilled.clone(), 1, 3);
        assert_eq!(chain.next_seq(), 10);
        let chain = SectorChain::recovered(1, RecordKind::Event, spilled, 1, 20);
        assert_eq!(chain.next_seq(), 20);
    }
}
