//! Descriptor chains and their reconciliation with an extent map.
//!
//! A file's DAD records are held as an arena in chain order. Links between
//! records are positions in the arena until the chain is committed, when
//! every live record is bound to a directory sector and the forward and
//! backward links are filled in.

use crate::FileExtentMap;
use mfd_error::{MfdError, Result};
use mfd_ondisk::{DAD_ENTRIES, DescriptorEntry, DescriptorRecord};
use mfd_types::{LdatIndex, SectorAddress, TrackId, tracks_to_words, words_to_tracks};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Persistence state of one record in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// Matches what is on disk.
    Clean,
    /// Must be written at the next commit.
    Dirty,
    /// No longer part of the chain; its sector is released at commit.
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRecord {
    /// Directory sector holding the record, once one has been bound.
    pub address: Option<SectorAddress>,
    pub record: DescriptorRecord,
    pub state: RecordState,
}

/// In-memory arena for one file's DAD chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorChain {
    records: Vec<ChainRecord>,
}

impl DescriptorChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain read back from disk, in link order.
    #[must_use]
    pub fn from_loaded(records: Vec<(SectorAddress, DescriptorRecord)>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|(address, record)| ChainRecord {
                    address: Some(address),
                    record,
                    state: RecordState::Clean,
                })
                .collect(),
        }
    }

    /// Records still part of the chain, in order.
    pub fn live(&self) -> impl Iterator<Item = &ChainRecord> {
        self.records
            .iter()
            .filter(|r| r.state != RecordState::Deleted)
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Address of the first live record, once bound.
    #[must_use]
    pub fn head(&self) -> Option<SectorAddress> {
        self.live().next().and_then(|r| r.address)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.records.iter().any(|r| r.state != RecordState::Clean)
    }

    /// Arena positions of live records that have no sector yet.
    #[must_use]
    pub fn unbound(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state != RecordState::Deleted && r.address.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// Attach a directory sector to the record at arena position `index`.
    pub fn bind_address(&mut self, index: usize, address: SectorAddress) -> Result<()> {
        let record = self.records.get_mut(index).ok_or_else(|| {
            MfdError::Invariant(format!("descriptor chain has no record {index}"))
        })?;
        if record.address.is_some() {
            return Err(MfdError::Invariant(format!(
                "descriptor record {index} is already bound"
            )));
        }
        record.address = Some(address);
        Ok(())
    }

    /// Fill in forward/backward links from arena order; records whose
    /// links change become dirty.
    pub fn link(&mut self) -> Result<()> {
        let mut addresses = Vec::with_capacity(self.records.len());
        for r in self.live() {
            let address = r.address.ok_or_else(|| {
                MfdError::Invariant("descriptor chain linked before addresses were bound".into())
            })?;
            addresses.push(address);
        }

        for (pos, r) in self
            .records
            .iter_mut()
            .filter(|r| r.state != RecordState::Deleted)
            .enumerate()
        {
            let backward = pos.checked_sub(1).map(|p| addresses[p]);
            let forward = addresses.get(pos + 1).copied();
            if r.record.backward != backward || r.record.forward != forward {
                r.record.backward = backward;
                r.record.forward = forward;
                r.state = RecordState::Dirty;
            }
        }
        Ok(())
    }

    /// Records to write at commit: `(address, record)` for every dirty
    /// live record. Fails if a dirty record has no address.
    pub fn pending_writes(&self) -> Result<Vec<(SectorAddress, &DescriptorRecord)>> {
        self.records
            .iter()
            .filter(|r| r.state == RecordState::Dirty)
            .map(|r| {
                r.address.map(|a| (a, &r.record)).ok_or_else(|| {
                    MfdError::Invariant("dirty descriptor record has no sector".into())
                })
            })
            .collect()
    }

    /// Sectors of deleted records to release at commit.
    #[must_use]
    pub fn pending_deletes(&self) -> Vec<SectorAddress> {
        self.records
            .iter()
            .filter(|r| r.state == RecordState::Deleted)
            .filter_map(|r| r.address)
            .collect()
    }

    /// Forget deleted records and mark everything else clean.
    pub fn mark_committed(&mut self) {
        self.records.retain(|r| r.state != RecordState::Deleted);
        for r in &mut self.records {
            r.state = RecordState::Clean;
        }
    }

    /// Delete every record (file deletion).
    pub fn clear(&mut self) {
        self.records.retain(|r| r.address.is_some());
        for r in &mut self.records {
            r.state = RecordState::Deleted;
        }
    }

    /// Records in arena order, including deleted ones.
    #[must_use]
    pub fn records(&self) -> &[ChainRecord] {
        &self.records
    }
}

// ── Reconciliation ──────────────────────────────────────────────────────────

impl FileExtentMap {
    /// Reconcile `chain` with this map.
    ///
    /// Builds the canonical record sequence (at most eight entries per
    /// record, holes for gaps, last-entry flag on each record's final
    /// entry, removable flag for entries on removable packs) and compares
    /// it position by position against the chain. Only records whose
    /// content differs become dirty; surplus old records are deleted and
    /// additional records are appended. Returns the number of records
    /// that became dirty or deleted.
    pub fn synchronize_descriptors(
        &self,
        chain: &mut DescriptorChain,
        is_removable: impl Fn(LdatIndex) -> bool,
    ) -> Result<usize> {
        let wanted = self.build_records(&is_removable)?;
        let mut changed = 0_usize;

        for (pos, record) in wanted.iter().enumerate() {
            match chain.records.get_mut(pos) {
                Some(existing)
                    if existing.state != RecordState::Deleted
                        && existing.record.same_content(record) => {}
                Some(existing) => {
                    existing.record.first_word = record.first_word;
                    existing.record.last_word_plus_one = record.last_word_plus_one;
                    existing.record.entries.clone_from(&record.entries);
                    existing.state = RecordState::Dirty;
                    changed += 1;
                }
                None => {
                    chain.records.push(ChainRecord {
                        address: None,
                        record: record.clone(),
                        state: RecordState::Dirty,
                    });
                    changed += 1;
                }
            }
        }

        let keep = wanted.len();
        let mut idx = keep;
        while idx < chain.records.len() {
            if chain.records[idx].address.is_none() {
                chain.records.remove(idx);
                continue;
            }
            if chain.records[idx].state != RecordState::Deleted {
                chain.records[idx].state = RecordState::Deleted;
                changed += 1;
            }
            idx += 1;
        }

        debug!(
            records = keep,
            changed,
            extents = self.extents.len(),
            "descriptors_synchronized"
        );
        Ok(changed)
    }

    fn build_records(
        &self,
        is_removable: &impl Fn(LdatIndex) -> bool,
    ) -> Result<Vec<DescriptorRecord>> {
        let Some(highest) = self.highest_track_allocated() else {
            return Ok(Vec::new());
        };
        let to_words = |tracks: u64| {
            tracks_to_words(tracks).ok_or_else(|| {
                MfdError::Invariant(format!("{tracks} tracks overflow a word address"))
            })
        };

        let mut records: Vec<DescriptorRecord> = Vec::new();
        for piece in self.file_allocation_entries(TrackId::ZERO, highest.0 + 1) {
            let entry = match piece.location {
                Some((ldat, device_track)) => DescriptorEntry {
                    device_word_address: to_words(device_track.0)?,
                    word_length: to_words(piece.count)?,
                    ldat,
                    last: false,
                    removable: is_removable(ldat),
                },
                None => DescriptorEntry::hole(to_words(piece.count)?),
            };
            let start_word = to_words(piece.file_start.0)?;
            match records.last_mut() {
                Some(current) if current.entries.len() < DAD_ENTRIES => {
                    current.last_word_plus_one += entry.word_length;
                    current.entries.push(entry);
                }
                _ => records.push(DescriptorRecord {
                    forward: None,
                    backward: None,
                    first_word: start_word,
                    last_word_plus_one: start_word + entry.word_length,
                    entries: vec![entry],
                }),
            }
        }
        for record in &mut records {
            if let Some(last) = record.entries.last_mut() {
                last.last = true;
            }
        }
        Ok(records)
    }

    /// Rebuild an extent map from a loaded chain.
    ///
    /// Word fields must be track-aligned, and each record must begin where
    /// the previous one ended; anything else is corruption of the record's
    /// sector.
    pub fn from_descriptors(chain: &DescriptorChain) -> Result<Self> {
        let mut map = Self::new();
        let mut expected_word = 0_u64;

        for chain_record in chain.live() {
            let sector = chain_record.address.map_or(0, |a| a.0);
            let corrupt = |detail: String| {
                error!(sector, detail = %detail, "descriptor_chain_corrupt");
                MfdError::Corruption { sector, detail }
            };
            let record = &chain_record.record;
            if record.first_word != expected_word {
                return Err(corrupt(format!(
                    "record starts at word {} but the chain reached {expected_word}",
                    record.first_word
                )));
            }

            let mut word = record.first_word;
            for entry in &record.entries {
                let tracks = words_to_tracks(entry.word_length).ok_or_else(|| {
                    corrupt(format!("entry length {} not track aligned", entry.word_length))
                })?;
                let file_track = words_to_tracks(word)
                    .ok_or_else(|| corrupt(format!("file word {word} not track aligned")))?;
                if !entry.is_hole() {
                    let device_track = words_to_tracks(entry.device_word_address).ok_or_else(|| {
                        corrupt(format!(
                            "device word {} not track aligned",
                            entry.device_word_address
                        ))
                    })?;
                    let located = map.allocated(
                        TrackId(file_track),
                        tracks,
                        entry.ldat,
                        TrackId(device_track),
                    );
                    if !located {
                        return Err(corrupt(format!(
                            "entry at file track {file_track} overlaps an earlier entry"
                        )));
                    }
                }
                word += entry.word_length;
            }
            if word != record.last_word_plus_one {
                return Err(corrupt(format!(
                    "entries end at word {word} but the record claims {}",
                    record.last_word_plus_one
                )));
            }
            expected_word = word;
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfd_types::WORDS_PER_TRACK;

    fn sector(n: u32) -> SectorAddress {
        SectorAddress::new(LdatIndex(1), TrackId(2), n).unwrap()
    }

    fn never_removable(_: LdatIndex) -> bool {
        false
    }

    /// Bind fresh sectors to unbound records, link, and commit.
    fn commit(chain: &mut DescriptorChain, next_sector: &mut u32) -> usize {
        for idx in chain.unbound() {
            chain.bind_address(idx, sector(*next_sector)).unwrap();
            *next_sector += 1;
        }
        chain.link().unwrap();
        let writes = chain.pending_writes().unwrap().len();
        chain.mark_committed();
        writes
    }

    fn striped(extents: u64) -> FileExtentMap {
        let mut map = FileExtentMap::new();
        // Every other track on alternating packs: nothing merges.
        for i in 0..extents {
            let ldat = LdatIndex(1 + (i % 2) as u32);
            assert!(map.allocated(TrackId(i), 1, ldat, TrackId(100 + i * 3)));
        }
        map
    }

    #[test]
    fn empty_map_has_no_records() {
        let map = FileExtentMap::new();
        let mut chain = DescriptorChain::new();
        assert_eq!(map.synchronize_descriptors(&mut chain, never_removable).unwrap(), 0);
        assert_eq!(chain.live_count(), 0);
        assert_eq!(chain.head(), None);
    }

    #[test]
    fn records_hold_eight_entries_and_flag_last() {
        let map = striped(10);
        let mut chain = DescriptorChain::new();
        assert_eq!(map.synchronize_descriptors(&mut chain, never_removable).unwrap(), 2);
        let records: Vec<_> = chain.live().map(|r| r.record.clone()).collect();
        assert_eq!(records[0].entries.len(), 8);
        assert_eq!(records[1].entries.len(), 2);
        assert_eq!(records[1].first_word, 8 * WORDS_PER_TRACK);
        for record in &records {
            let flagged: Vec<bool> = record.entries.iter().map(|e| e.last).collect();
            assert_eq!(flagged.iter().filter(|f| **f).count(), 1);
            assert!(flagged[flagged.len() - 1]);
        }
    }

    #[test]
    fn unchanged_map_rewrites_nothing() {
        let map = striped(10);
        let mut chain = DescriptorChain::new();
        let mut next = 1;
        map.synchronize_descriptors(&mut chain, never_removable).unwrap();
        assert_eq!(commit(&mut chain, &mut next), 2);

        assert_eq!(map.synchronize_descriptors(&mut chain, never_removable).unwrap(), 0);
        assert!(!chain.is_dirty());
        assert_eq!(commit(&mut chain, &mut next), 0);
    }

    #[test]
    fn only_changed_record_is_rewritten() {
        let mut map = striped(20);
        let mut chain = DescriptorChain::new();
        let mut next = 1;
        map.synchronize_descriptors(&mut chain, never_removable).unwrap();
        assert_eq!(commit(&mut chain, &mut next), 3);

        // Extend the last extent in place: only the final record changes.
        assert!(map.allocated(TrackId(20), 1, LdatIndex(2), TrackId(100 + 19 * 3 + 1)));
        assert_eq!(map.synchronize_descriptors(&mut chain, never_removable).unwrap(), 1);
        assert_eq!(commit(&mut chain, &mut next), 1);
    }

    #[test]
    fn shrinking_deletes_trailing_records() {
        let mut map = striped(20);
        let mut chain = DescriptorChain::new();
        let mut next = 1;
        map.synchronize_descriptors(&mut chain, never_removable).unwrap();
        commit(&mut chain, &mut next);
        let third = chain.records()[2].address;

        assert!(map.released(TrackId(8), 12));
        map.synchronize_descriptors(&mut chain, never_removable).unwrap();
        assert_eq!(chain.live_count(), 1);
        let deletes = chain.pending_deletes();
        assert_eq!(deletes.len(), 2);
        assert!(deletes.contains(&third.unwrap()));

        // The surviving record loses its forward link.
        assert_eq!(commit(&mut chain, &mut next), 1);
        assert_eq!(chain.records()[0].record.forward, None);
    }

    #[test]
    fn holes_survive_round_trip() {
        let mut map = FileExtentMap::new();
        assert!(map.allocated(TrackId(3), 2, LdatIndex(1), TrackId(40)));
        assert!(map.allocated(TrackId(10), 4, LdatIndex(5), TrackId(8)));
        let mut chain = DescriptorChain::new();
        let mut next = 1;
        map.synchronize_descriptors(&mut chain, |ldat| ldat == LdatIndex(5))
            .unwrap();
        commit(&mut chain, &mut next);

        let record = &chain.records()[0].record;
        assert!(record.entries[0].is_hole());
        assert!(record.entries[2].is_hole());
        assert!(record.entries[3].removable);
        assert!(!record.entries[1].removable);

        // Through the sector codec and back.
        let loaded: Vec<_> = chain
            .live()
            .map(|r| {
                let bytes = r.record.to_bytes().unwrap();
                (r.address.unwrap(), DescriptorRecord::parse_from_bytes(&bytes).unwrap())
            })
            .collect();
        let rebuilt =
            FileExtentMap::from_descriptors(&DescriptorChain::from_loaded(loaded)).unwrap();
        assert_eq!(rebuilt, map);
    }

    #[test]
    fn link_fills_neighbours() {
        let map = striped(17);
        let mut chain = DescriptorChain::new();
        let mut next = 1;
        map.synchronize_descriptors(&mut chain, never_removable).unwrap();
        commit(&mut chain, &mut next);
        let records = chain.records();
        assert_eq!(records[0].record.backward, None);
        assert_eq!(records[0].record.forward, records[1].address);
        assert_eq!(records[1].record.backward, records[0].address);
        assert_eq!(records[2].record.forward, None);
        assert_eq!(chain.head(), records[0].address);
    }

    #[test]
    fn misaligned_chain_is_corruption() {
        let mut entry = DescriptorEntry::hole(WORDS_PER_TRACK + 1);
        entry.last = true;
        let record = DescriptorRecord {
            last_word_plus_one: WORDS_PER_TRACK + 1,
            entries: vec![entry],
            ..DescriptorRecord::default()
        };
        let chain = DescriptorChain::from_loaded(vec![(sector(9), record)]);
        let err = FileExtentMap::from_descriptors(&chain).unwrap_err();
        assert!(matches!(err, MfdError::Corruption { sector: s, .. } if s == sector(9).0));
    }

    #[test]
    fn discontinuous_chain_is_corruption() {
        let mut entry = DescriptorEntry::hole(WORDS_PER_TRACK);
        entry.last = true;
        let first = DescriptorRecord {
            last_word_plus_one: WORDS_PER_TRACK,
            entries: vec![entry],
            ..DescriptorRecord::default()
        };
        let second = DescriptorRecord {
            first_word: 5 * WORDS_PER_TRACK,
            last_word_plus_one: 6 * WORDS_PER_TRACK,
            entries: vec![entry],
            ..DescriptorRecord::default()
        };
        let chain = DescriptorChain::from_loaded(vec![(sector(1), first), (sector(2), second)]);
        assert!(FileExtentMap::from_descriptors(&chain).unwrap_err().is_fatal());
    }

    #[test]
    fn clear_deletes_bound_records() {
        let map = striped(9);
        let mut chain = DescriptorChain::new();
        let mut next = 1;
        map.synchronize_descriptors(&mut chain, never_removable).unwrap();
        commit(&mut chain, &mut next);
        chain.clear();
        assert_eq!(chain.live_count(), 0);
        assert_eq!(chain.pending_deletes().len(), 2);
        chain.mark_committed();
        assert!(chain.records().is_empty());
    }
}
