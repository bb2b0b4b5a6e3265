//! Main items: the per-cycle record of the master file directory.
//!
//! | Word | Content |
//! |------|---------|
//! | 0-2 | qualifier |
//! | 3-5 | filename |
//! | 6-8 | project id |
//! | 9-11 | account id |
//! | 12 | lead item link |
//! | 13 | DAD chain head |
//! | 14 | absolute cycle (bits 0-9), kind (bits 12-13) |
//! | 15 | flag word |
//! | 16 | current assign count (bits 18-35), cumulative (bits 0-17) |
//! | 17.. | kind-specific fields |
//!
//! Mass storage: w17 granularity (bit 0) and word-addressable (bit 1),
//! w18-19 equipment, w20 initial reserve, w21 max granules, w22 highest
//! granule assigned, w23 highest track written.
//!
//! Tape: w17 density, w18 reel count, w19-26 up to four reel numbers.

use crate::{
    blank_sector, ensure_sector, read_ascii, read_link, read_word36, write_ascii, write_word36,
};
use mfd_types::{
    CHARS_PER_WORD, MAX_FILE_TRACKS, ParseError, SectorAddress, TRACKS_PER_POSITION, read_word,
    write_word,
};
use serde::{Deserialize, Serialize};

const KIND_MASS_STORAGE: u64 = 1;
const KIND_TAPE: u64 = 2;
const CYCLE_FIELD: u64 = 0o1777;
const COUNT_FIELD: u64 = 0o777_777;
const EQUIPMENT_WORDS: usize = 2;
const REEL_WORDS: usize = 2;

/// Reel numbers a tape cycle can list.
pub const MAX_REELS: usize = 4;
/// Width of the equipment type field.
pub const EQUIPMENT_CHARS: usize = EQUIPMENT_WORDS * CHARS_PER_WORD;
/// Width of one reel number.
pub const REEL_CHARS: usize = REEL_WORDS * CHARS_PER_WORD;

/// Allocation unit of a mass-storage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Granularity {
    #[default]
    Track,
    Position,
}

impl Granularity {
    /// Tracks in one granule.
    #[must_use]
    pub fn tracks_per_granule(self) -> u64 {
        match self {
            Self::Track => 1,
            Self::Position => TRACKS_PER_POSITION,
        }
    }

    /// Largest file size, in granules, whose word offsets fit 36 bits.
    #[must_use]
    pub fn addressable_granules(self) -> u64 {
        MAX_FILE_TRACKS / self.tracks_per_granule()
    }
}

/// Status flags of one file cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleFlags {
    pub directory_disabled: bool,
    pub written_to_disabled: bool,
    pub backup_inaccessible: bool,
    pub private: bool,
    pub guarded: bool,
    pub exclusive_use: bool,
    pub read_inhibited: bool,
    pub write_inhibited: bool,
    pub queued_for_output: bool,
    pub to_be_cataloged: bool,
    pub to_be_dropped: bool,
}

impl CycleFlags {
    fn bits(self) -> [bool; 11] {
        [
            self.directory_disabled,
            self.written_to_disabled,
            self.backup_inaccessible,
            self.private,
            self.guarded,
            self.exclusive_use,
            self.read_inhibited,
            self.write_inhibited,
            self.queued_for_output,
            self.to_be_cataloged,
            self.to_be_dropped,
        ]
    }

    fn to_word(self) -> u64 {
        self.bits()
            .iter()
            .enumerate()
            .fold(0, |word, (bit, set)| word | (u64::from(*set) << bit))
    }

    fn from_word(word: u64) -> Result<Self, ParseError> {
        if word >> 11 != 0 {
            return Err(ParseError::InvalidField {
                field: "main.flags",
                reason: "unknown flag bits set",
            });
        }
        let bit = |n: u32| word & (1 << n) != 0;
        Ok(Self {
            directory_disabled: bit(0),
            written_to_disabled: bit(1),
            backup_inaccessible: bit(2),
            private: bit(3),
            guarded: bit(4),
            exclusive_use: bit(5),
            read_inhibited: bit(6),
            write_inhibited: bit(7),
            queued_for_output: bit(8),
            to_be_cataloged: bit(9),
            to_be_dropped: bit(10),
        })
    }
}

/// Kind-specific part of a file cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileCycleKind {
    MassStorage {
        granularity: Granularity,
        word_addressable: bool,
        equipment: String,
        /// Granules allocated when the cycle is cataloged.
        initial_reserve: u64,
        max_granules: u64,
        highest_granule_assigned: u64,
        highest_track_written: u64,
    },
    /// Catalog metadata only; tape handling lives elsewhere.
    Tape {
        density: u32,
        reel_numbers: Vec<String>,
    },
}

/// One cataloged file cycle as stored in its main item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCycle {
    pub qualifier: String,
    pub filename: String,
    pub project_id: String,
    pub account_id: String,
    pub lead_item: SectorAddress,
    pub dad_head: Option<SectorAddress>,
    pub absolute_cycle: u32,
    pub flags: CycleFlags,
    pub current_assign_count: u32,
    pub cumulative_assign_count: u32,
    pub kind: FileCycleKind,
}

impl FileCycle {
    #[must_use]
    pub fn is_mass_storage(&self) -> bool {
        matches!(self.kind, FileCycleKind::MassStorage { .. })
    }

    /// Granularity of a mass-storage cycle; `None` for tape.
    #[must_use]
    pub fn granularity(&self) -> Option<Granularity> {
        match self.kind {
            FileCycleKind::MassStorage { granularity, .. } => Some(granularity),
            FileCycleKind::Tape { .. } => None,
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_sector(bytes)?;

        let qualifier = read_ascii(bytes, 0, 3)?;
        let filename = read_ascii(bytes, 3, 3)?;
        let project_id = read_ascii(bytes, 6, 3)?;
        let account_id = read_ascii(bytes, 9, 3)?;
        let lead_item = read_link(bytes, 12)?.ok_or(ParseError::InvalidField {
            field: "main.lead_item",
            reason: "main item has no lead item",
        })?;
        let dad_head = read_link(bytes, 13)?;

        let id = read_word36(bytes, 14, "main.cycle")?;
        let absolute_cycle = u32::try_from(id & CYCLE_FIELD)
            .ok()
            .filter(|c| (1..=999).contains(c))
            .ok_or(ParseError::InvalidField {
                field: "main.cycle",
                reason: "absolute cycle outside 1..=999",
            })?;
        let flags = CycleFlags::from_word(read_word36(bytes, 15, "main.flags")?)?;
        let counts = read_word36(bytes, 16, "main.assign_counts")?;
        let current_assign_count = to_u32((counts >> 18) & COUNT_FIELD, "main.current_assigns")?;
        let cumulative_assign_count = to_u32(counts & COUNT_FIELD, "main.cumulative_assigns")?;

        let kind = match (id >> 12) & 0o3 {
            KIND_MASS_STORAGE => {
                let control = read_word36(bytes, 17, "main.ms_control")?;
                FileCycleKind::MassStorage {
                    granularity: if control & 1 == 0 {
                        Granularity::Track
                    } else {
                        Granularity::Position
                    },
                    word_addressable: control & 2 != 0,
                    equipment: read_ascii(bytes, 18, EQUIPMENT_WORDS)?,
                    initial_reserve: read_word36(bytes, 20, "main.initial_reserve")?,
                    max_granules: read_word36(bytes, 21, "main.max_granules")?,
                    highest_granule_assigned: read_word36(bytes, 22, "main.highest_granule")?,
                    highest_track_written: read_word36(bytes, 23, "main.highest_written")?,
                }
            }
            KIND_TAPE => {
                let density = to_u32(read_word36(bytes, 17, "main.density")?, "main.density")?;
                let reels = usize::try_from(read_word(bytes, 18)?)
                    .ok()
                    .filter(|n| *n <= MAX_REELS)
                    .ok_or(ParseError::InvalidField {
                        field: "main.reel_count",
                        reason: "more than four reels",
                    })?;
                let reel_numbers = (0..reels)
                    .map(|i| read_ascii(bytes, 19 + REEL_WORDS * i, REEL_WORDS))
                    .collect::<Result<Vec<_>, _>>()?;
                FileCycleKind::Tape {
                    density,
                    reel_numbers,
                }
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "main.kind",
                    reason: "unknown file cycle kind",
                });
            }
        };

        Ok(Self {
            qualifier,
            filename,
            project_id,
            account_id,
            lead_item,
            dad_head,
            absolute_cycle,
            flags,
            current_assign_count,
            cumulative_assign_count,
            kind,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        if !(1..=999).contains(&self.absolute_cycle) {
            return Err(ParseError::InvalidField {
                field: "main.cycle",
                reason: "absolute cycle outside 1..=999",
            });
        }
        let current = u64::from(self.current_assign_count);
        let cumulative = u64::from(self.cumulative_assign_count);
        if current > COUNT_FIELD || cumulative > COUNT_FIELD {
            return Err(ParseError::InvalidField {
                field: "main.assign_counts",
                reason: "count exceeds 18 bits",
            });
        }

        let mut bytes = blank_sector();
        write_ascii(&mut bytes, 0, 3, &self.qualifier)?;
        write_ascii(&mut bytes, 3, 3, &self.filename)?;
        write_ascii(&mut bytes, 6, 3, &self.project_id)?;
        write_ascii(&mut bytes, 9, 3, &self.account_id)?;
        write_word(&mut bytes, 12, self.lead_item.0)?;
        write_word(&mut bytes, 13, SectorAddress::from_link(self.dad_head).0)?;
        write_word(&mut bytes, 15, self.flags.to_word())?;
        write_word(&mut bytes, 16, (current << 18) | cumulative)?;

        let kind = match &self.kind {
            FileCycleKind::MassStorage {
                granularity,
                word_addressable,
                equipment,
                initial_reserve,
                max_granules,
                highest_granule_assigned,
                highest_track_written,
            } => {
                let mut control = u64::from(*granularity == Granularity::Position);
                if *word_addressable {
                    control |= 2;
                }
                write_word(&mut bytes, 17, control)?;
                write_ascii(&mut bytes, 18, EQUIPMENT_WORDS, equipment)?;
                write_word36(&mut bytes, 20, *initial_reserve, "main.initial_reserve")?;
                write_word36(&mut bytes, 21, *max_granules, "main.max_granules")?;
                write_word36(&mut bytes, 22, *highest_granule_assigned, "main.highest_granule")?;
                write_word36(&mut bytes, 23, *highest_track_written, "main.highest_written")?;
                KIND_MASS_STORAGE
            }
            FileCycleKind::Tape {
                density,
                reel_numbers,
            } => {
                if reel_numbers.len() > MAX_REELS {
                    return Err(ParseError::InvalidField {
                        field: "main.reel_count",
                        reason: "more than four reels",
                    });
                }
                write_word36(&mut bytes, 17, u64::from(*density), "main.density")?;
                write_word(&mut bytes, 18, reel_numbers.len() as u64)?;
                for (i, reel) in reel_numbers.iter().enumerate() {
                    write_ascii(&mut bytes, 19 + REEL_WORDS * i, REEL_WORDS, reel)?;
                }
                KIND_TAPE
            }
        };
        write_word(&mut bytes, 14, (kind << 12) | u64::from(self.absolute_cycle))?;
        Ok(bytes)
    }
}

fn to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfd_types::{LdatIndex, TrackId, WORD_MASK};

    fn addr(sector: u32) -> SectorAddress {
        SectorAddress::new(LdatIndex(2), TrackId(9), sector).unwrap()
    }

    fn mass_storage_cycle() -> FileCycle {
        FileCycle {
            qualifier: "PAYROLL".to_owned(),
            filename: "LEDGER".to_owned(),
            project_id: "ACCTG".to_owned(),
            account_id: "A100".to_owned(),
            lead_item: addr(1),
            dad_head: Some(addr(7)),
            absolute_cycle: 999,
            flags: CycleFlags {
                private: true,
                to_be_cataloged: true,
                ..CycleFlags::default()
            },
            current_assign_count: 3,
            cumulative_assign_count: 0o777_777,
            kind: FileCycleKind::MassStorage {
                granularity: Granularity::Position,
                word_addressable: true,
                equipment: "F".to_owned(),
                initial_reserve: 2,
                max_granules: 256,
                highest_granule_assigned: 1,
                highest_track_written: 100,
            },
        }
    }

    #[test]
    fn mass_storage_cycle_round_trips() {
        let cycle = mass_storage_cycle();
        let parsed = FileCycle::parse_from_bytes(&cycle.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, cycle);
        assert_eq!(parsed.granularity(), Some(Granularity::Position));
    }

    #[test]
    fn tape_cycle_round_trips() {
        let cycle = FileCycle {
            dad_head: None,
            kind: FileCycleKind::Tape {
                density: 6250,
                reel_numbers: vec!["R00001".to_owned(), "R00002".to_owned()],
            },
            ..mass_storage_cycle()
        };
        let parsed = FileCycle::parse_from_bytes(&cycle.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, cycle);
        assert!(!parsed.is_mass_storage());
        assert_eq!(parsed.granularity(), None);
    }

    #[test]
    fn rejects_bad_cycle_and_counts() {
        let mut cycle = mass_storage_cycle();
        cycle.absolute_cycle = 0;
        assert!(cycle.to_bytes().is_err());
        cycle.absolute_cycle = 1000;
        assert!(cycle.to_bytes().is_err());
        cycle.absolute_cycle = 5;
        cycle.current_assign_count = 1 << 20;
        assert!(cycle.to_bytes().is_err());
    }

    #[test]
    fn refuses_fields_it_could_not_read_back() {
        let wide = |edit: fn(&mut FileCycleKind)| {
            let mut cycle = mass_storage_cycle();
            edit(&mut cycle.kind);
            cycle.to_bytes()
        };
        assert!(wide(|k| {
            if let FileCycleKind::MassStorage { max_granules, .. } = k {
                *max_granules = WORD_MASK + 1;
            }
        })
        .is_err());
        assert!(wide(|k| {
            if let FileCycleKind::MassStorage {
                highest_track_written,
                ..
            } = k
            {
                *highest_track_written = u64::MAX;
            }
        })
        .is_err());
        assert!(wide(|k| {
            if let FileCycleKind::MassStorage { equipment, .. } = k {
                *equipment = "LONGEQUIPNM".to_owned();
            }
        })
        .is_err());
        assert!(wide(|k| {
            *k = FileCycleKind::Tape {
                density: 1600,
                reel_numbers: vec!["R1".to_owned(); MAX_REELS + 1],
            };
        })
        .is_err());
    }

    #[test]
    fn rejects_unknown_kind_and_missing_lead() {
        let cycle = mass_storage_cycle();
        let mut bytes = cycle.to_bytes().unwrap();
        write_word(&mut bytes, 14, (3 << 12) | 5).unwrap();
        assert!(FileCycle::parse_from_bytes(&bytes).is_err());

        let mut bytes = cycle.to_bytes().unwrap();
        write_word(&mut bytes, 12, 0).unwrap();
        assert!(FileCycle::parse_from_bytes(&bytes).is_err());
    }

    #[test]
    fn granule_sizes() {
        assert_eq!(Granularity::Track.tracks_per_granule(), 1);
        assert_eq!(Granularity::Position.tracks_per_granule(), 64);
        assert_eq!(Granularity::Track.addressable_granules(), MAX_FILE_TRACKS);
        assert_eq!(Granularity::Position.addressable_granules(), MAX_FILE_TRACKS / 64);
    }
}
