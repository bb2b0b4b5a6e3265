//! Device area descriptor (DAD) records.
//!
//! One record per sector:
//!
//! | Word | Content |
//! |------|---------|
//! | 0 | forward link |
//! | 1 | backward link |
//! | 2 | first file-relative word covered |
//! | 3 | last file-relative word covered + 1 |
//! | 4.. | 8 entries × 3 words: device word address, word length, flags/ldat |
//!
//! The flags/ldat word carries the last-entry flag in bit 35, the
//! removable-pack flag in bit 34 and the LDAT index in the low 18 bits.
//! Unused entries are all-zero.

use crate::{blank_sector, ensure_sector, read_link, read_word36, write_word36};
use mfd_types::{HOLE_LDAT, LdatIndex, ParseError, SectorAddress, write_word};
use serde::{Deserialize, Serialize};

/// Entries in one descriptor record.
pub const DAD_ENTRIES: usize = 8;

const ENTRY_BASE: usize = 4;
const ENTRY_WORDS: usize = 3;
const FLAG_LAST: u64 = 1 << 35;
const FLAG_REMOVABLE: u64 = 1 << 34;
const LDAT_FIELD: u64 = 0o777_777;

/// One contiguous span of a file: either an extent on a pack or a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorEntry {
    pub device_word_address: u64,
    pub word_length: u64,
    pub ldat: LdatIndex,
    pub last: bool,
    pub removable: bool,
}

impl DescriptorEntry {
    /// An entry describing `word_length` unallocated words.
    #[must_use]
    pub fn hole(word_length: u64) -> Self {
        Self {
            device_word_address: 0,
            word_length,
            ldat: LdatIndex::HOLE,
            last: false,
            removable: false,
        }
    }

    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.ldat.is_hole()
    }

    fn flags_word(&self) -> u64 {
        let mut word = u64::from(self.ldat.0) & LDAT_FIELD;
        if self.last {
            word |= FLAG_LAST;
        }
        if self.removable {
            word |= FLAG_REMOVABLE;
        }
        word
    }
}

/// One descriptor record of a file's DAD chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    pub forward: Option<SectorAddress>,
    pub backward: Option<SectorAddress>,
    pub first_word: u64,
    pub last_word_plus_one: u64,
    pub entries: Vec<DescriptorEntry>,
}

impl DescriptorRecord {
    /// Compare everything but the chain links.
    ///
    /// Links are bound when the chain is committed, so two records with
    /// the same coverage and entries describe the same storage.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.first_word == other.first_word
            && self.last_word_plus_one == other.last_word_plus_one
            && self.entries == other.entries
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_sector(bytes)?;

        let forward = read_link(bytes, 0)?;
        let backward = read_link(bytes, 1)?;
        let first_word = read_word36(bytes, 2, "dad.first_word")?;
        let last_word_plus_one = read_word36(bytes, 3, "dad.last_word_plus_one")?;
        if last_word_plus_one < first_word {
            return Err(ParseError::InvalidField {
                field: "dad.last_word_plus_one",
                reason: "range ends before it starts",
            });
        }

        let mut entries = Vec::with_capacity(DAD_ENTRIES);
        for slot in 0..DAD_ENTRIES {
            let base = ENTRY_BASE + slot * ENTRY_WORDS;
            let address = read_word36(bytes, base, "dad.entry.address")?;
            let length = read_word36(bytes, base + 1, "dad.entry.length")?;
            let flags = read_word36(bytes, base + 2, "dad.entry.flags")?;
            if address == 0 && length == 0 && flags == 0 {
                break;
            }
            if entries.last().is_some_and(|e: &DescriptorEntry| e.last) {
                return Err(ParseError::InvalidField {
                    field: "dad.entry",
                    reason: "entry follows the last-entry flag",
                });
            }
            let ldat_bits = flags & LDAT_FIELD;
            let ldat = if ldat_bits == u64::from(HOLE_LDAT) {
                LdatIndex::HOLE
            } else {
                LdatIndex::new(u32::try_from(ldat_bits).map_err(|_| {
                    ParseError::IntegerConversion {
                        field: "dad.entry.ldat",
                    }
                })?)?
            };
            if length == 0 {
                return Err(ParseError::InvalidField {
                    field: "dad.entry.length",
                    reason: "zero-length entry",
                });
            }
            entries.push(DescriptorEntry {
                device_word_address: address,
                word_length: length,
                ldat,
                last: flags & FLAG_LAST != 0,
                removable: flags & FLAG_REMOVABLE != 0,
            });
        }

        if entries.last().is_some_and(|e| !e.last) {
            return Err(ParseError::InvalidField {
                field: "dad.entry",
                reason: "final entry lacks the last-entry flag",
            });
        }
        let covered: u64 = entries.iter().map(|e| e.word_length).sum();
        if covered != last_word_plus_one - first_word {
            return Err(ParseError::InvalidField {
                field: "dad.entry.length",
                reason: "entry lengths do not cover the record range",
            });
        }

        Ok(Self {
            forward,
            backward,
            first_word,
            last_word_plus_one,
            entries,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        if self.entries.len() > DAD_ENTRIES {
            return Err(ParseError::InvalidField {
                field: "dad.entries",
                reason: "more than 8 entries",
            });
        }
        let mut bytes = blank_sector();
        write_word(&mut bytes, 0, SectorAddress::from_link(self.forward).0)?;
        write_word(&mut bytes, 1, SectorAddress::from_link(self.backward).0)?;
        write_word36(&mut bytes, 2, self.first_word, "dad.first_word")?;
        write_word36(&mut bytes, 3, self.last_word_plus_one, "dad.last_word_plus_one")?;
        for (slot, entry) in self.entries.iter().enumerate() {
            let base = ENTRY_BASE + slot * ENTRY_WORDS;
            write_word36(&mut bytes, base, entry.device_word_address, "dad.entry.address")?;
            write_word36(&mut bytes, base + 1, entry.word_length, "dad.entry.length")?;
            write_word(&mut bytes, base + 2, entry.flags_word())?;
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfd_types::{TrackId, WORD_MASK, WORDS_PER_TRACK};

    fn extent(ldat: u32, device_track: u64, tracks: u64) -> DescriptorEntry {
        DescriptorEntry {
            device_word_address: device_track * WORDS_PER_TRACK,
            word_length: tracks * WORDS_PER_TRACK,
            ldat: LdatIndex(ldat),
            last: false,
            removable: false,
        }
    }

    #[test]
    fn record_with_hole_round_trips() {
        let mut last = extent(2, 40, 3);
        last.last = true;
        last.removable = true;
        let record = DescriptorRecord {
            forward: None,
            backward: Some(SectorAddress::new(LdatIndex(1), TrackId(7), 5).unwrap()),
            first_word: 0,
            last_word_plus_one: 10 * WORDS_PER_TRACK,
            entries: vec![
                extent(1, 100, 5),
                DescriptorEntry::hole(2 * WORDS_PER_TRACK),
                last,
            ],
        };
        let bytes = record.to_bytes().unwrap();
        let parsed = DescriptorRecord::parse_from_bytes(&bytes).unwrap();
        assert_eq!(parsed, record);
        assert!(parsed.entries[1].is_hole());
        assert!(parsed.entries[2].removable);
    }

    #[test]
    fn empty_record_parses() {
        let record = DescriptorRecord::default();
        let parsed = DescriptorRecord::parse_from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert!(parsed.entries.is_empty());
    }

    #[test]
    fn rejects_missing_last_flag() {
        let record = DescriptorRecord {
            last_word_plus_one: WORDS_PER_TRACK,
            entries: vec![extent(1, 0, 1)],
            ..DescriptorRecord::default()
        };
        let bytes = record.to_bytes().unwrap();
        assert!(DescriptorRecord::parse_from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_coverage_mismatch() {
        let mut entry = extent(1, 0, 1);
        entry.last = true;
        let record = DescriptorRecord {
            last_word_plus_one: 2 * WORDS_PER_TRACK,
            entries: vec![entry],
            ..DescriptorRecord::default()
        };
        let bytes = record.to_bytes().unwrap();
        assert!(DescriptorRecord::parse_from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_ninth_entry_on_encode() {
        let record = DescriptorRecord {
            entries: vec![extent(1, 0, 1); DAD_ENTRIES + 1],
            ..DescriptorRecord::default()
        };
        assert!(record.to_bytes().is_err());
    }

    #[test]
    fn refuses_to_encode_words_past_36_bits() {
        let mut entry = extent(1, 0, 1);
        entry.last = true;
        let record = DescriptorRecord {
            first_word: WORD_MASK,
            last_word_plus_one: WORD_MASK + WORDS_PER_TRACK,
            entries: vec![entry],
            ..DescriptorRecord::default()
        };
        assert!(matches!(
            record.to_bytes(),
            Err(ParseError::InvalidField {
                field: "dad.last_word_plus_one",
                ..
            })
        ));

        let mut wide = extent(1, 0, 1);
        wide.device_word_address = WORD_MASK + 1;
        wide.last = true;
        let record = DescriptorRecord {
            last_word_plus_one: WORDS_PER_TRACK,
            entries: vec![wide],
            ..DescriptorRecord::default()
        };
        assert!(record.to_bytes().is_err());
    }

    #[test]
    fn same_content_ignores_links() {
        let a = DescriptorRecord::default();
        let b = DescriptorRecord {
            forward: Some(SectorAddress::new(LdatIndex(1), TrackId(1), 1).unwrap()),
            ..DescriptorRecord::default()
        };
        assert!(a.same_content(&b));
        assert_ne!(a, b);
    }
}
