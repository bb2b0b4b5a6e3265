//! Lead items: the file-set record of the master file directory.
//!
//! Sector 0:
//!
//! | Word | Content |
//! |------|---------|
//! | 0-2 | qualifier |
//! | 3-5 | filename |
//! | 6-8 | project id |
//! | 9-10 | read key |
//! | 11-12 | write key |
//! | 13 | guarded (bit 35), plus-one exists (bit 34), max range (bits 6-11), current range (bits 0-5) |
//! | 14 | highest absolute cycle |
//! | 15 | link to sector 1 |
//! | 16-27 | cycle links 0-11 |
//!
//! Sector 1 (present once the range passes 12): word 0 links back to
//! sector 0, words 1-20 hold cycle links 12-31.

use crate::{blank_sector, ensure_sector, read_ascii, read_link, read_word36, write_ascii};
use mfd_types::{ParseError, SectorAddress, read_word, write_word};
use serde::{Deserialize, Serialize};

/// Cycle links held in lead sector 0.
pub const LEAD_PRIMARY_LINKS: usize = 12;
/// Cycle links held in lead sector 1.
pub const LEAD_OVERFLOW_LINKS: usize = 20;
/// Largest cycle range a lead item can describe.
pub const MAX_CYCLE_LINKS: usize = LEAD_PRIMARY_LINKS + LEAD_OVERFLOW_LINKS;

const LINK_TO_BE_CATALOGED: u64 = 1 << 62;
const LINK_TO_BE_DROPPED: u64 = 1 << 61;
const LINK_ADDRESS: u64 = (1 << 42) - 1;

const FLAG_GUARDED: u64 = 1 << 35;
const FLAG_PLUS_ONE: u64 = 1 << 34;
const RANGE_FIELD: u64 = 0o77;

/// One slot of the cycle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleLink {
    pub main_item: SectorAddress,
    pub to_be_cataloged: bool,
    pub to_be_dropped: bool,
}

impl CycleLink {
    fn encode(slot: Option<&Self>) -> u64 {
        slot.map_or(0, |link| {
            let mut word = link.main_item.0;
            if link.to_be_cataloged {
                word |= LINK_TO_BE_CATALOGED;
            }
            if link.to_be_dropped {
                word |= LINK_TO_BE_DROPPED;
            }
            word
        })
    }

    fn decode(word: u64) -> Result<Option<Self>, ParseError> {
        if word == 0 {
            return Ok(None);
        }
        if word & !(LINK_ADDRESS | LINK_TO_BE_CATALOGED | LINK_TO_BE_DROPPED) != 0 {
            return Err(ParseError::InvalidField {
                field: "lead.cycle_link",
                reason: "unknown bits set",
            });
        }
        let main_item = SectorAddress(word & LINK_ADDRESS);
        if main_item.is_none() {
            return Err(ParseError::InvalidField {
                field: "lead.cycle_link",
                reason: "flags without a main item address",
            });
        }
        Ok(Some(Self {
            main_item,
            to_be_cataloged: word & LINK_TO_BE_CATALOGED != 0,
            to_be_dropped: word & LINK_TO_BE_DROPPED != 0,
        }))
    }
}

/// Decoded lead item.
///
/// `links[i]` is the slot for absolute cycle `highest_absolute_cycle - i`
/// (wrapping within 1..=999); `links.len()` is the current range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadItem {
    pub qualifier: String,
    pub filename: String,
    pub project_id: String,
    pub read_key: String,
    pub write_key: String,
    pub guarded: bool,
    pub plus_one_exists: bool,
    pub max_cycle_range: u32,
    pub highest_absolute_cycle: u32,
    /// Address of sector 1, once the range has outgrown sector 0.
    pub overflow: Option<SectorAddress>,
    pub links: Vec<Option<CycleLink>>,
}

impl LeadItem {
    /// Whether the current range needs sector 1.
    #[must_use]
    pub fn needs_overflow(&self) -> bool {
        self.links.len() > LEAD_PRIMARY_LINKS
    }

    /// Read the sector 1 link out of a raw sector 0.
    pub fn overflow_link(sector0: &[u8]) -> Result<Option<SectorAddress>, ParseError> {
        ensure_sector(sector0)?;
        read_link(sector0, 15)
    }

    pub fn parse_from_sectors(sector0: &[u8], sector1: Option<&[u8]>) -> Result<Self, ParseError> {
        ensure_sector(sector0)?;

        let qualifier = read_ascii(sector0, 0, 3)?;
        let filename = read_ascii(sector0, 3, 3)?;
        let project_id = read_ascii(sector0, 6, 3)?;
        let read_key = read_ascii(sector0, 9, 2)?;
        let write_key = read_ascii(sector0, 11, 2)?;

        let control = read_word36(sector0, 13, "lead.control")?;
        let current_range = usize::try_from(control & RANGE_FIELD).map_err(|_| {
            ParseError::IntegerConversion {
                field: "lead.current_range",
            }
        })?;
        let max_cycle_range = u32::try_from((control >> 6) & RANGE_FIELD).map_err(|_| {
            ParseError::IntegerConversion {
                field: "lead.max_range",
            }
        })?;
        validate_ranges(current_range, max_cycle_range)?;

        let highest = read_word36(sector0, 14, "lead.highest_cycle")?;
        let highest_absolute_cycle = u32::try_from(highest)
            .ok()
            .filter(|c| *c <= 999)
            .ok_or(ParseError::InvalidField {
                field: "lead.highest_cycle",
                reason: "cycle beyond 999",
            })?;
        let overflow = read_link(sector0, 15)?;

        let mut links = Vec::with_capacity(current_range);
        for slot in 0..current_range.min(LEAD_PRIMARY_LINKS) {
            links.push(CycleLink::decode(read_word(sector0, 16 + slot)?)?);
        }
        if current_range > LEAD_PRIMARY_LINKS {
            let sector1 = sector1.ok_or(ParseError::InvalidField {
                field: "lead.overflow",
                reason: "range needs sector 1 but none was supplied",
            })?;
            ensure_sector(sector1)?;
            if overflow.is_none() {
                return Err(ParseError::InvalidField {
                    field: "lead.overflow",
                    reason: "range needs sector 1 but the link is empty",
                });
            }
            for slot in 0..current_range - LEAD_PRIMARY_LINKS {
                links.push(CycleLink::decode(read_word(sector1, 1 + slot)?)?);
            }
        }

        Ok(Self {
            qualifier,
            filename,
            project_id,
            read_key,
            write_key,
            guarded: control & FLAG_GUARDED != 0,
            plus_one_exists: control & FLAG_PLUS_ONE != 0,
            max_cycle_range,
            highest_absolute_cycle,
            overflow,
            links,
        })
    }

    /// Encode sector 0, plus sector 1 when an overflow sector is linked.
    ///
    /// `own_address` is the address of sector 0, written as sector 1's
    /// back link.
    pub fn to_sectors(
        &self,
        own_address: SectorAddress,
    ) -> Result<(Vec<u8>, Option<Vec<u8>>), ParseError> {
        validate_ranges(self.links.len(), self.max_cycle_range)?;
        if self.needs_overflow() && self.overflow.is_none() {
            return Err(ParseError::InvalidField {
                field: "lead.overflow",
                reason: "range needs sector 1 but no address was bound",
            });
        }

        let mut sector0 = blank_sector();
        write_ascii(&mut sector0, 0, 3, &self.qualifier)?;
        write_ascii(&mut sector0, 3, 3, &self.filename)?;
        write_ascii(&mut sector0, 6, 3, &self.project_id)?;
        write_ascii(&mut sector0, 9, 2, &self.read_key)?;
        write_ascii(&mut sector0, 11, 2, &self.write_key)?;

        let mut control = (u64::from(self.max_cycle_range) << 6) | self.links.len() as u64;
        if self.guarded {
            control |= FLAG_GUARDED;
        }
        if self.plus_one_exists {
            control |= FLAG_PLUS_ONE;
        }
        write_word(&mut sector0, 13, control)?;
        write_word(&mut sector0, 14, u64::from(self.highest_absolute_cycle))?;
        write_word(&mut sector0, 15, SectorAddress::from_link(self.overflow).0)?;

        for (slot, link) in self.links.iter().take(LEAD_PRIMARY_LINKS).enumerate() {
            write_word(&mut sector0, 16 + slot, CycleLink::encode(link.as_ref()))?;
        }

        let sector1 = match self.overflow {
            Some(_) => {
                let mut sector1 = blank_sector();
                write_word(&mut sector1, 0, own_address.0)?;
                for (slot, link) in self.links.iter().skip(LEAD_PRIMARY_LINKS).enumerate() {
                    write_word(&mut sector1, 1 + slot, CycleLink::encode(link.as_ref()))?;
                }
                Some(sector1)
            }
            None => None,
        };

        Ok((sector0, sector1))
    }
}

fn validate_ranges(current: usize, max: u32) -> Result<(), ParseError> {
    if max == 0 || max as usize > MAX_CYCLE_LINKS {
        return Err(ParseError::InvalidField {
            field: "lead.max_range",
            reason: "must be in 1..=32",
        });
    }
    if current > max as usize {
        return Err(ParseError::InvalidField {
            field: "lead.current_range",
            reason: "exceeds max range",
        });
    }
    Ok(())
}
