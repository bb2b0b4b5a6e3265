#![forbid(unsafe_code)]
//! Directory sector formats.
//!
//! Pure parsing crate with no I/O. Parses 224-byte sectors
//! (28 words, each stored as a little-endian u64) into descriptor (DAD)
//! records, lead items and main items, and encodes them back.

pub mod dad;
pub mod lead;
pub mod main_item;

pub use dad::{DAD_ENTRIES, DescriptorEntry, DescriptorRecord};
pub use lead::{CycleLink, LEAD_OVERFLOW_LINKS, LEAD_PRIMARY_LINKS, LeadItem, MAX_CYCLE_LINKS};
pub use main_item::{
    CycleFlags, EQUIPMENT_CHARS, FileCycle, FileCycleKind, Granularity, MAX_REELS, REEL_CHARS,
};

use mfd_types::{ParseError, SECTOR_BYTES, SectorAddress, WORD_MASK, Word, read_word};

/// Reject anything but exactly one serialized sector.
pub(crate) fn ensure_sector(bytes: &[u8]) -> Result<(), ParseError> {
    if bytes.len() != SECTOR_BYTES {
        return Err(ParseError::InsufficientData {
            needed: SECTOR_BYTES,
            offset: 0,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// A zero-filled sector buffer.
pub(crate) fn blank_sector() -> Vec<u8> {
    vec![0_u8; SECTOR_BYTES]
}

/// Read a link word: zero means no link.
pub(crate) fn read_link(bytes: &[u8], index: usize) -> Result<Option<SectorAddress>, ParseError> {
    Ok(SectorAddress(read_word(bytes, index)?).into_link())
}

/// Read a word that must fit 36 bits.
pub(crate) fn read_word36(
    bytes: &[u8],
    index: usize,
    field: &'static str,
) -> Result<Word, ParseError> {
    let word = read_word(bytes, index)?;
    if word & !WORD_MASK != 0 {
        return Err(ParseError::InvalidField {
            field,
            reason: "value exceeds 36 bits",
        });
    }
    Ok(word)
}

/// Write a word that must fit 36 bits.
pub(crate) fn write_word36(
    bytes: &mut [u8],
    index: usize,
    value: Word,
    field: &'static str,
) -> Result<(), ParseError> {
    if value & !WORD_MASK != 0 {
        return Err(ParseError::InvalidField {
            field,
            reason: "value exceeds 36 bits",
        });
    }
    mfd_types::write_word(bytes, index, value)
}

/// Unpack a fixed-width ASCII field of `words` words starting at `index`.
pub(crate) fn read_ascii(bytes: &[u8], index: usize, words: usize) -> Result<String, ParseError> {
    let raw = (index..index + words)
        .map(|i| read_word(bytes, i))
        .collect::<Result<Vec<_>, _>>()?;
    mfd_types::unpack_ascii(&raw)
}

/// Pack `text` into `words` words at `index`.
pub(crate) fn write_ascii(
    bytes: &mut [u8],
    index: usize,
    words: usize,
    text: &str,
) -> Result<(), ParseError> {
    for (offset, word) in mfd_types::pack_ascii(text, words)?.into_iter().enumerate() {
        mfd_types::write_word(bytes, index + offset, word)?;
    }
    Ok(())
}
