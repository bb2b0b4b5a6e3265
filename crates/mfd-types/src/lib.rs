#![forbid(unsafe_code)]
//! Shared vocabulary for the mass-storage engine: unit-carrying newtypes,
//! disk geometry constants, and the word-level parsing helpers used by the
//! directory codecs.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Geometry ────────────────────────────────────────────────────────────────

/// Words in one directory sector.
pub const WORDS_PER_SECTOR: usize = 28;

/// Sectors in one track.
pub const SECTORS_PER_TRACK: u32 = 64;

/// Words in one track: the fundamental allocation unit.
pub const WORDS_PER_TRACK: u64 = WORDS_PER_SECTOR as u64 * SECTORS_PER_TRACK as u64;

/// Tracks in one position (position-granularity files allocate in these).
pub const TRACKS_PER_POSITION: u64 = 64;

/// Bytes in one serialized sector (each word stored as a little-endian u64).
pub const SECTOR_BYTES: usize = WORDS_PER_SECTOR * 8;

/// Highest LDAT index a pack may carry.
pub const MAX_LDAT: u32 = 0o7777;

/// LDAT value marking an unallocated span in a descriptor entry.
pub const HOLE_LDAT: u32 = 0o400_000;

/// A 36-bit machine word, held in the low bits of a `u64`.
pub type Word = u64;

/// Mask of the significant bits of a [`Word`].
pub const WORD_MASK: u64 = (1 << 36) - 1;

/// File-relative tracks whose word offsets fit a [`Word`].
pub const MAX_FILE_TRACKS: u64 = WORD_MASK / WORDS_PER_TRACK;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Logical device address table index: the identity of a physical pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LdatIndex(pub u32);

impl LdatIndex {
    pub const HOLE: Self = Self(HOLE_LDAT);

    /// Validate a pack LDAT index (`1..=0o7777`).
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if value == 0 || value > MAX_LDAT {
            return Err(ParseError::InvalidField {
                field: "ldat_index",
                reason: "must be in 1..=0o7777",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn is_hole(self) -> bool {
        self.0 == HOLE_LDAT
    }
}

/// Track number, either file-relative or device-relative depending on use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl TrackId {
    pub const ZERO: Self = Self(0);

    /// Advance by `count` tracks, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Word address of the first word of this track.
    #[must_use]
    pub fn to_word_address(self) -> Option<u64> {
        tracks_to_words(self.0)
    }
}

/// Encoded address of one directory sector.
///
/// Layout: `ldat << 30 | track << 6 | sector`, where `track` is the
/// device-relative track holding the sector. Address zero means "no link".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorAddress(pub u64);

const SECTOR_BITS: u32 = 6;
const TRACK_BITS: u32 = 24;
const LDAT_BITS: u32 = 12;
const ADDRESS_BITS: u32 = SECTOR_BITS + TRACK_BITS + LDAT_BITS;

impl SectorAddress {
    pub const NONE: Self = Self(0);

    /// Build an address from its parts.
    pub fn new(ldat: LdatIndex, track: TrackId, sector: u32) -> Result<Self, ParseError> {
        if ldat.0 == 0 || ldat.0 >= (1 << LDAT_BITS) {
            return Err(ParseError::InvalidField {
                field: "sector_address.ldat",
                reason: "ldat does not fit 12 bits",
            });
        }
        if track.0 >= (1 << TRACK_BITS) {
            return Err(ParseError::InvalidField {
                field: "sector_address.track",
                reason: "track does not fit 24 bits",
            });
        }
        if sector >= SECTORS_PER_TRACK {
            return Err(ParseError::InvalidField {
                field: "sector_address.sector",
                reason: "sector beyond track",
            });
        }
        Ok(Self(
            (u64::from(ldat.0) << (TRACK_BITS + SECTOR_BITS))
                | (track.0 << SECTOR_BITS)
                | u64::from(sector),
        ))
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Decode into `(ldat, track, sector)`.
    pub fn decode(self) -> Result<(LdatIndex, TrackId, u32), ParseError> {
        if self.0 >> ADDRESS_BITS != 0 {
            return Err(ParseError::InvalidField {
                field: "sector_address",
                reason: "bits above the address field are set",
            });
        }
        let ldat_bits = (self.0 >> (TRACK_BITS + SECTOR_BITS)) & ((1 << LDAT_BITS) - 1);
        let ldat = LdatIndex::new(
            u32::try_from(ldat_bits).map_err(|_| ParseError::IntegerConversion {
                field: "sector_address.ldat",
            })?,
        )?;
        let track = TrackId((self.0 >> SECTOR_BITS) & ((1 << TRACK_BITS) - 1));
        let sector = u32::try_from(self.0 & u64::from(SECTORS_PER_TRACK - 1)).map_err(|_| {
            ParseError::IntegerConversion {
                field: "sector_address.sector",
            }
        })?;
        Ok((ldat, track, sector))
    }

    /// Convert an optional link into the on-disk word (zero for no link).
    #[must_use]
    pub fn from_link(link: Option<Self>) -> Self {
        link.unwrap_or(Self::NONE)
    }

    /// Convert the on-disk word into an optional link.
    #[must_use]
    pub fn into_link(self) -> Option<Self> {
        if self.is_none() { None } else { Some(self) }
    }
}

// ── Unit conversions ────────────────────────────────────────────────────────

/// Convert a track count to a word count, `None` on overflow.
#[must_use]
pub fn tracks_to_words(tracks: u64) -> Option<u64> {
    tracks.checked_mul(WORDS_PER_TRACK)
}

/// Convert a word count to a track count; `None` unless track-aligned.
#[must_use]
pub fn words_to_tracks(words: u64) -> Option<u64> {
    if words % WORDS_PER_TRACK == 0 {
        Some(words / WORDS_PER_TRACK)
    } else {
        None
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

/// Read word `index` of a serialized sector.
#[inline]
pub fn read_word(data: &[u8], index: usize) -> Result<Word, ParseError> {
    let bytes = ensure_slice(data, index * 8, 8)?;
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

/// Write word `index` of a serialized sector.
#[inline]
pub fn write_word(data: &mut [u8], index: usize, value: Word) -> Result<(), ParseError> {
    let offset = index * 8;
    let len = data.len();
    let dst = data
        .get_mut(offset..offset + 8)
        .ok_or(ParseError::InsufficientData {
            needed: 8,
            offset,
            actual: len.saturating_sub(offset),
        })?;
    dst.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// ── Quarter-word ASCII ──────────────────────────────────────────────────────

/// Characters packed into one word (9 bits each).
pub const CHARS_PER_WORD: usize = 4;

/// Pack `text` into `words` words of 9-bit ASCII, space-filled on the right.
pub fn pack_ascii(text: &str, words: usize) -> Result<Vec<Word>, ParseError> {
    let capacity = words * CHARS_PER_WORD;
    if text.len() > capacity {
        return Err(ParseError::InvalidField {
            field: "ascii",
            reason: "text longer than field",
        });
    }
    if !text.is_ascii() {
        return Err(ParseError::InvalidField {
            field: "ascii",
            reason: "non-ASCII character",
        });
    }
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(capacity, b' ');
    Ok(bytes
        .chunks(CHARS_PER_WORD)
        .map(|chunk| {
            chunk
                .iter()
                .fold(0_u64, |acc, &b| (acc << 9) | u64::from(b))
        })
        .collect())
}

/// Unpack 9-bit ASCII words, trimming trailing spaces.
pub fn unpack_ascii(words: &[Word]) -> Result<String, ParseError> {
    let mut out = String::with_capacity(words.len() * CHARS_PER_WORD);
    for &word in words {
        for shift in (0..CHARS_PER_WORD).rev() {
            let code = (word >> (shift * 9)) & 0o777;
            let byte = u8::try_from(code).map_err(|_| ParseError::IntegerConversion {
                field: "ascii",
            })?;
            if !byte.is_ascii() {
                return Err(ParseError::InvalidField {
                    field: "ascii",
                    reason: "non-ASCII character",
                });
            }
            out.push(char::from(byte));
        }
    }
    Ok(out.trim_end().to_owned())
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for LdatIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SectorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:014o}", self.0)
    }
}
