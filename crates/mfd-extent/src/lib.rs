#![forbid(unsafe_code)]
//! File extent mapping: file-relative track to device track resolution.
//!
//! A [`FileExtentMap`] records which pack tracks back which file-relative
//! tracks. Extents never overlap and are merged whenever they are
//! contiguous both file-relatively and physically. The persisted form of
//! the map is a chain of descriptor (DAD) records, reconciled through
//! [`DescriptorChain`] and [`FileExtentMap::synchronize_descriptors`].

pub mod chain;

pub use chain::{ChainRecord, DescriptorChain, RecordState};

use mfd_types::{LdatIndex, TrackId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

// ── Types ───────────────────────────────────────────────────────────────────

/// A run of file-relative tracks stored contiguously on one pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub file_start: TrackId,
    pub count: u64,
    pub ldat: LdatIndex,
    pub device_start: TrackId,
}

impl Extent {
    /// One past the last file-relative track.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.file_start.0 + self.count
    }

    fn device_end(&self) -> u64 {
        self.device_start.0 + self.count
    }
}

/// One piece of a file range: a located span or a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAllocationEntry {
    pub file_start: TrackId,
    pub count: u64,
    /// `(pack, device track of file_start)`, or `None` for a hole.
    pub location: Option<(LdatIndex, TrackId)>,
}

impl FileAllocationEntry {
    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.location.is_none()
    }
}

// ── Extent map ──────────────────────────────────────────────────────────────

/// Ordered, non-overlapping extents of one file keyed by file-relative start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileExtentMap {
    extents: BTreeMap<TrackId, Extent>,
}

impl FileExtentMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `count` file tracks at `file_start` now live at
    /// `device_start` on `ldat`.
    ///
    /// Returns `false` (and changes nothing) when the span is empty or
    /// overlaps an existing extent.
    #[must_use]
    pub fn allocated(
        &mut self,
        file_start: TrackId,
        count: u64,
        ldat: LdatIndex,
        device_start: TrackId,
    ) -> bool {
        if count == 0 {
            return false;
        }
        let (Some(end), Some(_)) = (
            file_start.0.checked_add(count),
            device_start.checked_add(count),
        ) else {
            return false;
        };
        if self.overlapping(file_start, end).next().is_some() {
            return false;
        }

        let mut merged = Extent {
            file_start,
            count,
            ldat,
            device_start,
        };
        if let Some(prev) = self
            .extents
            .range(..file_start)
            .next_back()
            .map(|(_, e)| *e)
            .filter(|p| {
                p.end() == file_start.0 && p.ldat == ldat && p.device_end() == device_start.0
            })
        {
            self.extents.remove(&prev.file_start);
            merged.file_start = prev.file_start;
            merged.device_start = prev.device_start;
            merged.count += prev.count;
        }
        if let Some(next) = self.extents.get(&TrackId(end)).copied().filter(|n| {
            n.ldat == ldat && device_start.0 + count == n.device_start.0
        }) {
            self.extents.remove(&next.file_start);
            merged.count += next.count;
        }
        self.extents.insert(merged.file_start, merged);

        trace!(
            file_start = file_start.0,
            count,
            ldat = ldat.0,
            device_start = device_start.0,
            extents = self.extents.len(),
            "extent_allocated"
        );
        true
    }

    /// Forget `count` file tracks at `file_start`.
    ///
    /// Extents are deleted, shrunk at either end, or split. Returns `false`
    /// (and changes nothing) unless every track of the span is allocated.
    #[must_use]
    pub fn released(&mut self, file_start: TrackId, count: u64) -> bool {
        if count == 0 {
            return false;
        }
        let Some(end) = file_start.0.checked_add(count) else {
            return false;
        };

        let affected: Vec<Extent> = self.overlapping(file_start, end).copied().collect();
        let mut pos = file_start.0;
        for ext in &affected {
            if ext.file_start.0 > pos {
                return false;
            }
            pos = ext.end();
        }
        if pos < end {
            return false;
        }

        for ext in affected {
            self.extents.remove(&ext.file_start);
            if ext.file_start < file_start {
                let head = file_start.0 - ext.file_start.0;
                self.extents.insert(
                    ext.file_start,
                    Extent {
                        count: head,
                        ..ext
                    },
                );
            }
            if ext.end() > end {
                let skip = end - ext.file_start.0;
                self.extents.insert(
                    TrackId(end),
                    Extent {
                        file_start: TrackId(end),
                        count: ext.end() - end,
                        ldat: ext.ldat,
                        device_start: TrackId(ext.device_start.0 + skip),
                    },
                );
            }
        }

        trace!(
            file_start = file_start.0,
            count,
            extents = self.extents.len(),
            "extent_released"
        );
        true
    }

    /// Describe `[file_start, file_start+count)` as an ordered list of
    /// located spans and holes that exactly covers the range.
    #[must_use]
    pub fn file_allocation_entries(
        &self,
        file_start: TrackId,
        count: u64,
    ) -> Vec<FileAllocationEntry> {
        let mut entries = Vec::new();
        let Some(end) = file_start.0.checked_add(count) else {
            return entries;
        };
        let mut pos = file_start.0;
        for ext in self.overlapping(file_start, end) {
            if ext.file_start.0 > pos {
                entries.push(FileAllocationEntry {
                    file_start: TrackId(pos),
                    count: ext.file_start.0 - pos,
                    location: None,
                });
                pos = ext.file_start.0;
            }
            let seg_end = ext.end().min(end);
            entries.push(FileAllocationEntry {
                file_start: TrackId(pos),
                count: seg_end - pos,
                location: Some((
                    ext.ldat,
                    TrackId(ext.device_start.0 + (pos - ext.file_start.0)),
                )),
            });
            pos = seg_end;
        }
        if pos < end {
            entries.push(FileAllocationEntry {
                file_start: TrackId(pos),
                count: end - pos,
                location: None,
            });
        }
        entries
    }

    /// Device location of one file-relative track; `None` in a hole.
    #[must_use]
    pub fn convert_track_id(&self, file_track: TrackId) -> Option<(LdatIndex, TrackId)> {
        self.extents
            .range(..=file_track)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| file_track.0 < e.end())
            .map(|e| {
                (
                    e.ldat,
                    TrackId(e.device_start.0 + (file_track.0 - e.file_start.0)),
                )
            })
    }

    #[must_use]
    pub fn allocated_track_count(&self) -> u64 {
        self.extents.values().map(|e| e.count).sum()
    }

    /// Highest file-relative track that is allocated.
    #[must_use]
    pub fn highest_track_allocated(&self) -> Option<TrackId> {
        self.extents
            .values()
            .next_back()
            .map(|e| TrackId(e.end() - 1))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Extents in file-relative order.
    pub fn extents(&self) -> impl Iterator<Item = &Extent> {
        self.extents.values()
    }

    fn overlapping(&self, start: TrackId, end: u64) -> impl Iterator<Item = &Extent> {
        let straddling = self
            .extents
            .range(..start)
            .next_back()
            .map(|(_, e)| e)
            .filter(move |e| e.end() > start.0);
        straddling
            .into_iter()
            .chain(self.extents.range(start..TrackId(end)).map(|(_, e)| e))
    }
}
