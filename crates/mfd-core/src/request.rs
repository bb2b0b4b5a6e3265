//! Request and reply types of the engine's public operations.

use mfd_catalog::{CycleSpec, Credentials};
use mfd_extent::FileExtentMap;
use mfd_ondisk::{CycleFlags, FileCycle, FileCycleKind, Granularity};
use mfd_types::{LdatIndex, SectorAddress, TrackId};
use serde::{Deserialize, Serialize};

/// Storage attributes of a new cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Media {
    MassStorage {
        granularity: Granularity,
        word_addressable: bool,
        equipment: String,
        /// Granules allocated when the cycle is created.
        initial_reserve: u64,
        max_granules: u64,
    },
    Tape {
        density: u32,
        reel_numbers: Vec<String>,
    },
}

impl Default for Media {
    fn default() -> Self {
        Self::MassStorage {
            granularity: Granularity::Track,
            word_addressable: false,
            equipment: "F".to_owned(),
            initial_reserve: 0,
            max_granules: 256,
        }
    }
}

impl Media {
    pub(crate) fn to_kind(&self) -> FileCycleKind {
        match self {
            Self::MassStorage {
                granularity,
                word_addressable,
                equipment,
                initial_reserve,
                max_granules,
            } => FileCycleKind::MassStorage {
                granularity: *granularity,
                word_addressable: *word_addressable,
                equipment: equipment.clone(),
                initial_reserve: *initial_reserve,
                max_granules: *max_granules,
                highest_granule_assigned: 0,
                highest_track_written: 0,
            },
            Self::Tape {
                density,
                reel_numbers,
            } => FileCycleKind::Tape {
                density: *density,
                reel_numbers: reel_numbers.clone(),
            },
        }
    }
}

/// Attributes given to a cycle when it is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleAttributes {
    /// Keys and guard apply only when the request creates the file set.
    pub read_key: String,
    pub write_key: String,
    pub guarded: bool,
    pub private: bool,
    pub max_cycle_range: Option<u32>,
    pub media: Media,
    /// Wait for space when the initial reserve cannot be met at once.
    pub hold: bool,
}

/// Catalog a new cycle without assigning it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRequest {
    pub qualifier: String,
    pub filename: String,
    pub cycle: CycleSpec,
    pub credentials: Credentials,
    pub attributes: CycleAttributes,
}

/// Assignment of an existing cycle, or of a new one that becomes
/// permanent when freed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignRequest {
    pub qualifier: String,
    pub filename: String,
    pub cycle: CycleSpec,
    pub credentials: Credentials,
    /// Refuse other assignments while this one is held.
    pub exclusive: bool,
    pub read_only: bool,
    /// Create the cycle, tentatively cataloged, instead of looking it up.
    pub create: Option<CycleAttributes>,
}

/// Attributes of an uncataloged scratch file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryRequest {
    pub name: String,
    pub granularity: Granularity,
    pub initial_reserve: u64,
    pub max_granules: u64,
    /// Packs to draw from; empty means the whole fixed pool.
    pub packs: Vec<LdatIndex>,
    pub hold: bool,
}

/// File-relative track span of an assigned cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRequest {
    pub main_item: SectorAddress,
    pub file_track: TrackId,
    pub count: u64,
    pub hold: bool,
}

/// New reserve limits for an assigned mass-storage cycle, in granules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub initial_reserve: Option<u64>,
    pub max_granules: Option<u64>,
    pub hold: bool,
}

/// Release of one assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeRequest {
    pub main_item: SectorAddress,
    /// Drop the cycle once no assignment remains.
    pub delete: bool,
    /// Overrides `release_unused_reserve_on_free` for this free.
    pub release_unused_reserve: Option<bool>,
}

impl FreeRequest {
    #[must_use]
    pub fn keep(main_item: SectorAddress) -> Self {
        Self {
            main_item,
            delete: false,
            release_unused_reserve: None,
        }
    }

    #[must_use]
    pub fn delete(main_item: SectorAddress) -> Self {
        Self {
            main_item,
            delete: true,
            release_unused_reserve: None,
        }
    }
}

/// How a free request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FreeOutcome {
    /// Other assignments remain.
    StillAssigned { current_assign_count: u32 },
    /// Last assignment gone; the cycle stays cataloged.
    Released { tracks_released: u64 },
    /// Last assignment gone and the cycle was deleted.
    Dropped { tracks_released: u64 },
}

/// A successful assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assigned {
    pub main_item: SectorAddress,
    pub absolute_cycle: u32,
    pub created: bool,
    pub info: FileCycleInfo,
}

/// Snapshot of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCycleInfo {
    pub main_item: SectorAddress,
    pub qualifier: String,
    pub filename: String,
    pub absolute_cycle: u32,
    pub project_id: String,
    pub account_id: String,
    pub flags: CycleFlags,
    pub current_assign_count: u32,
    pub cumulative_assign_count: u32,
    pub kind: FileCycleKind,
    /// First sector of the descriptor chain.
    pub descriptor_head: Option<SectorAddress>,
    /// Tracks allocated, when the extent map is in memory.
    pub allocated_tracks: Option<u64>,
}

impl FileCycleInfo {
    pub(crate) fn from_cycle(
        main_item: SectorAddress,
        cycle: &FileCycle,
        map: Option<&FileExtentMap>,
    ) -> Self {
        Self {
            main_item,
            qualifier: cycle.qualifier.clone(),
            filename: cycle.filename.clone(),
            absolute_cycle: cycle.absolute_cycle,
            project_id: cycle.project_id.clone(),
            account_id: cycle.account_id.clone(),
            flags: cycle.flags,
            current_assign_count: cycle.current_assign_count,
            cumulative_assign_count: cycle.cumulative_assign_count,
            kind: cycle.kind.clone(),
            descriptor_head: cycle.dad_head,
            allocated_tracks: map.map(FileExtentMap::allocated_track_count),
        }
    }
}

/// Snapshot of one file set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSetInfo {
    pub qualifier: String,
    pub filename: String,
    pub project_id: String,
    pub max_cycle_range: u32,
    pub current_range: u32,
    pub plus_one_exists: bool,
    pub guarded: bool,
    /// Absolute cycles, newest first.
    pub cycles: Vec<u32>,
}

/// An uncataloged scratch file. Its tracks are counted as temporary and
/// vanish with it; nothing about it reaches the directory.
#[derive(Debug, Clone)]
pub struct TemporaryFile {
    pub(crate) name: String,
    pub(crate) granularity: Granularity,
    pub(crate) max_granules: u64,
    pub(crate) map: FileExtentMap,
    pub(crate) packs: Vec<LdatIndex>,
}

impl TemporaryFile {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    #[must_use]
    pub fn max_granules(&self) -> u64 {
        self.max_granules
    }

    #[must_use]
    pub fn extent_map(&self) -> &FileExtentMap {
        &self.map
    }

    #[must_use]
    pub fn convert_track(&self, file_track: TrackId) -> Option<(LdatIndex, TrackId)> {
        self.map.convert_track_id(file_track)
    }
}
