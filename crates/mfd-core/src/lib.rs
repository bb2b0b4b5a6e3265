#![forbid(unsafe_code)]
//! Mass-storage allocation and catalog engine.
//!
//! Ties the fixed-pool track allocator, the directory-sector allocator,
//! per-file extent maps with their descriptor chains, and the master file
//! directory into one service. Callers catalog, assign, extend, shrink
//! and free file cycles; every change to directory sectors is written to
//! the [`SectorDevice`](mfd_block::SectorDevice) before the request
//! returns.

mod config;
mod engine;
mod hold;
mod request;

pub use config::EngineConfig;
pub use engine::Engine;
pub use hold::{AlwaysHold, HoldNotice, HoldObserver, NeverHold};
pub use request::{
    AssignRequest, Assigned, CatalogRequest, CycleAttributes, FileCycleInfo, FileSetInfo,
    FreeOutcome, FreeRequest, Media, ReserveRequest, TemporaryFile, TemporaryRequest,
    TrackRequest,
};

pub use mfd_alloc::{PackSpec, PoolStats};
pub use mfd_block::{MemSectorDevice, SectorDevice};
pub use mfd_catalog::{BypassSet, Credentials, CycleSpec};
pub use mfd_error::{MfdError, Result, Status};
pub use mfd_extent::FileAllocationEntry;
pub use mfd_ondisk::{CycleFlags, FileCycleKind, Granularity};
pub use mfd_types::{LdatIndex, SectorAddress, TrackId};
