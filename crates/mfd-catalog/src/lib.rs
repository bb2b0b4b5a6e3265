#![forbid(unsafe_code)]
//! Master file directory model.
//!
//! A file set (lead item) owns a window of up to 32 cycles of one
//! `(qualifier, filename)`; each cycle (main item) carries the file's
//! attributes and the head of its descriptor chain. Absolute cycles wrap
//! within 1..=999 and are compared by age, not by value.

pub mod access;
pub mod catalog;
pub mod cycle;
pub mod file_set;

pub use access::{BypassSet, Credentials};
pub use catalog::{Catalog, Cataloged, DroppedCycle, NewCycle};
pub use cycle::{AbsoluteCycle, CycleSpec, MAX_ABSOLUTE_CYCLE, compare_absolute_cycles};
pub use file_set::{CycleSlot, FileSet, Placement};

use mfd_error::Result;
use mfd_types::SectorAddress;

/// Supplier of directory sectors for lead and main items.
pub trait SectorSource {
    fn allocate_sector(&mut self) -> Result<SectorAddress>;
    fn release_sector(&mut self, addr: SectorAddress) -> Result<()>;
}
