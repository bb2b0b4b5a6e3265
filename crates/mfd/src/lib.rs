#![forbid(unsafe_code)]
//! Mass-storage allocation and master file directory.
//!
//! Re-exports the engine from `mfd-core`; downstream consumers depend on
//! this crate rather than on the layers beneath it.

pub use mfd_core::*;
