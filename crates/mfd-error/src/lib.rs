#![forbid(unsafe_code)]
//! Error types for the mass-storage engine.
//!
//! # Error Taxonomy
//!
//! The engine uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `mfd-types` | Directory sector format violations detected while decoding words |
//! | Runtime | `MfdError` | `mfd-error` (this crate) | Errors surfaced to the facilities layer |
//!
//! `mfd-error` does not depend on `mfd-types`; `ParseError` is converted at
//! the engine boundary, where the sector address being decoded is known, into
//! `MfdError::Corruption { sector, detail }`.
//!
//! ## Status Mapping
//!
//! The facilities layer never sees `MfdError` directly; it receives a
//! [`Status`] produced by [`MfdError::status`]. The mapping is exhaustive
//! (no wildcard arms) so adding a variant is a compile error until its
//! status is assigned.
//!
//! | Variant | Status |
//! |---------|--------|
//! | `Io` | `IoError` |
//! | `Corruption` | `Terminating` |
//! | `Invariant` | `Terminating` |
//! | `InvalidRequest` | `InvalidRequest` |
//! | `InvalidConfig` | `Terminating` |
//! | `NotFound` | `NotFound` |
//! | `NoSpace` | `OutOfSpace` |
//! | `MaximumExceeded` | `OutOfSpace` |
//! | `CycleConflict` | `CycleConflict` |
//! | `Exists` | `CycleConflict` |
//! | `KeyMismatch` | `AccessDenied` |
//! | `PrivacyViolation` | `AccessDenied` |
//! | `ExclusiveUse` | `AccessDenied` |
//! | `OperatorDeclined` | `OperatorDeclined` |
//! | `Terminating` | `Terminating` |
//!
//! ## Invariant Violations
//!
//! `Corruption` and `Invariant` mean the in-memory or on-disk directory can
//! no longer be trusted. The engine logs them at `error!` and returns them;
//! halting the system is the caller's decision.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome class reported to the facilities layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Success,
    NotFound,
    OutOfSpace,
    IoError,
    /// Name or cycle-range conflict.
    CycleConflict,
    /// Malformed request: bad names, attributes or spans.
    InvalidRequest,
    /// Read/write key mismatch or privacy violation.
    AccessDenied,
    /// The console operator refused to keep a request held.
    OperatorDeclined,
    /// The engine is shutting down, or its directory is no longer consistent.
    Terminating,
}

impl Status {
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum MfdError {
    /// Sector device I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A directory sector failed to decode or is inconsistent with its chain.
    #[error("corrupt directory sector {sector:#o}: {detail}")]
    Corruption { sector: u64, detail: String },

    /// An internal allocation invariant does not hold (region or extent
    /// boundaries that do not line up with the request).
    #[error("allocation invariant violated: {0}")]
    Invariant(String),

    /// The request is malformed (bad cycle number, zero-length span, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Engine configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// File set, cycle, pack or open file not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// No pack in the fixed pool can supply the requested tracks.
    #[error("insufficient mass storage")]
    NoSpace,

    /// The request would grow a file past its maximum granules.
    #[error("maximum granules exceeded: requested {requested}, maximum {maximum}")]
    MaximumExceeded { requested: u64, maximum: u64 },

    /// The cycle window cannot accommodate the request.
    #[error("cycle conflict: {0}")]
    CycleConflict(String),

    /// The cycle or file set already exists.
    #[error("already cataloged: {0}")]
    Exists(String),

    /// Read or write key does not match the file set.
    #[error("read/write key mismatch")]
    KeyMismatch,

    /// The cycle is private to another project.
    #[error("file is private to another project")]
    PrivacyViolation,

    /// The cycle is assigned with exclusive use by another run.
    #[error("file is exclusively assigned")]
    ExclusiveUse,

    /// The console operator declined to keep the request held.
    #[error("operator declined the hold")]
    OperatorDeclined,

    /// The engine is shutting down.
    #[error("engine terminating")]
    Terminating,
}

impl MfdError {
    /// Map this error onto the status reported to the facilities layer.
    ///
    /// The mapping is exhaustive; every variant has an explicit arm.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Io(_) => Status::IoError,
            Self::Corruption { .. }
            | Self::Invariant(_)
            | Self::InvalidConfig(_)
            | Self::Terminating => Status::Terminating,
            Self::InvalidRequest(_) => Status::InvalidRequest,
            Self::CycleConflict(_) | Self::Exists(_) => Status::CycleConflict,
            Self::NotFound(_) => Status::NotFound,
            Self::NoSpace | Self::MaximumExceeded { .. } => Status::OutOfSpace,
            Self::KeyMismatch | Self::PrivacyViolation | Self::ExclusiveUse => {
                Status::AccessDenied
            }
            Self::OperatorDeclined => Status::OperatorDeclined,
        }
    }

    /// Whether the directory can no longer be trusted after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::Invariant(_))
    }
}

/// Collapse an operation result into the status the facilities layer sees.
#[must_use]
pub fn status_of<T>(result: &Result<T>) -> Status {
    match result {
        Ok(_) => Status::Success,
        Err(err) => err.status(),
    }
}

/// Result alias using `MfdError`.
pub type Result<T> = std::result::Result<T, MfdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_all_variants() {
        let cases: Vec<(MfdError, Status)> = vec![
            (MfdError::Io(std::io::Error::other("test")), Status::IoError),
            (
                MfdError::Corruption {
                    sector: 0o100,
                    detail: "test".into(),
                },
                Status::Terminating,
            ),
            (MfdError::Invariant("test".into()), Status::Terminating),
            (MfdError::InvalidRequest("test".into()), Status::InvalidRequest),
            (MfdError::InvalidConfig("test".into()), Status::Terminating),
            (MfdError::NotFound("test".into()), Status::NotFound),
            (MfdError::NoSpace, Status::OutOfSpace),
            (
                MfdError::MaximumExceeded {
                    requested: 10,
                    maximum: 5,
                },
                Status::OutOfSpace,
            ),
            (MfdError::CycleConflict("test".into()), Status::CycleConflict),
            (MfdError::Exists("test".into()), Status::CycleConflict),
            (MfdError::KeyMismatch, Status::AccessDenied),
            (MfdError::PrivacyViolation, Status::AccessDenied),
            (MfdError::ExclusiveUse, Status::AccessDenied),
            (MfdError::OperatorDeclined, Status::OperatorDeclined),
            (MfdError::Terminating, Status::Terminating),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.status(), *expected, "wrong status for {error:?}");
        }
    }

    #[test]
    fn only_directory_damage_is_fatal() {
        assert!(MfdError::Invariant("x".into()).is_fatal());
        assert!(
            MfdError::Corruption {
                sector: 1,
                detail: "x".into()
            }
            .is_fatal()
        );
        assert!(!MfdError::NoSpace.is_fatal());
        assert!(!MfdError::Terminating.is_fatal());
    }

    #[test]
    fn display_formatting() {
        let err = MfdError::Corruption {
            sector: 0o1000,
            detail: "backward link mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt directory sector 0o1000: backward link mismatch"
        );
        assert_eq!(MfdError::NoSpace.to_string(), "insufficient mass storage");
        let max = MfdError::MaximumExceeded {
            requested: 12,
            maximum: 8,
        };
        assert_eq!(
            max.to_string(),
            "maximum granules exceeded: requested 12, maximum 8"
        );
    }

    #[test]
    fn status_of_results() {
        let ok: Result<u32> = Ok(3);
        assert_eq!(status_of(&ok), Status::Success);
        assert!(status_of(&ok).is_success());
        let err: Result<u32> = Err(MfdError::NotFound("SYS$*LIB".into()));
        assert_eq!(status_of(&err), Status::NotFound);
    }
}
