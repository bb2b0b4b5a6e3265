//! Waiting for space.
//!
//! A request that may hold is retried while the fixed pool is short of
//! tracks. The engine lock is released between polls so frees from other
//! callers can land; an observer (the operator console, in a full system)
//! may cut the wait short.

use serde::Serialize;

/// What a held request is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoldNotice {
    /// Operation that ran out of space.
    pub operation: &'static str,
    /// Tracks the operation was trying to obtain.
    pub tracks_wanted: u64,
    /// Polls already spent waiting (0 on the first notice).
    pub polls: u32,
}

/// Decides whether a held request keeps waiting.
pub trait HoldObserver: Send + Sync {
    /// Return `false` to give up; the request then fails with
    /// `OperatorDeclined`.
    fn keep_holding(&self, notice: &HoldNotice) -> bool;
}

/// Waits until the configured poll limit runs out.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysHold;

impl HoldObserver for AlwaysHold {
    fn keep_holding(&self, _notice: &HoldNotice) -> bool {
        true
    }
}

/// Refuses every hold.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverHold;

impl HoldObserver for NeverHold {
    fn keep_holding(&self, _notice: &HoldNotice) -> bool {
        false
    }
}
