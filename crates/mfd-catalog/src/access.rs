//! Caller credentials and access checks against file sets and cycles.

use crate::file_set::FileSet;
use mfd_error::{MfdError, Result};
use mfd_ondisk::FileCycle;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Security bypass capabilities held by a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BypassSet(pub u8);

impl BypassSet {
    pub const NONE: Self = Self(0);
    pub const READ_KEY: Self = Self(0x01);
    pub const WRITE_KEY: Self = Self(0x02);
    pub const PRIVACY: Self = Self(0x04);
    pub const GUARD: Self = Self(0x08);
    pub const ALL: Self = Self(0x0F);

    const KNOWN: &[(u8, &'static str)] = &[
        (0x01, "READ_KEY"),
        (0x02, "WRITE_KEY"),
        (0x04, "PRIVACY"),
        (0x08, "GUARD"),
    ];

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    #[must_use]
    pub fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    /// Names of the set capabilities.
    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        Self::KNOWN
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for BypassSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl std::fmt::Display for BypassSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.describe();
        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Identity and keys presented with a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub project_id: String,
    pub account_id: String,
    pub read_key: String,
    pub write_key: String,
    pub bypass: BypassSet,
}

impl Credentials {
    /// Check guard and keys of `set` for the requested access.
    pub fn authorize_file_set(&self, set: &FileSet, write: bool) -> Result<()> {
        if set.guarded && !self.bypass.contains(BypassSet::GUARD) {
            debug!(
                qualifier = %set.qualifier,
                filename = %set.filename,
                "guarded_file_set_refused"
            );
            return Err(MfdError::PrivacyViolation);
        }
        if !set.read_key.is_empty()
            && set.read_key != self.read_key
            && !self.bypass.contains(BypassSet::READ_KEY)
        {
            return Err(MfdError::KeyMismatch);
        }
        if write
            && !set.write_key.is_empty()
            && set.write_key != self.write_key
            && !self.bypass.contains(BypassSet::WRITE_KEY)
        {
            return Err(MfdError::KeyMismatch);
        }
        Ok(())
    }

    /// Whether a private `cycle` belongs to someone else.
    #[must_use]
    pub fn is_private_against(&self, cycle: &FileCycle) -> bool {
        cycle.flags.private
            && cycle.project_id != self.project_id
            && !self.bypass.contains(BypassSet::PRIVACY)
    }

    pub fn authorize_cycle(&self, cycle: &FileCycle) -> Result<()> {
        if self.is_private_against(cycle) {
            return Err(MfdError::PrivacyViolation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfd_types::SectorAddress;

    fn set(read: &str, write: &str, guarded: bool) -> FileSet {
        let mut set = FileSet::new(SectorAddress(1), "Q", "F", "PROJ", 32);
        set.read_key = read.to_owned();
        set.write_key = write.to_owned();
        set.guarded = guarded;
        set
    }

    fn creds(read: &str, write: &str, bypass: BypassSet) -> Credentials {
        Credentials {
            project_id: "PROJ".to_owned(),
            account_id: "ACCT".to_owned(),
            read_key: read.to_owned(),
            write_key: write.to_owned(),
            bypass,
        }
    }

    #[test]
    fn keys_are_checked_unless_bypassed() {
        let s = set("RK", "WK", false);
        assert!(creds("RK", "WK", BypassSet::NONE).authorize_file_set(&s, true).is_ok());
        assert!(creds("RK", "", BypassSet::NONE).authorize_file_set(&s, false).is_ok());
        assert!(matches!(
            creds("RK", "", BypassSet::NONE).authorize_file_set(&s, true),
            Err(MfdError::KeyMismatch)
        ));
        assert!(matches!(
            creds("XX", "WK", BypassSet::NONE).authorize_file_set(&s, false),
            Err(MfdError::KeyMismatch)
        ));
        let all_keys = BypassSet::READ_KEY | BypassSet::WRITE_KEY;
        assert!(creds("", "", all_keys).authorize_file_set(&s, true).is_ok());
    }

    #[test]
    fn guard_needs_bypass() {
        let s = set("", "", true);
        assert!(creds("", "", BypassSet::NONE).authorize_file_set(&s, false).is_err());
        assert!(creds("", "", BypassSet::GUARD).authorize_file_set(&s, false).is_ok());
    }

    #[test]
    fn bypass_flags_describe() {
        let b = BypassSet::READ_KEY | BypassSet::GUARD;
        assert!(b.contains(BypassSet::GUARD));
        assert!(!b.contains(BypassSet::PRIVACY));
        assert!(BypassSet::ALL.contains(b));
        assert_eq!(b.to_string(), "READ_KEY|GUARD");
        assert_eq!(BypassSet::NONE.to_string(), "(none)");
    }
}
