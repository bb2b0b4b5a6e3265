//! Engine configuration.

use mfd_error::{MfdError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables read once at engine construction.
///
/// Every field has a default, so a partial JSON document is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cycle range given to new file sets that do not name one (1..=32).
    pub max_cycle_range: u32,
    /// Release tracks beyond the highest written track (but never the
    /// initial reserve) when the last assignment of a cycle is freed.
    pub release_unused_reserve_on_free: bool,
    /// Delay between retries while a request is held for space.
    pub hold_poll_interval_ms: u64,
    /// Retries before a held request gives up with out-of-space.
    pub hold_max_polls: u32,
    /// Directory tracks reserved on each fixed pack at bring-up.
    pub directory_tracks_per_pack: u64,
    /// Longest descriptor chain followed when loading a file.
    pub max_descriptor_records: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cycle_range: 32,
            release_unused_reserve_on_free: true,
            hold_poll_interval_ms: 2_000,
            hold_max_polls: 30,
            directory_tracks_per_pack: 2,
            max_descriptor_records: 4_096,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| MfdError::InvalidConfig(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=32).contains(&self.max_cycle_range) {
            return Err(MfdError::InvalidConfig(format!(
                "max_cycle_range {} outside 1..=32",
                self.max_cycle_range
            )));
        }
        if self.hold_poll_interval_ms == 0 && self.hold_max_polls > 0 {
            return Err(MfdError::InvalidConfig(
                "hold_poll_interval_ms must be positive when holds are allowed".to_owned(),
            ));
        }
        if self.max_descriptor_records == 0 {
            return Err(MfdError::InvalidConfig(
                "max_descriptor_records must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn hold_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hold_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_cycle_range, 32);
        assert!(config.release_unused_reserve_on_free);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config =
            EngineConfig::from_json(r#"{"max_cycle_range": 5, "hold_max_polls": 2}"#).unwrap();
        assert_eq!(config.max_cycle_range, 5);
        assert_eq!(config.hold_max_polls, 2);
        assert_eq!(config.directory_tracks_per_pack, 2);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"max_cycle_range": 40}"#),
            Err(MfdError::InvalidConfig(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"hold_poll_interval_ms": 0}"#),
            Err(MfdError::InvalidConfig(_))
        ));
        assert!(matches!(
            EngineConfig::from_json("not json"),
            Err(MfdError::InvalidConfig(_))
        ));
    }

    #[test]
    fn serializes_back_to_json() {
        let config = EngineConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_json(&text).unwrap(), config);
    }
}
