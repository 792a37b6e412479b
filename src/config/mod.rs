//! Workflow policy configuration.
//!
//! Loaded from an optional `config.toml` inside the store's data directory:
//!
//! ```toml
//! # What rejecting a review does to the gated task.
//! rejection-policy = "keep-blocked"   # or "release-task"
//! ```
//!
//! Missing file means defaults. Unknown keys are rejected so typos fail
//! loudly instead of silently falling back.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// What [`reject_review`](crate::storage::Storage::reject_review) does to the
/// task gated by the rejected review.
///
/// The upstream workflow never touched the task on rejection; claiming simply
/// starts succeeding because the gate only fires on *pending* reviews. Some
/// teams prefer the rejected task to drop straight back into the TODO pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionPolicy {
    /// Leave the task in REVIEW with its block pointer intact (default).
    #[default]
    KeepBlocked,
    /// Clear the block pointer and revert the task from REVIEW to TODO.
    ReleaseTask,
}

/// Workflow policy knobs, stored as `config.toml` in the data directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Review-rejection behavior.
    #[serde(default)]
    pub rejection_policy: RejectionPolicy,
}

/// Name of the config file inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

impl WorkflowConfig {
    /// Load the config from `dir/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Write the config to `dir/config.toml`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("serialize config: {}", e)))?;
        std::fs::write(dir.join(CONFIG_FILE), raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = WorkflowConfig::load(dir.path()).unwrap();
        assert_eq!(config.rejection_policy, RejectionPolicy::KeepBlocked);
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = WorkflowConfig {
            rejection_policy: RejectionPolicy::ReleaseTask,
        };
        config.save(dir.path()).unwrap();

        let loaded = WorkflowConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_parse_kebab_case_values() {
        let config: WorkflowConfig =
            toml::from_str("rejection-policy = \"release-task\"").unwrap();
        assert_eq!(config.rejection_policy, RejectionPolicy::ReleaseTask);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "rejection-polcy = \"x\"").unwrap();
        assert!(WorkflowConfig::load(dir.path()).is_err());
    }
}
