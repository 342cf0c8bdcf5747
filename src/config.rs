//! Engine configuration.
//!
//! This is a plain data struct with sensible defaults; it does not read a
//! config file or the environment itself. An embedder loads a file however
//! its deployment wants (env, a config crate, a CLI flag) and constructs
//! this, or uses [`EngineConfig::default`] as a starting point.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::safety;

/// Default directory, relative to the main repository, that worktrees are
/// created under.
pub const DEFAULT_WORKTREE_BASE_DIR: &str = ".orc/worktrees";

/// Default bound on assistant subprocess wall-clock time.
pub const DEFAULT_ASSISTANT_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Branch names a worktree handle is never allowed to check out, reset,
    /// or force-push directly (see [`crate::safety`]).
    pub protected_branches: HashSet<String>,
    /// Where worktrees are created, relative to the main repository unless
    /// absolute.
    pub worktree_base_dir: PathBuf,
    /// Prepended to every checkpoint and knowledge-merge commit message.
    pub commit_prefix: String,
    /// Used by [`crate::workflow::effective_max_iterations`] when neither a
    /// phase override nor a template sets one.
    pub default_max_iterations: u32,
    /// Wall-clock bound for one assistant subprocess invocation.
    #[serde(with = "duration_secs")]
    pub assistant_timeout: Duration,
    /// Path (or bare program name on `PATH`) of the AI assistant binary the
    /// phase executor invokes.
    pub assistant_binary: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            protected_branches: safety::default_protected_branches(),
            worktree_base_dir: PathBuf::from(DEFAULT_WORKTREE_BASE_DIR),
            commit_prefix: crate::checkpoint::DEFAULT_COMMIT_PREFIX.to_string(),
            default_max_iterations: crate::workflow::DEFAULT_MAX_ITERATIONS,
            assistant_timeout: Duration::from_secs(DEFAULT_ASSISTANT_TIMEOUT_SECS),
            assistant_binary: "claude".to_string(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = EngineConfig::default();
        assert!(config.protected_branches.contains("main"));
        assert_eq!(config.worktree_base_dir, PathBuf::from(DEFAULT_WORKTREE_BASE_DIR));
        assert_eq!(config.commit_prefix, crate::checkpoint::DEFAULT_COMMIT_PREFIX);
        assert_eq!(config.assistant_timeout, Duration::from_secs(DEFAULT_ASSISTANT_TIMEOUT_SECS));
    }

    #[test]
    fn round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.commit_prefix, config.commit_prefix);
        assert_eq!(back.assistant_timeout, config.assistant_timeout);
    }
}
