//! Sync tuning configuration
//!
//! Loaded from (in order of priority):
//! 1. Environment variables (`FOLDERSYNC_*`), applied on top of whatever was loaded
//! 2. JSON file (~/.config/foldersync/sync.json)
//! 3. Built-in defaults
//!
//! Every value here is a heuristic. None of them are load-bearing for
//! correctness, only for how many round-trips a sync takes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::date::{DEFAULT_OLDEST_SYNC_DATE, Timestamp};

/// Config filename in the foldersync config directory
const CONFIG_FILE: &str = "sync.json";

/// Knobs for the date-range sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A SEARCH returning more UIDs than this narrows the window
    pub bisect_limit: usize,
    /// Pastwards syncs never look before this date
    pub oldest_sync_date: Timestamp,
    /// Width of the first window of an initial sync
    pub initial_sync_days: i64,
    /// Headers an initial or grow sync wants before it stops
    pub initial_fill_size: usize,
    /// Window multiplier after a step that found nothing new
    pub growth_factor: f64,
    /// Age-tiered caps on the widened window
    pub growth_caps: Vec<GrowthCap>,
    /// Cap used once the anchor is older than every tier
    pub growth_cap_ceiling_days: i64,
    /// Offset of the server's timezone from UTC
    pub tz_offset_ms: i64,
    /// Maximum snippet length in characters
    pub snippet_chars: usize,
    pub progress: ProgressWeights,
    pub blocks: BlockLimits,
    pub refresh: RefreshThresholds,
}

/// Window cap for anchors younger than `below_days`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthCap {
    pub below_days: i64,
    pub max_days: i64,
}

/// Relative costs used to apportion the fetch phase of a step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressWeights {
    /// Fixed cost of each batched fetch
    pub aggregate: f64,
    pub per_known: f64,
    pub per_new_header: f64,
    pub per_new_body: f64,
}

/// Block sizing policy for the folder store
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockLimits {
    /// A block at or above this estimate gets split
    pub max_block_size: usize,
    /// Newer part target when splitting the newest block
    pub split_small: usize,
    /// Newer part target when splitting an interior block
    pub split_equal: usize,
    /// Newer part target when splitting the oldest block
    pub split_large: usize,
    /// Estimated serialized size of one header
    pub header_est_size: usize,
}

/// How stale an accuracy range may get before a refresh is worthwhile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshThresholds {
    pub inbox_ms: i64,
    pub non_inbox_ms: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bisect_limit: 50,
            oldest_sync_date: DEFAULT_OLDEST_SYNC_DATE,
            initial_sync_days: 3,
            initial_fill_size: 15,
            growth_factor: 1.6,
            growth_caps: vec![
                GrowthCap {
                    below_days: 180,
                    max_days: 14,
                },
                GrowthCap {
                    below_days: 365,
                    max_days: 30,
                },
                GrowthCap {
                    below_days: 730,
                    max_days: 60,
                },
                GrowthCap {
                    below_days: 1095,
                    max_days: 90,
                },
                GrowthCap {
                    below_days: 1825,
                    max_days: 120,
                },
                GrowthCap {
                    below_days: 3650,
                    max_days: 365,
                },
            ],
            growth_cap_ceiling_days: 730,
            tz_offset_ms: 0,
            snippet_chars: 160,
            progress: ProgressWeights::default(),
            blocks: BlockLimits::default(),
            refresh: RefreshThresholds::default(),
        }
    }
}

impl Default for ProgressWeights {
    fn default() -> Self {
        Self {
            aggregate: 20.0,
            per_known: 1.0,
            per_new_header: 5.0,
            per_new_body: 30.0,
        }
    }
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self {
            max_block_size: 96 * 1024,
            split_small: 32 * 1024,
            split_equal: 48 * 1024,
            split_large: 64 * 1024,
            header_est_size: 200,
        }
    }
}

impl Default for RefreshThresholds {
    fn default() -> Self {
        Self {
            inbox_ms: 2 * 60 * 60 * 1000,
            non_inbox_ms: 6 * 60 * 60 * 1000,
        }
    }
}

impl SyncConfig {
    /// Load configuration using the following priority:
    /// 1. `FOLDERSYNC_*` environment overrides
    /// 2. JSON file (~/.config/foldersync/sync.json)
    /// 3. Defaults
    pub fn load() -> Result<Self> {
        let mut cfg: SyncConfig = config::load_json_or_default(CONFIG_FILE)?;
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Parse a config from a JSON string; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse sync config JSON")
    }

    /// Persist the config to the foldersync config directory
    pub fn save(&self) -> Result<()> {
        config::save_json(CONFIG_FILE, self)
    }

    /// Apply environment overrides through `lookup` so tests don't touch the process env.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("FOLDERSYNC_BISECT_LIMIT") {
            self.bisect_limit = v
                .parse()
                .with_context(|| format!("FOLDERSYNC_BISECT_LIMIT is not a count: {v}"))?;
        }
        if let Some(v) = lookup("FOLDERSYNC_INITIAL_SYNC_DAYS") {
            self.initial_sync_days = v
                .parse()
                .with_context(|| format!("FOLDERSYNC_INITIAL_SYNC_DAYS is not a number: {v}"))?;
        }
        if let Some(v) = lookup("FOLDERSYNC_TZ_OFFSET_MS") {
            self.tz_offset_ms = v
                .parse()
                .with_context(|| format!("FOLDERSYNC_TZ_OFFSET_MS is not a number: {v}"))?;
        }
        Ok(())
    }

    /// Largest window (in days) a growth step may use for an anchor `elapsed_days` old.
    pub fn growth_cap_days(&self, elapsed_days: i64) -> i64 {
        self.growth_caps
            .iter()
            .find(|cap| elapsed_days < cap.below_days)
            .map(|cap| cap.max_days)
            .unwrap_or(self.growth_cap_ceiling_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.bisect_limit, 50);
        assert_eq!(cfg.initial_sync_days, 3);
        assert_eq!(cfg.blocks.max_block_size, 98_304);
        assert_eq!(cfg.progress.per_new_body, 30.0);
    }

    #[test]
    fn test_growth_cap_tiers() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.growth_cap_days(0), 14);
        assert_eq!(cfg.growth_cap_days(179), 14);
        assert_eq!(cfg.growth_cap_days(180), 30);
        assert_eq!(cfg.growth_cap_days(729), 60);
        assert_eq!(cfg.growth_cap_days(1000), 90);
        assert_eq!(cfg.growth_cap_days(1500), 120);
        assert_eq!(cfg.growth_cap_days(3000), 365);
        assert_eq!(cfg.growth_cap_days(5000), 730);
    }

    #[test]
    fn test_from_json_partial() {
        let json = r#"{"bisect_limit": 2000, "blocks": {"max_block_size": 1024}}"#;
        let cfg = SyncConfig::from_json(json).unwrap();
        assert_eq!(cfg.bisect_limit, 2000);
        assert_eq!(cfg.blocks.max_block_size, 1024);
        assert_eq!(cfg.blocks.header_est_size, 200);
        assert_eq!(cfg.initial_sync_days, 3);
    }

    #[test]
    fn test_apply_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FOLDERSYNC_BISECT_LIMIT", "200"),
            ("FOLDERSYNC_TZ_OFFSET_MS", "-3600000"),
        ]
        .into_iter()
        .collect();

        let mut cfg = SyncConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.bisect_limit, 200);
        assert_eq!(cfg.tz_offset_ms, -3_600_000);
        assert_eq!(cfg.initial_sync_days, 3);
    }

    #[test]
    fn test_apply_env_rejects_garbage() {
        let mut cfg = SyncConfig::default();
        let result =
            cfg.apply_env(|k| (k == "FOLDERSYNC_BISECT_LIMIT").then(|| "lots".to_string()));
        assert!(result.is_err());
    }
}
