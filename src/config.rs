//! Tunables for the sync core (spec §6 "Tunables" table).
//!
//! Loaded from `<state_dir>/config.toml` if present, falling back to the
//! spec's defaults otherwise.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestTimeouts {
    pub summary_secs: u64,
    pub listing_secs: u64,
    pub bytes_secs: u64,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self { summary_secs: 10, listing_secs: 90, bytes_secs: 180 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryCounts {
    pub summary: u32,
    pub listing: u32,
    pub bytes: u32,
}

impl Default for RetryCounts {
    fn default() -> Self {
        Self { summary: 2, listing: 3, bytes: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub chunk_sync_threshold_bytes: u64,
    pub max_concurrent_transfers: usize,
    pub write_stability_delay_secs: u64,
    pub debounce_delay_secs: u64,
    pub sync_write_cooldown_secs: u64,
    pub peer_sync_cooldown_secs: u64,
    pub online_window_secs: u64,
    pub tombstone_ttl_secs: u64,
    pub request_timeouts: RequestTimeouts,
    pub retry_counts: RetryCounts,
    /// FastCDC target parameters, bytes.
    pub chunk_min_size: u32,
    pub chunk_avg_size: u32,
    pub chunk_max_size: u32,
    /// Cooperative yield interval for the folder walker (files).
    pub walk_yield_every: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_sync_threshold_bytes: 1024 * 1024,
            max_concurrent_transfers: 8,
            write_stability_delay_secs: 3,
            debounce_delay_secs: 2,
            sync_write_cooldown_secs: 5,
            peer_sync_cooldown_secs: 30,
            online_window_secs: 30,
            tombstone_ttl_secs: 7 * 24 * 3600,
            request_timeouts: RequestTimeouts::default(),
            retry_counts: RetryCounts::default(),
            chunk_min_size: 4 * 1024,
            chunk_avg_size: 16 * 1024,
            chunk_max_size: 64 * 1024,
            walk_yield_every: 50,
        }
    }
}

impl Config {
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn write_default(path: &Path) -> anyhow::Result<()> {
        let cfg = Self::default();
        let text = toml::to_string_pretty(&cfg)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn write_stability_delay(&self) -> Duration {
        Duration::from_secs(self.write_stability_delay_secs)
    }
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_secs(self.debounce_delay_secs)
    }
    pub fn sync_write_cooldown(&self) -> Duration {
        Duration::from_secs(self.sync_write_cooldown_secs)
    }
    pub fn peer_sync_cooldown(&self) -> Duration {
        Duration::from_secs(self.peer_sync_cooldown_secs)
    }
    pub fn online_window(&self) -> Duration {
        Duration::from_secs(self.online_window_secs)
    }
    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_tunables() {
        let c = Config::default();
        assert_eq!(c.chunk_sync_threshold_bytes, 1024 * 1024);
        assert_eq!(c.max_concurrent_transfers, 8);
        assert_eq!(c.tombstone_ttl_secs, 7 * 24 * 3600);
    }

    #[test]
    fn load_or_default_falls_back_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = Config::load_or_default(&path).unwrap();
        assert_eq!(cfg.max_concurrent_transfers, 8);
    }
}
