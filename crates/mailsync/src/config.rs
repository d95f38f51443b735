//! Server-side sync limits
//!
//! Loaded from (in order of priority):
//! 1. `sync.json` in the shared config directory
//! 2. `MAILSYNC_*` environment variables
//! 3. Built-in defaults

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Config filename in the shared config directory
const CONFIG_FILE: &str = "sync.json";

const ENV_MAX_CHANGE_COUNT: &str = "MAILSYNC_MAX_CHANGE_COUNT";
const ENV_MAX_DELETE_COUNT: &str = "MAILSYNC_MAX_DELETE_COUNT";
const ENV_SNAPSHOT_STUB_DEPTH: &str = "MAILSYNC_SNAPSHOT_STUB_DEPTH";
const ENV_FETCH_BATCH_SIZE: &str = "MAILSYNC_FETCH_BATCH_SIZE";

/// Limits applied to every sync request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on items (and synthetic deletions) per page
    pub max_change_count: usize,
    /// Upper bound on tombstones per page
    pub max_delete_count: usize,
    /// Snapshot folders deeper than this are returned without children
    pub snapshot_stub_depth: Option<usize>,
    /// Records read from storage per round trip while filling a page
    pub fetch_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_change_count: 1000,
            max_delete_count: 1000,
            snapshot_stub_depth: None,
            fetch_batch_size: 200,
        }
    }
}

impl SyncConfig {
    /// Load the config using the priority order above
    pub fn load() -> Result<Self> {
        let config = if config::config_exists(CONFIG_FILE) {
            log::debug!("Loading sync config from {}", CONFIG_FILE);
            config::load_json::<Self>(CONFIG_FILE)?
        } else {
            Self::from_env()?
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `MAILSYNC_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = parse_var(&lookup, ENV_MAX_CHANGE_COUNT)? {
            config.max_change_count = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_MAX_DELETE_COUNT)? {
            config.max_delete_count = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_SNAPSHOT_STUB_DEPTH)? {
            config.snapshot_stub_depth = Some(value);
        }
        if let Some(value) = parse_var(&lookup, ENV_FETCH_BATCH_SIZE)? {
            config.fetch_batch_size = value;
        }
        Ok(config)
    }

    /// Reject limits that would stop a sync from making progress
    pub fn validate(&self) -> Result<()> {
        if self.max_change_count == 0 {
            bail!("max_change_count must be at least 1");
        }
        if self.max_delete_count == 0 {
            bail!("max_delete_count must be at least 1");
        }
        if self.fetch_batch_size == 0 {
            bail!("fetch_batch_size must be at least 1");
        }
        Ok(())
    }

    /// Save this config to the shared config directory
    pub fn save(&self) -> Result<()> {
        config::save_json(CONFIG_FILE, self)
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<usize>> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid value for {}: {:?}", name, value))
        })
        .transpose()
}
