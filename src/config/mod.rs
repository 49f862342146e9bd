//! Desired-config model: the in-memory shape of `jobsconfig.json` and the
//! pure diff operation over it.
//!
//! Loading keeps validation next to the type it builds, with defaults and
//! errors named explicitly rather than falling back to `unwrap()`.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::time::SystemTime;
use url::Url;

/// One pool's declared intent: how many slots, which JQ functions they
/// serve, and where a job's HTTP payload is POSTed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub worker_count: u32,
    pub processing_uri: String,
    pub jobs: BTreeSet<String>,
}

/// An immutable snapshot of intent. `loaded_at` is the
/// filesystem mtime of the config file as of this snapshot, used to decide
/// whether a later load is actually newer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredConfig {
    pub servers: BTreeSet<String>,
    pub pools: HashMap<String, PoolSpec>,
    pub loaded_at: SystemTime,
}

impl DesiredConfig {
    /// An empty config with no servers and no pools, used as the starting
    /// point before the first successful load.
    pub fn empty() -> Self {
        Self {
            servers: BTreeSet::new(),
            pools: HashMap::new(),
            loaded_at: SystemTime::UNIX_EPOCH,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("server set must not be empty".into()));
        }
        for (name, pool) in &self.pools {
            if name.is_empty() {
                return Err(ConfigError::Invalid("pool name must not be empty".into()));
            }
            if pool.jobs.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "pool {name} has no job functions"
                )));
            }
            Url::parse(&pool.processing_uri).map_err(|e| {
                ConfigError::Invalid(format!(
                    "pool {name} has an invalid processing_uri: {e}"
                ))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    gearman_servers_list: Vec<String>,
    pools_list: HashMap<String, RawPool>,
}

#[derive(Debug, Deserialize)]
struct RawPool {
    worker_count: u32,
    jobs_list: Vec<String>,
    job_processing_uri: String,
}

/// Load the config at `path` unless its mtime is not newer than
/// `previous_loaded_at`, in which case `Ok(None)` is returned and the
/// caller should keep using the config it already has.
///
/// Grounded on `original_source/src/main-loop.cpp::loadConfig`, which
/// `stat()`s the file and skips the reload entirely when
/// `st_mtime <= m_load_time` — the reload stays idempotent when the file
/// hasn't changed.
pub fn load_if_changed(
    path: &Path,
    previous_loaded_at: SystemTime,
) -> Result<Option<DesiredConfig>, ConfigError> {
    let metadata = fs::metadata(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mtime = metadata.modified().map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    if mtime <= previous_loaded_at {
        return Ok(None);
    }

    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let parsed: RawConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let mut pools = HashMap::with_capacity(parsed.pools_list.len());
    for (name, raw_pool) in parsed.pools_list {
        pools.insert(
            name,
            PoolSpec {
                worker_count: raw_pool.worker_count,
                processing_uri: raw_pool.job_processing_uri,
                jobs: raw_pool.jobs_list.into_iter().collect(),
            },
        );
    }

    let config = DesiredConfig {
        servers: parsed.gearman_servers_list.into_iter().collect(),
        pools,
        loaded_at: mtime,
    };

    config.validate()?;
    Ok(Some(config))
}

/// The pool names to stop and the pool names to (re)start, computed purely
/// from two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub pools_to_stop: BTreeSet<String>,
    pub pools_to_start: BTreeSet<String>,
}

/// Diff `old` against `new`. If the server set changed, every pool is
/// marked for restart (stop+start); otherwise pools only in `old` are
/// stopped, pools only in `new` are started, and pools present in both
/// whose `processing_uri` or `jobs` differ are added to *both* sets.
pub fn diff(old: &DesiredConfig, new: &DesiredConfig) -> ConfigDiff {
    if old.servers != new.servers {
        return ConfigDiff {
            pools_to_stop: old.pools.keys().cloned().collect(),
            pools_to_start: new.pools.keys().cloned().collect(),
        };
    }

    let old_names: BTreeSet<&String> = old.pools.keys().collect();
    let new_names: BTreeSet<&String> = new.pools.keys().collect();

    let mut pools_to_stop: BTreeSet<String> = old_names
        .difference(&new_names)
        .map(|s| (*s).clone())
        .collect();
    let mut pools_to_start: BTreeSet<String> = new_names
        .difference(&old_names)
        .map(|s| (*s).clone())
        .collect();

    for (name, old_pool) in &old.pools {
        if let Some(new_pool) = new.pools.get(name) {
            let restart =
                old_pool.processing_uri != new_pool.processing_uri || old_pool.jobs != new_pool.jobs;
            if restart {
                pools_to_stop.insert(name.clone());
                pools_to_start.insert(name.clone());
            }
        }
    }

    ConfigDiff {
        pools_to_stop,
        pools_to_start,
    }
}
