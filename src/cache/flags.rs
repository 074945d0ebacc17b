//! Process-wide cache toggles.
//!
//! Every connection holds a clone of [`CacheFlags`]; a change made through any
//! clone (admin API, config reload, code) is seen by connections that start
//! afterwards. A running connection keeps the [`ConnectionPolicy`] it captured.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::CacheConfig;

/// A boolean shared by every clone.
#[derive(Debug, Clone)]
pub struct SharedFlag(Arc<AtomicBool>);

impl SharedFlag {
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(AtomicBool::new(initial)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Names of the cache toggles, as used by the admin API and CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFlag {
    Enabled,
    LocalOnly,
}

impl CacheFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheFlag::Enabled => "enabled",
            CacheFlag::LocalOnly => "local-only",
        }
    }
}

impl fmt::Display for CacheFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unknown flag name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cache flag: {0}")]
pub struct UnknownFlag(pub String);

impl FromStr for CacheFlag {
    type Err = UnknownFlag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(CacheFlag::Enabled),
            "local-only" | "local_only" => Ok(CacheFlag::LocalOnly),
            other => Err(UnknownFlag(other.to_string())),
        }
    }
}

/// The `enabled` and `local_only` toggles.
#[derive(Debug, Clone)]
pub struct CacheFlags {
    enabled: SharedFlag,
    local_only: SharedFlag,
}

impl CacheFlags {
    pub fn new(enabled: bool, local_only: bool) -> Self {
        Self {
            enabled: SharedFlag::new(enabled),
            local_only: SharedFlag::new(local_only),
        }
    }

    /// Flags seeded from configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.enabled, config.local_only)
    }

    /// When cleared, interceptors are inert.
    pub fn enabled(&self) -> &SharedFlag {
        &self.enabled
    }

    /// When set, nothing is fetched from upstream.
    pub fn local_only(&self) -> &SharedFlag {
        &self.local_only
    }

    pub fn flag(&self, flag: CacheFlag) -> &SharedFlag {
        match flag {
            CacheFlag::Enabled => &self.enabled,
            CacheFlag::LocalOnly => &self.local_only,
        }
    }

    /// Copy of both toggles for one connection.
    pub fn snapshot(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            enabled: self.enabled.get(),
            local_only: self.local_only.get(),
        }
    }

    /// Apply the toggles a reloaded configuration changed.
    ///
    /// A toggle whose configured value is the same in both files keeps its live
    /// value, so changes made through the admin API survive unrelated reloads.
    pub fn apply_changes(&self, previous: &CacheConfig, next: &CacheConfig) {
        let changes = [
            (&self.enabled, previous.enabled, next.enabled),
            (&self.local_only, previous.local_only, next.local_only),
        ];
        for (flag, before, after) in changes {
            if before == after {
                continue;
            }
            if after {
                flag.set();
            } else {
                flag.clear();
            }
        }
    }
}

impl Default for CacheFlags {
    fn default() -> Self {
        Self::new(true, false)
    }
}

/// Toggle values captured once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionPolicy {
    pub enabled: bool,
    pub local_only: bool,
}
