// src/config.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration option controlling the maximum number of concurrently
/// open sources. Read once, when the pool singleton is created.
pub const MAX_DATASET_POOL_SIZE_ENV: &str = "MAX_DATASET_POOL_SIZE";

pub const DEFAULT_MAX_POOL_SIZE: usize = 100;
pub const MIN_POOL_SIZE: usize = 2;
pub const MAX_POOL_SIZE: usize = 1000;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
}

fn default_max_pool_size() -> usize {
    DEFAULT_MAX_POOL_SIZE
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
        }
    }
}

impl PoolConfig {
    /// Configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = PoolConfig::default();
        if let Ok(raw) = std::env::var(MAX_DATASET_POOL_SIZE_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(size) => config.max_pool_size = size,
                Err(_) => warn!(
                    value = %raw,
                    "ignoring unparseable {MAX_DATASET_POOL_SIZE_ENV}"
                ),
            }
        }
        config
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid pool configuration")
    }

    /// The pool size actually used: clamped to `[2, 1000]`.
    pub fn effective_max_pool_size(&self) -> usize {
        let clamped = self.max_pool_size.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE);
        if clamped != self.max_pool_size {
            warn!(
                requested = self.max_pool_size,
                used = clamped,
                "pool size out of range, clamping"
            );
        }
        clamped
    }
}
