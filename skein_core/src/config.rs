//! Aggregator configuration.
//!
//! Tunables for the aggregation layer, loadable from a TOML file or built in
//! code. Every field has a default so partial config files work.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SkeinError, SkeinResult};
use crate::wire::RECORD_HEADER_BYTES;

fn default_target_size() -> usize {
    4096
}

fn default_prefetch_distance() -> usize {
    5
}

fn default_max_buffer_size() -> usize {
    64 * 1024
}

fn default_medium_cutoff() -> usize {
    512
}

/// Software prefetch strategy for the send-path list walk. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PrefetchStrategy {
    /// Non-temporal prefetch (bypass cache hierarchy)
    NonTemporal,
    /// Prefetch into L1
    L1,
    /// No prefetching
    None,
}

impl TryFrom<u8> for PrefetchStrategy {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(PrefetchStrategy::NonTemporal),
            3 => Ok(PrefetchStrategy::L1),
            255 => Ok(PrefetchStrategy::None),
            other => Err(format!("unknown prefetch strategy {} (expected 0, 3, or 255)", other)),
        }
    }
}

impl From<PrefetchStrategy> for u8 {
    fn from(s: PrefetchStrategy) -> u8 {
        match s {
            PrefetchStrategy::NonTemporal => 0,
            PrefetchStrategy::L1 => 3,
            PrefetchStrategy::None => 255,
        }
    }
}

/// Configuration for one aggregator instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Soft byte cap that triggers a size-based flush. Must exceed the
    /// largest single serialized message.
    #[serde(default = "default_target_size")]
    pub target_size: usize,

    /// Length of the per-destination prefetch ring (D)
    #[serde(default = "default_prefetch_distance")]
    pub prefetch_distance: usize,

    /// Prefetch hint used while walking a grabbed list
    #[serde(default = "AggregatorConfig::default_prefetch_strategy")]
    pub prefetch_strategy: PrefetchStrategy,

    /// Hard cap for a single aggregated send buffer. Flushes larger than
    /// this ship as multiple ordered chunks.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Aggregate payloads at or below this size skip the rendezvous and go
    /// out as one medium active message.
    #[serde(default = "default_medium_cutoff")]
    pub medium_cutoff: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            prefetch_distance: default_prefetch_distance(),
            prefetch_strategy: PrefetchStrategy::NonTemporal,
            max_buffer_size: default_max_buffer_size(),
            medium_cutoff: default_medium_cutoff(),
        }
    }
}

impl AggregatorConfig {
    fn default_prefetch_strategy() -> PrefetchStrategy {
        PrefetchStrategy::NonTemporal
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> SkeinResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency. Called by the aggregator at init.
    pub fn validate(&self) -> SkeinResult<()> {
        if self.target_size <= RECORD_HEADER_BYTES {
            return Err(SkeinError::config(format!(
                "target_size {} does not fit a single record header ({} bytes)",
                self.target_size, RECORD_HEADER_BYTES
            )));
        }
        // Running size estimates are carried in a 16-bit ring field.
        if self.target_size > u16::MAX as usize {
            return Err(SkeinError::config(format!(
                "target_size {} exceeds the {} estimator limit",
                self.target_size,
                u16::MAX
            )));
        }
        if self.prefetch_distance == 0 {
            return Err(SkeinError::config("prefetch_distance must be at least 1"));
        }
        if self.medium_cutoff > self.max_buffer_size {
            return Err(SkeinError::config(format!(
                "medium_cutoff {} exceeds max_buffer_size {}",
                self.medium_cutoff, self.max_buffer_size
            )));
        }
        if self.max_buffer_size < self.target_size {
            return Err(SkeinError::config(format!(
                "max_buffer_size {} is below target_size {}",
                self.max_buffer_size, self.target_size
            )));
        }
        Ok(())
    }
}
