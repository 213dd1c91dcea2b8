//! Engine configuration
//!
//! Configuration can come from a TOML file (see [`toml`]) or be built
//! directly. Command-line flags (see [`cli`]) override file values.
//!
//! ```toml
//! [engine]
//! capacity = 64
//! poll_mode = "pollable"
//! backend = "kernel"
//! alignment = 512
//! ```

use crate::engine::{Backend, PollMode};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub mod cli;
pub mod toml;

/// Largest capacity accepted by validation
pub const MAX_CAPACITY: usize = 65536;

/// Smallest alignment accepted for direct IO
pub const MIN_ALIGNMENT: usize = 512;

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Parameters for constructing an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum number of simultaneously outstanding requests
    pub capacity: usize,

    /// Whether to expose a readiness descriptor
    pub poll_mode: PollMode,

    /// Which engine implementation to build
    pub backend: Backend,

    /// Reject requests whose buffer, length, or offset is not a multiple of
    /// this value. Set it when descriptors are opened with O_DIRECT.
    pub alignment: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            poll_mode: PollMode::NotPollable,
            backend: Backend::Kernel,
            alignment: None,
        }
    }
}

/// Validate engine configuration
pub fn validate(config: &EngineConfig) -> Result<()> {
    if config.capacity == 0 || config.capacity > MAX_CAPACITY {
        anyhow::bail!(
            "capacity must be between 1 and {}, got {}",
            MAX_CAPACITY,
            config.capacity
        );
    }

    if let Some(align) = config.alignment {
        if !align.is_power_of_two() || align < MIN_ALIGNMENT {
            anyhow::bail!(
                "alignment must be a power of two of at least {}, got {}",
                MIN_ALIGNMENT,
                align
            );
        }
    }

    Ok(())
}

/// Parse a size string (e.g., "4k", "1M", "512") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        anyhow::bail!("Empty size string");
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("kb").or_else(|| s.strip_suffix('k')) {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix("mb").or_else(|| s.strip_suffix('m')) {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("gb").or_else(|| s.strip_suffix('g')) {
        (n, 1024 * 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid size format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size overflows: {}", s))
}
