//! Engine configuration
//!
//! A single [`EngineConfig`] carries every tunable. It can be built from
//! defaults, from `TASKJS_*` environment variables, or from JSON.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dialect::Transpiler;
use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default per-engine heap limit (32 MiB)
pub const DEFAULT_MEMORY_LIMIT: usize = 32 * 1024 * 1024;

pub const ENV_MEMORY_LIMIT: &str = "TASKJS_MEMORY_LIMIT";
pub const ENV_MAX_STACK_SIZE: &str = "TASKJS_MAX_STACK_SIZE";
pub const ENV_CIVET_MODULE: &str = "TASKJS_CIVET_MODULE";
pub const ENV_POOL_MAX_IDLE: &str = "TASKJS_POOL_MAX_IDLE";

fn default_pool_max_idle() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Settings shared by the facade, the pool and the binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Heap limit applied to every engine at creation
    pub memory_limit: usize,

    /// Maximum native stack size for the interpreter, if any
    pub max_stack_size: Option<usize>,

    /// Path to the Civet transpiler bundle
    pub civet_module: Option<PathBuf>,

    /// Idle instances a pool keeps around
    pub pool_max_idle: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            max_stack_size: None,
            civet_module: None,
            pool_max_idle: default_pool_max_idle(),
        }
    }
}

impl EngineConfig {
    /// Resolve configuration from `TASKJS_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = EngineConfig::default();

        if let Some(raw) = non_empty(lookup(ENV_MEMORY_LIMIT)) {
            config.memory_limit = parse_size(ENV_MEMORY_LIMIT, &raw)?;
        }
        if let Some(raw) = non_empty(lookup(ENV_MAX_STACK_SIZE)) {
            config.max_stack_size = Some(parse_size(ENV_MAX_STACK_SIZE, &raw)?);
        }
        if let Some(raw) = non_empty(lookup(ENV_CIVET_MODULE)) {
            config.civet_module = Some(PathBuf::from(raw));
        }
        if let Some(raw) = non_empty(lookup(ENV_POOL_MAX_IDLE)) {
            config.pool_max_idle = raw.trim().parse().map_err(|_| {
                Error::Configuration(format!("{}: expected a count, got {:?}", ENV_POOL_MAX_IDLE, raw))
            })?;
        }

        Ok(config)
    }

    /// Parse configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Load the Civet transpiler
    ///
    /// A configured bundle path wins over the bundle compiled into the crate.
    pub fn transpiler(&self) -> Result<Option<Transpiler>> {
        match self.civet_module.as_deref() {
            Some(path) => Transpiler::from_file(path).map(Some),
            None => Ok(Transpiler::bundled()),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse a byte size with an optional `K`, `M` or `G` suffix
pub fn parse_size(key: &str, raw: &str) -> Result<usize> {
    let trimmed = raw.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k' | 'K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m' | 'M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| Error::Configuration(format!("{}: invalid size {:?}", key, raw)))
}
