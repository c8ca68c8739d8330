//! Configuration for the ReBAC engine
//!
//! Settings are layered, later sources overriding earlier ones:
//! - Built-in defaults
//! - A YAML or TOML file (explicit path, or `REBAC_CONFIG`)
//! - A `.env` file in the working directory
//! - `REBAC_` environment variables, with `__` separating sections
//!   (e.g. `REBAC_DATABASE__URL`, `REBAC_ENGINE__MAX_PAGE_SIZE`)
//!
//! # Example
//!
//! ```rust,no_run
//! use config_engine::RebacConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RebacConfig::load_from(Some("rebac.yaml"))?;
//!     println!("page size: {}", config.engine.default_page_size);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod providers;
pub mod validation;

pub use error::*;
pub use providers::*;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebacConfig {
    pub database: DatabaseConfig,
    pub engine: EngineSettings,
    pub logging: LoggingConfig,
}

/// PostgreSQL connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection string; required only for the PostgreSQL store
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    /// Upper bound on waiting for the exclusive relation lock
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_ms: 5_000,
            lock_timeout_ms: 5_000,
        }
    }
}

/// Evaluation, caching and paging behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum chain of `relative2` hops per check
    pub max_schema_depth: u32,
    /// Deadline applied when a call does not pass one; 0 disables it
    pub default_deadline_ms: u64,
    /// Evaluate union branches concurrently
    pub parallel_union: bool,
    pub intersection_cache: bool,
    pub intersection_cache_capacity: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Schema file (`.yaml`, `.yml` or `.json`)
    pub schema_path: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_schema_depth: 32,
            default_deadline_ms: 5_000,
            parallel_union: true,
            intersection_cache: true,
            intersection_cache_capacity: 100_000,
            default_page_size: 100,
            max_page_size: 1_000,
            schema_path: None,
        }
    }
}

impl EngineSettings {
    pub fn default_deadline(&self) -> Option<Duration> {
        (self.default_deadline_ms > 0).then(|| Duration::from_millis(self.default_deadline_ms))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. `info` or `auth_rebac=debug,info`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
