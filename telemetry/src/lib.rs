//! Logging and metrics wiring for the ReBAC engine
//!
//! - Structured logging through `tracing-subscriber`, pretty for local runs
//!   and JSON for production, filtered by `RUST_LOG` or the configured level
//! - Prometheus export of the counters recorded by `auth-rebac`
//!
//! # Example
//!
//! ```rust,no_run
//! use config_engine::RebacConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RebacConfig::load()?;
//!     telemetry::init_tracing(&config.logging)?;
//!     let prometheus = telemetry::install_prometheus_recorder()?;
//!     // ... serve prometheus.render() from a metrics endpoint
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod metrics;

pub use self::error::*;
pub use self::logging::*;
pub use self::metrics::*;
