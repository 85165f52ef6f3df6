//! # Router Configuration
//!
//! Configuration for the request router and the logging setup that goes with
//! it.
//!
//! ## Sources
//!
//! Values are resolved in this order, later sources overriding earlier ones:
//!
//! 1. Built-in defaults (`RouterConfig::default()`)
//! 2. An optional TOML file
//! 3. `ROUTER__<SECTION>__<KEY>` environment variables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use router_config::{init_tracing, ErrorBehaviour, RouterConfig};
//!
//! let config = RouterConfig::load(Some("config/router.toml".as_ref()))?;
//! init_tracing(&config.log_level)?;
//!
//! if config.error_behaviour == ErrorBehaviour::Raise {
//!     // per-item errors fail the whole request
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod logging;
pub mod router_config;

pub use logging::init_tracing;
pub use router_config::{
    ClassifierConfig, ErrorBehaviour, RetryConfig, RouterConfig, SessionConfig,
    MAX_RETRY_ATTEMPTS,
};
