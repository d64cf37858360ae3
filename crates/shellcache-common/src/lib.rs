//! # shellcache common
//!
//! Pieces shared by the shellcache crates.
//!
//! ## Features
//!
//! - Agent configuration: cache version tag, precached asset list, shell path
//! - Logging configuration and setup on top of `tracing-subscriber`

pub mod config;
pub mod logging;

pub use config::{
    AgentConfig, ConfigError, DEFAULT_ASSETS, DEFAULT_CACHE_NAME, DEFAULT_SHELL_PATH,
};
pub use logging::{init_logging, LogConfig, LogFormat, LogTarget, LoggingError};
