//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - TOML/JSON loading
//! - Named experiment definitions
//! - Up-front validation of everything a run depends on

#[allow(clippy::module_inception)]
pub mod config;
pub mod serde_secs;

pub use config::{
    ConfigError, ConfigResult, EngineConfig, ExperimentConfig, IdentityEntry, load_proxy_file,
    parse_proxy_list,
};
