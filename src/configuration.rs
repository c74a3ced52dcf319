//! Runtime configuration: the TOML sections, their defaults and the environment overrides.

pub mod config;
pub mod types;

pub use config::Config;
