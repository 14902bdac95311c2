//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML file from the platform config
//! directory (or an explicit path) and turns it into connection settings.

pub mod config;
