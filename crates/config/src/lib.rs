//! Configuration for the AFD dir_check daemon
//!
//! Handles loading `AFD_CONFIG` (`KEY value` lines) and environment variable overrides.

pub mod config;

pub use config::*;
