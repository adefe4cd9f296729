//! CLI module
//!
//! Command-line interface for the sharing node.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::Config;
