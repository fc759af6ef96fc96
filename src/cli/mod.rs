//! Command-line interface for taskfleet.
//!
//! Thin argument parsing only; everything interesting lives in the
//! library crate.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
