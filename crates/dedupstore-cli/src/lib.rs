//! Command line front end for the dedupstore engine.

pub mod cli;

pub use cli::{format_bytes, Cli, Command};
