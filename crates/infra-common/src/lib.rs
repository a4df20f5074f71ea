//! Common infrastructure for the pipeline loopback workspace.
//!
//! Binaries install their `tracing` subscriber through [`logging::setup_logging`];
//! library crates only emit events and never install a subscriber themselves.

pub mod errors;
pub mod logging;

pub use errors::{Error, ErrorContext, ErrorExt, Result};
pub use logging::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
