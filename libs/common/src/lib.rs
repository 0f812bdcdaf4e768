//! Shared utilities for the RTU sniffer workspace
//!
//! Provides the functions every binary built on the capture engine needs:
//! - logging bootstrap (console + optional daily file)
//! - graceful shutdown signal handling
//! - hex formatting of raw frames

pub mod hex;
pub mod logging;
pub mod shutdown;
