//! Logger setup and the byte-count formatting shared by allocation and
//! capability diagnostics.
//!
//! The backend itself only logs through the `log` facade; installing a
//! logger is left to binaries.

mod format;
mod init;

pub use format::{human_number, human_size};
pub use init::{init_logging, LoggingConfig};
