//! Utility modules shared by the backup and restore pipelines.

pub mod errors;
pub mod logger;
pub mod shutdown;

pub use errors::{DrError, Result};
