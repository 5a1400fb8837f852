//! Homelab disaster recovery library
//!
//! Backs up and restores a k3s homelab: control-plane state, CNPG databases
//! and PVC data, described by one manifest per timestamped run directory.

pub mod cluster;
pub mod collector;
pub mod config;
pub mod manifest;
pub mod report;
pub mod restore;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use report::RunResult;
pub use utils::{DrError, Result};
