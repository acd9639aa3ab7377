//! Core types shared across the qemukit workspace.

mod error;
mod types;

pub use error::{Error, Result};
pub use types::{DiskConfig, NicConfig, VmConfig, VmStatus};
