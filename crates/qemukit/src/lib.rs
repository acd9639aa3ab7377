//! qemukit - a host-side controller library for QEMU virtual machines.
//!
//! qemukit renders a declarative [`VmConfig`] into a QEMU invocation,
//! supervises the QEMU process over its lifetime, and drives it through QMP
//! (the QEMU Machine Protocol) on its control socket.
//!
//! # Example
//!
//! ```rust,no_run
//! use qemukit::{DiskConfig, VmConfig, VmManager};
//!
//! #[tokio::main]
//! async fn main() -> qemukit::Result<()> {
//!     let config = VmConfig::new()
//!         .cpus(2)
//!         .memory_mb(2048)
//!         .enable_kvm()
//!         .disk(DiskConfig::new("./rootfs.qcow2"))
//!         .no_graphic();
//!
//!     let manager = VmManager::new();
//!     manager.create_vm(config).await?;
//!
//!     manager.pause().await?;
//!     manager.start().await?;
//!
//!     // Graceful power-down, escalating to a forced teardown if the guest
//!     // does not exit in time.
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod cmdline;
mod manager;
mod process;
mod qmp;

#[cfg(test)]
pub(crate) mod test_support;

pub use manager::VmManager;
pub use process::QemuProcess;
pub use qemukit_core::{DiskConfig, Error, NicConfig, Result, VmConfig, VmStatus};
pub use qmp::{QmpClient, QmpCommand, QmpError, QmpEvent, QmpGreeting, QmpResponse, QueryStatus};
