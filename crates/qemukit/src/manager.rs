//! The VM manager: lifecycle and hot-plug operations over one supervised
//! hypervisor process and one monitor session.
//!
//! All state lives behind a single mutex held for the duration of each
//! public method, so operations are strictly serialized: at most one of
//! them touches the process, the monitor, or the status at any time.

use std::path::Path;
use std::time::Duration;

use qemukit_core::{Error, Result, VmConfig, VmStatus};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::process::QemuProcess;
use crate::qmp::QmpClient;

const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
// Bound on destroy's best-effort quit; the process may already be exiting
// and never answer.
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Controller for one virtual machine.
///
/// Owns a [`QemuProcess`] for spawning and teardown and a [`QmpClient`]
/// for in-band control, and keeps the two consistent through a small state
/// machine with bounded timeouts and rollback on partial failure.
pub struct VmManager {
    inner: Mutex<Inner>,
}

struct Inner {
    process: QemuProcess,
    monitor: QmpClient,
    status: VmStatus,
    connected: bool,
}

impl VmManager {
    pub fn new() -> Self {
        Self::with_process(QemuProcess::new())
    }

    /// Builds a manager around a specific supervisor, e.g. one pointed at a
    /// non-default hypervisor binary.
    pub fn with_process(process: QemuProcess) -> Self {
        Self {
            inner: Mutex::new(Inner {
                process,
                monitor: QmpClient::new(),
                status: VmStatus::Stopped,
                connected: false,
            }),
        }
    }

    /// Current VM status.
    pub async fn status(&self) -> VmStatus {
        self.inner.lock().await.status
    }

    /// Whether a live monitor session exists.
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.connected
    }

    /// Launches the hypervisor and connects to its control socket, with a
    /// 30 second budget.
    pub async fn create_vm(&self, config: VmConfig) -> Result<()> {
        self.create_vm_with_timeout(config, DEFAULT_CREATE_TIMEOUT).await
    }

    /// Launches the hypervisor with a caller-chosen budget. Any failure,
    /// including running out of budget, tears the partially started VM
    /// back down before the error is returned.
    pub async fn create_vm_with_timeout(&self, config: VmConfig, budget: Duration) -> Result<()> {
        config.validate()?;
        let mut inner = self.inner.lock().await;
        if inner.process.is_running() {
            return Err(Error::ProcessAlreadyRunning);
        }
        inner.status = VmStatus::Creating;

        let booted = match timeout(budget, inner.boot(&config)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout),
        };
        if let Err(e) = booted {
            warn!(error = %e, "vm creation failed, cleaning up");
            inner.teardown().await;
            return Err(e);
        }

        inner.connected = true;
        inner.refresh_status().await;
        Ok(())
    }

    /// Resumes a paused VM.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.require_connected()?;
        let previous = inner.status;
        inner.status = VmStatus::Running;
        if let Err(e) = inner.monitor.cont().await {
            inner.status = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Pauses a running VM.
    pub async fn pause(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.require_connected()?;
        let previous = inner.status;
        inner.status = VmStatus::Paused;
        if let Err(e) = inner.monitor.stop().await {
            inner.status = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Hard-resets the VM, then re-reads its status from the monitor.
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.require_connected()?;
        if let Err(e) = inner.monitor.system_reset().await {
            inner.status = VmStatus::Unknown;
            return Err(e);
        }
        inner.refresh_status().await;
        Ok(())
    }

    /// Gracefully powers the guest down, forcing teardown if it has not
    /// exited after 30 seconds.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_GRACE).await
    }

    /// Gracefully powers the guest down with a caller-chosen grace period.
    pub async fn shutdown_with_timeout(&self, grace: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.require_connected()?;
        inner.status = VmStatus::ShuttingDown;

        if let Err(e) = inner.monitor.system_powerdown().await {
            warn!(error = %e, "powerdown request failed, forcing teardown");
            inner.destroy().await;
            return Err(e);
        }

        match timeout(grace, inner.process.wait()).await {
            Ok(Ok(code)) => debug!(code, "guest powered down"),
            Ok(Err(e)) => debug!(error = %e, "hypervisor already gone"),
            Err(_) => {
                warn!("guest did not power down in time, forcing teardown");
                inner.destroy().await;
                return Ok(());
            }
        }

        inner.monitor.disconnect().await;
        inner.process.stop();
        inner.connected = false;
        inner.status = VmStatus::Stopped;
        Ok(())
    }

    /// Forcibly tears the VM down: best-effort `quit`, then disconnect and
    /// process termination. Succeeds from any state.
    pub async fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.destroy().await;
        Ok(())
    }

    /// Re-reads the VM status from the monitor.
    pub async fn update_status(&self) -> Result<VmStatus> {
        let mut inner = self.inner.lock().await;
        inner.require_connected()?;
        inner.refresh_status().await;
        Ok(inner.status)
    }

    /// Hot-plugs a disk: creates the block backend, then binds a virtio-blk
    /// frontend to it. If the frontend cannot be attached, the backend is
    /// deleted again before the error surfaces.
    pub async fn attach_disk(
        &self,
        path: impl AsRef<Path>,
        device_name: &str,
        read_only: bool,
    ) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.require_connected()?;

        let node_name = format!("drive-{device_name}");
        let path = path.as_ref().display().to_string();
        inner.monitor.blockdev_add(&node_name, &path, read_only).await?;

        let mut args = Map::new();
        args.insert(
            "driver".to_string(),
            Value::String("virtio-blk-pci".to_string()),
        );
        args.insert("id".to_string(), Value::String(device_name.to_string()));
        args.insert("drive".to_string(), Value::String(node_name.clone()));
        if let Err(e) = inner.monitor.device_add(args).await {
            if let Err(rollback) = inner.monitor.blockdev_del(&node_name).await {
                warn!(node = %node_name, error = %rollback, "backend rollback failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Hot-unplugs a disk: detaches the frontend, then deletes the backend
    /// node. Detach is idempotent at the hypervisor level, so there is no
    /// rollback.
    pub async fn detach_disk(&self, device_name: &str) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.require_connected()?;
        inner.monitor.device_del(device_name).await?;
        inner.monitor.blockdev_del(&format!("drive-{device_name}")).await?;
        Ok(())
    }

    /// Raw `query-block` payload, one opaque value per block device.
    pub async fn list_disks(&self) -> Result<Vec<Value>> {
        let inner = self.inner.lock().await;
        inner.require_connected()?;
        inner.monitor.query_block().await
    }
}

impl Default for VmManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn require_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn boot(&mut self, config: &VmConfig) -> Result<()> {
        self.process.start(config).await?;
        let socket_path = self
            .process
            .control_socket_path()
            .map(Path::to_path_buf)
            .ok_or(Error::ProcessNotRunning)?;
        self.monitor.connect_unix(&socket_path).await
    }

    /// Cleanup shared by failed creation and destroy: no step may fail, and
    /// the child must not be left behind.
    async fn teardown(&mut self) {
        self.monitor.disconnect().await;
        self.process.stop();
        self.connected = false;
        self.status = VmStatus::Stopped;
    }

    async fn destroy(&mut self) {
        if self.monitor.is_connected() {
            match timeout(QUIT_TIMEOUT, self.monitor.quit()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(error = %e, "quit failed (hypervisor may already be exiting)")
                }
                Err(_) => debug!("quit timed out"),
            }
        }
        self.teardown().await;
    }

    async fn refresh_status(&mut self) {
        match self.monitor.query_status().await {
            Ok(status) => {
                let mapped = VmStatus::from_query(&status.status, status.running);
                if mapped == VmStatus::Unknown {
                    warn!(status = %status.status, "unrecognized vm status");
                }
                self.status = mapped;
            }
            Err(e) => {
                // A monitor failure does not mean the process is gone, so
                // unknown rather than stopped.
                warn!(error = %e, "status query failed");
                self.status = VmStatus::Unknown;
            }
        }
    }
}
