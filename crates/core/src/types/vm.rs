use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::types::{DiskConfig, NicConfig};

/// Current status of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    /// No VM exists, or it has been torn down.
    Stopped,
    /// The hypervisor is being launched and connected to.
    Creating,
    /// The guest is executing.
    Running,
    /// The guest exists but its vCPUs are halted.
    Paused,
    /// A graceful power-down has been requested.
    ShuttingDown,
    /// The hypervisor reported a state this controller does not track.
    Unknown,
}

impl VmStatus {
    /// Maps a `query-status` reply onto a [`VmStatus`].
    ///
    /// QEMU reports `status: "running"` with `running == false` while the
    /// vCPUs are halted, so the boolean wins over the string.
    pub fn from_query(status: &str, running: bool) -> Self {
        match status {
            "running" => {
                if running {
                    Self::Running
                } else {
                    Self::Paused
                }
            }
            "paused" | "suspended" => Self::Paused,
            "shutdown" | "poweroff" => Self::Stopped,
            "inmigrate" | "prelaunch" => Self::Creating,
            _ => Self::Unknown,
        }
    }
}

/// Declarative description of a virtual machine.
///
/// Built by the caller, consumed by the manager's `create_vm`, never
/// mutated by the controller afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub machine_type: String,
    pub cpu_type: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub enable_kvm: bool,
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    #[serde(default)]
    pub nics: Vec<NicConfig>,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub kernel_cmdline: Option<String>,
    pub no_graphic: bool,
    pub start_paused: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Control socket path; a unique path under the host temp directory is
    /// synthesized when not supplied.
    pub socket_path: Option<PathBuf>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            machine_type: "q35".to_string(),
            cpu_type: "max".to_string(),
            cpu_count: 1,
            memory_mb: 512,
            enable_kvm: false,
            disks: Vec::new(),
            nics: Vec::new(),
            kernel: None,
            initrd: None,
            kernel_cmdline: None,
            no_graphic: false,
            start_paused: false,
            extra_args: Vec::new(),
            socket_path: None,
        }
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn machine_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = machine_type.into();
        self
    }

    pub fn cpu_type(mut self, cpu_type: impl Into<String>) -> Self {
        self.cpu_type = cpu_type.into();
        self
    }

    /// Sets the number of virtual CPUs for the VM.
    pub fn cpus(mut self, count: u32) -> Self {
        self.cpu_count = count;
        self
    }

    /// Sets the amount of memory in mebibytes for the VM.
    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    pub fn enable_kvm(mut self) -> Self {
        self.enable_kvm = true;
        self
    }

    /// Adds a disk; disks are rendered in the order they are added.
    pub fn disk(mut self, disk: DiskConfig) -> Self {
        self.disks.push(disk);
        self
    }

    /// Adds a network interface; NICs are rendered in the order they are
    /// added.
    pub fn nic(mut self, nic: NicConfig) -> Self {
        self.nics.push(nic);
        self
    }

    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel = Some(path.into());
        self
    }

    pub fn initrd(mut self, path: impl Into<PathBuf>) -> Self {
        self.initrd = Some(path.into());
        self
    }

    pub fn kernel_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.kernel_cmdline = Some(cmdline.into());
        self
    }

    pub fn no_graphic(mut self) -> Self {
        self.no_graphic = true;
        self
    }

    /// Launches the guest with its vCPUs halted until resumed.
    pub fn start_paused(mut self) -> Self {
        self.start_paused = true;
        self
    }

    /// Appends a raw hypervisor argument after everything this library
    /// renders.
    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    /// Checks the configuration before it is handed to the hypervisor.
    pub fn validate(&self) -> Result<()> {
        if self.machine_type.is_empty() {
            return Err(Error::InvalidConfig("machine type must not be empty".to_string()));
        }
        if self.cpu_type.is_empty() {
            return Err(Error::InvalidConfig("CPU type must not be empty".to_string()));
        }
        if self.cpu_count < 1 {
            return Err(Error::InvalidConfig("at least one CPU is required".to_string()));
        }
        if self.memory_mb < 1 {
            return Err(Error::InvalidConfig("at least 1 MiB of memory is required".to_string()));
        }
        for disk in &self.disks {
            if disk.path.as_os_str().is_empty() {
                return Err(Error::InvalidConfig("disk path must not be empty".to_string()));
            }
        }
        for nic in &self.nics {
            if nic.backend.is_empty() {
                return Err(Error::InvalidConfig("NIC backend must not be empty".to_string()));
            }
            if nic.model.is_empty() {
                return Err(Error::InvalidConfig("NIC model must not be empty".to_string()));
            }
        }
        Ok(())
    }
}
