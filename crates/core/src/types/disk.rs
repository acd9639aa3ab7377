use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A virtual disk attached to the VM at launch.
///
/// Disks are rendered on the hypervisor command line in the order they
/// appear in [`VmConfig::disks`](crate::VmConfig); a disk without an
/// explicit id gets `driveN`, where `N` is its zero-based position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub format: String,
    pub interface: String,
    pub read_only: bool,
    pub id: Option<String>,
}

impl DiskConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: "qcow2".to_string(),
            interface: "virtio".to_string(),
            read_only: false,
            id: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_qcow2_on_virtio() {
        let disk = DiskConfig::new("/images/root.qcow2");
        assert_eq!(disk.format, "qcow2");
        assert_eq!(disk.interface, "virtio");
        assert!(!disk.read_only);
        assert!(disk.id.is_none());
    }

    #[test]
    fn chained_setters() {
        let disk = DiskConfig::new("/images/cdrom.iso")
            .with_format("raw")
            .with_interface("ide")
            .with_id("install-media")
            .read_only();
        assert_eq!(disk.format, "raw");
        assert_eq!(disk.interface, "ide");
        assert_eq!(disk.id.as_deref(), Some("install-media"));
        assert!(disk.read_only);
    }
}
