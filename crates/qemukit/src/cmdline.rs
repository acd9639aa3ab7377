//! Rendering of a [`VmConfig`] into the hypervisor argument vector.

use std::path::Path;

use qemukit_core::VmConfig;

/// Builds the QEMU argument vector. Flag order is significant: machine and
/// resource flags first, then drives and NICs in declaration order, boot
/// material, display, the control socket endpoint, and finally the caller's
/// extra arguments verbatim.
pub(crate) fn build_args(config: &VmConfig, socket_path: &Path) -> Vec<String> {
    let mut args = vec!["-machine".to_string(), config.machine_type.clone()];

    if config.enable_kvm {
        args.push("-enable-kvm".to_string());
    }

    args.push("-cpu".to_string());
    args.push(config.cpu_type.clone());
    args.push("-smp".to_string());
    args.push(config.cpu_count.to_string());
    args.push("-m".to_string());
    args.push(config.memory_mb.to_string());

    for (index, disk) in config.disks.iter().enumerate() {
        let id = disk.id.clone().unwrap_or_else(|| format!("drive{index}"));
        let mut drive = format!(
            "file={},format={},if={},id={}",
            disk.path.display(),
            disk.format,
            disk.interface,
            id
        );
        if disk.read_only {
            drive.push_str(",readonly=on");
        }
        args.push("-drive".to_string());
        args.push(drive);
    }

    for (index, nic) in config.nics.iter().enumerate() {
        let id = nic.id.clone().unwrap_or_else(|| format!("net{index}"));
        let mut netdev = format!("{},id={}", nic.backend, id);
        for option in &nic.options {
            netdev.push(',');
            netdev.push_str(option);
        }
        args.push("-netdev".to_string());
        args.push(netdev);

        let mut device = format!("{},netdev={}", nic.model, id);
        if let Some(mac) = &nic.mac {
            device.push_str(",mac=");
            device.push_str(mac);
        }
        args.push("-device".to_string());
        args.push(device);
    }

    if let Some(kernel) = &config.kernel {
        args.push("-kernel".to_string());
        args.push(kernel.display().to_string());
    }
    if let Some(initrd) = &config.initrd {
        args.push("-initrd".to_string());
        args.push(initrd.display().to_string());
    }
    if let Some(cmdline) = &config.kernel_cmdline {
        args.push("-append".to_string());
        args.push(cmdline.clone());
    }

    if config.no_graphic {
        args.push("-nographic".to_string());
    }

    args.push("-qmp".to_string());
    args.push(format!("unix:{},server,wait=off", socket_path.display()));

    if config.start_paused {
        args.push("-S".to_string());
    }

    args.extend(config.extra_args.iter().cloned());

    args
}
