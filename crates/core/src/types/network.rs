use serde::{Deserialize, Serialize};

/// A virtual network interface: a host-side backend (`user`, `tap`,
/// `bridge`, ...) paired with a guest-visible device model.
///
/// A NIC without an explicit id gets `netN`, where `N` is its zero-based
/// position in [`VmConfig::nics`](crate::VmConfig).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicConfig {
    pub backend: String,
    pub model: String,
    pub mac: Option<String>,
    pub id: Option<String>,
    pub options: Vec<String>,
}

impl NicConfig {
    pub fn new(backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            mac: None,
            id: None,
            options: Vec::new(),
        }
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Appends a backend option rendered verbatim into the `-netdev` flag.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_setters() {
        let nic = NicConfig::new("tap", "virtio-net-pci")
            .with_mac("52:54:00:12:34:56")
            .with_id("lan0")
            .with_option("ifname=tap0")
            .with_option("script=no");
        assert_eq!(nic.backend, "tap");
        assert_eq!(nic.model, "virtio-net-pci");
        assert_eq!(nic.mac.as_deref(), Some("52:54:00:12:34:56"));
        assert_eq!(nic.id.as_deref(), Some("lan0"));
        assert_eq!(nic.options, vec!["ifname=tap0", "script=no"]);
    }
}
