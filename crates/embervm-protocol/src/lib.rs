//! Machine-description types for the Firecracker hypervisor.
//!
//! embervm never talks to Firecracker's HTTP API while booting a VM. Instead it
//! writes a declarative JSON document and passes it with `--config-file` at
//! launch. This crate defines that document.
//!
//! # Document Layout
//!
//! ```text
//! {
//!   "boot-source":        { kernel image + kernel command line },
//!   "drives":             [ block devices, exactly one root ],
//!   "machine-config":     { vCPUs + memory },
//!   "network-interfaces": [ guest MAC + host TAP device ]
//! }
//! ```

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Maximum vCPU count Firecracker accepts.
pub const MAX_VCPUS: u8 = 32;

/// Smallest memory size we are willing to boot a guest with.
pub const MIN_MEMORY_MIB: u32 = 128;

/// Drive id used for the root filesystem.
pub const ROOT_DRIVE_ID: &str = "rootfs";

/// Interface id of the single guest NIC.
pub const GUEST_IFACE_ID: &str = "eth0";

/// Kernel arguments every guest boots with, before the network configuration.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Errors produced while validating a machine description.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DescriptionError {
    /// No drive is flagged as the root device.
    #[error("no root drive configured")]
    MissingRootDrive,

    /// More than one drive claims to be the root device.
    #[error("multiple root drives configured: {0:?}")]
    MultipleRootDrives(Vec<String>),

    /// Two drives share an id.
    #[error("duplicate drive id: {0}")]
    DuplicateDrive(String),

    /// vCPU count outside 1..=32.
    #[error("vcpu count must be between 1 and {MAX_VCPUS}, got {0}")]
    InvalidVcpus(u8),

    /// Memory below the supported minimum.
    #[error("memory must be at least {MIN_MEMORY_MIB} MiB, got {0}")]
    InvalidMemory(u32),

    /// MAC address could not be parsed.
    #[error("invalid mac address: {0}")]
    InvalidMac(String),
}

/// Kernel image and command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    /// Path to the uncompressed kernel (`vmlinux`).
    pub kernel_image_path: PathBuf,
    /// Kernel command line.
    pub boot_args: String,
}

/// A block device attached to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    /// Unique drive id.
    pub drive_id: String,
    /// Image file on the host.
    pub path_on_host: PathBuf,
    /// Whether the guest boots from this drive.
    pub is_root_device: bool,
    /// Whether the drive is attached read-only.
    pub is_read_only: bool,
}

impl Drive {
    /// A writable root drive.
    pub fn root(path: impl Into<PathBuf>) -> Self {
        Self {
            drive_id: ROOT_DRIVE_ID.to_string(),
            path_on_host: path.into(),
            is_root_device: true,
            is_read_only: false,
        }
    }

    /// A writable non-root drive.
    pub fn data(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            drive_id: id.into(),
            path_on_host: path.into(),
            is_root_device: false,
            is_read_only: false,
        }
    }

    /// Attach the drive read-only.
    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }
}

/// Guest sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of vCPUs.
    pub vcpu_count: u8,
    /// Guest memory in MiB.
    pub mem_size_mib: u32,
}

/// A guest NIC backed by a host TAP device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Interface id inside the description.
    pub iface_id: String,
    /// MAC address presented to the guest.
    pub guest_mac: MacAddress,
    /// TAP device name on the host.
    pub host_dev_name: String,
}

/// The complete document passed to `firecracker --config-file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDescription {
    /// Kernel and boot arguments.
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    /// Attached block devices.
    pub drives: Vec<Drive>,
    /// vCPU and memory sizing.
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    /// Guest network interfaces.
    #[serde(rename = "network-interfaces", default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

impl MachineDescription {
    /// Check the invariants Firecracker would otherwise reject at boot.
    pub fn validate(&self) -> Result<(), DescriptionError> {
        let roots: Vec<String> = self
            .drives
            .iter()
            .filter(|d| d.is_root_device)
            .map(|d| d.drive_id.clone())
            .collect();
        match roots.len() {
            0 => return Err(DescriptionError::MissingRootDrive),
            1 => {}
            _ => return Err(DescriptionError::MultipleRootDrives(roots)),
        }

        let mut seen = std::collections::HashSet::new();
        for drive in &self.drives {
            if !seen.insert(drive.drive_id.as_str()) {
                return Err(DescriptionError::DuplicateDrive(drive.drive_id.clone()));
            }
        }

        let vcpus = self.machine_config.vcpu_count;
        if vcpus == 0 || vcpus > MAX_VCPUS {
            return Err(DescriptionError::InvalidVcpus(vcpus));
        }
        if self.machine_config.mem_size_mib < MIN_MEMORY_MIB {
            return Err(DescriptionError::InvalidMemory(
                self.machine_config.mem_size_mib,
            ));
        }
        Ok(())
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Ethernet MAC address, serialized as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Derive a locally administered MAC from a guest IPv4 address.
    ///
    /// The layout is `06:00:<a>:<b>:<c>:<d>`, so the guest address can be read
    /// back from the MAC when debugging.
    pub fn from_guest_ip(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        Self([0x06, 0x00, a, b, c, d])
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = DescriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(DescriptionError::InvalidMac(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| DescriptionError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Netmask for a prefix length (0..=32).
pub fn netmask(prefix_len: u8) -> Ipv4Addr {
    let prefix = prefix_len.min(32) as u32;
    let bits = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    Ipv4Addr::from(bits)
}

/// Kernel `ip=` argument configuring the guest NIC statically.
///
/// Format: `ip=<client>::<gateway>:<netmask>::<device>:off`.
pub fn guest_ip_arg(guest: Ipv4Addr, gateway: Ipv4Addr, prefix_len: u8) -> String {
    format!(
        "ip={}::{}:{}::{}:off",
        guest,
        gateway,
        netmask(prefix_len),
        GUEST_IFACE_ID
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> MachineDescription {
        MachineDescription {
            boot_source: BootSource {
                kernel_image_path: PathBuf::from("/var/lib/embervm/vmlinux"),
                boot_args: DEFAULT_BOOT_ARGS.to_string(),
            },
            drives: vec![
                Drive::root("/vms/a/rootfs.ext4"),
                Drive::data("volume", "/vms/a/volume.ext4"),
            ],
            machine_config: MachineConfig {
                vcpu_count: 2,
                mem_size_mib: 1024,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: GUEST_IFACE_ID.to_string(),
                guest_mac: MacAddress::from_guest_ip(Ipv4Addr::new(172, 16, 0, 2)),
                host_dev_name: "tap-a".to_string(),
            }],
        }
    }

    #[test]
    fn test_document_uses_firecracker_keys() {
        let json = description().to_json().unwrap();
        assert!(json.contains("\"boot-source\""));
        assert!(json.contains("\"machine-config\""));
        assert!(json.contains("\"network-interfaces\""));
        assert!(json.contains("\"guest_mac\": \"06:00:ac:10:00:02\""));
        assert!(json.contains("\"is_root_device\": true"));
    }

    #[test]
    fn test_validate_accepts_well_formed_description() {
        assert_eq!(description().validate(), Ok(()));
    }

    #[test]
    fn test_validate_requires_exactly_one_root() {
        let mut desc = description();
        desc.drives.retain(|d| !d.is_root_device);
        assert_eq!(desc.validate(), Err(DescriptionError::MissingRootDrive));

        let mut desc = description();
        desc.drives.push(Drive {
            drive_id: "other".into(),
            ..Drive::root("/vms/a/other.ext4")
        });
        assert!(matches!(
            desc.validate(),
            Err(DescriptionError::MultipleRootDrives(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_drive_ids() {
        let mut desc = description();
        desc.drives.push(Drive::data("volume", "/vms/a/extra.ext4").read_only());
        assert_eq!(
            desc.validate(),
            Err(DescriptionError::DuplicateDrive("volume".into()))
        );
    }

    #[test]
    fn test_validate_sizing_bounds() {
        let mut desc = description();
        desc.machine_config.vcpu_count = 0;
        assert_eq!(desc.validate(), Err(DescriptionError::InvalidVcpus(0)));

        let mut desc = description();
        desc.machine_config.mem_size_mib = 64;
        assert_eq!(desc.validate(), Err(DescriptionError::InvalidMemory(64)));
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "06:00:0a:00:00:05".parse().unwrap();
        assert_eq!(mac, MacAddress::from_guest_ip(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(mac.to_string(), "06:00:0a:00:00:05");
        assert!("06:00:zz:00:00:05".parse::<MacAddress>().is_err());
        assert!("06:00".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_netmask_and_ip_arg() {
        assert_eq!(netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(netmask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(
            guest_ip_arg(Ipv4Addr::new(172, 16, 3, 2), Ipv4Addr::new(172, 16, 3, 1), 24),
            "ip=172.16.3.2::172.16.3.1:255.255.255.0::eth0:off"
        );
    }
}
