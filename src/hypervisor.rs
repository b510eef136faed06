//! Machine descriptions for the hypervisor.

use crate::config::HypervisorSettings;
use crate::error::{Error, Result};
use crate::state::VmRecord;
use embervm_protocol::{
    guest_ip_arg, BootSource, Drive, MacAddress, MachineConfig, MachineDescription,
    NetworkInterface, GUEST_IFACE_ID,
};

/// Drive id of the secondary volume.
pub const VOLUME_DRIVE_ID: &str = "volume";

/// Describe the machine for a built VM.
///
/// The kernel command line carries the static guest network configuration,
/// so the guest needs no DHCP.
pub fn describe(record: &VmRecord, settings: &HypervisorSettings) -> Result<MachineDescription> {
    let network = record.network().ok_or_else(|| {
        Error::invalid_state("network assigned", format!("'{}' has no network assignment", record.name))
    })?;
    let tap = record.tap_name.clone().ok_or_else(|| {
        Error::invalid_state("tap device recorded", format!("'{}' has no tap device", record.name))
    })?;
    let rootfs = record.rootfs_path.clone().ok_or_else(|| {
        Error::invalid_state("built", format!("'{}' has no root filesystem", record.name))
    })?;

    let boot_args = format!(
        "{} {}",
        settings.boot_args.trim(),
        guest_ip_arg(network.guest_ip, network.gateway_ip, network.prefix_len)
    );

    let mut drives = vec![Drive::root(rootfs)];
    if let Some(volume) = &record.volume_path {
        drives.push(Drive::data(VOLUME_DRIVE_ID, volume));
    }

    let description = MachineDescription {
        boot_source: BootSource {
            kernel_image_path: settings.kernel.clone(),
            boot_args,
        },
        drives,
        machine_config: MachineConfig {
            vcpu_count: record.cpus.unwrap_or(1),
            mem_size_mib: record.memory_mib.unwrap_or(512),
        },
        network_interfaces: vec![NetworkInterface {
            iface_id: GUEST_IFACE_ID.to_string(),
            guest_mac: MacAddress::from_guest_ip(network.guest_ip),
            host_dev_name: tap,
        }],
    };
    description.validate()?;
    Ok(description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    fn built_record() -> VmRecord {
        VmRecord {
            name: "a".into(),
            cpus: Some(2),
            memory_mib: Some(1024),
            guest_ip: Some(Ipv4Addr::new(172, 16, 3, 2)),
            gateway_ip: Some(Ipv4Addr::new(172, 16, 3, 1)),
            subnet_index: Some(3),
            prefix_len: Some(24),
            tap_name: Some("tap-a".into()),
            rootfs_path: Some(PathBuf::from("/vms/a/rootfs.ext4")),
            volume_path: Some(PathBuf::from("/vms/a/volume.ext4")),
            built_at: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_describe_built_vm() {
        let settings = HypervisorSettings::default();
        let desc = describe(&built_record(), &settings).unwrap();

        assert!(desc
            .boot_source
            .boot_args
            .ends_with("ip=172.16.3.2::172.16.3.1:255.255.255.0::eth0:off"));
        assert!(desc.boot_source.boot_args.starts_with("console=ttyS0"));
        assert_eq!(desc.drives.len(), 2);
        assert!(desc.drives[0].is_root_device);
        assert_eq!(desc.drives[1].drive_id, VOLUME_DRIVE_ID);
        assert_eq!(desc.machine_config.vcpu_count, 2);
        assert_eq!(desc.machine_config.mem_size_mib, 1024);
        assert_eq!(desc.network_interfaces[0].host_dev_name, "tap-a");
        assert_eq!(
            desc.network_interfaces[0].guest_mac.to_string(),
            "06:00:ac:10:03:02"
        );
    }

    #[test]
    fn test_describe_without_volume() {
        let mut record = built_record();
        record.volume_path = None;
        let desc = describe(&record, &HypervisorSettings::default()).unwrap();
        assert_eq!(desc.drives.len(), 1);
    }

    #[test]
    fn test_describe_requires_rootfs() {
        let mut record = built_record();
        record.rootfs_path = None;
        assert!(matches!(
            describe(&record, &HypervisorSettings::default()),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_describe_rejects_invalid_sizing() {
        let mut record = built_record();
        record.memory_mib = Some(16);
        assert!(matches!(
            describe(&record, &HypervisorSettings::default()),
            Err(Error::Description(_))
        ));
    }
}
