//! Guest address and TAP name allocation.
//!
//! Allocation is a linear scan for the lowest free slot, compared against the
//! guest address of every existing record (built or not, running or not).
//! VM counts are in the tens, so the scan stays cheap.

use crate::error::{Error, Result};
use crate::state::VmRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Linux limit on interface names (IFNAMSIZ minus the terminator).
pub const MAX_IFNAME_LEN: usize = 15;

/// Prefix of every managed TAP device.
pub const TAP_PREFIX: &str = "tap-";

/// Host octet of the gateway inside each /24.
const GATEWAY_HOST: u8 = 1;

/// First and last assignable guest host octet in shared mode.
const FIRST_GUEST_HOST: u8 = 2;
const LAST_GUEST_HOST: u8 = 254;

/// How guest addresses are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressMode {
    /// All guests in one /24; each TAP is a point-to-point link to the gateway.
    Shared,
    /// One /24 per guest, selected by an index 0-255.
    #[default]
    PerVm,
}

/// Address allocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Allocation layout.
    pub mode: AddressMode,

    /// Base address. Shared mode uses `a.b.c.0/24`, per-VM mode `a.b.<index>.0/24`.
    pub base: Ipv4Addr,

    /// Uplink interface; detected from the default route when unset.
    pub uplink: Option<String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            mode: AddressMode::PerVm,
            base: Ipv4Addr::new(172, 16, 0, 0),
            uplink: None,
        }
    }
}

impl NetworkSettings {
    /// CIDR covering every address this configuration can hand out.
    pub fn managed_range(&self) -> String {
        let [a, b, c, _] = self.base.octets();
        match self.mode {
            AddressMode::Shared => format!("{}.{}.{}.0/24", a, b, c),
            AddressMode::PerVm => format!("{}.{}.0.0/16", a, b),
        }
    }
}

/// The addresses handed to one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAssignment {
    /// Guest address.
    pub guest_ip: Ipv4Addr,
    /// Host side of the TAP link.
    pub gateway_ip: Ipv4Addr,
    /// Dedicated subnet index (per-VM mode).
    pub subnet_index: Option<u8>,
    /// Guest prefix length.
    pub prefix_len: u8,
}

impl NetworkAssignment {
    /// How the host side of the TAP device is addressed.
    pub fn tap_address(&self) -> TapAddress {
        match self.subnet_index {
            Some(_) => TapAddress {
                local: self.gateway_ip,
                prefix_len: self.prefix_len,
                peer: None,
            },
            None => TapAddress {
                local: self.gateway_ip,
                prefix_len: 32,
                peer: Some(self.guest_ip),
            },
        }
    }
}

/// Host-side TAP addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapAddress {
    /// Address configured on the TAP.
    pub local: Ipv4Addr,
    /// Prefix length of `local`.
    pub prefix_len: u8,
    /// Point-to-point peer (shared mode).
    pub peer: Option<Ipv4Addr>,
}

impl TapAddress {
    /// Arguments for `ip addr add`.
    pub fn ip_args(&self) -> Vec<String> {
        let mut args = vec![format!("{}/{}", self.local, self.prefix_len)];
        if let Some(peer) = self.peer {
            args.push("peer".to_string());
            args.push(format!("{}/32", peer));
        }
        args
    }
}

/// Assign the lowest free guest address.
///
/// # Errors
///
/// Returns `ResourceExhausted` when every slot is taken.
pub fn assign_network(existing: &[VmRecord], settings: &NetworkSettings) -> Result<NetworkAssignment> {
    let used: HashSet<Ipv4Addr> = existing.iter().filter_map(|r| r.guest_ip).collect();
    let [a, b, c, _] = settings.base.octets();

    match settings.mode {
        AddressMode::Shared => {
            let gateway_ip = Ipv4Addr::new(a, b, c, GATEWAY_HOST);
            (FIRST_GUEST_HOST..=LAST_GUEST_HOST)
                .map(|host| Ipv4Addr::new(a, b, c, host))
                .find(|ip| !used.contains(ip))
                .map(|guest_ip| NetworkAssignment {
                    guest_ip,
                    gateway_ip,
                    subnet_index: None,
                    prefix_len: 24,
                })
                .ok_or_else(|| {
                    Error::ResourceExhausted(format!(
                        "all {} addresses in {} are assigned",
                        LAST_GUEST_HOST - FIRST_GUEST_HOST + 1,
                        settings.managed_range()
                    ))
                })
        }
        AddressMode::PerVm => {
            let taken_subnets: HashSet<u8> = existing.iter().filter_map(|r| r.subnet_index).collect();
            (0..=u8::MAX)
                .find(|&index| {
                    !taken_subnets.contains(&index)
                        && !used.contains(&Ipv4Addr::new(a, b, index, FIRST_GUEST_HOST))
                })
                .map(|index| NetworkAssignment {
                    guest_ip: Ipv4Addr::new(a, b, index, FIRST_GUEST_HOST),
                    gateway_ip: Ipv4Addr::new(a, b, index, GATEWAY_HOST),
                    subnet_index: Some(index),
                    prefix_len: 24,
                })
                .ok_or_else(|| {
                    Error::ResourceExhausted(format!(
                        "all 256 subnets in {} are assigned",
                        settings.managed_range()
                    ))
                })
        }
    }
}

/// Deterministic TAP device name for a VM.
///
/// `tap-<name>` when it fits the interface-name limit, otherwise
/// `tap-<first 4>-<hash>` with a stable hash of the full name.
pub fn tap_name_for(vm_name: &str) -> String {
    let plain = format!("{}{}", TAP_PREFIX, vm_name);
    if plain.len() <= MAX_IFNAME_LEN {
        return plain;
    }
    let head: String = vm_name.chars().take(4).collect();
    let hash = fnv1a(vm_name.as_bytes()) & 0xff_ffff;
    format!("{}{}-{:06x}", TAP_PREFIX, head, hash)
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(0x0100_0193)
    })
}
