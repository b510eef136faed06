//! Host networking for VMs.
//!
//! Each VM gets a TAP device on the host plus a pair of FORWARD rules that
//! route its traffic through the uplink. [`HostNetwork`] is the seam between
//! the lifecycle logic and the host; [`LinuxHost`] drives `ip` and `iptables`.
//!
//! The [`audit`] module compares the records against what the host actually
//! has, without changing anything.

pub mod allocator;
pub mod audit;
mod linux;

use crate::error::Result;

pub use allocator::{
    assign_network, tap_name_for, AddressMode, NetworkAssignment, NetworkSettings, TapAddress,
};
pub use audit::{audit, AuditReport, Finding, FindingKind, HostSnapshot};
pub use linux::{ip_forwarding_enabled, parse_default_route, LinuxHost};

/// A TAP device present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapInfo {
    /// Interface name.
    pub name: String,
    /// IPv4 addresses configured on it.
    pub addresses: Vec<TapAddress>,
}

impl TapInfo {
    /// Whether the device carries `address` (local, prefix and peer).
    pub fn has_address(&self, address: &TapAddress) -> bool {
        self.addresses.iter().any(|a| a == address)
    }
}

/// One rule of the FORWARD chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    /// `-i` interface.
    pub in_iface: Option<String>,
    /// `-o` interface.
    pub out_iface: Option<String>,
    /// Rule as printed by `iptables -S`, without the leading `-A FORWARD`.
    pub spec: String,
}

impl ForwardRule {
    /// The managed TAP device this rule refers to, if any.
    pub fn tap(&self) -> Option<&str> {
        [self.in_iface.as_deref(), self.out_iface.as_deref()]
            .into_iter()
            .flatten()
            .find(|iface| iface.starts_with(allocator::TAP_PREFIX))
    }

    /// Whether this is the outbound rule `tap -> uplink`.
    pub fn is_outbound(&self, tap: &str, uplink: &str) -> bool {
        self.in_iface.as_deref() == Some(tap) && self.out_iface.as_deref() == Some(uplink)
    }

    /// Whether this is the return rule `uplink -> tap`.
    pub fn is_return(&self, tap: &str, uplink: &str) -> bool {
        self.in_iface.as_deref() == Some(uplink) && self.out_iface.as_deref() == Some(tap)
    }
}

/// The rule pair that forwards one VM's traffic, as `iptables` arguments.
pub fn forward_rule_specs(tap: &str, uplink: &str) -> [Vec<String>; 2] {
    let args = |s: &[&str]| s.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    [
        args(&["-i", tap, "-o", uplink, "-j", "ACCEPT"]),
        args(&[
            "-i",
            uplink,
            "-o",
            tap,
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]),
    ]
}

/// Host operations the lifecycle needs.
///
/// Removal operations are idempotent and report whether anything was removed.
pub trait HostNetwork: Send + Sync {
    /// Create a TAP device owned by `owner`, address it and bring it up.
    fn create_tap(&self, name: &str, owner: &str, address: &TapAddress) -> Result<()>;

    /// Delete a TAP device.
    fn destroy_tap(&self, name: &str) -> Result<bool>;

    /// Install the forwarding rule pair unless it is already present.
    fn add_forward_rule(&self, tap: &str, uplink: &str) -> Result<()>;

    /// Remove the forwarding rule pair.
    fn remove_forward_rule(&self, tap: &str, uplink: &str) -> Result<bool>;

    /// Every TAP device with its addresses.
    fn tap_devices(&self) -> Result<Vec<TapInfo>>;

    /// Every rule of the FORWARD chain.
    fn forward_rules(&self) -> Result<Vec<ForwardRule>>;

    /// Interface of the default route.
    fn default_uplink(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(i: &str, o: &str) -> ForwardRule {
        ForwardRule {
            in_iface: Some(i.into()),
            out_iface: Some(o.into()),
            spec: format!("-i {} -o {} -j ACCEPT", i, o),
        }
    }

    #[test]
    fn test_forward_rule_tap_detection() {
        assert_eq!(rule("tap-a", "eth0").tap(), Some("tap-a"));
        assert_eq!(rule("eth0", "tap-a").tap(), Some("tap-a"));
        assert_eq!(rule("docker0", "eth0").tap(), None);
    }

    #[test]
    fn test_rule_direction() {
        assert!(rule("tap-a", "eth0").is_outbound("tap-a", "eth0"));
        assert!(!rule("tap-a", "eth0").is_return("tap-a", "eth0"));
        assert!(rule("eth0", "tap-a").is_return("tap-a", "eth0"));
    }

    #[test]
    fn test_forward_rule_specs() {
        let [out, ret] = forward_rule_specs("tap-a", "eth0");
        assert_eq!(out.join(" "), "-i tap-a -o eth0 -j ACCEPT");
        assert_eq!(
            ret.join(" "),
            "-i eth0 -o tap-a -m state --state RELATED,ESTABLISHED -j ACCEPT"
        );
    }
}
