//! Read-only comparison of VM records against the host.
//!
//! [`HostSnapshot::gather`] collects what the host has; [`audit`] is a pure
//! function over records and snapshot. Views that could not be read are `None`
//! and the checks depending on them are skipped.

use super::allocator::TAP_PREFIX;
use super::{forward_rule_specs, ForwardRule, HostNetwork, TapInfo};
use crate::process::{self, HypervisorProcess, PidState};
use crate::state::VmRecord;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

/// Category of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FindingKind {
    /// Host resource no record accounts for.
    Orphaned,
    /// Resource a record requires but the host lacks.
    Missing,
    /// Record claims a process that is gone or is not a hypervisor.
    Stale,
    /// Record and host disagree, or records conflict with each other.
    Inconsistent,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FindingKind::Orphaned => "orphaned",
            FindingKind::Missing => "missing",
            FindingKind::Stale => "stale",
            FindingKind::Inconsistent => "inconsistent",
        };
        f.write_str(s)
    }
}

/// One discrepancy between the records and the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Category.
    pub kind: FindingKind,
    /// VM the finding concerns, if any.
    pub vm: Option<String>,
    /// Affected resource (device, rule, pid, address).
    pub resource: String,
    /// Human-readable description.
    pub detail: String,
    /// Command that resolves it.
    pub remediation: String,
}

/// Result of an audit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Discrepancies found.
    pub findings: Vec<Finding>,
    /// Host views that could not be read.
    pub not_inspected: Vec<String>,
}

impl AuditReport {
    /// No findings.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Host state relevant to the records.
#[derive(Debug, Clone, Default)]
pub struct HostSnapshot {
    /// TAP devices.
    pub taps: Option<Vec<TapInfo>>,
    /// FORWARD chain.
    pub forward_rules: Option<Vec<ForwardRule>>,
    /// Running hypervisor processes.
    pub processes: Option<Vec<HypervisorProcess>>,
    /// Classification of every PID the records mention.
    pub pids: HashMap<u32, PidState>,
}

impl HostSnapshot {
    /// Query the host. Never fails; unreadable views stay `None`.
    pub fn gather(host: &dyn HostNetwork, records: &[VmRecord], program: &str) -> Self {
        let taps = host
            .tap_devices()
            .map_err(|e| tracing::warn!(error = %e, "cannot list tap devices"))
            .ok();
        let forward_rules = host
            .forward_rules()
            .map_err(|e| tracing::warn!(error = %e, "cannot list forward rules"))
            .ok();
        let processes = process::list_hypervisor_processes(program)
            .map_err(|e| tracing::warn!(error = %e, "cannot list hypervisor processes"))
            .ok();
        let pids = records
            .iter()
            .filter_map(|r| r.pid)
            .map(|pid| (pid, process::probe_pid(pid, program)))
            .collect();
        Self {
            taps,
            forward_rules,
            processes,
            pids,
        }
    }
}

/// Compare records against the host.
pub fn audit(records: &[VmRecord], host: &HostSnapshot) -> AuditReport {
    let mut report = AuditReport::default();

    check_records(records, &mut report);

    match &host.taps {
        Some(taps) => check_taps(records, taps, &mut report),
        None => report.not_inspected.push("tap devices".into()),
    }
    match &host.forward_rules {
        Some(rules) => check_forward_rules(records, rules, &mut report),
        None => report.not_inspected.push("forward rules".into()),
    }
    check_pids(records, &host.pids, &mut report);
    match &host.processes {
        Some(processes) => check_processes(records, processes, &mut report),
        None => report.not_inspected.push("hypervisor processes".into()),
    }

    report
}

/// Conflicts visible from the records alone.
fn check_records(records: &[VmRecord], report: &mut AuditReport) {
    let mut by_ip: HashMap<Ipv4Addr, Vec<&str>> = HashMap::new();
    for record in records {
        if let Some(ip) = record.guest_ip {
            by_ip.entry(ip).or_default().push(&record.name);
        }
    }
    let mut duplicates: Vec<_> = by_ip.into_iter().filter(|(_, names)| names.len() > 1).collect();
    duplicates.sort();
    for (ip, names) in duplicates {
        for name in &names[1..] {
            report.findings.push(Finding {
                kind: FindingKind::Inconsistent,
                vm: Some(name.to_string()),
                resource: ip.to_string(),
                detail: format!("guest address {} is shared by {}", ip, names.join(", ")),
                remediation: format!("sudo embervm destroy --force {}", name),
            });
        }
    }

    for record in records {
        if record.guest_ip.is_some() && record.network().is_none() {
            report.findings.push(Finding {
                kind: FindingKind::Inconsistent,
                vm: Some(record.name.clone()),
                resource: "network assignment".into(),
                detail: "record has a guest address but an incomplete network assignment".into(),
                remediation: format!("sudo embervm destroy --force {}", record.name),
            });
        }
        if record.pid.is_some() && !record.is_built() {
            report.findings.push(Finding {
                kind: FindingKind::Inconsistent,
                vm: Some(record.name.clone()),
                resource: "built marker".into(),
                detail: "record has a process but was never built".into(),
                remediation: format!("embervm down {}", record.name),
            });
        }
    }
}

fn check_taps(records: &[VmRecord], taps: &[TapInfo], report: &mut AuditReport) {
    let recorded: HashSet<&str> = records.iter().filter_map(|r| r.tap_name.as_deref()).collect();

    for tap in taps {
        if tap.name.starts_with(TAP_PREFIX) && !recorded.contains(tap.name.as_str()) {
            report.findings.push(Finding {
                kind: FindingKind::Orphaned,
                vm: None,
                resource: tap.name.clone(),
                detail: format!("tap device {} has no VM record", tap.name),
                remediation: format!("sudo ip link delete {}", tap.name),
            });
        }
    }

    let by_name: HashMap<&str, &TapInfo> = taps.iter().map(|t| (t.name.as_str(), t)).collect();
    for record in records.iter().filter(|r| r.is_built()) {
        let Some(tap_name) = record.tap_name.as_deref() else {
            continue;
        };
        let expected = record.tap_address();
        match by_name.get(tap_name) {
            None => {
                let address = expected
                    .map(|a| a.ip_args().join(" "))
                    .unwrap_or_else(|| "<gateway>/24".into());
                report.findings.push(Finding {
                    kind: FindingKind::Missing,
                    vm: Some(record.name.clone()),
                    resource: tap_name.to_string(),
                    detail: format!("built VM '{}' has no tap device {}", record.name, tap_name),
                    remediation: format!(
                        "sudo ip tuntap add dev {tap} mode tap && sudo ip addr add {address} dev {tap} && sudo ip link set {tap} up",
                        tap = tap_name,
                        address = address
                    ),
                });
            }
            Some(tap) => {
                if let Some(expected) = expected {
                    if !tap.has_address(&expected) {
                        let actual: Vec<String> =
                            tap.addresses.iter().map(|a| a.ip_args().join(" ")).collect();
                        report.findings.push(Finding {
                            kind: FindingKind::Inconsistent,
                            vm: Some(record.name.clone()),
                            resource: tap_name.to_string(),
                            detail: format!(
                                "{} carries [{}], record expects {}",
                                tap_name,
                                actual.join(", "),
                                expected.ip_args().join(" ")
                            ),
                            remediation: format!(
                                "sudo ip addr flush dev {tap} && sudo ip addr add {address} dev {tap}",
                                tap = tap_name,
                                address = expected.ip_args().join(" ")
                            ),
                        });
                    }
                }
            }
        }
    }
}

fn check_forward_rules(records: &[VmRecord], rules: &[ForwardRule], report: &mut AuditReport) {
    let recorded: HashSet<&str> = records.iter().filter_map(|r| r.tap_name.as_deref()).collect();

    for rule in rules {
        if let Some(tap) = rule.tap() {
            if !recorded.contains(tap) {
                report.findings.push(Finding {
                    kind: FindingKind::Orphaned,
                    vm: None,
                    resource: format!("FORWARD {}", rule.spec),
                    detail: format!("forward rule for {} has no VM record", tap),
                    remediation: format!("sudo iptables -D FORWARD {}", rule.spec),
                });
            }
        }
    }

    for record in records.iter().filter(|r| r.is_built()) {
        let (Some(tap), Some(uplink)) = (record.tap_name.as_deref(), record.uplink.as_deref()) else {
            continue;
        };
        let [outbound, inbound] = forward_rule_specs(tap, uplink);
        let has_outbound = rules.iter().any(|r| r.is_outbound(tap, uplink));
        let has_return = rules.iter().any(|r| r.is_return(tap, uplink));
        for (present, spec, what) in [
            (has_outbound, outbound, "outbound"),
            (has_return, inbound, "return"),
        ] {
            if !present {
                report.findings.push(Finding {
                    kind: FindingKind::Missing,
                    vm: Some(record.name.clone()),
                    resource: format!("FORWARD {}", spec.join(" ")),
                    detail: format!("{} forward rule for {} via {} is missing", what, tap, uplink),
                    remediation: format!("sudo iptables -A FORWARD {}", spec.join(" ")),
                });
            }
        }
    }
}

fn check_pids(records: &[VmRecord], pids: &HashMap<u32, PidState>, report: &mut AuditReport) {
    for record in records {
        let Some(pid) = record.pid else { continue };
        let detail = match pids.get(&pid) {
            Some(PidState::Dead) => format!("recorded pid {} is not running", pid),
            Some(PidState::Foreign) => format!("recorded pid {} belongs to a different program", pid),
            _ => continue,
        };
        report.findings.push(Finding {
            kind: FindingKind::Stale,
            vm: Some(record.name.clone()),
            resource: format!("pid {}", pid),
            detail,
            remediation: format!("embervm down {}", record.name),
        });
    }
}

fn check_processes(records: &[VmRecord], processes: &[HypervisorProcess], report: &mut AuditReport) {
    let recorded: HashSet<u32> = records.iter().filter_map(|r| r.pid).collect();
    for proc in processes {
        if recorded.contains(&proc.pid) {
            continue;
        }
        let owner = proc
            .api_socket
            .as_ref()
            .and_then(|s| s.parent())
            .and_then(|d| d.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| records.iter().any(|r| &r.name == n));
        let detail = match &owner {
            Some(name) => format!(
                "hypervisor pid {} serves '{}' but the record does not track it",
                proc.pid, name
            ),
            None => format!("hypervisor pid {} has no VM record", proc.pid),
        };
        report.findings.push(Finding {
            kind: FindingKind::Orphaned,
            vm: owner,
            resource: format!("pid {}", proc.pid),
            detail,
            remediation: format!("sudo kill {}", proc.pid),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::allocator::TapAddress;
    use std::path::PathBuf;

    fn built(name: &str, host: u8) -> VmRecord {
        VmRecord {
            name: name.into(),
            guest_ip: Some(Ipv4Addr::new(172, 16, host, 2)),
            gateway_ip: Some(Ipv4Addr::new(172, 16, host, 1)),
            subnet_index: Some(host),
            prefix_len: Some(24),
            tap_name: Some(format!("tap-{}", name)),
            uplink: Some("eth0".into()),
            built_at: Some(1),
            ..Default::default()
        }
    }

    fn tap_for(record: &VmRecord) -> TapInfo {
        TapInfo {
            name: record.tap_name.clone().unwrap(),
            addresses: vec![record.tap_address().unwrap()],
        }
    }

    fn rules_for(record: &VmRecord) -> Vec<ForwardRule> {
        let tap = record.tap_name.as_deref().unwrap();
        let uplink = record.uplink.as_deref().unwrap();
        vec![
            ForwardRule {
                in_iface: Some(tap.into()),
                out_iface: Some(uplink.into()),
                spec: format!("-i {} -o {} -j ACCEPT", tap, uplink),
            },
            ForwardRule {
                in_iface: Some(uplink.into()),
                out_iface: Some(tap.into()),
                spec: format!(
                    "-i {} -o {} -m state --state RELATED,ESTABLISHED -j ACCEPT",
                    uplink, tap
                ),
            },
        ]
    }

    fn consistent(records: &[VmRecord]) -> HostSnapshot {
        HostSnapshot {
            taps: Some(records.iter().map(tap_for).collect()),
            forward_rules: Some(records.iter().flat_map(rules_for).collect()),
            processes: Some(Vec::new()),
            pids: HashMap::new(),
        }
    }

    #[test]
    fn test_consistent_host_has_no_findings() {
        let records = vec![built("a", 0), built("b", 1)];
        let report = audit(&records, &consistent(&records));
        assert!(report.is_clean(), "{:?}", report.findings);
        assert!(report.not_inspected.is_empty());
    }

    #[test]
    fn test_single_orphaned_tap() {
        let records = vec![built("a", 0)];
        let mut host = consistent(&records);
        host.taps.as_mut().unwrap().push(TapInfo {
            name: "tap-ghost".into(),
            addresses: Vec::new(),
        });
        // Unmanaged devices are not ours to judge.
        host.taps.as_mut().unwrap().push(TapInfo {
            name: "vnet0".into(),
            addresses: Vec::new(),
        });

        let report = audit(&records, &host);
        assert_eq!(report.findings.len(), 1);
        let finding = &report.findings[0];
        assert_eq!(finding.kind, FindingKind::Orphaned);
        assert_eq!(finding.resource, "tap-ghost");
        assert_eq!(finding.remediation, "sudo ip link delete tap-ghost");
    }

    #[test]
    fn test_missing_tap_and_rules_for_built_vm() {
        let records = vec![built("a", 0)];
        let host = HostSnapshot {
            taps: Some(Vec::new()),
            forward_rules: Some(Vec::new()),
            processes: Some(Vec::new()),
            pids: HashMap::new(),
        };
        let report = audit(&records, &host);
        let kinds: Vec<FindingKind> = report.findings.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FindingKind::Missing; 3]);
        assert!(report.findings[0].remediation.contains("ip tuntap add dev tap-a"));
        assert!(report.findings[1]
            .remediation
            .starts_with("sudo iptables -A FORWARD -i tap-a -o eth0"));
    }

    #[test]
    fn test_unbuilt_vm_needs_no_host_resources() {
        let mut record = built("a", 0);
        record.built_at = None;
        let host = HostSnapshot {
            taps: Some(Vec::new()),
            forward_rules: Some(Vec::new()),
            processes: Some(Vec::new()),
            pids: HashMap::new(),
        };
        assert!(audit(&[record], &host).is_clean());
    }

    #[test]
    fn test_stale_and_foreign_pids() {
        let mut a = built("a", 0);
        a.pid = Some(100);
        let mut b = built("b", 1);
        b.pid = Some(200);
        let mut c = built("c", 2);
        c.pid = Some(300);
        let records = vec![a, b, c];
        let mut host = consistent(&records);
        host.pids = HashMap::from([
            (100, PidState::Dead),
            (200, PidState::Foreign),
            (300, PidState::Hypervisor),
        ]);
        host.processes = Some(vec![HypervisorProcess {
            pid: 300,
            api_socket: None,
        }]);

        let report = audit(&records, &host);
        assert_eq!(report.findings.len(), 2);
        assert!(report.findings.iter().all(|f| f.kind == FindingKind::Stale));
        assert_eq!(report.findings[0].remediation, "embervm down a");
        assert!(report.findings[1].detail.contains("different program"));
    }

    #[test]
    fn test_untracked_hypervisor_process() {
        let records = vec![built("a", 0)];
        let mut host = consistent(&records);
        host.processes = Some(vec![HypervisorProcess {
            pid: 4242,
            api_socket: Some(PathBuf::from("/state/vms/a/firecracker.sock")),
        }]);
        let report = audit(&records, &host);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, FindingKind::Orphaned);
        assert_eq!(report.findings[0].vm.as_deref(), Some("a"));
        assert_eq!(report.findings[0].remediation, "sudo kill 4242");
    }

    #[test]
    fn test_wrong_tap_address_is_inconsistent() {
        let records = vec![built("a", 0)];
        let mut host = consistent(&records);
        host.taps.as_mut().unwrap()[0].addresses = vec![TapAddress {
            local: Ipv4Addr::new(172, 16, 9, 1),
            prefix_len: 24,
            peer: None,
        }];
        let report = audit(&records, &host);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, FindingKind::Inconsistent);
        assert!(report.findings[0].remediation.contains("172.16.0.1/24"));
    }

    #[test]
    fn test_duplicate_guest_address() {
        let a = built("a", 0);
        let mut b = built("b", 1);
        b.guest_ip = a.guest_ip;
        b.gateway_ip = a.gateway_ip;
        let records = vec![a, b];
        let mut host = consistent(&records);
        // Tap for b carries the duplicated address, so only the conflict remains.
        host.taps = Some(records.iter().map(tap_for).collect());

        let report = audit(&records, &host);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, FindingKind::Inconsistent);
        assert_eq!(report.findings[0].vm.as_deref(), Some("b"));
    }

    #[test]
    fn test_orphaned_forward_rule() {
        let records = vec![built("a", 0)];
        let ghost = built("ghost", 5);
        let mut host = consistent(&records);
        host.forward_rules.as_mut().unwrap().extend(rules_for(&ghost));
        let report = audit(&records, &host);
        assert_eq!(report.findings.len(), 2);
        assert!(report
            .findings
            .iter()
            .all(|f| f.kind == FindingKind::Orphaned && f.remediation.starts_with("sudo iptables -D FORWARD")));
    }

    #[test]
    fn test_unreadable_views_are_not_inspected() {
        let records = vec![built("a", 0)];
        let host = HostSnapshot::default();
        let report = audit(&records, &host);
        assert!(report.is_clean());
        assert_eq!(
            report.not_inspected,
            vec!["tap devices", "forward rules", "hypervisor processes"]
        );
    }
}
