//! [`HostNetwork`] on Linux via `ip`, `iptables` and `sysctl`.

use super::allocator::{NetworkSettings, TapAddress};
use super::{forward_rule_specs, ForwardRule, HostNetwork, TapInfo};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;

/// Kernel view of network devices.
const SYS_CLASS_NET: &str = "/sys/class/net";

/// IPv4 forwarding toggle.
pub(crate) const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Drives the host's network stack with the standard Linux tools.
#[derive(Debug, Clone, Default)]
pub struct LinuxHost;

impl LinuxHost {
    /// Create a host handle.
    pub fn new() -> Self {
        Self
    }

    /// Resolve the uplink: the configured one, else the default route's device.
    pub fn uplink(&self, settings: &NetworkSettings) -> Result<String> {
        match &settings.uplink {
            Some(uplink) => Ok(uplink.clone()),
            None => self.default_uplink(),
        }
    }

    /// Enable IPv4 forwarding and masquerade the managed range on the uplink.
    pub fn setup(&self, settings: &NetworkSettings, uplink: &str) -> Result<()> {
        run("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;

        let rule = masquerade_rule(settings, uplink);
        if iptables_check("nat", "POSTROUTING", &rule) {
            tracing::debug!(uplink = %uplink, "masquerade rule already present");
        } else {
            iptables_modify("nat", "-A", "POSTROUTING", &rule)?;
            tracing::info!(range = %settings.managed_range(), uplink = %uplink, "added masquerade rule");
        }
        Ok(())
    }

    /// Remove the masquerade rule. Forwarding is left as found.
    pub fn cleanup(&self, settings: &NetworkSettings, uplink: &str) -> Result<bool> {
        let rule = masquerade_rule(settings, uplink);
        let mut removed = false;
        while iptables_check("nat", "POSTROUTING", &rule) {
            iptables_modify("nat", "-D", "POSTROUTING", &rule)?;
            removed = true;
        }
        Ok(removed)
    }
}

/// Whether the kernel forwards IPv4 traffic.
pub fn ip_forwarding_enabled() -> Result<bool> {
    Ok(std::fs::read_to_string(IP_FORWARD_PATH)?.trim() == "1")
}

impl HostNetwork for LinuxHost {
    fn create_tap(&self, name: &str, owner: &str, address: &TapAddress) -> Result<()> {
        if device_exists(name) {
            // Left over from an interrupted build; recreate with the current owner and address.
            tracing::warn!(tap = %name, "tap device already exists, recreating");
            run("ip", &["link", "delete", name])?;
        }

        run("ip", &["tuntap", "add", "dev", name, "mode", "tap", "user", owner])?;

        let mut args = vec!["addr".to_string(), "add".to_string()];
        args.extend(address.ip_args());
        args.extend(["dev".to_string(), name.to_string()]);
        let configured = run_owned("ip", &args).and_then(|_| run("ip", &["link", "set", name, "up"]));
        if let Err(e) = configured {
            let _ = run("ip", &["link", "delete", name]);
            return Err(e);
        }

        tracing::info!(tap = %name, owner = %owner, address = %address.local, "created tap device");
        Ok(())
    }

    fn destroy_tap(&self, name: &str) -> Result<bool> {
        if !device_exists(name) {
            tracing::debug!(tap = %name, "tap device already gone");
            return Ok(false);
        }
        run("ip", &["link", "delete", name])?;
        tracing::info!(tap = %name, "deleted tap device");
        Ok(true)
    }

    fn add_forward_rule(&self, tap: &str, uplink: &str) -> Result<()> {
        for spec in forward_rule_specs(tap, uplink) {
            if iptables_check("filter", "FORWARD", &spec) {
                tracing::debug!(rule = %spec.join(" "), "forward rule already present");
                continue;
            }
            iptables_modify("filter", "-A", "FORWARD", &spec)?;
        }
        tracing::info!(tap = %tap, uplink = %uplink, "added forward rules");
        Ok(())
    }

    fn remove_forward_rule(&self, tap: &str, uplink: &str) -> Result<bool> {
        let mut removed = false;
        for spec in forward_rule_specs(tap, uplink) {
            // Duplicates from manual intervention are removed as well.
            while iptables_check("filter", "FORWARD", &spec) {
                iptables_modify("filter", "-D", "FORWARD", &spec)?;
                removed = true;
            }
        }
        if removed {
            tracing::info!(tap = %tap, uplink = %uplink, "removed forward rules");
        }
        Ok(removed)
    }

    fn tap_devices(&self) -> Result<Vec<TapInfo>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(SYS_CLASS_NET)? {
            let entry = entry?;
            // Only tun/tap devices expose tun_flags.
            if entry.path().join("tun_flags").exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        let mut addresses = parse_addr_show(&run("ip", &["-4", "-o", "addr", "show"])?);
        Ok(names
            .into_iter()
            .map(|name| TapInfo {
                addresses: addresses.remove(&name).unwrap_or_default(),
                name,
            })
            .collect())
    }

    fn forward_rules(&self) -> Result<Vec<ForwardRule>> {
        Ok(parse_forward_rules(&run("iptables", &["-S", "FORWARD"])?))
    }

    fn default_uplink(&self) -> Result<String> {
        let output = run("ip", &["route", "show", "default"])?;
        parse_default_route(&output).ok_or_else(|| {
            Error::Config("no default route; set network.uplink in the config file".into())
        })
    }
}

fn masquerade_rule(settings: &NetworkSettings, uplink: &str) -> Vec<String> {
    [
        "-s",
        &settings.managed_range(),
        "-o",
        uplink,
        "-j",
        "MASQUERADE",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn device_exists(name: &str) -> bool {
    Path::new(SYS_CLASS_NET).join(name).exists()
}

fn iptables_check(table: &str, chain: &str, spec: &[String]) -> bool {
    let mut cmd = Command::new("iptables");
    cmd.args(["-t", table, "-C", chain]).args(spec);
    cmd.output().map(|o| o.status.success()).unwrap_or(false)
}

fn iptables_modify(table: &str, action: &str, chain: &str, spec: &[String]) -> Result<()> {
    let mut args: Vec<String> = ["-t", table, action, chain]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(spec.iter().cloned());
    run_owned("iptables", &args).map(|_| ())
}

fn run(program: &str, args: &[&str]) -> Result<String> {
    let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    run_owned(program, &owned)
}

fn run_owned(program: &str, args: &[String]) -> Result<String> {
    let rendered = format!("{} {}", program, args.join(" "));
    tracing::debug!(command = %rendered, "running");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::command_failed(&rendered, e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::command_failed(
            rendered,
            format!("{}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Device of the first default route in `ip route show default` output.
pub fn parse_default_route(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .find_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "dev")?;
            tokens.next().map(str::to_string)
        })
}

/// Group `ip -4 -o addr show` lines by device.
fn parse_addr_show(output: &str) -> HashMap<String, Vec<TapAddress>> {
    let mut map: HashMap<String, Vec<TapAddress>> = HashMap::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        // "<index>: <dev> inet <addr>[/len] [peer <peer>/len] ..."
        if tokens.len() < 4 || tokens[2] != "inet" {
            continue;
        }
        let dev = tokens[1].trim_end_matches(':').to_string();
        let Some((local, prefix)) = parse_cidr(tokens[3]) else {
            continue;
        };
        let peer = match tokens.get(4..6) {
            Some(["peer", p]) => parse_cidr(p).map(|(ip, _)| ip),
            _ => None,
        };
        map.entry(dev).or_default().push(TapAddress {
            local,
            prefix_len: prefix.unwrap_or(32),
            peer,
        });
    }
    map
}

fn parse_cidr(text: &str) -> Option<(Ipv4Addr, Option<u8>)> {
    match text.split_once('/') {
        Some((ip, len)) => Some((ip.parse().ok()?, Some(len.parse().ok()?))),
        None => Some((text.parse().ok()?, None)),
    }
}

/// Parse `iptables -S FORWARD` output into rules.
fn parse_forward_rules(output: &str) -> Vec<ForwardRule> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("-A FORWARD "))
        .map(|spec| {
            let tokens: Vec<&str> = spec.split_whitespace().collect();
            let value_of = |flag: &str| {
                tokens
                    .iter()
                    .position(|t| *t == flag)
                    .and_then(|i| tokens.get(i + 1))
                    .map(|s| s.to_string())
            };
            ForwardRule {
                in_iface: value_of("-i"),
                out_iface: value_of("-o"),
                spec: spec.trim().to_string(),
            }
        })
        .collect()
}
