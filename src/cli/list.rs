//! List command implementation.

use crate::cli::or_dash;
use clap::Args;
use embervm::config::EmbervmConfig;

/// List all VMs.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Show detailed output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    /// Execute the list command.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        let controller = crate::cli::controller(config)?;
        let vms = controller.list()?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&vms)?);
            return Ok(0);
        }

        if vms.is_empty() {
            println!("No VMs found");
            return Ok(0);
        }

        println!(
            "{:<20} {:<12} {:<16} {:<16} {:<8} {:<6} {:<10}",
            "NAME", "STATE", "ADDRESS", "TAP", "PID", "CPUS", "MEMORY"
        );
        println!("{}", "-".repeat(92));

        for vm in &vms {
            println!(
                "{:<20} {:<12} {:<16} {:<16} {:<8} {:<6} {:<10}",
                truncate(&vm.name, 18),
                vm.status,
                or_dash(vm.guest_ip),
                or_dash(vm.tap.as_deref()),
                or_dash(vm.pid),
                or_dash(vm.cpus),
                or_dash(vm.memory_mib.map(|m| format!("{} MiB", m))),
            );

            if self.verbose {
                if let Some(gw) = vm.gateway_ip {
                    println!("  Gateway: {}", gw);
                }
                if let Some(secs) = vm.uptime_secs {
                    println!("  Uptime: {}s", secs);
                }
                if let Some(err) = &vm.error {
                    println!("  Error: {}", err);
                }
                println!();
            }
        }

        Ok(0)
    }
}

/// Truncate a string to `max` characters, adding "..." if needed.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("web", 18), "web");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("ééééé", 5), "ééééé");
        assert_eq!(truncate("日本語のとても長い名前", 6), "日本語...");
    }
}
