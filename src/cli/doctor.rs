//! Doctor command implementation.

use clap::Args;
use embervm::config::EmbervmConfig;

/// Check the environment and audit host resources against VM records.
#[derive(Args, Debug)]
pub struct DoctorCmd {}

impl DoctorCmd {
    /// Execute the doctor command. Exits non-zero when anything needs attention.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        let controller = crate::cli::controller(config)?;
        let report = controller.doctor()?;

        println!("Environment:");
        for check in &report.checks {
            let mark = if check.ok { "ok" } else { "!!" };
            println!("  [{}] {:<20} {}", mark, check.name, check.detail);
        }

        if !report.unreadable.is_empty() {
            println!();
            println!("Unreadable records:");
            for (name, error) in &report.unreadable {
                println!("  {}: {}", name, error);
                println!("    fix: sudo embervm destroy --force {}", name);
            }
        }

        println!();
        if report.audit.findings.is_empty() {
            println!("Host resources: consistent with records");
        } else {
            println!("Host resources:");
            for finding in &report.audit.findings {
                let vm = finding.vm.as_deref().unwrap_or("-");
                println!(
                    "  {:<12} {:<16} {:<20} {}",
                    finding.kind, vm, finding.resource, finding.detail
                );
                println!("    fix: {}", finding.remediation);
            }
        }
        for view in &report.audit.not_inspected {
            println!("  not inspected: {} (try with sudo)", view);
        }

        Ok(if report.is_healthy() { 0 } else { 1 })
    }
}
