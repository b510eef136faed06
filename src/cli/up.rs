//! Up command implementation.

use crate::cli::parsers::parse_name;
use clap::Args;
use embervm::config::EmbervmConfig;
use std::io::Write;

/// Start a built VM in the background.
#[derive(Args, Debug)]
pub struct UpCmd {
    /// VM name.
    #[arg(value_parser = parse_name)]
    pub name: String,
}

impl UpCmd {
    /// Execute the up command.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        let budget = config.timeouts.boot_budget();
        let controller = crate::cli::controller(config)?;

        print!(
            "Starting VM '{}' (waiting up to {} for SSH)... ",
            self.name,
            humantime::format_duration(budget)
        );
        let _ = std::io::stdout().flush();

        let pid = match controller.up(&self.name) {
            Ok(pid) => pid,
            Err(e) => {
                println!("failed");
                let log = controller.store().console_log(&self.name);
                if log.exists() {
                    eprintln!("Console output: {}", log.display());
                }
                return Err(e);
            }
        };
        println!("ok");

        let info = controller.status(&self.name)?;
        println!("VM '{}' is running (PID: {})", self.name, pid);
        if let Some(ip) = info.guest_ip {
            println!("  Address: {}", ip);
        }
        println!("Connect: embervm ssh {}", self.name);
        Ok(0)
    }
}
