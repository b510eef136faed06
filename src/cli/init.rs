//! Init command implementation.

use crate::cli::parsers::{parse_cpus, parse_memory, parse_name};
use clap::Args;
use embervm::config::EmbervmConfig;

/// Create a VM record and assign its address.
#[derive(Args, Debug)]
pub struct InitCmd {
    /// VM name (letters, digits, '-' and '_').
    #[arg(value_parser = parse_name)]
    pub name: String,

    /// Number of vCPUs (default from config).
    #[arg(long, value_parser = parse_cpus)]
    pub cpus: Option<u8>,

    /// Memory in MiB, or with a G suffix (default from config).
    #[arg(long, value_parser = parse_memory)]
    pub memory: Option<u32>,
}

impl InitCmd {
    /// Execute the init command.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        let controller = crate::cli::controller(config)?;
        let record = controller.init(&self.name, self.cpus, self.memory)?;

        println!("Initialized VM '{}'", record.name);
        if let Some(ip) = record.guest_ip {
            println!("  Address: {}/{}", ip, record.prefix_len.unwrap_or(24));
        }
        if let Some(gw) = record.gateway_ip {
            println!("  Gateway: {}", gw);
        }
        println!("Next: sudo embervm build {}", record.name);
        Ok(0)
    }
}
