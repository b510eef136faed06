//! Status command implementation.

use crate::cli::or_dash;
use crate::cli::parsers::parse_name;
use clap::Args;
use embervm::config::EmbervmConfig;
use std::time::Duration;

/// Show the state of one VM.
#[derive(Args, Debug)]
pub struct StatusCmd {
    /// VM name.
    #[arg(value_parser = parse_name)]
    pub name: String,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusCmd {
    /// Execute the status command.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        let controller = crate::cli::controller(config)?;
        let info = controller.status(&self.name)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&info)?);
            return Ok(0);
        }

        println!("Name:    {}", info.name);
        println!("State:   {}", info.status);
        println!("Address: {}", or_dash(info.guest_ip));
        println!("Gateway: {}", or_dash(info.gateway_ip));
        println!("TAP:     {}", or_dash(info.tap.as_deref()));
        println!("CPUs:    {}", or_dash(info.cpus));
        println!(
            "Memory:  {}",
            or_dash(info.memory_mib.map(|m| format!("{} MiB", m)))
        );
        if let Some(pid) = info.pid {
            println!("PID:     {}", pid);
        }
        if let Some(secs) = info.uptime_secs {
            println!(
                "Uptime:  {}",
                humantime::format_duration(Duration::from_secs(secs))
            );
        }
        Ok(0)
    }
}
