//! Down command implementation.

use crate::cli::parsers::{parse_duration, parse_name};
use clap::Args;
use embervm::config::EmbervmConfig;
use embervm::process::StopOutcome;
use std::time::Duration;

/// Stop a running VM.
#[derive(Args, Debug)]
pub struct DownCmd {
    /// VM name to stop.
    #[arg(value_parser = parse_name)]
    pub name: String,

    /// Skip the guest shutdown request and signal the hypervisor right away.
    #[arg(short, long)]
    pub force: bool,

    /// How long to wait for the guest to power off.
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

impl DownCmd {
    /// Execute the down command.
    pub fn run(self, mut config: EmbervmConfig) -> embervm::Result<i32> {
        if let Some(timeout) = self.timeout {
            config.timeouts.graceful_shutdown = timeout;
        }
        let controller = crate::cli::controller(config)?;

        match controller.down(&self.name, !self.force)? {
            StopOutcome::NotRunning => println!("VM '{}' is not running", self.name),
            outcome => println!("Stopped VM '{}' ({})", self.name, outcome),
        }
        Ok(0)
    }
}
