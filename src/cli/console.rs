//! Console command implementation.

use crate::cli::parsers::parse_name;
use clap::Args;
use embervm::config::EmbervmConfig;

/// Run a VM in the foreground with its serial console attached.
#[derive(Args, Debug)]
pub struct ConsoleCmd {
    /// VM name.
    #[arg(value_parser = parse_name)]
    pub name: String,
}

impl ConsoleCmd {
    /// Execute the console command. Returns the hypervisor's exit code.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        let controller = crate::cli::controller(config)?;
        eprintln!("Attaching to VM '{}' (power off the guest to exit)", self.name);
        let code = controller.console(&self.name)?;
        eprintln!("VM '{}' exited with code {}", self.name, code);
        Ok(code)
    }
}
