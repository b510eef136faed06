//! Ssh command implementation.

use crate::cli::parsers::parse_name;
use clap::Args;
use embervm::config::EmbervmConfig;

/// Open a shell in a running VM.
#[derive(Args, Debug)]
pub struct SshCmd {
    /// VM name.
    #[arg(value_parser = parse_name)]
    pub name: String,

    /// Command to run instead of an interactive shell.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl SshCmd {
    /// Execute the ssh command. Returns the remote exit code.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        let controller = crate::cli::controller(config)?;
        controller.ssh(&self.name, &self.command)
    }
}
