//! Destroy command implementation.

use crate::cli::parsers::parse_name;
use clap::Args;
use embervm::config::EmbervmConfig;
use embervm::privilege::require_root;
use embervm::DestroyOutcome;

/// Stop a VM and remove its resources.
#[derive(Args, Debug)]
pub struct DestroyCmd {
    /// VM name to destroy.
    #[arg(value_parser = parse_name)]
    pub name: String,

    /// Skip confirmation, ignore a missing VM and continue past cleanup failures.
    #[arg(short, long)]
    pub force: bool,
}

impl DestroyCmd {
    /// Execute the destroy command.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        require_root("destroy")?;
        let controller = crate::cli::controller(config)?;

        // Confirm destruction unless --force
        if !self.force {
            if !controller.store().exists(&self.name) {
                return Err(embervm::Error::NotFound(self.name.clone()));
            }
            eprint!("Destroy VM '{}' and its disks? [y/N] ", self.name);
            let mut input = String::new();
            if std::io::stdin().read_line(&mut input).is_ok() {
                let input = input.trim().to_lowercase();
                if input != "y" && input != "yes" {
                    println!("Cancelled");
                    return Ok(0);
                }
            } else {
                println!("Cancelled");
                return Ok(0);
            }
        }

        match controller.destroy(&self.name, self.force)? {
            DestroyOutcome::Destroyed => println!("Destroyed VM '{}'", self.name),
            DestroyOutcome::NotFound => println!("VM '{}' not found, nothing to do", self.name),
        }
        Ok(0)
    }
}
