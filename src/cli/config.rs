//! Configuration CLI commands.

use clap::{Args, Subcommand};
use embervm::config::EmbervmConfig;
use embervm::{Error, Result};

/// Configuration commands
#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Show the effective configuration
    Show(ShowCmd),

    /// Write the default configuration file
    Init(InitConfigCmd),
}

impl ConfigCmd {
    pub fn run(self, config: EmbervmConfig) -> Result<i32> {
        match self {
            ConfigCmd::Show(cmd) => cmd.run(config),
            ConfigCmd::Init(cmd) => cmd.run(),
        }
    }
}

// ============================================================================
// Show Command
// ============================================================================

/// Show the effective configuration
#[derive(Args, Debug)]
pub struct ShowCmd {}

impl ShowCmd {
    pub fn run(self, config: EmbervmConfig) -> Result<i32> {
        if let Ok(path) = EmbervmConfig::config_path() {
            let status = if path.exists() { "" } else { " (not present, using defaults)" };
            println!("# Config file: {}{}", path.display(), status);
        }
        if let Ok(dir) = config.state_dir() {
            println!("# State directory: {}", dir.display());
        }
        let text = toml::to_string_pretty(&config)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        println!("{}", text);
        Ok(0)
    }
}

// ============================================================================
// Init Command
// ============================================================================

/// Write the default configuration file
#[derive(Args, Debug)]
pub struct InitConfigCmd {
    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

impl InitConfigCmd {
    pub fn run(self) -> Result<i32> {
        let path = EmbervmConfig::config_path()?;
        if path.exists() && !self.force {
            return Err(Error::AlreadyExists(format!(
                "{} (use --force to overwrite)",
                path.display()
            )));
        }
        EmbervmConfig::default().save_to(&path)?;
        println!("Wrote {}", path.display());
        Ok(0)
    }
}
