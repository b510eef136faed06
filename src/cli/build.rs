//! Build command implementation.

use crate::cli::parsers::parse_name;
use clap::Args;
use embervm::config::EmbervmConfig;
use embervm::privilege::require_root;

/// Provision a VM's disks and host network.
#[derive(Args, Debug)]
pub struct BuildCmd {
    /// VM name.
    #[arg(value_parser = parse_name)]
    pub name: String,
}

impl BuildCmd {
    /// Execute the build command.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        require_root("build")?;
        let controller = crate::cli::controller(config)?;

        println!("Building VM '{}'...", self.name);
        let record = controller.build(&self.name)?;

        println!("Built VM '{}'", record.name);
        if let Some(tap) = &record.tap_name {
            println!("  TAP device: {}", tap);
        }
        if let Some(rootfs) = &record.rootfs_path {
            println!("  Root disk:  {}", rootfs.display());
        }
        if let Some(volume) = &record.volume_path {
            println!("  Volume:     {}", volume.display());
        }
        println!("Next: embervm up {}", record.name);
        Ok(0)
    }
}
