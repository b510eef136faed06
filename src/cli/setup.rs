//! Host setup and cleanup commands.

use clap::Args;
use embervm::config::EmbervmConfig;
use embervm::network::LinuxHost;
use embervm::privilege::require_root;

/// Prepare the host for VM networking.
#[derive(Args, Debug)]
pub struct SetupCmd {}

impl SetupCmd {
    /// Execute the setup command.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        require_root("setup")?;
        let host = LinuxHost::new();
        let uplink = host.uplink(&config.network)?;

        host.setup(&config.network, &uplink)?;
        println!("IPv4 forwarding enabled");
        println!(
            "Masquerading {} via {}",
            config.network.managed_range(),
            uplink
        );
        Ok(0)
    }
}

/// Undo `setup`.
#[derive(Args, Debug)]
pub struct CleanupCmd {}

impl CleanupCmd {
    /// Execute the cleanup command.
    pub fn run(self, config: EmbervmConfig) -> embervm::Result<i32> {
        require_root("cleanup")?;
        let host = LinuxHost::new();
        let uplink = host.uplink(&config.network)?;

        if host.cleanup(&config.network, &uplink)? {
            println!("Removed masquerade rule for {}", config.network.managed_range());
        } else {
            println!("No masquerade rule installed");
        }
        Ok(0)
    }
}
