//! embervm CLI entry point.

use clap::{Parser, Subcommand};
use embervm::config::EmbervmConfig;
use tracing_subscriber::EnvFilter;

mod cli;

/// embervm - Firecracker microVMs with per-VM networking
#[derive(Parser, Debug)]
#[command(name = "embervm")]
#[command(about = "Firecracker microVMs with per-VM networking")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a VM record and assign its address.
    Init(cli::init::InitCmd),

    /// Provision disks, TAP device and forwarding rules (root).
    Build(cli::build::BuildCmd),

    /// Start a built VM in the background and wait for SSH.
    Up(cli::up::UpCmd),

    /// Start a built VM attached to its serial console.
    Console(cli::console::ConsoleCmd),

    /// Stop a running VM.
    Down(cli::down::DownCmd),

    /// Open a shell in a running VM, or run a command.
    Ssh(cli::ssh::SshCmd),

    /// Show the state of one VM.
    Status(cli::status::StatusCmd),

    /// List all VMs.
    #[command(alias = "ls")]
    List(cli::list::ListCmd),

    /// Check the environment and audit host resources.
    Doctor(cli::doctor::DoctorCmd),

    /// Stop a VM and remove all of its resources (root).
    #[command(alias = "rm")]
    Destroy(cli::destroy::DestroyCmd),

    /// Enable forwarding and masquerading for the managed range (root).
    Setup(cli::setup::SetupCmd),

    /// Remove the masquerade rule installed by setup (root).
    Cleanup(cli::setup::CleanupCmd),

    /// Show or write the configuration file.
    #[command(subcommand)]
    Config(cli::config::ConfigCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = embervm::VERSION, "starting embervm");

    // Load configuration
    let config = match EmbervmConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            EmbervmConfig::default()
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Init(cmd) => cmd.run(config),
        Commands::Build(cmd) => cmd.run(config),
        Commands::Up(cmd) => cmd.run(config),
        Commands::Console(cmd) => cmd.run(config),
        Commands::Down(cmd) => cmd.run(config),
        Commands::Ssh(cmd) => cmd.run(config),
        Commands::Status(cmd) => cmd.run(config),
        Commands::List(cmd) => cmd.run(config),
        Commands::Doctor(cmd) => cmd.run(config),
        Commands::Destroy(cmd) => cmd.run(config),
        Commands::Setup(cmd) => cmd.run(config),
        Commands::Cleanup(cmd) => cmd.run(config),
        Commands::Config(cmd) => cmd.run(config),
    };

    // Handle errors
    match result {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber.
///
/// `EMBERVM_LOG_FORMAT=json` switches to one JSON object per line.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("embervm=warn"));

    let json = std::env::var("EMBERVM_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}
