//! Global embervm configuration.
//!
//! Settings live in a TOML file at `$EMBERVM_CONFIG` or
//! `~/.config/embervm/config.toml`. Every section is optional; missing keys
//! fall back to defaults.

use crate::error::{Error, Result};
use crate::network::allocator::{AddressMode, NetworkSettings};
use crate::privilege::InvokingUser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and data directories.
const APP_NAME: &str = "embervm";

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "EMBERVM_CONFIG";

/// Global embervm configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbervmConfig {
    /// Configuration format version.
    pub version: u8,

    /// Directory holding one subdirectory per VM.
    pub state_dir: Option<PathBuf>,

    /// Default number of vCPUs for new VMs.
    pub default_cpus: u8,

    /// Default memory in MiB for new VMs.
    pub default_mem: u32,

    /// Hypervisor binary and kernel.
    pub hypervisor: HypervisorSettings,

    /// Disk image provisioning.
    pub image: ImageSettings,

    /// Address allocation and uplink.
    pub network: NetworkSettings,

    /// Guest SSH access.
    pub ssh: SshSettings,

    /// Boot and shutdown bounds.
    pub timeouts: Timeouts,
}

impl Default for EmbervmConfig {
    fn default() -> Self {
        Self {
            version: 1,
            state_dir: None,
            default_cpus: 1,
            default_mem: 512,
            hypervisor: HypervisorSettings::default(),
            image: ImageSettings::default(),
            network: NetworkSettings::default(),
            ssh: SshSettings::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl EmbervmConfig {
    /// Load configuration from disk.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Location of the config file.
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let user = InvokingUser::detect();
        let base = if user.is_elevated_caller() {
            user.home.map(|h| h.join(".config"))
        } else {
            dirs::config_dir()
        };
        base.map(|d| d.join(APP_NAME).join("config.toml"))
            .ok_or_else(|| Error::Config("could not determine config directory".into()))
    }

    /// Directory holding per-VM state.
    ///
    /// Under sudo this resolves against the invoking user's home, so privileged
    /// and unprivileged commands see the same VMs.
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        let user = InvokingUser::detect();
        let base = if user.is_elevated_caller() {
            user.home.map(|h| h.join(".local").join("share"))
        } else {
            dirs::data_local_dir().or_else(dirs::data_dir)
        };
        base.map(|d| d.join(APP_NAME).join("vms"))
            .ok_or_else(|| Error::Config("could not determine data directory".into()))
    }

    /// Current address allocation mode.
    pub fn address_mode(&self) -> AddressMode {
        self.network.mode
    }
}

/// Hypervisor binary and guest kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorSettings {
    /// Firecracker binary (looked up on `PATH` if relative).
    pub binary: PathBuf,

    /// Uncompressed guest kernel.
    pub kernel: PathBuf,

    /// Kernel arguments before the generated `ip=` argument.
    pub boot_args: String,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("firecracker"),
            kernel: PathBuf::from("/var/lib/embervm/vmlinux"),
            boot_args: embervm_protocol::DEFAULT_BOOT_ARGS.to_string(),
        }
    }
}

impl HypervisorSettings {
    /// File name of the hypervisor executable, used to recognize its processes.
    pub fn binary_name(&self) -> String {
        self.binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "firecracker".to_string())
    }
}

/// How root images and volumes are produced at `build`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Prebuilt root filesystem copied for each VM.
    pub base_image: PathBuf,

    /// External builder invoked instead of copying `base_image`.
    pub build_script: Option<PathBuf>,

    /// Size of the secondary volume in MiB (0 disables it).
    pub volume_size_mib: u64,

    /// Run `mkfs.ext4` on a fresh volume.
    pub format_volume: bool,

    /// Guest path of a script run once over SSH after the first boot.
    pub first_boot_script: Option<String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            base_image: PathBuf::from("/var/lib/embervm/rootfs.ext4"),
            build_script: None,
            volume_size_mib: 4096,
            format_volume: true,
            first_boot_script: None,
        }
    }
}

/// Guest SSH access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Guest login.
    pub user: String,

    /// Private key; discovered under `~/.ssh` when unset.
    pub key: Option<PathBuf>,

    /// Guest SSH port.
    pub port: u16,

    /// Command issued for a cooperative shutdown.
    ///
    /// Firecracker exits when the guest reboots, so `reboot` stops the VM.
    pub shutdown_command: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            key: None,
            port: 22,
            shutdown_command: "reboot".to_string(),
        }
    }
}

impl SshSettings {
    /// Resolve the private key: the configured one, else the first default key.
    pub fn identity(&self, home: Option<&Path>) -> Option<PathBuf> {
        if let Some(key) = &self.key {
            return Some(key.clone());
        }
        let ssh_dir = home?.join(".ssh");
        ["id_ed25519", "id_ecdsa", "id_rsa"]
            .iter()
            .map(|name| ssh_dir.join(name))
            .find(|p| p.exists())
    }

    /// Public half of the resolved identity, if present on disk.
    pub fn public_key(&self, home: Option<&Path>) -> Option<PathBuf> {
        let identity = self.identity(home)?;
        let mut public = identity.into_os_string();
        public.push(".pub");
        let public = PathBuf::from(public);
        public.exists().then_some(public)
    }
}

/// Bounds on every blocking wait (defaults: ~2 minutes boot, 30s/5s shutdown).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Readiness probes before giving up on boot.
    pub boot_attempts: u32,

    /// Pause between readiness probes.
    #[serde(with = "humantime_serde")]
    pub boot_interval: Duration,

    /// Wait after the guest shutdown request.
    #[serde(with = "humantime_serde")]
    pub graceful_shutdown: Duration,

    /// Wait after SIGTERM.
    #[serde(with = "humantime_serde")]
    pub terminate: Duration,

    /// Wait for the process to disappear after SIGKILL.
    #[serde(with = "humantime_serde")]
    pub kill: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            boot_attempts: 60,
            boot_interval: Duration::from_secs(2),
            graceful_shutdown: Duration::from_secs(30),
            terminate: Duration::from_secs(5),
            kill: Duration::from_secs(2),
        }
    }
}

impl Timeouts {
    /// Upper bound of the boot poll.
    pub fn boot_budget(&self) -> Duration {
        self.boot_interval * self.boot_attempts
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
