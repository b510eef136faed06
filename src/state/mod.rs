//! Durable per-VM state.
//!
//! Each VM owns a directory under the state root:
//!
//! ```text
//! <state_dir>/
//! ├── .locks/              # advisory lock files
//! └── <name>/
//!     ├── vm.json          # the VM record, replaced atomically
//!     ├── firecracker.json # generated machine description
//!     ├── firecracker.sock # hypervisor control socket (while running)
//!     ├── console.log      # hypervisor stdout/stderr
//!     ├── rootfs.ext4
//!     └── volume.ext4
//! ```
//!
//! Every field of [`VmRecord`] is optional: a crash part-way through `build`
//! leaves some facts recorded and others missing, and readers must treat a
//! missing field as its own state.

mod legacy;
pub mod lock;

use crate::error::{Error, Result};
use crate::network::allocator::{NetworkAssignment, TapAddress};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub use lock::StateLock;

/// Record document inside each VM directory.
pub const RECORD_FILE: &str = "vm.json";

/// Generated hypervisor configuration.
pub const MACHINE_FILE: &str = "firecracker.json";

/// Hypervisor control socket.
pub const SOCKET_FILE: &str = "firecracker.sock";

/// Hypervisor console output.
pub const CONSOLE_LOG_FILE: &str = "console.log";

/// Root filesystem image.
pub const ROOTFS_FILE: &str = "rootfs.ext4";

/// Secondary data volume.
pub const VOLUME_FILE: &str = "volume.ext4";

/// Longest usable `sun_path` for a UNIX socket.
const MAX_SOCKET_PATH: usize = 107;

/// Longest accepted VM name.
pub const MAX_NAME_LEN: usize = 64;

/// Check a VM name against `[A-Za-z0-9_-]{1,64}`.
///
/// Names become directory names under the state root, so anything that could
/// resolve outside a single child directory (`""`, `..`, `a/b`) is rejected.
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name is empty".to_string())
    } else if name.len() > MAX_NAME_LEN {
        Some(format!("longer than {} characters", MAX_NAME_LEN))
    } else if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        Some(format!("'{}' is not allowed (use letters, digits, '-' and '_')", c))
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// The durable facts about one VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    /// VM name, unique across records.
    pub name: String,

    /// Unix time of `init`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,

    /// vCPU count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u8>,

    /// Memory in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u32>,

    /// Guest address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_ip: Option<Ipv4Addr>,

    /// Host-side address of the TAP device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<Ipv4Addr>,

    /// Dedicated /24 index in per-VM mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_index: Option<u8>,

    /// Guest prefix length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_len: Option<u8>,

    /// Host TAP device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_name: Option<String>,

    /// Host interface forwarded traffic leaves through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink: Option<String>,

    /// Hypervisor process id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Hypervisor control socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Unix time the current process was spawned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,

    /// Unix time the last process was stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<u64>,

    /// Unix time of a completed `build`; presence is the built marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub built_at: Option<u64>,

    /// Root filesystem image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_path: Option<PathBuf>,

    /// Secondary volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_path: Option<PathBuf>,

    /// A first-boot script still has to run in the guest.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub first_boot_pending: bool,
}

impl VmRecord {
    /// A fresh record stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: Some(now_secs()),
            ..Default::default()
        }
    }

    /// Whether the built marker is present.
    pub fn is_built(&self) -> bool {
        self.built_at.is_some()
    }

    /// The network assignment, if all of its fields were recorded.
    pub fn network(&self) -> Option<NetworkAssignment> {
        Some(NetworkAssignment {
            guest_ip: self.guest_ip?,
            gateway_ip: self.gateway_ip?,
            subnet_index: self.subnet_index,
            prefix_len: self.prefix_len?,
        })
    }

    /// Address the TAP device should carry.
    pub fn tap_address(&self) -> Option<TapAddress> {
        self.network().map(|n| n.tap_address())
    }
}

/// Disk images produced by `build`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskArtifacts {
    /// Root filesystem image.
    pub rootfs: PathBuf,
    /// Secondary volume, when configured.
    pub volume: Option<PathBuf>,
}

/// Access to the per-VM state directories.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) the state root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The state root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one VM.
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Whether a VM directory exists. Always false for an invalid name.
    pub fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.vm_dir(name).is_dir()
    }

    /// Path of the generated machine description.
    pub fn machine_file(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join(MACHINE_FILE)
    }

    /// Path of the console log.
    pub fn console_log(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join(CONSOLE_LOG_FILE)
    }

    /// Path of the control socket, checked against the `sun_path` limit.
    pub fn socket_path(&self, name: &str) -> Result<PathBuf> {
        let path = self.vm_dir(name).join(SOCKET_FILE);
        if path.as_os_str().len() > MAX_SOCKET_PATH {
            return Err(Error::Config(format!(
                "control socket path {} exceeds {} bytes; configure a shorter state_dir",
                path.display(),
                MAX_SOCKET_PATH
            )));
        }
        Ok(path)
    }

    /// Create the directory and first record for a new VM.
    pub fn create(&self, record: &VmRecord) -> Result<()> {
        validate_name(&record.name)?;
        let dir = self.vm_dir(&record.name);
        match std::fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(format!("vm '{}'", record.name)));
            }
            Err(e) => return Err(e.into()),
        }
        self.save(record)
    }

    /// Load a record.
    ///
    /// Falls back to the legacy one-file-per-field layout when `vm.json` is absent.
    pub fn load(&self, name: &str) -> Result<VmRecord> {
        validate_name(name)?;
        let dir = self.vm_dir(name);
        if !dir.is_dir() {
            return Err(Error::NotFound(name.to_string()));
        }
        let path = dir.join(RECORD_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let record: VmRecord = serde_json::from_str(&text)
                    .map_err(|e| Error::corrupt(&path, e.to_string()))?;
                if record.name != name {
                    return Err(Error::corrupt(
                        &path,
                        format!("record names '{}' but lives in '{}'", record.name, name),
                    ));
                }
                Ok(record)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => legacy::read(&dir, name),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace a record atomically.
    pub fn save(&self, record: &VmRecord) -> Result<()> {
        validate_name(&record.name)?;
        let dir = self.vm_dir(&record.name);
        if !dir.is_dir() {
            return Err(Error::NotFound(record.name.clone()));
        }
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&dir.join(RECORD_FILE), &bytes)?;
        legacy::remove_files(&dir);
        Ok(())
    }

    /// Load, modify and save a record.
    pub fn update<F>(&self, name: &str, f: F) -> Result<VmRecord>
    where
        F: FnOnce(&mut VmRecord),
    {
        let mut record = self.load(name)?;
        f(&mut record);
        self.save(&record)?;
        Ok(record)
    }

    /// Names of all VM directories, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if let Err(e) = validate_name(&name) {
                tracing::debug!(dir = %name, error = %e, "ignoring directory that is not a vm");
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Every record with its individual load result.
    pub fn entries(&self) -> Result<Vec<(String, Result<VmRecord>)>> {
        Ok(self
            .names()?
            .into_iter()
            .map(|name| {
                let record = self.load(&name);
                (name, record)
            })
            .collect())
    }

    /// Every record; fails on the first one that cannot be read.
    pub fn list(&self) -> Result<Vec<VmRecord>> {
        self.entries()?.into_iter().map(|(_, r)| r).collect()
    }

    /// Delete a VM directory and everything in it.
    pub fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let dir = self.vm_dir(name);
        if !dir.is_dir() {
            return Err(Error::NotFound(name.to_string()));
        }
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    // Typed field accessors.

    /// Recorded guest address.
    pub fn read_ip(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        Ok(self.load(name)?.guest_ip)
    }

    /// Record a network assignment together with the TAP and uplink names.
    pub fn write_network(
        &self,
        name: &str,
        assignment: &NetworkAssignment,
        tap_name: &str,
        uplink: &str,
    ) -> Result<()> {
        self.update(name, |r| {
            r.guest_ip = Some(assignment.guest_ip);
            r.gateway_ip = Some(assignment.gateway_ip);
            r.subnet_index = assignment.subnet_index;
            r.prefix_len = Some(assignment.prefix_len);
            r.tap_name = Some(tap_name.to_string());
            r.uplink = Some(uplink.to_string());
        })?;
        Ok(())
    }

    /// Recorded hypervisor PID.
    pub fn read_pid(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.load(name)?.pid)
    }

    /// Record a freshly spawned hypervisor.
    pub fn write_pid(&self, name: &str, pid: u32, socket: &Path) -> Result<()> {
        self.update(name, |r| {
            r.pid = Some(pid);
            r.socket_path = Some(socket.to_path_buf());
            r.started_at = Some(now_secs());
        })?;
        Ok(())
    }

    /// Forget the hypervisor process.
    pub fn clear_pid(&self, name: &str) -> Result<()> {
        self.update(name, |r| {
            if r.pid.take().is_some() {
                r.stopped_at = Some(now_secs());
            }
            r.socket_path = None;
            r.started_at = None;
        })?;
        Ok(())
    }

    /// Recorded TAP device.
    pub fn read_tap_name(&self, name: &str) -> Result<Option<String>> {
        Ok(self.load(name)?.tap_name)
    }

    /// Whether the built marker is present.
    pub fn is_built(&self, name: &str) -> Result<bool> {
        Ok(self.load(name)?.is_built())
    }

    /// Record disk artifacts and set the built marker.
    pub fn mark_built(&self, name: &str, artifacts: &DiskArtifacts, first_boot: bool) -> Result<()> {
        self.update(name, |r| {
            r.rootfs_path = Some(artifacts.rootfs.clone());
            r.volume_path = artifacts.volume.clone();
            r.first_boot_pending = first_boot;
            r.built_at = Some(now_secs());
        })?;
        Ok(())
    }
}

/// Write a file by renaming a synced temporary over it.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
