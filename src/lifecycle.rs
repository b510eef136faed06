//! VM lifecycle.
//!
//! ```text
//! init ──► initialized ──build──► built ──up/console──► running
//!                                   ▲                     │
//!                                   └──── stopped ◄──down─┘
//! destroy: any state ──► gone
//! ```
//!
//! The [`Controller`] enforces the preconditions of each transition and
//! sequences the allocator, image builder, host network and supervisor.
//! Host facts (process liveness, devices) are queried fresh on every call.

use crate::config::EmbervmConfig;
use crate::error::{Error, Result};
use crate::network::{self, AuditReport, HostNetwork, HostSnapshot, LinuxHost};
use crate::privilege::{self, InvokingUser};
use crate::process::{FirecrackerLauncher, GuestChannel, Launcher, SshChannel, StopOutcome, Supervisor};
use crate::rootfs::{BaseImageBuilder, ImageBuilder};
use crate::state::{now_secs, StateLock, StateStore, VmRecord};
use embervm_protocol::{MAX_VCPUS, MIN_MEMORY_MIB};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use crate::state::{validate_name, MAX_NAME_LEN};

/// Derived lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Record and address exist; no disks yet.
    Initialized,
    /// Disks and host network exist; never started or cleanly forgotten.
    Built,
    /// Hypervisor process alive.
    Running,
    /// Was running; process gone.
    Stopped,
    /// Record could not be read.
    Corrupt,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Initialized => "initialized",
            VmStatus::Built => "built",
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Corrupt => "corrupt",
        };
        f.write_str(s)
    }
}

/// What `status` and `list` report about a VM.
#[derive(Debug, Clone, Serialize)]
pub struct VmInfo {
    /// VM name.
    pub name: String,
    /// Derived state.
    pub status: VmStatus,
    /// Guest address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_ip: Option<Ipv4Addr>,
    /// Gateway (host side of the TAP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<Ipv4Addr>,
    /// TAP device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
    /// Live hypervisor PID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Seconds since the hypervisor started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    /// vCPUs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u8>,
    /// Memory in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u32>,
    /// Why the record is unreadable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of `destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// Record and host resources removed.
    Destroyed,
    /// Nothing by that name existed (only with `force`).
    NotFound,
}

/// One environment check of `doctor`.
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    /// What was checked.
    pub name: String,
    /// Whether it passed.
    pub ok: bool,
    /// Details or the fix.
    pub detail: String,
}

/// Everything `doctor` found.
#[derive(Debug, Clone)]
pub struct DoctorReport {
    /// Environment checks.
    pub checks: Vec<Check>,
    /// Records that could not be read.
    pub unreadable: Vec<(String, String)>,
    /// Record/host audit.
    pub audit: AuditReport,
}

impl DoctorReport {
    /// All checks passed and the audit is clean.
    pub fn is_healthy(&self) -> bool {
        self.checks.iter().all(|c| c.ok) && self.unreadable.is_empty() && self.audit.is_clean()
    }
}

/// The collaborators a controller drives.
pub struct Backends {
    /// Host networking.
    pub host: Arc<dyn HostNetwork>,
    /// Hypervisor launcher.
    pub launcher: Arc<dyn Launcher>,
    /// Guest access.
    pub guest: Arc<dyn GuestChannel>,
    /// Disk image provisioning.
    pub images: Arc<dyn ImageBuilder>,
}

impl Backends {
    /// The real host: `ip`/`iptables`, Firecracker, `ssh`.
    pub fn system(config: &EmbervmConfig, user: &InvokingUser) -> Self {
        let home = user.home.as_deref();
        Self {
            host: Arc::new(LinuxHost::new()),
            launcher: Arc::new(FirecrackerLauncher::new(config.hypervisor.clone())),
            guest: Arc::new(
                SshChannel::new(&config.ssh, home)
                    .with_request_timeout(config.timeouts.graceful_shutdown),
            ),
            images: Arc::new(BaseImageBuilder::new(
                config.image.clone(),
                config.ssh.public_key(home),
            )),
        }
    }
}

/// Drives VMs through their lifecycle.
pub struct Controller {
    config: EmbervmConfig,
    store: StateStore,
    host: Arc<dyn HostNetwork>,
    images: Arc<dyn ImageBuilder>,
    guest: Arc<dyn GuestChannel>,
    program: String,
    supervisor: Supervisor,
    user: InvokingUser,
}

impl Controller {
    /// Controller over the real host for the invoking user.
    pub fn open(config: EmbervmConfig) -> Result<Self> {
        let user = InvokingUser::detect();
        let store = StateStore::open(config.state_dir()?)?;
        let backends = Backends::system(&config, &user);
        Ok(Self::new(config, store, backends, user))
    }

    /// Controller over explicit collaborators.
    pub fn new(config: EmbervmConfig, store: StateStore, backends: Backends, user: InvokingUser) -> Self {
        let program = backends.launcher.program();
        let supervisor = Supervisor::new(
            store.clone(),
            backends.launcher,
            backends.guest.clone(),
            config.hypervisor.clone(),
            config.timeouts.clone(),
        )
        .with_first_boot_script(config.image.first_boot_script.clone());
        Self {
            config,
            store,
            host: backends.host,
            images: backends.images,
            guest: backends.guest,
            program,
            supervisor,
            user,
        }
    }

    /// The state store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The active configuration.
    pub fn config(&self) -> &EmbervmConfig {
        &self.config
    }

    /// Derive the lifecycle state of a record.
    pub fn status_of(&self, record: &VmRecord) -> VmStatus {
        match record.pid {
            Some(pid) if self.supervisor.is_running(pid) => VmStatus::Running,
            Some(_) => VmStatus::Stopped,
            None if !record.is_built() => VmStatus::Initialized,
            None if record.stopped_at.is_some() => VmStatus::Stopped,
            None => VmStatus::Built,
        }
    }

    /// Create a VM record and assign its network identity.
    pub fn init(&self, name: &str, cpus: Option<u8>, memory_mib: Option<u32>) -> Result<VmRecord> {
        validate_name(name)?;
        let cpus = cpus.unwrap_or(self.config.default_cpus);
        let memory_mib = memory_mib.unwrap_or(self.config.default_mem);
        if cpus == 0 || cpus > MAX_VCPUS {
            return Err(Error::Config(format!("cpus must be between 1 and {}", MAX_VCPUS)));
        }
        if memory_mib < MIN_MEMORY_MIB {
            return Err(Error::Config(format!("memory must be at least {} MiB", MIN_MEMORY_MIB)));
        }

        let _vm_lock = StateLock::vm(&self.store, name)?;
        if self.store.exists(name) {
            return Err(Error::AlreadyExists(format!("vm '{}'", name)));
        }

        let _alloc_lock = StateLock::allocator(&self.store)?;
        let existing = self.store.list()?;
        let assignment = network::assign_network(&existing, &self.config.network)?;
        let tap_name = network::tap_name_for(name);
        if let Some(owner) = existing.iter().find(|r| r.tap_name.as_deref() == Some(tap_name.as_str())) {
            return Err(Error::AlreadyExists(format!(
                "tap device {} (used by '{}')",
                tap_name, owner.name
            )));
        }

        let mut record = VmRecord::new(name);
        record.cpus = Some(cpus);
        record.memory_mib = Some(memory_mib);
        record.guest_ip = Some(assignment.guest_ip);
        record.gateway_ip = Some(assignment.gateway_ip);
        record.subnet_index = assignment.subnet_index;
        record.prefix_len = Some(assignment.prefix_len);
        record.tap_name = Some(tap_name);
        self.store.create(&record)?;
        self.hand_back(&self.store.vm_dir(name));

        tracing::info!(vm = %name, ip = %assignment.guest_ip, "initialized vm");
        Ok(record)
    }

    /// Provision disks, the TAP device and forwarding rules.
    pub fn build(&self, name: &str) -> Result<VmRecord> {
        validate_name(name)?;
        let _lock = StateLock::vm(&self.store, name)?;
        let record = self.store.load(name)?;
        if record.is_built() {
            return Err(Error::invalid_state("initialized", self.status_of(&record).to_string()));
        }
        if let Some(pid) = record.pid {
            if self.supervisor.is_running(pid) {
                return Err(Error::invalid_state("initialized", "running"));
            }
        }
        let assignment = record.network().ok_or_else(|| {
            Error::invalid_state(
                "network assigned",
                "incomplete network assignment (destroy and init again)",
            )
        })?;
        let tap = record
            .tap_name
            .clone()
            .unwrap_or_else(|| network::tap_name_for(name));
        let uplink = match &self.config.network.uplink {
            Some(uplink) => uplink.clone(),
            None => self.host.default_uplink()?,
        };

        let vm_dir = self.store.vm_dir(name);
        let artifacts = self.images.build(&vm_dir, &record)?;

        self.host.create_tap(&tap, &self.user.name, &assignment.tap_address())?;
        if let Err(e) = self.host.add_forward_rule(&tap, &uplink) {
            if let Err(cleanup) = self.host.destroy_tap(&tap) {
                tracing::warn!(tap = %tap, error = %cleanup, "failed to remove tap after rule failure");
            }
            return Err(e);
        }

        self.store.write_network(name, &assignment, &tap, &uplink)?;
        self.store
            .mark_built(name, &artifacts, self.config.image.first_boot_script.is_some())?;
        self.hand_back(&vm_dir);

        tracing::info!(vm = %name, tap = %tap, uplink = %uplink, "built vm");
        self.store.load(name)
    }

    fn ready_to_start(&self, name: &str) -> Result<VmRecord> {
        let record = self.store.load(name)?;
        match self.status_of(&record) {
            VmStatus::Built | VmStatus::Stopped => {}
            VmStatus::Running => return Err(Error::invalid_state("stopped", "running")),
            other => return Err(Error::invalid_state("built", other.to_string())),
        }
        self.check_address_free(&record)?;
        Ok(record)
    }

    /// A guest address may only be used by one live VM.
    fn check_address_free(&self, record: &VmRecord) -> Result<()> {
        let Some(ip) = record.guest_ip else {
            return Ok(());
        };
        for (other_name, other) in self.store.entries()? {
            let other = match other {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(vm = %other_name, error = %e, "skipping unreadable record");
                    continue;
                }
            };
            if other.name == record.name || other.guest_ip != Some(ip) {
                continue;
            }
            if other.pid.map_or(false, |pid| self.supervisor.is_running(pid)) {
                return Err(Error::AlreadyExists(format!(
                    "guest address {} is in use by running vm '{}'",
                    ip, other.name
                )));
            }
        }
        Ok(())
    }

    /// Start the VM in the background and wait for SSH.
    pub fn up(&self, name: &str) -> Result<u32> {
        validate_name(name)?;
        let _lock = StateLock::vm(&self.store, name)?;
        let record = self.ready_to_start(name)?;
        self.supervisor.start(&record)
    }

    /// Run the VM with its serial console on this terminal.
    pub fn console(&self, name: &str) -> Result<i32> {
        validate_name(name)?;
        let record = {
            let _lock = StateLock::vm(&self.store, name)?;
            self.ready_to_start(name)?
        };
        self.supervisor.start_attached(&record)
    }

    /// Stop the VM. Succeeds with [`StopOutcome::NotRunning`] when nothing runs.
    ///
    /// Without `graceful` the guest is not asked to shut down and signals are
    /// sent right away.
    pub fn down(&self, name: &str, graceful: bool) -> Result<StopOutcome> {
        validate_name(name)?;
        let record = self.store.load(name)?;
        self.supervisor.stop(&record, graceful)
    }

    /// Stop the VM if needed and remove every host resource and the record.
    ///
    /// With `force`, a missing VM is reported instead of failing and cleanup
    /// continues past individual failures.
    pub fn destroy(&self, name: &str, force: bool) -> Result<DestroyOutcome> {
        validate_name(name)?;
        let _lock = StateLock::vm(&self.store, name)?;
        let record = match self.store.load(name) {
            Ok(record) => record,
            Err(Error::NotFound(_)) if force => {
                if !self.store.exists(name) {
                    return Ok(DestroyOutcome::NotFound);
                }
                // Left behind by an interrupted init.
                tracing::warn!(vm = %name, "directory holds no record, removing it");
                self.store.remove(name)?;
                return Ok(DestroyOutcome::Destroyed);
            }
            Err(e @ Error::Corrupt { .. }) if force => {
                tracing::warn!(vm = %name, error = %e, "record unreadable, removing by derived names");
                let mut fallback = VmRecord::new(name);
                fallback.tap_name = Some(network::tap_name_for(name));
                fallback.uplink = self.config.network.uplink.clone();
                fallback
            }
            Err(e) => return Err(e),
        };

        let tolerate = |step: &str, result: Result<()>| -> Result<()> {
            match result {
                Err(e) if force => {
                    tracing::warn!(vm = %name, step, error = %e, "continuing after failure");
                    Ok(())
                }
                other => other,
            }
        };

        tolerate("stop", self.supervisor.stop(&record, true).map(|_| ()))?;

        if let Some(tap) = record.tap_name.as_deref() {
            let uplink = match &record.uplink {
                Some(uplink) => Some(uplink.clone()),
                None if record.is_built() => self.host.default_uplink().ok(),
                None => None,
            };
            if let Some(uplink) = uplink {
                tolerate(
                    "remove forward rules",
                    self.host.remove_forward_rule(tap, &uplink).map(|_| ()),
                )?;
            }
            tolerate("destroy tap", self.host.destroy_tap(tap).map(|_| ()))?;
        }

        self.store.remove(name)?;
        tracing::info!(vm = %name, "destroyed vm");
        Ok(DestroyOutcome::Destroyed)
    }

    /// Report on one VM.
    pub fn status(&self, name: &str) -> Result<VmInfo> {
        validate_name(name)?;
        let record = self.store.load(name)?;
        Ok(self.info(&record))
    }

    /// Report on every VM; unreadable records are listed as corrupt.
    pub fn list(&self) -> Result<Vec<VmInfo>> {
        Ok(self
            .store
            .entries()?
            .into_iter()
            .map(|(name, record)| match record {
                Ok(record) => self.info(&record),
                Err(e) => VmInfo {
                    name,
                    status: VmStatus::Corrupt,
                    guest_ip: None,
                    gateway_ip: None,
                    tap: None,
                    pid: None,
                    uptime_secs: None,
                    cpus: None,
                    memory_mib: None,
                    error: Some(e.to_string()),
                },
            })
            .collect())
    }

    fn info(&self, record: &VmRecord) -> VmInfo {
        let status = self.status_of(record);
        let running = status == VmStatus::Running;
        VmInfo {
            name: record.name.clone(),
            status,
            guest_ip: record.guest_ip,
            gateway_ip: record.gateway_ip,
            tap: record.tap_name.clone(),
            pid: record.pid.filter(|_| running),
            uptime_secs: record
                .started_at
                .filter(|_| running)
                .map(|t| now_secs().saturating_sub(t)),
            cpus: record.cpus,
            memory_mib: record.memory_mib,
            error: None,
        }
    }

    /// Open a shell (or run `command`) in a running VM. Returns the remote exit code.
    pub fn ssh(&self, name: &str, command: &[String]) -> Result<i32> {
        validate_name(name)?;
        let record = self.store.load(name)?;
        let status = self.status_of(&record);
        if status != VmStatus::Running {
            return Err(Error::invalid_state("running", status.to_string()));
        }
        let ip = record
            .guest_ip
            .ok_or_else(|| Error::invalid_state("network assigned", "no guest address"))?;
        self.guest.interactive(ip, command)
    }

    /// Check the environment and audit records against the host.
    pub fn doctor(&self) -> Result<DoctorReport> {
        let mut records = Vec::new();
        let mut unreadable = Vec::new();
        for (name, record) in self.store.entries()? {
            match record {
                Ok(r) => records.push(r),
                Err(e) => unreadable.push((name, e.to_string())),
            }
        }

        let snapshot = HostSnapshot::gather(self.host.as_ref(), &records, &self.program);
        Ok(DoctorReport {
            checks: self.environment_checks(),
            unreadable,
            audit: network::audit(&records, &snapshot),
        })
    }

    fn environment_checks(&self) -> Vec<Check> {
        let hv = &self.config.hypervisor;
        let mut checks = Vec::new();

        checks.push(match find_executable(&hv.binary) {
            Some(path) => Check {
                name: "hypervisor binary".into(),
                ok: true,
                detail: path.display().to_string(),
            },
            None => Check {
                name: "hypervisor binary".into(),
                ok: false,
                detail: format!("{} not found; set hypervisor.binary", hv.binary.display()),
            },
        });

        checks.push(Check {
            name: "guest kernel".into(),
            ok: hv.kernel.is_file(),
            detail: hv.kernel.display().to_string(),
        });

        let image = &self.config.image;
        checks.push(match &image.build_script {
            Some(script) => Check {
                name: "image build script".into(),
                ok: script.is_file(),
                detail: script.display().to_string(),
            },
            None => Check {
                name: "base image".into(),
                ok: image.base_image.is_file(),
                detail: image.base_image.display().to_string(),
            },
        });

        let kvm = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/kvm");
        checks.push(Check {
            name: "/dev/kvm".into(),
            ok: kvm.is_ok(),
            detail: match kvm {
                Ok(_) => "read/write".into(),
                Err(e) => format!("{} (is the user in the kvm group?)", e),
            },
        });

        checks.push(match network::ip_forwarding_enabled() {
            Ok(true) => Check {
                name: "ip forwarding".into(),
                ok: true,
                detail: "enabled".into(),
            },
            Ok(false) => Check {
                name: "ip forwarding".into(),
                ok: false,
                detail: "disabled; run 'sudo embervm setup'".into(),
            },
            Err(e) => Check {
                name: "ip forwarding".into(),
                ok: false,
                detail: e.to_string(),
            },
        });

        checks.push(Check {
            name: "ssh key".into(),
            ok: self.config.ssh.identity(self.user.home.as_deref()).is_some(),
            detail: self
                .config
                .ssh
                .identity(self.user.home.as_deref())
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "no key configured or found in ~/.ssh".into()),
        });

        checks
    }

    /// Return ownership of files created under sudo to the invoking user.
    fn hand_back(&self, path: &Path) {
        if !self.user.is_elevated_caller() {
            return;
        }
        for target in [self.store.root(), path] {
            if let Err(e) = privilege::chown_tree(target, self.user.uid, self.user.gid) {
                tracing::warn!(path = %target.display(), error = %e, "failed to hand files back to invoking user");
            }
        }
    }
}

/// Resolve an executable the way a shell would.
fn find_executable(binary: &Path) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let is_exec = |p: &Path| {
        std::fs::metadata(p)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };
    if binary.components().count() > 1 {
        return is_exec(binary).then(|| binary.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_exec(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web-01").is_ok());
        assert!(validate_name("A_b").is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());

        for bad in ["", "a.b", "../etc", "with space", "ünï"] {
            assert!(
                matches!(validate_name(bad), Err(Error::InvalidName { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_find_executable() {
        assert!(find_executable(Path::new("sh")).is_some());
        assert!(find_executable(Path::new("/bin/sh")).is_some());
        assert!(find_executable(Path::new("definitely-not-a-binary-xyz")).is_none());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(VmStatus::Initialized.to_string(), "initialized");
        assert_eq!(
            serde_json::to_string(&VmStatus::Running).unwrap(),
            "\"running\""
        );
    }
}
