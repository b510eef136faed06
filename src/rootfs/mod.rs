//! Root filesystem provisioning.
//!
//! A VM's root image is either a copy of a prebuilt base image or the output
//! of an external build script. Distribution-specific image construction is
//! the script's business; this module only runs it and checks the result.

use crate::config::ImageSettings;
use crate::error::{Error, Result};
use crate::state::{DiskArtifacts, VmRecord, ROOTFS_FILE, VOLUME_FILE};
use crate::storage::VolumeDisk;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Produces the disk images of a VM.
pub trait ImageBuilder: Send + Sync {
    /// Create the root image (and volume) inside `vm_dir`.
    fn build(&self, vm_dir: &Path, record: &VmRecord) -> Result<DiskArtifacts>;
}

/// Copies the configured base image or delegates to a build script.
#[derive(Debug, Clone)]
pub struct BaseImageBuilder {
    settings: ImageSettings,
    ssh_public_key: Option<PathBuf>,
}

impl BaseImageBuilder {
    /// Create a builder.
    ///
    /// `ssh_public_key` is handed to build scripts so they can authorize it in the guest.
    pub fn new(settings: ImageSettings, ssh_public_key: Option<PathBuf>) -> Self {
        Self {
            settings,
            ssh_public_key,
        }
    }

    fn copy_base(&self, rootfs: &Path) -> Result<()> {
        let base = &self.settings.base_image;
        if !base.is_file() {
            return Err(Error::Config(format!(
                "base image {} does not exist; set image.base_image or image.build_script",
                base.display()
            )));
        }
        tracing::info!(base = %base.display(), rootfs = %rootfs.display(), "copying base image");
        std::fs::copy(base, rootfs)?;
        Ok(())
    }

    fn run_script(&self, script: &Path, rootfs: &Path, record: &VmRecord) -> Result<()> {
        tracing::info!(script = %script.display(), vm = %record.name, "running image build script");

        let mut cmd = Command::new(script);
        cmd.arg(rootfs)
            .env("EMBERVM_VM_NAME", &record.name)
            .env("EMBERVM_ROOTFS", rootfs)
            .env("EMBERVM_BASE_IMAGE", &self.settings.base_image);
        if let Some(ip) = record.guest_ip {
            cmd.env("EMBERVM_GUEST_IP", ip.to_string());
        }
        if let Some(gw) = record.gateway_ip {
            cmd.env("EMBERVM_GATEWAY_IP", gw.to_string());
        }
        if let Some(len) = record.prefix_len {
            cmd.env("EMBERVM_PREFIX_LEN", len.to_string());
        }
        if let Some(key) = &self.ssh_public_key {
            cmd.env("EMBERVM_SSH_PUBKEY", key);
        }
        if let Some(first_boot) = &self.settings.first_boot_script {
            cmd.env("EMBERVM_FIRST_BOOT_SCRIPT", first_boot);
        }

        let output = cmd
            .output()
            .map_err(|e| Error::command_failed(script.display().to_string(), e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::command_failed(
                script.display().to_string(),
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        if !rootfs.is_file() {
            return Err(Error::command_failed(
                script.display().to_string(),
                format!("finished without producing {}", rootfs.display()),
            ));
        }
        Ok(())
    }
}

impl ImageBuilder for BaseImageBuilder {
    fn build(&self, vm_dir: &Path, record: &VmRecord) -> Result<DiskArtifacts> {
        let rootfs = vm_dir.join(ROOTFS_FILE);
        match &self.settings.build_script {
            Some(script) => self.run_script(script, &rootfs, record)?,
            None => self.copy_base(&rootfs)?,
        }

        let volume = if self.settings.volume_size_mib > 0 {
            let disk = VolumeDisk::create(&vm_dir.join(VOLUME_FILE), self.settings.volume_size_mib)?;
            if self.settings.format_volume {
                disk.format_ext4()?;
            }
            Some(disk.path().to_path_buf())
        } else {
            None
        };

        Ok(DiskArtifacts { rootfs, volume })
    }
}
