//! Secondary volume disks.
//!
//! A volume is a sparse raw image, optionally formatted with ext4 on the host
//! at build time. It is attached to the guest as a second drive.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

const MIB: u64 = 1024 * 1024;

/// Filesystem label given to formatted volumes.
pub const VOLUME_LABEL: &str = "embervm-data";

/// A sparse raw disk image.
#[derive(Debug, Clone)]
pub struct VolumeDisk {
    path: PathBuf,
    size_bytes: u64,
}

impl VolumeDisk {
    /// Create a fresh sparse image, replacing any leftover from an interrupted build.
    pub fn create(path: &Path, size_mib: u64) -> Result<Self> {
        if size_mib == 0 {
            return Err(Error::Config("volume size must be at least 1 MiB".into()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed partial volume"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let size_bytes = size_mib * MIB;
        Self::create_sparse(path, size_bytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            size_bytes,
        })
    }

    /// Create a sparse disk image.
    fn create_sparse(path: &Path, size_bytes: u64) -> Result<()> {
        use std::fs::OpenOptions;
        use std::io::{Seek, SeekFrom, Write};

        tracing::info!(path = %path.display(), size_mib = size_bytes / MIB, "creating sparse volume");

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        // Seek to end and write a single byte to create sparse file
        file.seek(SeekFrom::Start(size_bytes - 1))?;
        file.write_all(&[0])?;
        file.sync_all()?;

        Ok(())
    }

    /// Format the image with ext4.
    pub fn format_ext4(&self) -> Result<()> {
        tracing::debug!(path = %self.path.display(), "formatting volume");

        let output = Command::new("mkfs.ext4")
            .args(["-F", "-q", "-L", VOLUME_LABEL])
            .arg(&self.path)
            .output()
            .map_err(|e| Error::command_failed("mkfs.ext4", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::command_failed(
                format!("mkfs.ext4 {}", self.path.display()),
                stderr.trim().to_string(),
            ));
        }
        Ok(())
    }

    /// Get the path to the disk image.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the disk size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_sparse_volume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.ext4");

        let disk = VolumeDisk::create(&path, 64).unwrap();
        assert_eq!(disk.size_bytes(), 64 * MIB);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 * MIB);
        assert_eq!(disk.path(), path);
    }

    #[test]
    fn test_create_replaces_leftover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.ext4");
        std::fs::write(&path, b"partial").unwrap();

        VolumeDisk::create(&path, 2).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * MIB);
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(VolumeDisk::create(&dir.path().join("v"), 0).is_err());
    }
}
