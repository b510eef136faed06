//! Reader for the one-fact-per-file record layout.
//!
//! Older state directories hold each field in its own small file (`ip`,
//! `pid`, `built`, ...). They are read transparently; the next save writes
//! `vm.json` and removes these files.

use super::{VmRecord, ROOTFS_FILE, VOLUME_FILE};
use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Field files of the legacy layout.
const FIELDS: &[&str] = &["ip", "gateway", "subnet", "tap", "uplink", "pid", "socket", "built"];

/// Prefix length every legacy assignment used.
const LEGACY_PREFIX: u8 = 24;

/// Read a legacy record. `NotFound` when not a single field file exists.
pub(super) fn read(dir: &Path, name: &str) -> Result<VmRecord> {
    if !FIELDS.iter().any(|field| dir.join(field).exists()) {
        return Err(Error::NotFound(name.to_string()));
    }

    let mut record = VmRecord {
        name: name.to_string(),
        ..Default::default()
    };

    record.guest_ip = parse_field::<Ipv4Addr>(dir, "ip")?;
    record.gateway_ip = parse_field::<Ipv4Addr>(dir, "gateway")?;
    record.subnet_index = parse_field::<u8>(dir, "subnet")?;
    record.tap_name = read_field(dir, "tap")?;
    record.uplink = read_field(dir, "uplink")?;
    record.pid = parse_field::<u32>(dir, "pid")?;
    record.socket_path = read_field(dir, "socket")?.map(PathBuf::from);
    record.built_at = parse_field::<u64>(dir, "built")?;
    if record.guest_ip.is_some() {
        record.prefix_len = Some(LEGACY_PREFIX);
    }

    let rootfs = dir.join(ROOTFS_FILE);
    if rootfs.exists() {
        record.rootfs_path = Some(rootfs);
    }
    let volume = dir.join(VOLUME_FILE);
    if volume.exists() {
        record.volume_path = Some(volume);
    }

    tracing::debug!(vm = %name, "loaded legacy per-field record");
    Ok(record)
}

pub(super) fn remove_files(dir: &Path) {
    for field in FIELDS {
        let _ = std::fs::remove_file(dir.join(field));
    }
}

fn read_field(dir: &Path, field: &str) -> Result<Option<String>> {
    match std::fs::read_to_string(dir.join(field)) {
        Ok(text) => {
            let text = text.trim();
            Ok((!text.is_empty()).then(|| text.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_field<T>(dir: &Path, field: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match read_field(dir, field)? {
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|e: T::Err| Error::corrupt(dir.join(field), format!("'{}': {}", text, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{StateStore, RECORD_FILE};
    use super::*;

    fn legacy_vm(store: &StateStore, name: &str, fields: &[(&str, &str)]) {
        let dir = store.vm_dir(name);
        std::fs::create_dir(&dir).unwrap();
        for (field, value) in fields {
            std::fs::write(dir.join(field), format!("{}\n", value)).unwrap();
        }
    }

    #[test]
    fn test_reads_legacy_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        legacy_vm(
            &store,
            "old",
            &[
                ("ip", "172.16.4.2"),
                ("gateway", "172.16.4.1"),
                ("subnet", "4"),
                ("tap", "tap-old"),
                ("pid", "777"),
                ("built", "1700000000"),
            ],
        );

        let record = store.load("old").unwrap();
        assert_eq!(record.guest_ip, Some(Ipv4Addr::new(172, 16, 4, 2)));
        assert_eq!(record.subnet_index, Some(4));
        assert_eq!(record.prefix_len, Some(24));
        assert_eq!(record.tap_name.as_deref(), Some("tap-old"));
        assert_eq!(record.pid, Some(777));
        assert_eq!(record.uplink, None);
        assert!(record.is_built());
    }

    #[test]
    fn test_partial_legacy_record_keeps_missing_fields_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        legacy_vm(&store, "half", &[("ip", "172.16.0.9")]);

        let record = store.load("half").unwrap();
        assert_eq!(record.guest_ip, Some(Ipv4Addr::new(172, 16, 0, 9)));
        assert_eq!(record.gateway_ip, None);
        assert!(record.network().is_none());
        assert!(!record.is_built());
    }

    #[test]
    fn test_directory_with_only_disks_is_not_a_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        legacy_vm(&store, "disks", &[(ROOTFS_FILE, "x")]);

        assert!(matches!(store.load("disks"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_non_numeric_pid_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        legacy_vm(&store, "bad", &[("pid", "not-a-pid")]);

        match store.load("bad") {
            Err(Error::Corrupt { path, message }) => {
                assert!(path.ends_with("pid"));
                assert!(message.contains("not-a-pid"));
            }
            other => panic!("expected corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_save_migrates_to_record_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        legacy_vm(&store, "old", &[("ip", "172.16.0.2"), ("pid", "55")]);

        store.clear_pid("old").unwrap();

        let dir = store.vm_dir("old");
        assert!(dir.join(RECORD_FILE).exists());
        assert!(!dir.join("ip").exists());
        assert!(!dir.join("pid").exists());
        let record = store.load("old").unwrap();
        assert_eq!(record.guest_ip, Some(Ipv4Addr::new(172, 16, 0, 2)));
        assert_eq!(record.pid, None);
    }
}
