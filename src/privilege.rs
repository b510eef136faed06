//! Privilege separation helpers.
//!
//! Privileged commands (`build`, `destroy`, `setup`, `cleanup`) run under
//! sudo; everything they create for a VM is handed back to the invoking user
//! so that `up`, `down` and `ssh` never need root.

use crate::error::{Error, Result};
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};

/// The human behind this invocation (the sudo caller when elevated).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokingUser {
    /// Login name.
    pub name: String,
    /// User id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Home directory, if the passwd entry has one.
    pub home: Option<PathBuf>,
}

impl InvokingUser {
    /// Detect the invoking user.
    ///
    /// When running as root through sudo, `SUDO_USER`/`SUDO_UID`/`SUDO_GID`
    /// identify the caller. Otherwise the real uid is used.
    pub fn detect() -> Self {
        if is_root() {
            if let Some(user) = Self::from_sudo_env() {
                return user;
            }
        }
        let uid = unsafe { libc::getuid() };
        lookup_uid(uid).unwrap_or_else(|| Self {
            name: std::env::var("USER").unwrap_or_else(|_| uid.to_string()),
            uid,
            gid: unsafe { libc::getgid() },
            home: dirs::home_dir(),
        })
    }

    fn from_sudo_env() -> Option<Self> {
        let name = std::env::var("SUDO_USER").ok()?;
        let uid: u32 = std::env::var("SUDO_UID").ok()?.parse().ok()?;
        let gid: u32 = std::env::var("SUDO_GID").ok()?.parse().ok()?;
        let home = lookup_name(&name).and_then(|u| u.home);
        Some(Self {
            name,
            uid,
            gid,
            home,
        })
    }

    /// Whether this user differs from the effective user of the process.
    pub fn is_elevated_caller(&self) -> bool {
        self.uid != unsafe { libc::geteuid() }
    }
}

/// Whether the process runs with effective uid 0.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Fail with `PermissionDenied` unless running as root.
pub fn require_root(command: &str) -> Result<()> {
    if is_root() {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!(
            "'{}' creates host network devices and must run as root (try: sudo embervm {} ...)",
            command, command
        )))
    }
}

/// Recursively hand a directory tree to `uid:gid`.
pub fn chown_tree(path: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    if path.is_dir() && !path.is_symlink() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

fn lookup_uid(uid: u32) -> Option<InvokingUser> {
    // SAFETY: getpwuid returns a pointer into static storage or null; the
    // fields are copied out before any other passwd call.
    unsafe {
        let pw = libc::getpwuid(uid);
        passwd_to_user(pw)
    }
}

fn lookup_name(name: &str) -> Option<InvokingUser> {
    let cname = CString::new(name).ok()?;
    // SAFETY: see lookup_uid.
    unsafe {
        let pw = libc::getpwnam(cname.as_ptr());
        passwd_to_user(pw)
    }
}

unsafe fn passwd_to_user(pw: *const libc::passwd) -> Option<InvokingUser> {
    if pw.is_null() {
        return None;
    }
    let pw = &*pw;
    let name = CStr::from_ptr(pw.pw_name).to_string_lossy().into_owned();
    let home = if pw.pw_dir.is_null() {
        None
    } else {
        Some(PathBuf::from(
            CStr::from_ptr(pw.pw_dir).to_string_lossy().into_owned(),
        ))
    };
    Some(InvokingUser {
        name,
        uid: pw.pw_uid,
        gid: pw.pw_gid,
        home,
    })
}
