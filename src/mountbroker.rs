//! Mount-broker directory management.
//!
//! The broker hands unprivileged users pre-arranged mounts. Its root
//! directory must be owned by root and not writable by group or other,
//! and the same must hold for every ancestor up to `/`, except that a
//! sticky-bit directory may be group/other writable (the `/tmp` shape).
//! Under the root live a hive directory for cookie symlinks and one 0700
//! directory per authorized uid. Granting a mount atomically publishes a
//! cookie link from the hive to the user's mountpoint: create under a
//! temporary name, then rename into place.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt, symlink};
use std::path::{Component, Path, PathBuf};

use log::{debug, info};

/// Hive subdirectory name.
const HIVE: &str = "mb_hive";
/// Cookie links get this prefix while being staged.
const STAGING_PREFIX: &str = ".in-progress.";

/// The broker state rooted at a validated directory.
#[derive(Debug)]
pub struct MountBroker {
    root: PathBuf,
}

fn bad(path: &Path, why: &str) -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, format!("{}: {why}", path.display()))
}

/// Check one directory against the broker invariant.
fn check_dir(path: &Path) -> io::Result<()> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return Err(bad(path, "not a directory"));
    }
    if meta.uid() != 0 {
        return Err(bad(path, "not owned by root"));
    }
    let mode = meta.permissions().mode();
    let lax = mode & (libc::S_IWGRP | libc::S_IWOTH) as u32 != 0;
    let sticky = mode & libc::S_ISVTX as u32 != 0;
    if lax && !sticky {
        return Err(bad(path, "group/other writable without the sticky bit"));
    }
    Ok(())
}

/// Validate `root` and its whole ancestor chain.
fn check_ancestry(root: &Path) -> io::Result<()> {
    if !root.is_absolute() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "broker root must be absolute"));
    }
    let mut current = PathBuf::new();
    for component in root.components() {
        match component {
            Component::RootDir => current.push("/"),
            Component::Normal(part) => {
                current.push(part);
                check_dir(&current)?;
            }
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "path not canonical")),
        }
    }
    check_dir(root)
}

impl MountBroker {
    /// Open (and validate) a broker root, creating the hive if absent.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<MountBroker> {
        let root = root.into();
        check_ancestry(&root)?;
        let hive = root.join(HIVE);
        if !hive.exists() {
            std::fs::create_dir(&hive)?;
            std::fs::set_permissions(&hive, std::fs::Permissions::from_mode(0o711))?;
        }
        info!("mount broker rooted at {}", root.display());
        Ok(MountBroker { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn hive(&self) -> PathBuf {
        self.root.join(HIVE)
    }

    fn user_dir(&self, uid: u32) -> PathBuf {
        self.root.join(uid.to_string())
    }

    /// Provision the per-user directory: mode 0700, owned by the uid.
    pub fn add_user(&self, uid: u32) -> io::Result<PathBuf> {
        let dir = self.user_dir(uid);
        if !dir.exists() {
            std::fs::create_dir(&dir)?;
        }
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        let cpath = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))?;
        if unsafe { libc::chown(cpath.as_ptr(), uid, u32::MAX) } != 0 {
            return Err(io::Error::last_os_error());
        }
        debug!("user {uid} provisioned under the broker");
        Ok(dir)
    }

    /// Publish a cookie for a granted mount. The link appears in the hive
    /// atomically or not at all.
    pub fn grant(&self, uid: u32, label: &str, mountpoint: &Path) -> io::Result<PathBuf> {
        if label.is_empty() || label.contains('/') {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad cookie label"));
        }
        let user_dir = self.user_dir(uid);
        if !user_dir.is_dir() {
            return Err(bad(&user_dir, "user not provisioned"));
        }
        let hive = self.hive();
        let staged = hive.join(format!("{STAGING_PREFIX}{uid}.{label}"));
        let cookie = hive.join(format!("{uid}.{label}"));
        // Leftovers from a crashed grant are harmless to replace.
        let _ = std::fs::remove_file(&staged);
        symlink(mountpoint, &staged)?;
        std::fs::rename(&staged, &cookie)?;
        info!("granted {label} for uid {uid} -> {}", mountpoint.display());
        Ok(cookie)
    }

    /// Remove a cookie; absent cookies are fine.
    pub fn revoke(&self, uid: u32, label: &str) -> io::Result<()> {
        let cookie = self.hive().join(format!("{uid}.{label}"));
        match std::fs::remove_file(&cookie) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// The mountpoint a cookie currently names.
    pub fn cookie_target(&self, uid: u32, label: &str) -> io::Result<PathBuf> {
        std::fs::read_link(self.hive().join(format!("{uid}.{label}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_as_root() -> bool {
        unsafe { libc::geteuid() == 0 }
    }

    fn broker_root(tmp: &tempfile::TempDir) -> PathBuf {
        let root = tmp.path().join("broker");
        std::fs::create_dir(&root).unwrap();
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o755)).unwrap();
        root
    }

    #[test]
    fn cookie_grant_and_revoke() {
        if !running_as_root() {
            return; // ancestry validation demands root-owned directories
        }
        let tmp = tempfile::tempdir().unwrap();
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let broker = MountBroker::open(broker_root(&tmp)).unwrap();
        broker.add_user(0).unwrap();

        let mountpoint = tmp.path().join("mnt");
        let cookie = broker.grant(0, "vol1", &mountpoint).unwrap();
        assert!(cookie.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(broker.cookie_target(0, "vol1").unwrap(), mountpoint);

        // Re-granting replaces atomically.
        let other = tmp.path().join("mnt2");
        broker.grant(0, "vol1", &other).unwrap();
        assert_eq!(broker.cookie_target(0, "vol1").unwrap(), other);

        broker.revoke(0, "vol1").unwrap();
        assert!(broker.cookie_target(0, "vol1").is_err());
        // Idempotent revoke.
        broker.revoke(0, "vol1").unwrap();
    }

    #[test]
    fn group_writable_ancestor_without_sticky_is_rejected() {
        if !running_as_root() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o775)).unwrap();
        let root = broker_root(&tmp);
        let err = MountBroker::open(&root).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        // The sticky bit exempts it.
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o1775)).unwrap();
        MountBroker::open(&root).unwrap();
    }

    #[test]
    fn bad_labels_are_rejected() {
        if !running_as_root() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let broker = MountBroker::open(broker_root(&tmp)).unwrap();
        broker.add_user(0).unwrap();
        assert!(broker.grant(0, "", Path::new("/mnt")).is_err());
        assert!(broker.grant(0, "a/b", Path::new("/mnt")).is_err());
        // Granting for an unprovisioned user fails.
        assert!(broker.grant(12345, "x", Path::new("/mnt")).is_err());
    }
}
