//! Installing certificate material on disk
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! reader never sees a half-written key. Keys are `0600`, certificates
//! `0644`; ownership is applied before the rename.
//!
//! A key and its certificate are [`stage`]d together and only committed
//! once both temporaries are complete.

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

pub const KEY_MODE: u32 = 0o600;
pub const CERT_MODE: u32 = 0o644;

/// Resolved `user:group` ownership; `None` leaves that id unchanged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Ownership {
    /// Parse `user`, `user:group` or `:group`; names or numeric ids
    pub fn parse(owner: &str) -> Result<Self, String> {
        let (user, group) = match owner.split_once(':') {
            Some((user, group)) => (user, group),
            None => (owner, ""),
        };

        let uid = if user.is_empty() {
            None
        } else {
            Some(resolve_user(user)?)
        };
        let gid = if group.is_empty() {
            None
        } else {
            Some(resolve_group(group)?)
        };

        if uid.is_none() && gid.is_none() {
            return Err("empty owner".to_string());
        }
        Ok(Self { uid, gid })
    }

    pub fn apply(&self, path: &Path) -> io::Result<()> {
        std::os::unix::fs::chown(path, self.uid, self.gid)
    }
}

fn resolve_user(name: &str) -> Result<u32, String> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    let c_name = CString::new(name).map_err(|_| format!("invalid user name `{name}`"))?;

    // SAFETY: getpwnam reads the passwd database and returns either null or
    // a pointer to static storage; we copy the uid out immediately.
    let uid = unsafe {
        let entry = libc::getpwnam(c_name.as_ptr());
        if entry.is_null() {
            None
        } else {
            Some((*entry).pw_uid)
        }
    };
    uid.ok_or_else(|| format!("unknown user `{name}`"))
}

fn resolve_group(name: &str) -> Result<u32, String> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    let c_name = CString::new(name).map_err(|_| format!("invalid group name `{name}`"))?;

    // SAFETY: as for getpwnam above.
    let gid = unsafe {
        let entry = libc::getgrnam(c_name.as_ptr());
        if entry.is_null() {
            None
        } else {
            Some((*entry).gr_gid)
        }
    };
    gid.ok_or_else(|| format!("unknown group `{name}`"))
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.phoenix-{}", std::process::id()))
}

/// A fully written temporary file waiting to be renamed over its target
///
/// Dropping it without [`Staged::commit`] removes the temporary.
#[derive(Debug)]
pub struct Staged {
    temp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl Staged {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename the temporary into place
    pub fn commit(mut self) -> io::Result<()> {
        fs::rename(&self.temp, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp);
        }
    }
}

/// Write `contents` next to `path` with the given mode and ownership,
/// leaving `path` itself untouched until the result is committed
pub fn stage(
    path: &Path,
    contents: &[u8],
    mode: u32,
    ownership: Option<Ownership>,
) -> io::Result<Staged> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_path(path);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&temp)?;
    // From here on the temporary exists and is cleaned up on drop
    let staged = Staged {
        temp,
        target: path.to_path_buf(),
        committed: false,
    };
    file.write_all(contents)?;
    file.sync_all()?;
    // umask may have narrowed the create mode
    fs::set_permissions(&staged.temp, fs::Permissions::from_mode(mode))?;
    if let Some(owner) = ownership {
        owner.apply(&staged.temp)?;
    }
    Ok(staged)
}

/// Write `contents` to `path` atomically with the given mode and ownership
pub fn write_atomic(
    path: &Path,
    contents: &[u8],
    mode: u32,
    ownership: Option<Ownership>,
) -> io::Result<()> {
    stage(path, contents, mode, ownership)?.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_sets_mode_and_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("certs/service.key");

        write_atomic(&path, b"secret", KEY_MODE, None).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"secret");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, KEY_MODE);
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("service.crt");
        fs::write(&path, "old").unwrap();

        write_atomic(&path, b"new", CERT_MODE, None).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_dropped_stage_leaves_target_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("service.key");
        fs::write(&path, "old").unwrap();

        let staged = stage(&path, b"new", KEY_MODE, None).unwrap();
        assert_eq!(staged.target(), path);
        drop(staged);

        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_parse_numeric_owner() {
        assert_eq!(
            Ownership::parse("1000:33").unwrap(),
            Ownership {
                uid: Some(1000),
                gid: Some(33)
            }
        );
        assert_eq!(
            Ownership::parse(":33").unwrap(),
            Ownership {
                uid: None,
                gid: Some(33)
            }
        );
    }

    #[test]
    fn test_parse_unknown_owner() {
        let err = Ownership::parse("no-such-phoenix-user").unwrap_err();
        assert!(err.contains("unknown user"));
        assert!(Ownership::parse(":").is_err());
    }
}
