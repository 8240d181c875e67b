//! Read leases on files that must not change while a tier depends on them.
//!
//! On Unix a lease is a shared, non-blocking `flock`. Advisory locks do not
//! stop `unlink`, so cooperating writers check [`FileLease::is_held_elsewhere`]
//! before rewriting. On Windows the file is opened with read-only sharing,
//! which makes deletion and writes by other processes fail outright.

use std::path::{Path, PathBuf};

use crate::error::{Result, WardenError};

#[derive(Debug)]
pub struct FileLease {
    path: PathBuf,
    // Held for the lifetime of the lease; dropping the handle releases it.
    _file: std::fs::File,
}

impl FileLease {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_shared(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when some other handle holds a lease on `path`.
    /// A missing file is never held.
    pub fn is_held_elsewhere(path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        probe_exclusive(path)
    }
}

#[cfg(unix)]
fn open_shared(path: &Path) -> Result<std::fs::File> {
    use std::os::unix::io::AsRawFd;

    let file = fs_err::File::open(path)
        .map_err(|err| map_open_error(path, err))?
        .into_parts()
        .0;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Err(WardenError::FileLocked(path.to_path_buf()));
        }
        return Err(WardenError::io(
            format!("Failed to lease {}", path.display()),
            err,
        ));
    }
    Ok(file)
}

#[cfg(unix)]
fn probe_exclusive(path: &Path) -> bool {
    use std::os::unix::io::AsRawFd;

    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let fd = file.as_raw_fd();
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        unsafe { libc::flock(fd, libc::LOCK_UN) };
        return false;
    }
    std::io::Error::last_os_error().kind() == std::io::ErrorKind::WouldBlock
}

#[cfg(windows)]
fn open_shared(path: &Path) -> Result<std::fs::File> {
    use std::os::windows::fs::OpenOptionsExt;

    const FILE_SHARE_READ: u32 = 0x0000_0001;
    const ERROR_SHARING_VIOLATION: i32 = 32;

    std::fs::OpenOptions::new()
        .read(true)
        .share_mode(FILE_SHARE_READ)
        .open(path)
        .map_err(|err| {
            if err.raw_os_error() == Some(ERROR_SHARING_VIOLATION) {
                WardenError::FileLocked(path.to_path_buf())
            } else {
                map_open_error(path, err)
            }
        })
}

#[cfg(windows)]
fn probe_exclusive(path: &Path) -> bool {
    const ERROR_SHARING_VIOLATION: i32 = 32;

    match std::fs::OpenOptions::new().write(true).open(path) {
        Ok(_) => false,
        Err(err) => err.raw_os_error() == Some(ERROR_SHARING_VIOLATION),
    }
}

fn map_open_error(path: &Path, err: std::io::Error) -> WardenError {
    if err.kind() == std::io::ErrorKind::NotFound {
        WardenError::FileNotFound(path.to_path_buf())
    } else {
        WardenError::io(format!("Failed to open {}", path.display()), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_visible_until_dropped() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.json");
        fs_err::write(&path, "{}").expect("write");

        assert!(!FileLease::is_held_elsewhere(&path));
        let lease = FileLease::acquire(&path).expect("lease");
        assert_eq!(lease.path(), path.as_path());
        assert!(FileLease::is_held_elsewhere(&path));

        drop(lease);
        assert!(!FileLease::is_held_elsewhere(&path));
    }

    #[test]
    fn shared_leases_coexist() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("warden-agent");
        fs_err::write(&path, "binary").expect("write");

        let _first = FileLease::acquire(&path).expect("first lease");
        let _second = FileLease::acquire(&path).expect("second lease");
    }

    #[test]
    fn missing_file_is_not_found() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.json");
        assert!(matches!(
            FileLease::acquire(&path),
            Err(WardenError::FileNotFound(_))
        ));
        assert!(!FileLease::is_held_elsewhere(&path));
    }
}
