//! Named cross-process lock keyed by the public address
//!
//! The lock is an exclusively held file in the lock directory. It is released
//! when the guard is dropped or the owning process dies, whichever comes first.

use crate::config::HostAddress;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Guard for an acquired lock; dropping it releases the lock
#[derive(Debug)]
pub struct NamedLock {
    _file: File,
    path: PathBuf,
}

impl NamedLock {
    /// Lock file path for a public address
    pub fn path_for(lock_dir: &Path, address: &HostAddress) -> PathBuf {
        let host: String = address
            .host()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        lock_dir.join(format!("ollamamux-{}-{}.lock", host, address.port()))
    }

    /// Try to take the lock for `address` without blocking.
    ///
    /// Returns `Ok(None)` when another process (or another guard in this
    /// process) holds it.
    pub fn try_acquire(lock_dir: &Path, address: &HostAddress) -> std::io::Result<Option<Self>> {
        std::fs::create_dir_all(lock_dir)?;
        let path = Self::path_for(lock_dir, address);

        match platform::try_lock(&path)? {
            Some(file) => {
                debug!(path = %path.display(), "Gateway lock acquired");
                Ok(Some(Self { _file: file, path }))
            }
            None => {
                debug!(path = %path.display(), "Gateway lock held elsewhere");
                Ok(None)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly (equivalent to dropping)
    pub fn release(self) {
        debug!(path = %self.path.display(), "Gateway lock released");
    }
}

#[cfg(unix)]
mod platform {
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    pub fn try_lock(path: &Path) -> std::io::Result<Option<File>> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // flock locks belong to the open file description, so a second open
        // in this process conflicts just like another process would.
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        // Record the owner for diagnostics
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Some(file))
    }
}

#[cfg(windows)]
mod platform {
    use std::fs::File;
    use std::io::Write;
    use std::os::windows::fs::OpenOptionsExt;
    use std::path::Path;

    const ERROR_SHARING_VIOLATION: i32 = 32;
    const ERROR_LOCK_VIOLATION: i32 = 33;

    pub fn try_lock(path: &Path) -> std::io::Result<Option<File>> {
        // share_mode(0) denies every other open until this handle closes
        let opened = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .share_mode(0)
            .open(path);

        match opened {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Some(file))
            }
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(ERROR_SHARING_VIOLATION) | Some(ERROR_LOCK_VIOLATION)
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
