//! File-based manifest locking for cross-process mutual exclusion.
//!
//! Every mutating manifest operation runs under an exclusive OS-level lock on
//! a sibling `.lock` file, so concurrent deployments from separate processes
//! serialize instead of losing updates. The lock is advisory on Unix
//! (`flock`) and mandatory on Windows (`LockFileEx`); it is released when the
//! guard drops and the handle closes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, UpgradesError};

/// Metadata written into the lock file by the current holder, used only for
/// diagnostics when another process times out waiting.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockHolder {
    /// Process id of the holder.
    pub pid: u32,
    /// Unix timestamp at which the lock was taken.
    pub acquired_at_unix: u64,
}

/// RAII guard over an exclusively locked file. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockFileGuard {
    _file: File,
    path: PathBuf,
}

impl LockFileGuard {
    /// Acquire an exclusive lock on `path`, retrying every `retry` until
    /// `timeout` elapses.
    ///
    /// Waiting is bounded: on timeout the error carries whatever holder
    /// metadata could be read from the contended file.
    pub fn acquire(path: &Path, timeout: Duration, retry: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| UpgradesError::io(format!("creating {}", parent.display()), e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| UpgradesError::io(format!("opening lock file {}", path.display()), e))?;

        let deadline = Instant::now() + timeout;
        loop {
            match try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(UpgradesError::LockTimeout {
                            path: path.to_path_buf(),
                            holder: read_holder(path),
                        });
                    }
                    debug!(path = %path.display(), "manifest lock contended, retrying");
                    std::thread::sleep(retry);
                }
                Err(err) => {
                    return Err(UpgradesError::io(
                        format!("locking {}", path.display()),
                        err,
                    ))
                }
            }
        }

        write_holder(&file).map_err(|e| {
            UpgradesError::io(format!("writing lock metadata to {}", path.display()), e)
        })?;

        Ok(LockFileGuard {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock file this guard holds.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_holder(file: &File) -> io::Result<()> {
    let holder = LockHolder {
        pid: std::process::id(),
        acquired_at_unix: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    };
    file.set_len(0)?;
    let mut writer = io::BufWriter::new(file);
    serde_json::to_writer(&mut writer, &holder).map_err(io::Error::other)?;
    writer.flush()
}

/// Best-effort read of the current holder's metadata for diagnostics.
fn read_holder(path: &Path) -> Option<String> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    let holder: LockHolder = serde_json::from_str(&contents).ok()?;
    Some(format!(
        "pid {} since unix time {}",
        holder.pid, holder.acquired_at_unix
    ))
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use rustix::fs::{flock, FlockOperation};
    use std::os::unix::io::AsFd;

    flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
        .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    let handle = file.as_raw_handle() as HANDLE;

    // SAFETY: OVERLAPPED is a plain data struct that is valid when
    // zero-initialized, and the handle is open for the guard's lifetime.
    let result = unsafe {
        let mut overlapped = std::mem::zeroed();
        LockFileEx(
            handle,
            LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
            0,
            1,
            0,
            &mut overlapped,
        )
    };

    if result == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
