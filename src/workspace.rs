//! Single-instance lock and sync-root bootstrap (§4.6.1 step 1-2, §10.6).
//!
//! The lock mechanism is kept verbatim from the host's `WorkspaceLock`
//! (flock on Unix, create_new-based emulation on Windows); `ensure_dropbox_dir`
//! replaces the host's ACL-file bootstrap with this engine's much smaller
//! requirement — the sync root and its metadata directory must exist and be
//! writable, or startup fails with `NoDropboxDirError` (§7).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::errors::SyncErrorKind;

#[derive(Debug)]
pub struct WorkspaceLockedError;

impl std::fmt::Display for WorkspaceLockedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "another process already holds the sync lock")
    }
}

impl std::error::Error for WorkspaceLockedError {}

#[derive(Debug)]
pub struct WorkspaceLock {
    #[allow(dead_code)]
    file: fs::File,
    path: PathBuf,
}

/// Verifies `dropbox_path` exists (creating it if absent) and is writable,
/// and that the metadata directory alongside `state_dir` is usable.
pub fn ensure_dropbox_dir(dropbox_path: &Path) -> Result<(), SyncErrorKind> {
    if !dropbox_path.exists() {
        fs::create_dir_all(dropbox_path)
            .map_err(|e| SyncErrorKind::NoDropboxDir(format!("{}: {e}", dropbox_path.display())))?;
    }
    if !dropbox_path.is_dir() {
        return Err(SyncErrorKind::NoDropboxDir(format!("{} is not a directory", dropbox_path.display())));
    }
    let probe = dropbox_path.join(".dropsync-write-probe");
    fs::write(&probe, b"").map_err(|e| {
        SyncErrorKind::NoDropboxDir(format!("{} is not writable: {e}", dropbox_path.display()))
    })?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

impl WorkspaceLock {
    pub fn try_lock(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).with_context(|| format!("create {}", state_dir.display()))?;
        let lock_path = state_dir.join("dropsync.lock");
        let file = open_lock_file(&lock_path)?;
        lock_file(&file).context("lock")?;

        Ok(Self { file, path: lock_path })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn lock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;

    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let raw = err.raw_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock || raw == Some(11) || raw == Some(35) {
        return Err(WorkspaceLockedError.into());
    }
    Err(err).context("flock")
}

#[cfg(unix)]
fn unlock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_UN: i32 = 8;
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).context("flock unlock")
    }
}

#[cfg(windows)]
fn lock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(windows)]
fn unlock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("open {}", lock_path.display()))
}

#[cfg(windows)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    let file = fs::OpenOptions::new().read(true).write(true).create_new(true).open(lock_path);
    match file {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(WorkspaceLockedError.into()),
        Err(e) => Err(e).with_context(|| format!("open {}", lock_path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dropbox_dir_creates_and_accepts_missing_root() {
        let tmp = std::env::temp_dir().join(format!("dropsync-workspace-test-{}", uuid::Uuid::new_v4()));
        ensure_dropbox_dir(&tmp).unwrap();
        assert!(tmp.is_dir());
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn workspace_lock_is_exclusive_and_released_on_drop() {
        let tmp = std::env::temp_dir().join(format!("dropsync-workspace-lock-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&tmp).unwrap();

        let lock1 = WorkspaceLock::try_lock(&tmp).unwrap();
        let err = WorkspaceLock::try_lock(&tmp).unwrap_err();
        let mut found = false;
        for cause in err.chain() {
            if cause.is::<WorkspaceLockedError>() {
                found = true;
                break;
            }
        }
        assert!(found, "expected WorkspaceLockedError, got: {err:#}");

        drop(lock1);
        let _lock2 = WorkspaceLock::try_lock(&tmp).unwrap();
        let _ = fs::remove_dir_all(&tmp);
    }
}
