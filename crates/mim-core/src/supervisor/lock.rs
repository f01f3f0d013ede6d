//! Singleton lock: one pipeline per state directory.
//!
//! The lock file holds the owning pid. A live owner refuses startup with a
//! distinguishable error; a dead owner's lock is reclaimed.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Exit code the CLI uses when another instance owns the lock.
pub const EXIT_ALREADY_RUNNING: i32 = 3;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance is running (pid {0})")]
    AlreadyRunning(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Held singleton lock; releases on drop when still owned by this process.
#[derive(Debug)]
pub struct SingletonLock {
    path: PathBuf,
    pid: u32,
}

impl SingletonLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(owner) = contents.trim().parse::<u32>() {
                if owner != std::process::id() && pid_alive(owner) {
                    return Err(LockError::AlreadyRunning(owner));
                }
                tracing::info!(owner, "reclaiming stale singleton lock");
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pid = std::process::id();
        std::fs::write(path, pid.to_string())?;
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    /// Explicit release for orderly shutdown paths.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim() == self.pid.to_string() => {
                let _ = std::fs::remove_file(&self.path);
            }
            // Someone else reclaimed it; leave their lock alone.
            _ => {}
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything. EPERM
    // still means the process exists, just not ours to signal.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Without a liveness probe, assume stale: single-user devices restart
    // far more often than they race two instances.
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid_and_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.pid");
        {
            let _lock = SingletonLock::acquire(&path).unwrap();
            let contents = std::fs::read_to_string(&path).unwrap();
            assert_eq!(contents, std::process::id().to_string());
        }
        assert!(!path.exists(), "lock removed on drop");
    }

    #[test]
    fn live_owner_refuses_second_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.pid");
        let _held = SingletonLock::acquire(&path).unwrap();
        // Same pid re-acquires (restart within one process is allowed), so
        // simulate a different live owner with our parent-ish pid 1.
        std::fs::write(&path, "1").unwrap();
        match SingletonLock::acquire(&path) {
            Err(LockError::AlreadyRunning(pid)) => assert_eq!(pid, 1),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn dead_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.pid");
        // Pid values this large cannot exist on Linux (max ~4M).
        std::fs::write(&path, "999999999").unwrap();
        let _lock = SingletonLock::acquire(&path).expect("dead owner reclaimed");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }
}
