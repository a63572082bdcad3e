//! Single-instance lock file (§5, §6: `bot.lock`).
//!
//! Contains the owning process's PID. A stale lock — one whose PID no
//! longer corresponds to a running process — is reclaimed automatically;
//! a live lock is a fatal startup condition per §7.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(i32),
    #[error("I/O error managing lock file: {0}")]
    Io(#[from] std::io::Error),
}

/// Acquire `path`, reclaiming it first if the PID it names is dead.
/// Returns a guard that removes the file on drop.
pub struct LockGuard {
    path: std::path::PathBuf,
}

impl LockGuard {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();

        if let Ok(existing) = fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<i32>() {
                if pid_is_alive(pid) {
                    return Err(LockError::AlreadyRunning(pid));
                }
                warn!(pid, path = %path.display(), "reclaiming stale lock file");
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, std::process::id().to_string())?;
        info!(path = %path.display(), pid = std::process::id(), "acquired single-instance lock");
        Ok(Self { path })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Signal 0 performs no actual signalling, only existence/permission checks.
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_reclaim_a_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.lock");
        fs::write(&path, "999999999").unwrap();
        let guard = LockGuard::acquire(&path);
        assert!(guard.is_ok());
    }

    #[test]
    fn second_acquire_against_a_live_pid_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.lock");
        fs::write(&path, std::process::id().to_string()).unwrap();
        let result = LockGuard::acquire(&path);
        assert!(matches!(result, Err(LockError::AlreadyRunning(_))));
    }
}
