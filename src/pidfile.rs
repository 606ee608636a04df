//! # Pidfile claim and lookup.
//!
//! The supervisor claims its pidfile at startup; failure is fatal (exit
//! code 2). A pidfile naming a dead process is stale and is taken over.
//! Liveness is verified with a null signal — pidfiles are never assumed
//! to be atomically consistent with the process table. After a reset the
//! re-exec'd supervisor keeps its pid, so a recorded pid equal to our
//! own is also treated as ours.

use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::LegionError;

/// Holds the claimed pidfile; removed on drop.
pub struct PidClaim {
    path: PathBuf,
}

impl PidClaim {
    /// Claims `path`, refusing when another live instance holds it.
    pub fn claim(path: &Path) -> Result<Self, LegionError> {
        if let Some(pid) = read_pid(path) {
            let own = std::process::id() as i32;
            if pid != own && kill(Pid::from_raw(pid), None).is_ok() {
                return Err(LegionError::PidfileClaim {
                    path: path.to_path_buf(),
                    reason: format!("already held by running pid {pid}"),
                });
            }
            debug!(path = %path.display(), pid, "taking over stale pidfile");
        }
        std::fs::write(path, format!("{}\n", std::process::id())).map_err(|e| {
            LegionError::PidfileClaim {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidClaim {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "pidfile removal failed");
        }
    }
}

/// First whitespace-delimited token of the file as a pid.
pub fn read_pid(path: &Path) -> Option<i32> {
    let text = std::fs::read_to_string(path).ok()?;
    let pid = text.split_whitespace().next()?.parse::<i32>().ok()?;
    (pid > 0).then_some(pid)
}

/// Signals the instance recorded in `path` (`--stop` / `--reset`).
pub fn signal_instance(path: &Path, sig: nix::sys::signal::Signal) -> Result<(), LegionError> {
    let pid = read_pid(path).ok_or_else(|| LegionError::SendSignal {
        reason: format!("no pid in {}", path.display()),
    })?;
    kill(Pid::from_raw(pid), sig).map_err(|e| LegionError::SendSignal {
        reason: format!("kill {pid}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_writes_own_pid_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legiond.pid");
        {
            let _claim = PidClaim::claim(&path).unwrap();
            assert_eq!(read_pid(&path), Some(std::process::id() as i32));
        }
        assert!(!path.exists());
    }

    #[test]
    fn stale_pidfile_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legiond.pid");
        // Far beyond any configured pid_max, so certainly not running.
        std::fs::write(&path, "999999999\n").unwrap();
        let claim = PidClaim::claim(&path);
        assert!(claim.is_ok());
    }

    #[test]
    fn own_pid_is_not_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legiond.pid");
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(PidClaim::claim(&path).is_ok());
    }

    #[test]
    fn signal_instance_without_pidfile_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.pid");
        let err = signal_instance(&path, nix::sys::signal::Signal::SIGTERM).unwrap_err();
        assert!(matches!(err, LegionError::SendSignal { .. }));
    }
}
