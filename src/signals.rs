//! # Signal names, exit-status formatting, and OS signal sources.
//!
//! Configured event actions may name signals as `NAME`, `SIGNAME`, or a
//! decimal number; [`signum`] accepts all forms (case-insensitive) and
//! [`signame`] renders the symbolic name back. [`ExitDetail`] captures a
//! reaped wait status in a shape the status endpoint and logs can share.
//!
//! [`SignalSources`] installs the tokio signal streams for SIGTERM,
//! SIGINT, and SIGHUP and forwards each delivery into the poller as a
//! [`Stimulus::Signal`](crate::poller::Stimulus). SIGCHLD is not handled
//! here: child exits are observed through the per-child wait futures that
//! feed [`Stimulus::ChildExit`](crate::poller::Stimulus).

use std::fmt;

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::error;

use crate::poller::{SignalEvent, Stimulus};

/// Determines a signal number from its name.
///
/// Accepted forms: decimal number, `SIGNAME`, `signame`, `NAME`, `name`.
pub fn signum(name: &str) -> Option<i32> {
    let trimmed = name.trim();
    if let Ok(n) = trimmed.parse::<i32>() {
        return Signal::try_from(n).ok().map(|s| s as i32);
    }
    let upper = trimmed.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper.clone()
    } else {
        format!("SIG{upper}")
    };
    Signal::iterator()
        .find(|s| s.as_str() == full)
        .map(|s| s as i32)
}

/// Produces a symbolic signal name for a signal number.
///
/// Unknown numbers render as `SIG<n>` rather than failing.
pub fn signame(sig: i32) -> String {
    match Signal::try_from(sig) {
        Ok(s) => s.as_str().to_string(),
        Err(_) => format!("SIG{sig}"),
    }
}

/// How a reaped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitDetail {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when it died on one.
    pub signal: Option<i32>,
    /// Whether a core was dumped.
    pub core_dumped: bool,
}

impl ExitDetail {
    /// Normal exit with the given code.
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
            core_dumped: false,
        }
    }

    /// Death by signal.
    pub fn signaled(sig: i32, core_dumped: bool) -> Self {
        Self {
            code: None,
            signal: Some(sig),
            core_dumped,
        }
    }

    /// An exit observed only indirectly (adopted orphan disappeared);
    /// neither code nor signal is known.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            core_dumped: false,
        }
    }

    /// Builds from a [`std::process::ExitStatus`].
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            Self::signaled(sig, status.core_dumped())
        } else {
            Self::exited(status.code().unwrap_or(0))
        }
    }

    /// True for a clean exit with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }

    /// The numeric status reported by the status endpoint: the exit code,
    /// or 128+signal for a signal death, mirroring shell conventions.
    pub fn status_code(&self) -> Option<i32> {
        match (self.code, self.signal) {
            (Some(c), _) => Some(c),
            (None, Some(s)) => Some(128 + s),
            (None, None) => None,
        }
    }
}

impl fmt::Display for ExitDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (_, Some(sig)) => write!(f, "died on {}", signame(sig))?,
            (Some(code), None) if code > 0 => write!(f, "exited {code}")?,
            (Some(_), None) => write!(f, "exited ok")?,
            (None, None) => write!(f, "exited (status unknown)")?,
        }
        if self.core_dumped {
            write!(f, " (core dumped)")?;
        }
        Ok(())
    }
}

/// Installs SIGTERM/SIGINT/SIGHUP streams and forwards deliveries into
/// the given stimulus channel.
///
/// The streams live for the life of the process; handlers are installed
/// once, so a second construction would share the same dispositions.
pub struct SignalSources;

impl SignalSources {
    pub fn install(tx: mpsc::UnboundedSender<Stimulus>) -> std::io::Result<Self> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut hup = signal(SignalKind::hangup())?;

        let fwd = tx.clone();
        tokio::spawn(async move {
            while term.recv().await.is_some() {
                if fwd.send(Stimulus::Signal(SignalEvent::Terminate)).is_err() {
                    return;
                }
            }
            error!("SIGTERM stream closed");
        });
        let fwd = tx.clone();
        tokio::spawn(async move {
            while int.recv().await.is_some() {
                if fwd.send(Stimulus::Signal(SignalEvent::Interrupt)).is_err() {
                    return;
                }
            }
        });
        tokio::spawn(async move {
            while hup.recv().await.is_some() {
                if tx.send(Stimulus::Signal(SignalEvent::Hangup)).is_err() {
                    return;
                }
            }
        });
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signum_accepts_all_forms() {
        let term = Signal::SIGTERM as i32;
        assert_eq!(signum("TERM"), Some(term));
        assert_eq!(signum("term"), Some(term));
        assert_eq!(signum("SIGTERM"), Some(term));
        assert_eq!(signum("sigterm"), Some(term));
        assert_eq!(signum(&term.to_string()), Some(term));
    }

    #[test]
    fn signum_rejects_garbage() {
        assert_eq!(signum("NOSUCHSIG"), None);
        assert_eq!(signum("99999"), None);
        assert_eq!(signum(""), None);
    }

    #[test]
    fn signame_round_trips() {
        let hup = Signal::SIGHUP as i32;
        assert_eq!(signame(hup), "SIGHUP");
        assert_eq!(signum(&signame(hup)), Some(hup));
    }

    #[test]
    fn exit_detail_formats() {
        assert_eq!(ExitDetail::exited(0).to_string(), "exited ok");
        assert_eq!(ExitDetail::exited(3).to_string(), "exited 3");
        let term = Signal::SIGTERM as i32;
        assert_eq!(
            ExitDetail::signaled(term, false).to_string(),
            "died on SIGTERM"
        );
        assert_eq!(
            ExitDetail::signaled(term, true).to_string(),
            "died on SIGTERM (core dumped)"
        );
    }

    #[test]
    fn exit_detail_success() {
        assert!(ExitDetail::exited(0).success());
        assert!(!ExitDetail::exited(1).success());
        assert!(!ExitDetail::signaled(9, false).success());
        assert_eq!(ExitDetail::signaled(9, false).status_code(), Some(137));
    }
}
