//! # Runtime events emitted by the legion and task runtimes.
//!
//! The [`EventKind`] enum classifies event types across the supervisor:
//! process lifecycle (spawn, exit, backoff, escalation), scope changes,
//! configuration activity, and shutdown progress. The [`Event`] struct
//! carries optional metadata such as task name, slot instance, pid, exit
//! status, and paths.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically, so subscribers can order events delivered through async
//! channels.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Process lifecycle ===
    /// A slot process was forked.
    ProcStarted,
    /// A slot process exited and was reaped.
    ProcExited,
    /// fork/exec failed for a slot.
    SpawnFailed,
    /// A slot entered restart cooldown.
    BackoffScheduled,
    /// A stop escalated from SIGTERM to SIGKILL.
    StopEscalated,
    /// A task exceeded its `time_limit` and is being stopped.
    TimeLimitHit,
    /// A live orphan was adopted from a pidfile at startup.
    OrphanAdopted,

    // === Scope and configuration ===
    /// A task entered the active scope.
    TaskScoped,
    /// A task left the active scope and is being stopped.
    TaskUnscoped,
    /// A new configuration replaced the running one.
    ConfigReloaded,
    /// A configuration load failed; the previous one was retained.
    ConfigRejected,
    /// The active role set changed.
    RolesChanged,
    /// A watched path degraded from native notification to polling.
    WatchDegraded,

    // === Shutdown ===
    /// Stop requested (signal or control plane).
    ShutdownRequested,
    /// Reset requested (SIGHUP or control plane); the supervisor will
    /// re-exec after stopping.
    ResetRequested,
    /// All processes stopped within the stop limit.
    AllStoppedWithin,
    /// The stop limit elapsed with processes still running.
    StopLimitExceeded,

    // === Subscriber plumbing ===
    /// A subscriber dropped an event (queue full or worker closed).
    SubscriberOverflow,
}

/// Runtime event with optional metadata.
///
/// `at` is wall-clock and may go backwards under NTP steps; use it for
/// logging only. `seq` is the ordering authority.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Name of the task, if applicable.
    pub task: Option<String>,
    /// Slot instance, if applicable.
    pub instance: Option<u32>,
    /// Process id, if applicable.
    pub pid: Option<i32>,
    /// Human-readable exit description ("exited 0", "killed by SIGTERM").
    pub status: Option<String>,
    /// Cooldown or delay duration, if relevant.
    pub delay: Option<Duration>,
    /// Filesystem path, if relevant.
    pub path: Option<PathBuf>,
    /// Error message, if the event represents a failure.
    pub error: Option<String>,
}

impl Event {
    /// Creates a new event of the given kind with the current timestamp
    /// and next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            task: None,
            instance: None,
            pid: None,
            status: None,
            delay: None,
            path: None,
            error: None,
        }
    }

    /// Attaches a task name.
    pub fn with_task(mut self, name: impl Into<String>) -> Self {
        self.task = Some(name.into());
        self
    }

    /// Attaches a slot instance.
    pub fn with_instance(mut self, instance: u32) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Attaches a pid.
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches a human-readable exit description.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Attaches a delay duration.
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    /// Attaches a path.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }

    /// Creates a subscriber overflow event.
    pub fn subscriber_overflow(subscriber: &'static str) -> Self {
        Event::now(EventKind::SubscriberOverflow).with_error(format!("subscriber={subscriber}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_monotonic() {
        let a = Event::now(EventKind::ProcStarted);
        let b = Event::now(EventKind::ProcExited);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn builder_attaches_metadata() {
        let ev = Event::now(EventKind::ProcExited)
            .with_task("ntpd")
            .with_instance(2)
            .with_pid(4242)
            .with_status("exited 0");
        assert_eq!(ev.task.as_deref(), Some("ntpd"));
        assert_eq!(ev.instance, Some(2));
        assert_eq!(ev.pid, Some(4242));
        assert_eq!(ev.status.as_deref(), Some("exited 0"));
    }
}
