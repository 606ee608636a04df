//! # Process slots and restart backoff.
//!
//! A [`ProcessSlot`] is one of a task's identically-configured process
//! instances. Its `instance` number is stable across respawns: slot 2
//! dying respawns slot 2, with the same `Task_instance` and the same
//! resolved pidfile.
//!
//! [`BackoffPolicy`] shapes the cooldown between a slot's exit and its
//! next spawn: an exit within the start-jitter window of its spawn
//! doubles the accumulated delay up to a cap, while an exit after a
//! stable run resets the accumulator to the base delay. The retry
//! deadline is measured from the spawn, so a process that ran for hours
//! restarts immediately while a crash loop is throttled.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use crate::signals::ExitDetail;

/// An exit within this much of the spawn counts as a quick death and
/// escalates the backoff accumulator.
pub const STABLE_WINDOW: Duration = Duration::from_secs(10);

/// Restart backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Base delay between a spawn and the earliest respawn.
    pub first: Duration,
    /// Cap on the accumulated delay.
    pub max: Duration,
    /// Multiplicative growth per quick death.
    pub factor: f64,
    /// Fractional jitter (0.0 disables; 0.1 = ±10%).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    /// 5s base doubling to a 60s cap, no jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(5),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Computes the next delay from the previous one: `first` when there
    /// is no history, otherwise the previous delay grown by `factor`,
    /// capped at `max`.
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        let grown = match prev {
            None => self.first,
            Some(d) => {
                let scaled = d.as_secs_f64() * self.factor;
                if scaled.is_finite() {
                    Duration::from_secs_f64(scaled)
                } else {
                    self.max
                }
            }
        };
        let base = grown.min(self.max);
        if self.jitter > 0.0 {
            let spread = 1.0 + self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
            Duration::from_secs_f64((base.as_secs_f64() * spread).max(0.0)).min(self.max)
        } else {
            base
        }
    }
}

/// Derived lifecycle phase of a slot, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Blocked,
    Delayed,
    Starting,
    Running,
    Stopping,
    Terminated,
    Cooldown,
    Retired,
}

impl SlotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotPhase::Blocked => "blocked",
            SlotPhase::Delayed => "delayed",
            SlotPhase::Starting => "starting",
            SlotPhase::Running => "running",
            SlotPhase::Stopping => "stopping",
            SlotPhase::Terminated => "terminated",
            SlotPhase::Cooldown => "cooldown",
            SlotPhase::Retired => "retired",
        }
    }
}

/// One process instance of a task.
#[derive(Debug, Clone, Default)]
pub struct ProcessSlot {
    /// 0 … count−1, stable across respawns.
    pub instance: u32,
    /// Live pid, when running.
    pub pid: Option<i32>,
    /// True when the process was adopted from a pidfile rather than
    /// spawned; adopted slots survive resets.
    pub adopted: bool,
    /// Monotonic spawn time of the current or last process.
    pub started: Option<Instant>,
    /// Wall-clock spawn time, for status reporting.
    pub started_wall: Option<SystemTime>,
    /// Monotonic time of the last observed exit.
    pub exited: Option<Instant>,
    pub exited_wall: Option<SystemTime>,
    /// Last exit, retained across respawns for the status endpoint.
    pub exit: Option<ExitDetail>,
    /// Backoff accumulator; `None` after a stable run.
    pub cooldown: Option<Duration>,
    /// Earliest next spawn.
    pub retry_at: Option<Instant>,
    /// Escalation signal scheduled by the shrink path.
    pub pending_sig: Option<i32>,
    /// When to deliver `pending_sig`.
    pub next_sig: Option<Instant>,
    /// Pidfile path resolved at spawn time, for adoption bookkeeping.
    pub pidfile: Option<PathBuf>,
}

impl ProcessSlot {
    pub fn new(instance: u32) -> Self {
        Self {
            instance,
            ..Self::default()
        }
    }

    /// Records a (re)spawn.
    pub fn record_spawn(&mut self, pid: i32, now: Instant) {
        self.pid = Some(pid);
        self.adopted = false;
        self.started = Some(now);
        self.started_wall = Some(SystemTime::now());
        self.retry_at = None;
        self.pending_sig = None;
        self.next_sig = None;
    }

    /// Records adoption of a live orphan.
    pub fn record_adoption(&mut self, pid: i32, now: Instant) {
        self.record_spawn(pid, now);
        self.adopted = true;
    }

    /// Records an exit and arms the retry deadline per `policy`.
    /// Returns the cooldown applied, measured from now.
    pub fn record_exit(
        &mut self,
        detail: ExitDetail,
        policy: &BackoffPolicy,
        now: Instant,
    ) -> Duration {
        let started = self.started.unwrap_or(now);
        self.pid = None;
        self.adopted = false;
        self.exited = Some(now);
        self.exited_wall = Some(SystemTime::now());
        self.exit = Some(detail);
        self.pending_sig = None;
        self.next_sig = None;

        let quick_death = now.duration_since(started) < STABLE_WINDOW;
        let delay = if quick_death {
            let next = policy.next(self.cooldown);
            self.cooldown = Some(next);
            next
        } else {
            self.cooldown = None;
            policy.first
        };
        let retry_at = started + delay;
        self.retry_at = Some(retry_at);
        retry_at.saturating_duration_since(now)
    }

    /// A spawn-failure is treated as an immediate terminated transition
    /// with backoff.
    pub fn record_spawn_failure(&mut self, policy: &BackoffPolicy, now: Instant) -> Duration {
        self.started = Some(now);
        self.record_exit(ExitDetail::unknown(), policy, now)
    }

    /// True when the cooldown gate permits a respawn.
    pub fn ready(&self, now: Instant) -> bool {
        self.pid.is_none() && self.retry_at.map_or(true, |at| now >= at)
    }

    /// True while the cooldown gate is holding the slot back.
    pub fn cooling(&self, now: Instant) -> bool {
        self.pid.is_none() && self.retry_at.is_some_and(|at| now < at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::default()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        let d1 = p.next(None);
        assert_eq!(d1, Duration::from_secs(5));
        let d2 = p.next(Some(d1));
        assert_eq!(d2, Duration::from_secs(10));
        let d3 = p.next(Some(Duration::from_secs(40)));
        assert_eq!(d3, Duration::from_secs(60));
        let capped = p.next(Some(Duration::from_secs(600)));
        assert_eq!(capped, Duration::from_secs(60));
    }

    #[test]
    fn quick_deaths_escalate_cooldown() {
        let p = policy();
        let mut slot = ProcessSlot::new(0);
        let t0 = Instant::now();

        slot.record_spawn(100, t0);
        let first = slot.record_exit(ExitDetail::exited(1), &p, t0 + Duration::from_secs(1));
        // 5s from spawn, 1s already elapsed.
        assert_eq!(first, Duration::from_secs(4));

        let t1 = t0 + Duration::from_secs(5);
        slot.record_spawn(101, t1);
        let second = slot.record_exit(ExitDetail::exited(1), &p, t1 + Duration::from_secs(1));
        assert_eq!(second, Duration::from_secs(9));
    }

    #[test]
    fn stable_run_resets_cooldown() {
        let p = policy();
        let mut slot = ProcessSlot::new(0);
        let t0 = Instant::now();

        slot.record_spawn(100, t0);
        slot.record_exit(ExitDetail::exited(1), &p, t0 + Duration::from_secs(1));
        assert!(slot.cooldown.is_some());

        let t1 = t0 + Duration::from_secs(10);
        slot.record_spawn(101, t1);
        // Ran well past the stable window: restart is immediate.
        let wait = slot.record_exit(ExitDetail::exited(0), &p, t1 + Duration::from_secs(3600));
        assert_eq!(wait, Duration::ZERO);
        assert!(slot.cooldown.is_none());
        assert!(slot.ready(t1 + Duration::from_secs(3600)));
    }

    #[test]
    fn instance_is_stable_across_respawns() {
        let p = policy();
        let mut slot = ProcessSlot::new(2);
        let t0 = Instant::now();
        slot.record_spawn(10, t0);
        slot.record_exit(ExitDetail::exited(0), &p, t0 + Duration::from_secs(60));
        slot.record_spawn(11, t0 + Duration::from_secs(61));
        assert_eq!(slot.instance, 2);
        // Last exit is retained for status reporting.
        assert_eq!(slot.exit, Some(ExitDetail::exited(0)));
    }

    #[test]
    fn adoption_marks_slot() {
        let mut slot = ProcessSlot::new(0);
        slot.record_adoption(4242, Instant::now());
        assert!(slot.adopted);
        assert_eq!(slot.pid, Some(4242));
    }
}
