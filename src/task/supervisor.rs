//! # TaskRuntime: per-task state machine and process pool manager.
//!
//! One runtime per declared task. The legion drives it with `manage()`
//! on every loop pass; the runtime decides what one transition to
//! attempt: spawn missing slots, enforce `count` by shrinking, gate on
//! `requires`, apply `start_delay`, enforce `time_limit`, or push a stop
//! toward SIGKILL.
//!
//! ## State flags
//! Task-level phases are timestamps, `None` until the phase is entered:
//! `starting` (spawn issued), `started` (start_delay elapsed; dependents
//! may proceed and the time-limit clock runs), `stopping` (stop
//! commenced; set at spawn for run-to-completion controls), `terminated`
//! (the built-in stop mechanism fired), `killed` (escalated), `stopped`
//! (no processes remain). Per-slot state lives in [`ProcessSlot`].
//!
//! ## Stop semantics
//! The built-in stop sends SIGTERM and escalates to SIGKILL after 5
//! seconds. A configured `stop` event replaces the SIGTERM (a `restart`
//! event wins during resets); the escalation still applies. Exceeding
//! `time_limit` is equivalent to a stop, after which a `wait` control
//! respawns.
//!
//! A runtime never propagates errors to the legion: every failure is
//! logged, published on the bus, and absorbed into backoff state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::TaskError;
use crate::events::{Bus, Event, EventKind};
use crate::poller::Stimulus;
use crate::signals::{signame, ExitDetail};

use super::slot::{BackoffPolicy, ProcessSlot, SlotPhase};
use super::spawn::{self, Identity, SpawnRequest};
use super::spec::{ControlMode, EventAction, EventBind, TaskSpec};

/// Seconds before a SIGTERM sent to a task escalates to SIGKILL.
pub const SIGKILL_ESCALATION: Duration = Duration::from_secs(5);

/// Repeated "waiting on requires" messages are damped to this interval.
const REPETITION_LIMIT: Duration = Duration::from_secs(60);

/// Global layers and host facts the legion computes once per apply.
#[derive(Debug, Clone, Default)]
pub struct ContextSeed {
    /// Environment snapshot taken at supervisor startup, `Task_*` keys
    /// stripped.
    pub base: Context,
    pub defines: BTreeMap<String, String>,
    pub defaults: BTreeMap<String, String>,
    pub role_defines: BTreeMap<String, BTreeMap<String, String>>,
    pub role_defaults: BTreeMap<String, BTreeMap<String, String>>,
    /// Active roles in declaration order; `None` inhibits role gating.
    pub active_roles: Option<Vec<String>>,
    /// Roles declared with `= value`, injected as `Task_role_<name>`.
    pub role_values: Vec<(String, String)>,
    /// `settings.all_roles`.
    pub all_roles: bool,
    pub host: String,
    pub fqdn: String,
    /// The supervisor's own pid (`Task_ppid`).
    pub ppid: i32,
}

/// Per-call environment handed down by the legion.
pub struct TaskCtx<'a> {
    pub seed: &'a ContextSeed,
    pub bus: &'a Bus,
    pub exit_tx: &'a mpsc::UnboundedSender<Stimulus>,
    pub now: Instant,
    /// The legion is shutting down; nothing restarts.
    pub exiting: bool,
    /// The shutdown is a reset; `restart` events fire in place of `stop`.
    pub resetting: bool,
}

/// Side effects the legion applies after a runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEffect {
    /// A slot process was forked (or adopted); record pid ownership.
    SlotSpawned { pid: i32, instance: u32 },
    /// A utility command was forked; record pid ownership.
    UtilitySpawned { pid: i32, command: String },
    /// `onexit: start` asks the named `once` task to run again.
    RearmOnce { task: String },
}

/// What dependents need to know about a required task.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqSnapshot {
    /// Run-to-completion control (`once`/`event`).
    pub once: bool,
    /// Started and past its `start_delay`.
    pub started: bool,
    /// Stopped with a clean exit.
    pub completed_ok: bool,
}

/// A watch the runtime wants while its current spec is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchRequest {
    Path { path: PathBuf, action: EventAction },
    Modules { script: PathBuf, action: EventAction },
}

/// `/status/tasks` projection of one slot.
#[derive(Debug, Clone, Serialize)]
pub struct ProcStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_t: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_t: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<String>,
}

/// `/status/tasks` projection of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub control: &'static str,
    pub count: u32,
    pub scoped: bool,
    pub processes: Vec<ProcStatus>,
}

fn iso8601(t: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(t)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn epoch(t: SystemTime) -> f64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Mutable per-task state, persisting across reloads while the task name
/// survives.
pub struct TaskRuntime {
    spec: TaskSpec,
    pending: Option<TaskSpec>,
    applied: bool,
    context: Context,
    slots: Vec<ProcessSlot>,
    backoff: BackoffPolicy,
    starting: Option<Instant>,
    started: Option<Instant>,
    stopping: Option<Instant>,
    terminated: Option<Instant>,
    killed: Option<Instant>,
    stopped: Option<Instant>,
    /// Do Not Resuscitate: removed from configuration; delete after stop.
    dnr: bool,
    /// Absolute time-limit deadline, armed at `mark_started`.
    limit: Option<Instant>,
    last_exit: Option<ExitDetail>,
    last_wait_log: Option<Instant>,
    /// Resolved executable path, recomputed on apply.
    exec_path: Option<PathBuf>,
    /// Utility command pids (event actions, stop commands).
    utilities: BTreeMap<i32, String>,
}

impl TaskRuntime {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            pending: Some(spec.clone()),
            spec,
            applied: false,
            context: Context::new(),
            slots: Vec::new(),
            backoff: BackoffPolicy::default(),
            starting: None,
            started: None,
            stopping: None,
            terminated: None,
            killed: None,
            stopped: None,
            dnr: false,
            limit: None,
            last_exit: None,
            last_wait_log: None,
            exec_path: None,
            utilities: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// The spec scope decisions should use: pending when staged.
    pub fn effective_spec(&self) -> &TaskSpec {
        self.pending.as_ref().unwrap_or(&self.spec)
    }

    /// Stages a new spec for the next `apply()`.
    pub fn set_pending(&mut self, spec: TaskSpec) {
        self.pending = Some(spec);
    }

    /// Marks the task for deletion once stopped (removed from config).
    pub fn mark_delete(&mut self) {
        self.dnr = true;
    }

    pub fn is_marked_delete(&self) -> bool {
        self.dnr
    }

    /// True when the legion may drop this runtime.
    pub fn is_deletable(&self) -> bool {
        self.dnr && self.alive_count() == 0
    }

    pub fn alive_count(&self) -> usize {
        self.slots.iter().filter(|s| s.pid.is_some()).count()
    }

    pub fn pids(&self) -> Vec<i32> {
        self.slots.iter().filter_map(|s| s.pid).collect()
    }

    pub fn owns_pid(&self, pid: i32) -> bool {
        self.slots.iter().any(|s| s.pid == Some(pid)) || self.utilities.contains_key(&pid)
    }

    /// True when every live slot was adopted; such tasks survive resets.
    pub fn fully_adopted(&self) -> bool {
        let live: Vec<_> = self.slots.iter().filter(|s| s.pid.is_some()).collect();
        !live.is_empty() && live.iter().all(|s| s.adopted)
    }

    /// What dependents may conclude about this task.
    pub fn req_snapshot(&self) -> ReqSnapshot {
        ReqSnapshot {
            once: self.spec.control.is_once(),
            started: self.started.is_some(),
            completed_ok: self.stopped.is_some()
                && self.last_exit.as_ref().is_some_and(ExitDetail::success),
        }
    }

    fn reset_state(&mut self) {
        self.starting = None;
        self.started = None;
        self.stopping = None;
        self.terminated = None;
        self.killed = None;
        self.stopped = None;
        self.limit = None;
    }

    /// Re-arms a `once` task so it runs again (upstream `onexit: start`).
    pub fn rearm(&mut self) {
        info!(task = %self.spec.name, "marked to run again");
        self.reset_state();
    }

    // ------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------

    /// Builds the task-level context from the configured layers.
    fn build_context(&self, seed: &ContextSeed, spec: &TaskSpec) -> Context {
        let mut ctx = seed.base.clone();
        for (role, value) in &seed.role_values {
            ctx.define(format!("Task_role_{role}"), value.clone());
        }
        let roles_storage;
        let roles: &[String] = match &seed.active_roles {
            Some(r) => r,
            None => {
                roles_storage = Vec::new();
                &roles_storage
            }
        };
        ctx.apply_defaults(&seed.defaults, &seed.role_defaults, roles);
        ctx.apply_defaults(&spec.defaults, &spec.role_defaults, roles);
        ctx.apply_defines(&seed.defines, &seed.role_defines, roles);
        ctx.apply_defines(&spec.defines, &spec.role_defines, roles);

        ctx.define("Task_name", spec.name.clone());
        ctx.define("Task_ppid", seed.ppid.to_string());
        ctx.define("Task_host", seed.host.clone());
        ctx.define("Task_fqdn", seed.fqdn.clone());
        if let Some(user) = &spec.user {
            let resolved = ctx.subst(user);
            ctx.define("Task_user", resolved);
        }
        if let Some(group) = &spec.group {
            let resolved = ctx.subst(group);
            ctx.define("Task_group", resolved);
        }
        if let Some(cwd) = &spec.cwd {
            let resolved = ctx.subst(cwd);
            ctx.define("Task_cwd", resolved);
        }
        ctx
    }

    /// Per-slot context: the task context plus slot injections.
    fn slot_context(&self, instance: u32, identity: &Identity) -> Context {
        let mut ctx = self.context.clone();
        ctx.define("Task_instance", instance.to_string());
        if let Some(uid) = identity.uid {
            ctx.define("Task_uid", uid.to_string());
        }
        if let Some(gid) = identity.gid {
            ctx.define("Task_gid", gid.to_string());
        }
        if let Some(pidfile) = &self.spec.pidfile {
            let resolved = ctx.subst(pidfile);
            ctx.define("Task_pidfile", resolved);
        }
        ctx
    }

    /// True when the staged config or its context would change the
    /// running processes. Keys that only steer scheduling (`control`,
    /// `count`, `pidfile`, `onexit`, `requires`, `start_delay`) do not
    /// force a restart.
    fn command_change(&self, pending: &TaskSpec, new_context: &Context) -> bool {
        if !self.applied {
            return true;
        }
        let a = &self.spec;
        let core_equal = a.commands == pending.commands
            && a.events == pending.events
            && a.user == pending.user
            && a.group == pending.group
            && a.cwd == pending.cwd
            && a.procname == pending.procname
            && a.time_limit == pending.time_limit
            && a.roles == pending.roles;
        !core_equal || self.context != *new_context
    }

    // ------------------------------------------------------------------
    // Apply / reload
    // ------------------------------------------------------------------

    /// Makes the staged spec the running spec, stopping the processes
    /// first when the command or context changed. Returns true when a
    /// revisit is wanted soon.
    pub fn apply(&mut self, ctx: &TaskCtx<'_>, out: &mut Vec<TaskEffect>) -> bool {
        let pending = match self.pending.take() {
            Some(p) => p,
            None => self.spec.clone(),
        };
        let new_context = self.build_context(ctx.seed, &pending);
        let mut revisit = false;
        if self.command_change(&pending, &new_context) && self.alive_count() > 0 {
            debug!(task = %self.spec.name, "configuration change requires restart");
            revisit = self.stop_with(ctx, true, out);
        }
        self.spec = pending;
        self.context = new_context;
        self.applied = true;
        self.exec_path = self.resolve_exec_path();
        revisit
    }

    fn resolve_exec_path(&self) -> Option<PathBuf> {
        let argv = self
            .spec
            .commands
            .get("start")
            .map(|v| self.context.resolve_list(v))?;
        let first = argv.first()?;
        spawn::lookup_path(first, self.context.get("PATH"))
    }

    /// The watches this task wants while its spec is active.
    pub fn watch_requests(&self) -> Vec<WatchRequest> {
        let mut out = Vec::new();
        for ev in &self.spec.events {
            match ev.bind {
                EventBind::FileChange => {
                    if let Some(paths) = &ev.paths {
                        for path in self.context.resolve_list(paths) {
                            out.push(WatchRequest::Path {
                                path: PathBuf::from(path),
                                action: ev.action.clone(),
                            });
                        }
                    }
                }
                EventBind::SelfExe => match &self.exec_path {
                    Some(path) => out.push(WatchRequest::Path {
                        path: path.clone(),
                        action: ev.action.clone(),
                    }),
                    None => warn!(task = %self.spec.name, "self event without resolvable executable"),
                },
                EventBind::Python => match &self.exec_path {
                    Some(path) => out.push(WatchRequest::Modules {
                        script: path.clone(),
                        action: ev.action.clone(),
                    }),
                    None => warn!(task = %self.spec.name, "python event without resolvable script"),
                },
                EventBind::Stop | EventBind::Restart => {}
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Manage
    // ------------------------------------------------------------------

    /// One management pass. Returns true to request a short revisit.
    pub fn manage(
        &mut self,
        ctx: &TaskCtx<'_>,
        reqs: &BTreeMap<String, ReqSnapshot>,
        out: &mut Vec<TaskEffect>,
    ) -> bool {
        if self.stopping.is_some() {
            return self.stop_with(ctx, false, out);
        }
        if let (Some(_), Some(limit)) = (self.started, self.limit) {
            if ctx.now >= limit {
                ctx.bus
                    .publish(Event::now(EventKind::TimeLimitHit).with_task(&self.spec.name));
                return self.stop_with(ctx, false, out);
            }
        }
        if ctx.exiting {
            return false;
        }
        self.start_cycle(ctx, reqs, out)
    }

    fn start_cycle(
        &mut self,
        ctx: &TaskCtx<'_>,
        reqs: &BTreeMap<String, ReqSnapshot>,
        out: &mut Vec<TaskEffect>,
    ) -> bool {
        let now = ctx.now;
        let once = self.spec.control.is_once();

        // Event tasks behave as if they already ran at bring-up; only an
        // event action re-arms them.
        if self.spec.control == ControlMode::Event && self.stopped.is_none() {
            self.stopped = Some(now);
        }
        if self.stopped.is_some() {
            if self.dnr || once {
                return false;
            }
            debug!(task = %self.spec.name, "restarting stopped task");
            self.reset_state();
        }

        // start_delay: spawned, waiting to count as started.
        if let (Some(starting), None) = (self.starting, self.started) {
            if now >= starting + self.spec.start_delay {
                self.mark_started(now);
                return false;
            }
            return true;
        }

        // Dependency gate. A task that already started skips the check;
        // its dependencies dying later does not stop it.
        if self.started.is_none() {
            for name in &self.spec.requires.clone() {
                let snapshot = reqs.get(name).copied().unwrap_or_default();
                let satisfied = if snapshot.once {
                    snapshot.completed_ok
                } else {
                    snapshot.started
                };
                if !satisfied {
                    let log_due = self
                        .last_wait_log
                        .map_or(true, |at| now >= at + REPETITION_LIMIT);
                    if log_due {
                        info!(
                            task = %self.spec.name,
                            waiting_on = %name,
                            "waiting on required task"
                        );
                        self.last_wait_log = Some(now);
                    }
                    return true;
                }
            }
        }
        self.last_wait_log = None;

        let needed = self.spec.count as usize;
        let running = self.alive_count();
        if needed < running {
            self.shrink(needed, ctx);
            return false;
        }
        if needed == running {
            return false;
        }

        if once {
            // Run-to-completion controls are stopping the moment they
            // start.
            self.stopping = Some(now);
        }
        if self.starting.is_none() {
            self.starting = Some(now);
            if self.spec.start_delay.is_zero() {
                self.mark_started(now);
            }
        }

        while self.slots.len() < needed {
            let instance = self.slots.len() as u32;
            self.slots.push(ProcessSlot::new(instance));
        }
        for instance in 0..needed {
            if self.slots[instance].pid.is_some() || !self.slots[instance].ready(now) {
                continue;
            }
            self.spawn_slot(instance as u32, ctx, out);
        }
        false
    }

    fn mark_started(&mut self, now: Instant) {
        self.started = Some(now);
        if let Some(limit) = self.spec.time_limit {
            debug!(task = %self.spec.name, ?limit, "time limit armed");
            self.limit = Some(now + limit);
        }
    }

    fn spawn_slot(&mut self, instance: u32, ctx: &TaskCtx<'_>, out: &mut Vec<TaskEffect>) {
        match self.try_spawn_slot(instance, ctx) {
            Ok(pid) => {
                self.slots[instance as usize].record_spawn(pid, ctx.now);
                out.push(TaskEffect::SlotSpawned { pid, instance });
                ctx.bus.publish(
                    Event::now(EventKind::ProcStarted)
                        .with_task(&self.spec.name)
                        .with_instance(instance)
                        .with_pid(pid),
                );
            }
            Err(e) => {
                error!(task = %self.spec.name, instance, error = %e, "spawn failed");
                let delay =
                    self.slots[instance as usize].record_spawn_failure(&self.backoff, ctx.now);
                ctx.bus.publish(
                    Event::now(EventKind::SpawnFailed)
                        .with_task(&self.spec.name)
                        .with_instance(instance)
                        .with_error(e.to_string()),
                );
                ctx.bus.publish(
                    Event::now(EventKind::BackoffScheduled)
                        .with_task(&self.spec.name)
                        .with_instance(instance)
                        .with_delay(delay),
                );
            }
        }
    }

    fn try_spawn_slot(&mut self, instance: u32, ctx: &TaskCtx<'_>) -> Result<i32, TaskError> {
        let identity = spawn::resolve_identity(
            &self.spec.name,
            self.spec
                .user
                .as_ref()
                .map(|u| self.context.subst(u))
                .as_deref(),
            self.spec
                .group
                .as_ref()
                .map(|g| self.context.subst(g))
                .as_deref(),
        )?;
        let slot_ctx = self.slot_context(instance, &identity);
        let argv = self
            .spec
            .commands
            .get("start")
            .map(|v| slot_ctx.resolve_list(v))
            .unwrap_or_default();
        if argv.is_empty() {
            return Err(TaskError::NoStartCommand {
                task: self.spec.name.clone(),
            });
        }
        let procname = self.spec.procname.as_ref().map(|p| slot_ctx.subst(p));
        let cwd = slot_ctx.get("Task_cwd").map(str::to_string);
        let pidfile = slot_ctx.get("Task_pidfile").map(PathBuf::from);
        let req = SpawnRequest {
            task: self.spec.name.clone(),
            instance,
            argv,
            procname,
            env: slot_ctx.to_env(),
            cwd,
            identity,
        };
        let pid = spawn::spawn(&req, ctx.exit_tx)?;
        self.slots[instance as usize].pidfile = pidfile;
        Ok(pid)
    }

    /// Reduces the pool to `needed` slots with TERM→KILL escalation, and
    /// retires surplus slots once their processes are gone.
    fn shrink(&mut self, needed: usize, ctx: &TaskCtx<'_>) {
        let now = ctx.now;
        let mut signalled = 0;
        let mut to_signal: Vec<(i32, i32)> = Vec::new();
        for slot in self.slots.iter_mut().skip(needed) {
            let Some(pid) = slot.pid else { continue };
            if slot.pending_sig.is_none() {
                slot.pending_sig = Some(libc_term());
            }
            let due = slot.next_sig.map_or(true, |at| now >= at);
            if due {
                let sig = slot.pending_sig.unwrap_or_else(libc_term);
                to_signal.push((pid, sig));
                signalled += 1;
                slot.pending_sig = Some(libc_kill());
                slot.next_sig = Some(now + SIGKILL_ESCALATION);
            }
        }
        for (pid, sig) in to_signal {
            signal_pid(&self.spec.name, pid, sig);
        }
        self.slots
            .retain(|s| (s.instance as usize) < needed || s.pid.is_some());
        if signalled > 0 {
            info!(task = %self.spec.name, signalled, needed, "shrinking process pool");
        }
    }

    // ------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------

    /// Stops the task (or advances an in-progress stop). `task_resetting`
    /// marks config-driven restarts so `restart` events fire.
    pub fn stop_with(
        &mut self,
        ctx: &TaskCtx<'_>,
        task_resetting: bool,
        out: &mut Vec<TaskEffect>,
    ) -> bool {
        if self.stopped.is_some() {
            return false;
        }
        let now = ctx.now;
        let running = self.alive_count();
        if self.stopping.is_some() && running == 0 {
            self.reset_state();
            self.stopped = Some(now);
            return false;
        }
        if let Some(terminated) = self.terminated {
            if let Some(killed) = self.killed {
                warn!(
                    task = %self.spec.name,
                    running,
                    since = ?now.saturating_duration_since(killed),
                    "processes survive SIGKILL escalation"
                );
            } else if now >= terminated + SIGKILL_ESCALATION {
                ctx.bus
                    .publish(Event::now(EventKind::StopEscalated).with_task(&self.spec.name));
                self.signal_all(libc_kill());
                self.killed = Some(now);
            }
            return true;
        }
        let limit_expired = self.limit.is_some_and(|l| now >= l);
        if limit_expired {
            info!(task = %self.spec.name, "time limit exceeded, stopping");
        } else if self.stopping.is_some() && !ctx.exiting {
            // Run-to-completion processes are allowed to finish unless a
            // limit forces the issue.
            return false;
        }

        if self.stopping.is_none() {
            self.stopping = Some(now);
        }
        self.terminated = Some(now);
        let resetting = ctx.resetting || task_resetting;
        match self.spec.stop_event(resetting).cloned() {
            Some(ev) => {
                debug!(task = %self.spec.name, "firing configured stop action");
                self.run_action(&ev.action, ctx, true, out);
            }
            None => self.signal_all(libc_term()),
        }
        true
    }

    /// Executes a configured event action. `within_stop` marks actions
    /// fired from the stop path, where `command:stop` means the built-in
    /// SIGTERM rather than recursing.
    pub fn run_action(
        &mut self,
        action: &EventAction,
        ctx: &TaskCtx<'_>,
        within_stop: bool,
        out: &mut Vec<TaskEffect>,
    ) {
        match action {
            EventAction::Signal(sig) => {
                info!(task = %self.spec.name, signal = %signame(*sig), "signalling all processes");
                self.signal_all(*sig);
            }
            EventAction::Command(name) => {
                if name.as_str() == "start" && self.spec.control == ControlMode::Event {
                    // Event-control tasks enter running only as the
                    // action of an event.
                    self.rearm();
                    return;
                }
                match self.spec.commands.get(name).cloned() {
                    Some(template) => self.spawn_utility(name, &template, ctx, out),
                    None if name.as_str() == "stop" => {
                        if within_stop {
                            self.signal_all(libc_term());
                        } else {
                            self.stop_with(ctx, false, out);
                        }
                    }
                    None => {
                        error!(task = %self.spec.name, command = %name, "no such command configured");
                    }
                }
            }
        }
    }

    fn spawn_utility(
        &mut self,
        name: &str,
        template: &crate::config::ConfValue,
        ctx: &TaskCtx<'_>,
        out: &mut Vec<TaskEffect>,
    ) {
        let spawned = (|| -> Result<i32, TaskError> {
            let identity = spawn::resolve_identity(
                &self.spec.name,
                self.spec
                    .user
                    .as_ref()
                    .map(|u| self.context.subst(u))
                    .as_deref(),
                self.spec
                    .group
                    .as_ref()
                    .map(|g| self.context.subst(g))
                    .as_deref(),
            )?;
            let argv = self.context.resolve_list(template);
            if argv.is_empty() {
                return Err(TaskError::NoStartCommand {
                    task: self.spec.name.clone(),
                });
            }
            let req = SpawnRequest {
                task: self.spec.name.clone(),
                instance: 0,
                argv,
                procname: None,
                env: self.context.to_env(),
                cwd: self.context.get("Task_cwd").map(str::to_string),
                identity,
            };
            spawn::spawn(&req, ctx.exit_tx)
        })();
        match spawned {
            Ok(pid) => {
                info!(task = %self.spec.name, command = %name, pid, "utility command forked");
                self.utilities.insert(pid, name.to_string());
                out.push(TaskEffect::UtilitySpawned {
                    pid,
                    command: name.to_string(),
                });
            }
            Err(e) => {
                error!(task = %self.spec.name, command = %name, error = %e, "utility command failed");
            }
        }
    }

    fn signal_all(&self, sig: i32) {
        for pid in self.pids() {
            signal_pid(&self.spec.name, pid, sig);
        }
    }

    // ------------------------------------------------------------------
    // Exits
    // ------------------------------------------------------------------

    /// Processes a reaped exit for a pid this task owns. Returns the
    /// effects plus whether a short revisit is wanted.
    pub fn handle_exit(
        &mut self,
        pid: i32,
        detail: ExitDetail,
        ctx: &TaskCtx<'_>,
        out: &mut Vec<TaskEffect>,
    ) -> bool {
        if let Some(command) = self.utilities.remove(&pid) {
            if detail.success() {
                info!(task = %self.spec.name, command = %command, pid, %detail, "utility command finished");
            } else {
                warn!(task = %self.spec.name, command = %command, pid, %detail, "utility command failed");
            }
            return false;
        }
        let Some(slot_idx) = self.slots.iter().position(|s| s.pid == Some(pid)) else {
            return false;
        };
        let now = ctx.now;
        let instance = self.slots[slot_idx].instance;
        let delay = self.slots[slot_idx].record_exit(detail, &self.backoff, now);
        self.last_exit = Some(detail);

        if detail.success() || self.terminated.is_some() {
            info!(task = %self.spec.name, instance, pid, %detail, "process exited");
        } else {
            warn!(task = %self.spec.name, instance, pid, %detail, "unexpected error exit");
        }
        ctx.bus.publish(
            Event::now(EventKind::ProcExited)
                .with_task(&self.spec.name)
                .with_instance(instance)
                .with_pid(pid)
                .with_status(detail.to_string()),
        );
        if self.spec.control == ControlMode::Wait && !ctx.exiting && !delay.is_zero() {
            ctx.bus.publish(
                Event::now(EventKind::BackoffScheduled)
                    .with_task(&self.spec.name)
                    .with_instance(instance)
                    .with_delay(delay),
            );
        }

        if self.alive_count() == 0 {
            self.started = None;
            self.stopping = None;
            self.stopped = Some(now);
            if !ctx.exiting {
                for op in &self.spec.onexit {
                    out.push(TaskEffect::RearmOnce {
                        task: op.task.clone(),
                    });
                }
            }
        }
        true
    }

    /// Liveness probe for adopted slots (their exits cannot be reaped).
    /// A vanished pid is synthesized into an exit stimulus.
    pub fn check_adopted(&self, ctx: &TaskCtx<'_>) {
        for slot in &self.slots {
            if !slot.adopted {
                continue;
            }
            let Some(pid) = slot.pid else { continue };
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
            if !alive {
                let _ = ctx.exit_tx.send(Stimulus::ChildExit {
                    pid,
                    detail: ExitDetail::unknown(),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Orphan adoption
    // ------------------------------------------------------------------

    /// At supervisor start, a live process named by the task's pidfile
    /// whose executable matches the start command is adopted as slot 0.
    pub fn adopt_orphan(&mut self, ctx: &TaskCtx<'_>, out: &mut Vec<TaskEffect>) {
        let Some(template) = self.spec.pidfile.clone() else {
            return;
        };
        let mut slot_ctx = self.context.clone();
        slot_ctx.define("Task_instance", "0");
        let pidfile = PathBuf::from(slot_ctx.subst(&template));
        let Some(pid) = read_pidfile(&pidfile) else {
            return;
        };
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
            debug!(task = %self.spec.name, pid, "pidfile names a dead process");
            return;
        }
        let Some(expected) = self.exec_path.as_ref().and_then(|p| p.file_name()) else {
            return;
        };
        if !process_exe_matches(pid, expected.to_string_lossy().as_ref()) {
            debug!(task = %self.spec.name, pid, "pidfile process executable mismatch");
            return;
        }
        if self.slots.is_empty() {
            self.slots.push(ProcessSlot::new(0));
        }
        self.slots[0].record_adoption(pid, ctx.now);
        self.slots[0].pidfile = Some(pidfile);
        self.starting = Some(ctx.now);
        self.mark_started(ctx.now);
        out.push(TaskEffect::SlotSpawned { pid, instance: 0 });
        ctx.bus.publish(
            Event::now(EventKind::OrphanAdopted)
                .with_task(&self.spec.name)
                .with_pid(pid),
        );
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Derived phase of one slot, for status reporting.
    fn slot_phase(&self, slot: &ProcessSlot, now: Instant) -> SlotPhase {
        if slot.pid.is_some() {
            if self.stopping.is_some() && self.terminated.is_some() {
                SlotPhase::Stopping
            } else if self.started.is_none() {
                SlotPhase::Starting
            } else {
                SlotPhase::Running
            }
        } else if self.dnr {
            SlotPhase::Retired
        } else if self.stopped.is_some() {
            SlotPhase::Terminated
        } else if slot.cooling(now) {
            SlotPhase::Cooldown
        } else if self.starting.is_some() && self.started.is_none() {
            SlotPhase::Delayed
        } else if slot.exit.is_some() {
            SlotPhase::Terminated
        } else {
            SlotPhase::Blocked
        }
    }

    /// `/status/tasks` projection.
    pub fn snapshot(&self, now: Instant, scoped: bool) -> TaskStatus {
        TaskStatus {
            control: self.spec.control.as_str(),
            count: self.spec.count,
            scoped,
            processes: self
                .slots
                .iter()
                .map(|s| ProcStatus {
                    pid: s.pid,
                    state: self.slot_phase(s, now).as_str(),
                    started: s.started_wall.map(iso8601),
                    started_t: s.started_wall.map(epoch),
                    exited: s.exited_wall.map(iso8601),
                    exited_t: s.exited_wall.map(epoch),
                    status: s.exit.and_then(|e| e.status_code()),
                    exit: s.exit.map(|e| e.to_string()),
                })
                .collect(),
        }
    }

    /// The earliest deadline this task needs the loop to wake for.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut consider = |t: Instant| {
            earliest = Some(match earliest {
                Some(e) if e <= t => e,
                _ => t,
            });
        };
        if let (Some(starting), None) = (self.starting, self.started) {
            consider(starting + self.spec.start_delay);
        }
        if self.started.is_some() {
            if let Some(limit) = self.limit {
                consider(limit);
            }
        }
        if let (Some(terminated), None) = (self.terminated, self.killed) {
            consider(terminated + SIGKILL_ESCALATION);
        }
        for slot in &self.slots {
            if let Some(at) = slot.next_sig {
                consider(at);
            }
            if slot.pid.is_none() && self.stopped.is_none() {
                if let Some(at) = slot.retry_at {
                    if at > now {
                        consider(at);
                    }
                }
            }
        }
        earliest
    }
}

fn libc_term() -> i32 {
    nix::sys::signal::Signal::SIGTERM as i32
}

fn libc_kill() -> i32 {
    nix::sys::signal::Signal::SIGKILL as i32
}

fn signal_pid(task: &str, pid: i32, sig: i32) {
    let Ok(signal) = nix::sys::signal::Signal::try_from(sig) else {
        warn!(task, pid, sig, "unknown signal number");
        return;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
        Ok(()) => debug!(task, pid, signal = %signame(sig), "signalled"),
        Err(nix::errno::Errno::ESRCH) => {
            debug!(task, pid, "signal target already gone");
        }
        Err(e) => warn!(task, pid, signal = %signame(sig), error = %e, "signal failed"),
    }
}

fn read_pidfile(path: &std::path::Path) -> Option<i32> {
    let text = std::fs::read_to_string(path).ok()?;
    let pid = text.split_whitespace().next()?.parse::<i32>().ok()?;
    (pid > 1).then_some(pid)
}

/// Compares a live process's executable (or argv[0]) basename.
fn process_exe_matches(pid: i32, expected: &str) -> bool {
    let exe = std::fs::read_link(format!("/proc/{pid}/exe"))
        .ok()
        .and_then(|p| p.file_name().map(|f| f.to_string_lossy().into_owned()));
    if let Some(exe) = exe {
        // " (deleted)" suffixes appear when the binary was replaced.
        return exe == expected || exe.starts_with(&format!("{expected} "));
    }
    std::fs::read(format!("/proc/{pid}/cmdline"))
        .ok()
        .and_then(|raw| {
            raw.split(|b| *b == 0)
                .next()
                .map(|a| String::from_utf8_lossy(a).into_owned())
        })
        .map(|argv0| {
            std::path::Path::new(&argv0)
                .file_name()
                .map(|f| f.to_string_lossy() == expected)
                .unwrap_or(false)
        })
        .unwrap_or(false)
}
