//! # Legion: the top-level orchestrator and event loop.
//!
//! Owns the singleton [`Poller`], the file and module watchers, the
//! configuration, and the set of [`TaskRuntime`]s. Each loop iteration:
//!
//! 1. computes the next timer deadline across all runtimes (start
//!    delays, stop escalations, cooldowns, time limits, listener retry,
//!    expiry),
//! 2. waits in `poll()`,
//! 3. dispatches readiness in deterministic class order — signals,
//!    child exits, config/roles changes, task file changes, control
//!    requests,
//! 4. runs the pending reload if one was scheduled,
//! 5. gives every scoped runtime one management pass.
//!
//! A runtime never crashes the legion: every per-task failure is logged
//! and absorbed; the loop continues. Stop (SIGTERM or `/manage/stop`)
//! stops everything except adopted processes and returns
//! [`Outcome::Stopped`]; reset (SIGHUP or `/manage/reset`) does the same
//! but returns [`Outcome::Reset`] so the caller re-execs the supervisor.

mod watchset;

pub use watchset::{Subscription, WatchOwner, WatchSet};

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{self, scalar_map, scalar_role_map, LoadedConfig, RoleMap};
use crate::context::Context;
use crate::control::{self, ChangeOutcome, ControlRequest, HttpService, ListenerHandle};
use crate::error::{LegionError, WatchError};
use crate::events::{Bus, Event, EventKind};
use crate::poller::{Poller, SignalEvent, SourceId, Stimulus};
use crate::signals::SignalSources;
use crate::task::{
    lookup_path, ContextSeed, ControlMode, EventAction, TaskCtx, TaskEffect, TaskRuntime, TaskSpec,
};
use crate::watch::{FileWatcher, ModuleWatcher, WakeKind, WatchOptions};

/// Rapid-revisit cycle when a task asked to be looked at again soon.
const SHORT_CYCLE: Duration = Duration::from_millis(250);
/// Relaxed cycle driving idle housekeeping.
const LONG_CYCLE: Duration = Duration::from_secs(5);
/// Bound on waiting for tasks to exit after a stop is relayed.
const SIGTERM_LIMIT: Duration = Duration::from_secs(10);
/// Listener rebind retry interval after a transient failure.
const SERVICE_RETRY: Duration = Duration::from_secs(5);

/// How a legion run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stop requested; the process should exit.
    Stopped,
    /// Reset requested; the caller should re-exec the supervisor with
    /// its original argv and environment.
    Reset,
}

/// Construction parameters, mostly from the CLI.
#[derive(Debug, Clone, Default)]
pub struct LegionParams {
    pub config_file: PathBuf,
    pub roles_file: Option<PathBuf>,
    /// CLI override merged into the first configured listener.
    pub http_listen: Option<String>,
    pub allow_control: bool,
    pub certfile: Option<String>,
    /// Shut the whole supervisor down after this long.
    pub expires: Option<Duration>,
    /// Module search path for `python` events; `PYTHONPATH` when unset.
    pub module_path: Option<Vec<PathBuf>>,
}

pub struct Legion {
    params: LegionParams,
    poller: Poller,
    watcher: FileWatcher,
    modules: ModuleWatcher,
    watchset: WatchSet,
    bus: Bus,

    tasks: BTreeMap<String, TaskRuntime>,
    scoped: BTreeSet<String>,
    /// pid → owning task name.
    procs: BTreeMap<i32, String>,
    /// task name → action for its `python` event.
    module_actions: BTreeMap<String, EventAction>,

    config: Option<LoadedConfig>,
    config_value: serde_json::Value,
    roles: Option<RoleMap>,
    seed: ContextSeed,
    base_env: Context,
    control_overrides: BTreeMap<String, ControlMode>,
    count_overrides: BTreeMap<String, u32>,

    listeners: Vec<Option<ListenerHandle>>,
    http_retry: Option<Instant>,

    exit_tx: mpsc::UnboundedSender<Stimulus>,
    sig_tx: mpsc::UnboundedSender<Stimulus>,
    control_tx: mpsc::UnboundedSender<Stimulus>,

    exiting: Option<Instant>,
    resetting: Option<Instant>,
    reload_pending: Option<Instant>,
    expires_at: Option<Instant>,
    want_short: bool,
    last_housekeeping: Instant,
    exit_report: Option<Instant>,
}

impl Legion {
    pub fn new(params: LegionParams, bus: Bus) -> Self {
        let mut poller = Poller::new();
        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (file_tx, file_rx) = mpsc::unbounded_channel();
        let (mod_tx, mod_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        poller.register(SourceId::Signals, sig_rx);
        poller.register(SourceId::Reaper, exit_rx);
        poller.register(SourceId::FileEvents, file_rx);
        poller.register(SourceId::ModuleEvents, mod_rx);
        poller.register(SourceId::Control, control_rx);

        let watcher = FileWatcher::new(file_tx, WakeKind::File, WatchOptions::default());
        let search_path = params
            .module_path
            .clone()
            .or_else(|| {
                std::env::var("PYTHONPATH")
                    .ok()
                    .map(|p| p.split(':').map(PathBuf::from).collect())
            })
            .unwrap_or_default();
        let modules = ModuleWatcher::new(mod_tx, search_path, WatchOptions::default());
        info!(mode = ?watcher.mode(), "file watcher ready");

        let (host, fqdn) = host_names();
        let base_env = Context::from_env();
        let seed = ContextSeed {
            base: base_env.clone(),
            host,
            fqdn,
            ppid: std::process::id() as i32,
            ..Default::default()
        };

        Self {
            params,
            poller,
            watcher,
            modules,
            watchset: WatchSet::new(),
            bus,
            tasks: BTreeMap::new(),
            scoped: BTreeSet::new(),
            procs: BTreeMap::new(),
            module_actions: BTreeMap::new(),
            config: None,
            config_value: serde_json::Value::Null,
            roles: None,
            seed,
            base_env,
            control_overrides: BTreeMap::new(),
            count_overrides: BTreeMap::new(),
            listeners: Vec::new(),
            http_retry: None,
            exit_tx,
            sig_tx,
            control_tx,
            exiting: None,
            resetting: None,
            reload_pending: None,
            expires_at: None,
            want_short: false,
            last_housekeeping: Instant::now(),
            exit_report: None,
        }
    }

    /// Sender for control-plane requests; also used by tests to drive
    /// the loop.
    pub fn control_sender(&self) -> mpsc::UnboundedSender<Stimulus> {
        self.control_tx.clone()
    }

    /// Validates the configuration without running anything.
    pub fn check_config(params: &LegionParams) -> Result<(), LegionError> {
        let probe = script_probe();
        config::load_file(&params.config_file, &probe)
            .map(|_| ())
            .map_err(|source| LegionError::NoConfig { source })
    }

    /// Runs the event loop until stop or reset.
    pub async fn run(&mut self) -> Result<Outcome, LegionError> {
        SignalSources::install(self.sig_tx.clone()).map_err(|e| LegionError::SendSignal {
            reason: format!("signal setup: {e}"),
        })?;

        // The initial configuration must be valid; later reloads may
        // fail and retain the running table.
        self.roles = config::load_roles(self.params.roles_file.as_ref());
        let probe = script_probe();
        let loaded = config::load_file(&self.params.config_file, &probe)
            .map_err(|source| LegionError::NoConfig { source })?;
        self.install_config(loaded);
        self.apply().await;
        self.adopt_orphans();
        self.reconcile();

        if let Some(expires) = self.params.expires {
            info!(?expires, "expire time set");
            self.expires_at = Some(Instant::now() + expires);
        }

        let outcome = loop {
            let now = Instant::now();

            if let Some(done) = self.drive_exit(now) {
                break done;
            }
            if let Some(at) = self.expires_at {
                if now >= at && self.exiting.is_none() {
                    warn!("expiration reached, stopping");
                    self.schedule_exit(now);
                }
            }

            let timeout_ms = self.next_timeout_ms(now);
            let stimuli = self.poller.poll(timeout_ms).await;
            let idle = stimuli.is_empty();
            self.want_short = false;

            for (_source, stimulus) in stimuli {
                self.dispatch(stimulus).await;
            }

            if self.reload_pending.take().is_some() {
                self.reload().await;
            }
            if idle || self.last_housekeeping.elapsed() >= LONG_CYCLE {
                self.housekeeping().await;
            }
            self.reconcile();
        };

        for handle in self.listeners.drain(..).flatten() {
            handle.shutdown();
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    fn schedule_exit(&mut self, now: Instant) {
        if self.exiting.is_none() {
            self.exiting = Some(now);
            self.bus.publish(Event::now(EventKind::ShutdownRequested));
        }
        self.want_short = true;
    }

    fn schedule_reset(&mut self, now: Instant) {
        if self.resetting.is_none() {
            self.resetting = Some(now);
            self.bus.publish(Event::now(EventKind::ResetRequested));
        }
        self.schedule_exit(now);
    }

    /// While exiting, pushes stops forward and decides when to leave the
    /// loop. Adopted processes are left running.
    fn drive_exit(&mut self, now: Instant) -> Option<Outcome> {
        let started = self.exiting?;
        let outcome = if self.resetting.is_some() {
            Outcome::Reset
        } else {
            Outcome::Stopped
        };

        let mut still_running = 0usize;
        {
            let ctx = TaskCtx {
                seed: &self.seed,
                bus: &self.bus,
                exit_tx: &self.exit_tx,
                now,
                exiting: true,
                resetting: self.resetting.is_some(),
            };
            let mut fx = Vec::new();
            for rt in self.tasks.values_mut() {
                if rt.fully_adopted() {
                    continue;
                }
                rt.stop_with(&ctx, false, &mut fx);
                still_running += rt.alive_count();
            }
        }

        if still_running == 0 {
            info!("all tasks have stopped");
            self.bus.publish(Event::now(EventKind::AllStoppedWithin));
            return Some(outcome);
        }
        if now >= started + SIGTERM_LIMIT {
            let stuck: Vec<String> = self
                .tasks
                .values()
                .filter(|rt| !rt.fully_adopted() && rt.alive_count() > 0)
                .map(|rt| rt.name().to_string())
                .collect();
            warn!(?stuck, "limit waiting for tasks to exit was exceeded");
            self.bus.publish(
                Event::now(EventKind::StopLimitExceeded).with_error(format!("stuck: {stuck:?}")),
            );
            return Some(outcome);
        }
        let report_due = self
            .exit_report
            .map_or(true, |at| now >= at + Duration::from_secs(1));
        if report_due {
            info!(still_running, "waiting for processes to stop");
            self.exit_report = Some(now);
        }
        self.want_short = true;
        None
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&mut self, stimulus: Stimulus) {
        let now = Instant::now();
        match stimulus {
            Stimulus::Signal(SignalEvent::Terminate) | Stimulus::Signal(SignalEvent::Interrupt) => {
                if self.resetting.is_some() {
                    warn!("terminating signal while resetting, coercing to exit");
                    self.resetting = None;
                }
                info!("stopping all unadopted tasks on termination signal");
                self.schedule_exit(now);
            }
            Stimulus::Signal(SignalEvent::Hangup) => {
                info!("reset requested by SIGHUP");
                self.schedule_reset(now);
            }
            Stimulus::ChildExit { pid, detail } => {
                let Some(task) = self.procs.remove(&pid) else {
                    error!(pid, %detail, "unknown pid reaped, ignoring");
                    return;
                };
                let mut fx = Vec::new();
                {
                    let ctx = TaskCtx {
                        seed: &self.seed,
                        bus: &self.bus,
                        exit_tx: &self.exit_tx,
                        now,
                        exiting: self.exiting.is_some(),
                        resetting: self.resetting.is_some(),
                    };
                    if let Some(rt) = self.tasks.get_mut(&task) {
                        if rt.handle_exit(pid, detail, &ctx, &mut fx) {
                            self.want_short = true;
                        }
                    }
                }
                self.absorb_effects(&task, fx);
            }
            Stimulus::FileWake => {
                let changed = self.watcher.drain().await;
                let mut reload = false;
                let mut reset = false;
                // Config and roles first: reloads precede the respawn
                // decisions they may obviate.
                for path in &changed {
                    for (owner, _) in self.watchset.subscribers(path) {
                        match owner {
                            WatchOwner::Config | WatchOwner::Roles => reload = true,
                            WatchOwner::SelfExe => reset = true,
                            WatchOwner::Task(_) => {}
                        }
                    }
                }
                if reset {
                    info!("own executable changed, scheduling reset");
                    self.schedule_reset(now);
                }
                if reload {
                    debug!("config or roles change noticed");
                    self.reload_pending = Some(now);
                }
                for path in &changed {
                    let subs: Vec<_> = self
                        .watchset
                        .subscribers(path)
                        .iter()
                        .filter_map(|(owner, action)| match (owner, action) {
                            (WatchOwner::Task(name), Some(action)) => {
                                Some((name.clone(), action.clone()))
                            }
                            _ => None,
                        })
                        .collect();
                    for (task, action) in subs {
                        info!(path = %path.display(), task = %task, "file_change event");
                        self.run_task_action(&task, &action, now);
                    }
                }
            }
            Stimulus::ModuleWake => {
                let changes = self.modules.drain().await;
                for change in changes {
                    let Some(action) = self.module_actions.get(&change.name).cloned() else {
                        error!(task = %change.name, "module change for unregistered task");
                        continue;
                    };
                    info!(
                        task = %change.name,
                        files = change.paths.len(),
                        "module change event"
                    );
                    self.run_task_action(&change.name, &action, now);
                }
            }
            Stimulus::Control(req) => self.handle_control(req, now).await,
        }
    }

    fn run_task_action(&mut self, task: &str, action: &EventAction, now: Instant) {
        let mut fx = Vec::new();
        {
            let ctx = TaskCtx {
                seed: &self.seed,
                bus: &self.bus,
                exit_tx: &self.exit_tx,
                now,
                exiting: self.exiting.is_some(),
                resetting: self.resetting.is_some(),
            };
            match self.tasks.get_mut(task) {
                Some(rt) => {
                    rt.run_action(action, &ctx, false, &mut fx);
                    self.want_short = true;
                }
                None => error!(task, "event for unknown task"),
            }
        }
        self.absorb_effects(task, fx);
    }

    async fn handle_control(&mut self, req: ControlRequest, now: Instant) {
        match req {
            ControlRequest::Status { reply } => {
                let mut map = BTreeMap::new();
                for (name, rt) in &self.tasks {
                    map.insert(name.clone(), rt.snapshot(now, self.scoped.contains(name)));
                }
                let _ = reply.send(map);
            }
            ControlRequest::ConfigSnapshot { reply } => {
                let _ = reply.send(self.config_value.clone());
            }
            ControlRequest::GetCount { task, reply } => {
                let _ = reply.send(self.tasks.get(&task).map(|rt| rt.spec().count));
            }
            ControlRequest::SetCount { task, count, reply } => {
                let result = if !self.tasks.contains_key(&task) {
                    Err("not found".to_string())
                } else if self.tasks[&task].spec().count == count {
                    self.count_overrides.insert(task.clone(), count);
                    Ok(ChangeOutcome::NoChange)
                } else {
                    info!(task = %task, count, "count override from control plane");
                    self.count_overrides.insert(task.clone(), count);
                    self.stage_specs();
                    self.apply().await;
                    Ok(ChangeOutcome::Changed)
                };
                let _ = reply.send(result);
            }
            ControlRequest::SetControl {
                task,
                control,
                reply,
            } => {
                let parsed = ControlMode::parse(&control).filter(|c| !c.is_reserved());
                let result = match (self.tasks.contains_key(&task), parsed) {
                    (false, _) => Err("not found".to_string()),
                    (true, None) => Err(format!("bad control '{control}'")),
                    (true, Some(mode)) => {
                        if self.tasks[&task].spec().control == mode {
                            Ok(ChangeOutcome::NoChange)
                        } else {
                            info!(task = %task, control = %mode.as_str(), "control override from control plane");
                            self.control_overrides.insert(task.clone(), mode);
                            self.stage_specs();
                            self.apply().await;
                            Ok(ChangeOutcome::Changed)
                        }
                    }
                };
                let _ = reply.send(result);
            }
            ControlRequest::Reload { reply } => {
                self.reload_pending = Some(now);
                let _ = reply.send(());
            }
            ControlRequest::Reset { reply } => {
                self.schedule_reset(now);
                let _ = reply.send(());
            }
            ControlRequest::Stop { reply } => {
                self.schedule_exit(now);
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Reloads roles then config; either failing retains the previous
    /// state. Reloading identical content is a no-op.
    async fn reload(&mut self) {
        let new_roles = config::load_roles(self.params.roles_file.as_ref());
        let roles_changed = new_roles != self.roles;
        if roles_changed {
            info!(roles = ?new_roles.as_ref().map(|r| r.active().to_vec()), "roles changing");
            self.bus.publish(Event::now(EventKind::RolesChanged));
            self.roles = new_roles;
        }

        let probe = script_probe();
        match config::load_file(&self.params.config_file, &probe) {
            Ok(loaded) => {
                let config_changed = self
                    .config
                    .as_ref()
                    .map_or(true, |current| current.doc != loaded.doc);
                if config_changed {
                    info!(path = %self.params.config_file.display(), "configuration reloaded");
                    self.bus.publish(
                        Event::now(EventKind::ConfigReloaded)
                            .with_path(self.params.config_file.clone()),
                    );
                    // Operator overrides last until the file itself
                    // changes.
                    self.control_overrides.clear();
                    self.count_overrides.clear();
                    self.install_config(loaded);
                }
                if config_changed || roles_changed {
                    self.apply().await;
                } else {
                    debug!("no changes in configuration or roles");
                }
            }
            Err(e) => {
                error!(error = %e, label = e.as_label(), "config load failed, previous retained");
                self.bus
                    .publish(Event::now(EventKind::ConfigRejected).with_error(e.to_string()));
                if roles_changed {
                    self.apply().await;
                }
            }
        }
    }

    /// Installs a validated table: removed tasks are marked for death,
    /// new runtimes created, and every runtime gets its staged spec.
    fn install_config(&mut self, loaded: LoadedConfig) {
        self.config_value = serde_yaml::from_str(
            &std::fs::read_to_string(&self.params.config_file).unwrap_or_default(),
        )
        .unwrap_or(serde_json::Value::Null);

        let names: BTreeSet<String> = loaded.table.keys().cloned().collect();
        for (name, rt) in self.tasks.iter_mut() {
            if !names.contains(name) {
                info!(task = %name, "removed from configuration");
                rt.mark_delete();
            }
        }
        self.config = Some(loaded);
        self.stage_specs();
    }

    /// Stages per-task specs with operator overrides folded in.
    fn stage_specs(&mut self) {
        let Some(config) = &self.config else { return };
        for (name, spec) in &config.table {
            let mut spec: TaskSpec = spec.clone();
            if let Some(control) = self.control_overrides.get(name) {
                spec.control = *control;
            }
            if let Some(count) = self.count_overrides.get(name) {
                spec.count = (*count).max(1);
            }
            match self.tasks.get_mut(name) {
                Some(rt) => rt.set_pending(spec),
                None => {
                    self.tasks.insert(name.clone(), TaskRuntime::new(spec));
                }
            }
        }
    }

    /// Reconciles scope, applies staged specs in dependency order, and
    /// converges listeners and watches.
    async fn apply(&mut self) {
        self.seed = self.build_seed();
        self.manage_http_servers().await;

        let active = self.seed.active_roles.clone();
        let all_roles = self.seed.all_roles;
        let now = Instant::now();

        let mut entering = Vec::new();
        let mut leaving = Vec::new();
        for (name, rt) in &self.tasks {
            let in_scope = !rt.is_marked_delete()
                && rt
                    .effective_spec()
                    .participant(active.as_deref(), all_roles);
            if in_scope && !self.scoped.contains(name) {
                entering.push(name.clone());
            } else if !in_scope && self.scoped.contains(name) {
                leaving.push(name.clone());
            }
        }

        let mut pending_fx: Vec<(String, TaskEffect)> = Vec::new();
        {
            let ctx = TaskCtx {
                seed: &self.seed,
                bus: &self.bus,
                exit_tx: &self.exit_tx,
                now,
                exiting: self.exiting.is_some(),
                resetting: self.resetting.is_some(),
            };
            for name in &leaving {
                self.scoped.remove(name);
                ctx.bus
                    .publish(Event::now(EventKind::TaskUnscoped).with_task(name));
                if let Some(rt) = self.tasks.get_mut(name) {
                    let mut fx = Vec::new();
                    rt.stop_with(&ctx, false, &mut fx);
                    pending_fx.extend(fx.into_iter().map(|e| (name.clone(), e)));
                }
            }
            for name in &entering {
                self.scoped.insert(name.clone());
                ctx.bus
                    .publish(Event::now(EventKind::TaskScoped).with_task(name));
            }

            let order: Vec<String> = match &self.config {
                Some(config) => config::start_order(&config.table)
                    .unwrap_or_else(|_| self.scoped.iter().cloned().collect()),
                None => self.scoped.iter().cloned().collect(),
            };
            for name in order {
                if !self.scoped.contains(&name) {
                    continue;
                }
                if let Some(rt) = self.tasks.get_mut(&name) {
                    let mut fx = Vec::new();
                    if rt.apply(&ctx, &mut fx) {
                        self.want_short = true;
                    }
                    pending_fx.extend(fx.into_iter().map(|e| (name.clone(), e)));
                }
            }
        }
        for (task, fx) in pending_fx {
            self.absorb_one(&task, fx);
        }

        self.reconcile_watches();
    }

    /// Rebuilds the watch subscriptions to exactly what the active
    /// configuration implies.
    fn reconcile_watches(&mut self) {
        let mut desired = vec![Subscription {
            path: self.params.config_file.clone(),
            owner: WatchOwner::Config,
            action: None,
        }];
        if let Some(roles) = &self.params.roles_file {
            desired.push(Subscription {
                path: roles.clone(),
                owner: WatchOwner::Roles,
                action: None,
            });
        }
        if let Ok(exe) = std::env::current_exe() {
            desired.push(Subscription {
                path: exe,
                owner: WatchOwner::SelfExe,
                action: None,
            });
        }

        let mut module_wants: BTreeMap<String, (PathBuf, EventAction)> = BTreeMap::new();
        for name in &self.scoped {
            let Some(rt) = self.tasks.get(name) else { continue };
            for request in rt.watch_requests() {
                match request {
                    crate::task::WatchRequest::Path { path, action } => {
                        desired.push(Subscription {
                            path,
                            owner: WatchOwner::Task(name.clone()),
                            action: Some(action),
                        });
                    }
                    crate::task::WatchRequest::Modules { script, action } => {
                        module_wants.insert(name.clone(), (script, action));
                    }
                }
            }
        }
        self.watchset.reconcile(desired, &mut self.watcher);

        let registered: Vec<String> = self.module_actions.keys().cloned().collect();
        for name in registered {
            if !module_wants.contains_key(&name) {
                let _ = self.modules.remove(&name);
                self.module_actions.remove(&name);
            }
        }
        for (name, (script, action)) in module_wants {
            match self.modules.add(&name, &script) {
                Ok(()) => {
                    self.module_actions.insert(name, action);
                }
                Err(e) => {
                    error!(task = %name, error = %e, "module watch failed");
                }
            }
        }
    }

    fn build_seed(&self) -> ContextSeed {
        let (defines, defaults, role_defines, role_defaults, all_roles) = match &self.config {
            Some(config) => (
                scalar_map(&config.doc.defines),
                scalar_map(&config.doc.defaults),
                scalar_role_map(&config.doc.role_defines),
                scalar_role_map(&config.doc.role_defaults),
                config.doc.settings.all_roles,
            ),
            None => Default::default(),
        };
        ContextSeed {
            base: self.base_env.clone(),
            defines,
            defaults,
            role_defines,
            role_defaults,
            active_roles: self.roles.as_ref().map(|r| r.active().to_vec()),
            role_values: self
                .roles
                .as_ref()
                .map(|r| {
                    r.valued()
                        .map(|(n, v)| (n.to_string(), v.trim().to_string()))
                        .collect()
                })
                .unwrap_or_default(),
            all_roles,
            host: self.seed.host.clone(),
            fqdn: self.seed.fqdn.clone(),
            ppid: self.seed.ppid,
        }
    }

    /// The legion-level context used to resolve listener descriptors.
    fn legion_context(&self) -> Context {
        let mut ctx = self.base_env.clone();
        let roles_vec;
        let roles: &[String] = match &self.seed.active_roles {
            Some(r) => r,
            None => {
                roles_vec = Vec::new();
                &roles_vec
            }
        };
        ctx.apply_defaults(&self.seed.defaults, &self.seed.role_defaults, roles);
        ctx.apply_defines(&self.seed.defines, &self.seed.role_defines, roles);
        ctx.define("Task_host", self.seed.host.clone());
        ctx.define("Task_fqdn", self.seed.fqdn.clone());
        ctx
    }

    // ------------------------------------------------------------------
    // HTTP listeners
    // ------------------------------------------------------------------

    fn desired_services(&self) -> Vec<HttpService> {
        let ctx = self.legion_context();
        let mut services: Vec<HttpService> = self
            .config
            .as_ref()
            .map(|c| {
                c.doc
                    .settings
                    .http
                    .iter()
                    .map(|l| HttpService {
                        listen: ctx.subst(&l.listen),
                        certfile: l.certfile.as_ref().map(|f| ctx.subst(f)),
                        allow_control: l.allow_control,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if services.is_empty() && self.params.http_listen.is_some() {
            services.push(HttpService {
                listen: String::new(),
                certfile: None,
                allow_control: false,
            });
        }
        if let Some(first) = services.first_mut() {
            if let Some(listen) = &self.params.http_listen {
                first.listen = listen.clone();
            }
            if self.params.allow_control {
                first.allow_control = true;
            }
            if let Some(certfile) = &self.params.certfile {
                first.certfile = Some(certfile.clone());
            }
        }
        services
    }

    /// Converges running listeners to the configured set, slot by slot.
    /// A slot that fails to bind is retried after a grace period.
    async fn manage_http_servers(&mut self) {
        let need = self.desired_services();
        if self.listeners.len() != need.len() {
            info!(
                from = self.listeners.len(),
                to = need.len(),
                "listener count changed, reconfiguring"
            );
            for handle in self.listeners.drain(..).flatten() {
                handle.shutdown();
            }
        }
        self.http_retry = None;
        for (pos, service) in need.into_iter().enumerate() {
            if self.listeners.len() <= pos {
                self.listeners.push(None);
            }
            if let Some(existing) = &self.listeners[pos] {
                if existing.service == service {
                    continue;
                }
                debug!(slot = pos, "listener changing");
                if let Some(old) = self.listeners[pos].take() {
                    old.shutdown();
                }
            }
            match control::spawn_listener(service, self.control_tx.clone()).await {
                Ok(handle) => self.listeners[pos] = Some(handle),
                Err(e) => {
                    error!(slot = pos, error = %e, "listener failed");
                    if self.http_retry.is_none() {
                        self.http_retry = Some(Instant::now() + SERVICE_RETRY);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Steady-state driving
    // ------------------------------------------------------------------

    /// One management pass over every runtime.
    fn reconcile(&mut self) {
        let now = Instant::now();
        let reqs: BTreeMap<String, crate::task::ReqSnapshot> = self
            .tasks
            .iter()
            .map(|(name, rt)| (name.clone(), rt.req_snapshot()))
            .collect();

        let mut pending_fx: Vec<(String, TaskEffect)> = Vec::new();
        {
            let ctx = TaskCtx {
                seed: &self.seed,
                bus: &self.bus,
                exit_tx: &self.exit_tx,
                now,
                exiting: self.exiting.is_some(),
                resetting: self.resetting.is_some(),
            };
            let scoped = self.scoped.clone();
            for name in &scoped {
                let Some(rt) = self.tasks.get_mut(name) else { continue };
                let mut fx = Vec::new();
                if rt.manage(&ctx, &reqs, &mut fx) {
                    self.want_short = true;
                }
                pending_fx.extend(fx.into_iter().map(|e| (name.clone(), e)));
            }
            // Tasks leaving the world still need their stops driven.
            for (name, rt) in self.tasks.iter_mut() {
                if scoped.contains(name) || !rt.is_marked_delete() {
                    continue;
                }
                let mut fx = Vec::new();
                if rt.stop_with(&ctx, false, &mut fx) {
                    self.want_short = true;
                }
                pending_fx.extend(fx.into_iter().map(|e| (name.clone(), e)));
            }
        }
        for (task, fx) in pending_fx {
            self.absorb_one(&task, fx);
        }

        let deletable: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, rt)| rt.is_deletable())
            .map(|(n, _)| n.clone())
            .collect();
        for name in deletable {
            info!(task = %name, "deleting stopped task");
            self.tasks.remove(&name);
            self.scoped.remove(&name);
            self.procs.retain(|_, owner| owner != &name);
        }
    }

    fn absorb_effects(&mut self, task: &str, fx: Vec<TaskEffect>) {
        for effect in fx {
            self.absorb_one(task, effect);
        }
    }

    fn absorb_one(&mut self, task: &str, effect: TaskEffect) {
        match effect {
            TaskEffect::SlotSpawned { pid, .. } | TaskEffect::UtilitySpawned { pid, .. } => {
                self.procs.insert(pid, task.to_string());
            }
            TaskEffect::RearmOnce { task: target } => {
                if !self.scoped.contains(&target) {
                    error!(task, target = %target, "onexit start target out of scope");
                    return;
                }
                match self.tasks.get_mut(&target) {
                    Some(rt) if rt.spec().control.is_once() => {
                        rt.rearm();
                        self.want_short = true;
                    }
                    Some(_) => {
                        error!(task, target = %target, "onexit start may only target once tasks");
                    }
                    None => error!(task, target = %target, "onexit start target does not exist"),
                }
            }
        }
    }

    /// Startup-only sweep: adopt live processes recorded in pidfiles.
    fn adopt_orphans(&mut self) {
        let now = Instant::now();
        let mut pending_fx: Vec<(String, TaskEffect)> = Vec::new();
        {
            let ctx = TaskCtx {
                seed: &self.seed,
                bus: &self.bus,
                exit_tx: &self.exit_tx,
                now,
                exiting: false,
                resetting: false,
            };
            let scoped = self.scoped.clone();
            for name in &scoped {
                if let Some(rt) = self.tasks.get_mut(name) {
                    let mut fx = Vec::new();
                    rt.adopt_orphan(&ctx, &mut fx);
                    pending_fx.extend(fx.into_iter().map(|e| (name.clone(), e)));
                }
            }
        }
        for (task, fx) in pending_fx {
            self.absorb_one(&task, fx);
        }
    }

    /// Idle-cadence work: watcher sweeps, pending-appearance promotion,
    /// listener retries, adopted-orphan liveness.
    async fn housekeeping(&mut self) {
        self.last_housekeeping = Instant::now();
        self.watcher.scan();
        self.modules.scan();
        if let Some(at) = self.http_retry {
            if Instant::now() >= at {
                self.manage_http_servers().await;
            }
        }
        let ctx = TaskCtx {
            seed: &self.seed,
            bus: &self.bus,
            exit_tx: &self.exit_tx,
            now: Instant::now(),
            exiting: self.exiting.is_some(),
            resetting: self.resetting.is_some(),
        };
        for rt in self.tasks.values() {
            rt.check_adopted(&ctx);
        }
    }

    /// Milliseconds until the next interesting moment.
    fn next_timeout_ms(&self, now: Instant) -> i64 {
        let mut deadline = now
            + if self.want_short || self.exiting.is_some() {
                SHORT_CYCLE
            } else {
                LONG_CYCLE
            };
        let mut consider = |at: Instant| {
            if at < deadline {
                deadline = at;
            }
        };
        for rt in self.tasks.values() {
            if let Some(at) = rt.next_deadline(now) {
                consider(at);
            }
        }
        if let Some(at) = self.http_retry {
            consider(at);
        }
        if let Some(at) = self.expires_at {
            consider(at);
        }
        if self.reload_pending.is_some() {
            return 0;
        }
        deadline.saturating_duration_since(now).as_millis() as i64
    }
}

/// Probe used to vet `python` events: resolve the command then check the
/// script is analyzable.
fn script_probe() -> impl Fn(&str) -> Result<(), WatchError> {
    |command: &str| {
        let path = lookup_path(command, None).ok_or_else(|| WatchError::CommandNotFound {
            command: command.to_string(),
        })?;
        ModuleWatcher::probe(&path)
    }
}

fn host_names() -> (String, String) {
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let fqdn = host.clone();
    let short = host.split('.').next().unwrap_or(&host).to_string();
    if host.contains('.') {
        (short, fqdn)
    } else {
        (host.clone(), host)
    }
}
