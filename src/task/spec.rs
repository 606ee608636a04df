//! # Task specification for supervised execution.
//!
//! [`TaskSpec`] is the immutable snapshot of one task's declaration,
//! regenerated on every configuration reload and handed to the runtime.
//! Projection from the raw document validates the per-task structure;
//! cross-task rules (requires references, cycles, onexit targets) live in
//! the loader.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{scalar_map, scalar_role_map, ConfValue, TaskConf};
use crate::error::ConfigError;
use crate::signals::signum;

/// How a task's process pool is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// Maintain `count` live processes indefinitely.
    Wait,
    /// Run to completion once per supervisor lifetime, or until re-armed
    /// by an upstream `onexit`.
    Once,
    /// Never started on bring-up; runs only as the action of an event.
    Event,
    /// Reserved; rejected by validation.
    Nowait,
    /// Reserved; rejected by validation.
    Adopt,
}

impl ControlMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wait" => Some(ControlMode::Wait),
            "once" => Some(ControlMode::Once),
            "event" => Some(ControlMode::Event),
            "nowait" => Some(ControlMode::Nowait),
            "adopt" => Some(ControlMode::Adopt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMode::Wait => "wait",
            ControlMode::Once => "once",
            ControlMode::Event => "event",
            ControlMode::Nowait => "nowait",
            ControlMode::Adopt => "adopt",
        }
    }

    /// Controls whose processes run to completion rather than being
    /// maintained: the task counts as "complete" for dependents only
    /// after it has stopped.
    pub fn is_once(&self) -> bool {
        matches!(self, ControlMode::Once | ControlMode::Event)
    }

    /// Controls reserved by the grammar but not implemented.
    pub fn is_reserved(&self) -> bool {
        matches!(self, ControlMode::Nowait | ControlMode::Adopt)
    }
}

/// What fires when a configured event triggers: a two-case sum, not
/// polymorphism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    /// Run the named entry from the task's `commands`.
    Command(String),
    /// Deliver the signal to all of the task's processes.
    Signal(i32),
}

impl EventAction {
    /// Parses `command:<name>` / `signal:<name|number>`.
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, arg) = s.split_once(':')?;
        let arg = arg.trim();
        match kind.trim() {
            "command" if !arg.is_empty() => Some(EventAction::Command(arg.to_string())),
            "signal" => signum(arg).map(EventAction::Signal),
            _ => None,
        }
    }
}

/// Which external stimulus a configured event binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBind {
    /// Changes to explicitly listed paths.
    FileChange,
    /// Changes to the module closure of the task's script.
    Python,
    /// Changes to the task's own executable.
    SelfExe,
    /// Fired in place of the built-in SIGTERM when the task stops.
    Stop,
    /// As `Stop`, but only during reset/config-driven restarts; wins over
    /// `Stop` there.
    Restart,
}

impl EventBind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file_change" => Some(EventBind::FileChange),
            "python" => Some(EventBind::Python),
            "self" => Some(EventBind::SelfExe),
            "stop" => Some(EventBind::Stop),
            "restart" => Some(EventBind::Restart),
            _ => None,
        }
    }
}

/// One validated `events` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSpec {
    pub bind: EventBind,
    /// Path templates for `file_change`.
    pub paths: Option<ConfValue>,
    pub action: EventAction,
}

/// One validated `onexit` entry. Only `start` exists today.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnExit {
    pub task: String,
}

/// Immutable snapshot of one task's declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    pub control: ControlMode,
    pub count: u32,
    pub requires: Vec<String>,
    pub start_delay: Duration,
    pub time_limit: Option<Duration>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub cwd: Option<String>,
    pub procname: Option<String>,
    pub pidfile: Option<String>,
    pub commands: BTreeMap<String, ConfValue>,
    pub events: Vec<EventSpec>,
    pub onexit: Vec<OnExit>,
    pub roles: Vec<String>,
    pub defines: BTreeMap<String, String>,
    pub defaults: BTreeMap<String, String>,
    pub role_defines: BTreeMap<String, BTreeMap<String, String>>,
    pub role_defaults: BTreeMap<String, BTreeMap<String, String>>,
}

impl TaskSpec {
    /// Projects one raw task declaration, validating per-task structure.
    pub fn from_conf(name: &str, conf: &TaskConf) -> Result<Self, ConfigError> {
        let control_str = conf.control.as_deref().unwrap_or("wait");
        let control = ControlMode::parse(control_str).ok_or_else(|| ConfigError::Task {
            task: name.to_string(),
            reason: format!("unknown control '{control_str}'"),
        })?;
        if control.is_reserved() {
            return Err(ConfigError::ReservedControl {
                task: name.to_string(),
                control: control_str.to_string(),
            });
        }

        let count = conf.count.unwrap_or(1);
        if count < 1 {
            return Err(ConfigError::Task {
                task: name.to_string(),
                reason: "count must be >= 1".to_string(),
            });
        }

        if !conf.commands.contains_key("start") {
            return Err(ConfigError::Task {
                task: name.to_string(),
                reason: "no 'start' command".to_string(),
            });
        }

        let mut events = Vec::with_capacity(conf.events.len());
        for ev in &conf.events {
            let bind = EventBind::parse(&ev.kind).ok_or_else(|| ConfigError::Task {
                task: name.to_string(),
                reason: format!("unknown event type '{}'", ev.kind),
            })?;
            if bind == EventBind::FileChange && ev.path.is_none() {
                return Err(ConfigError::Task {
                    task: name.to_string(),
                    reason: "file_change event has no path".to_string(),
                });
            }
            let raw_action = ev.action.as_deref().ok_or_else(|| ConfigError::BadAction {
                task: name.to_string(),
                action: "(missing)".to_string(),
            })?;
            let action = EventAction::parse(raw_action).ok_or_else(|| ConfigError::BadAction {
                task: name.to_string(),
                action: raw_action.to_string(),
            })?;
            // A stop action on a run-to-completion control would stop a
            // task that is already stopping by definition; ignore it the
            // way the event registration path always has.
            if control.is_once() && action == EventAction::Command("stop".to_string()) {
                continue;
            }
            events.push(EventSpec {
                bind,
                paths: ev.path.clone(),
                action,
            });
        }

        let mut onexit = Vec::with_capacity(conf.onexit.len());
        for op in &conf.onexit {
            if op.kind != "start" {
                return Err(ConfigError::Task {
                    task: name.to_string(),
                    reason: format!("unknown onexit type '{}'", op.kind),
                });
            }
            let target = op.task.clone().ok_or_else(|| ConfigError::Task {
                task: name.to_string(),
                reason: "onexit start has no 'task'".to_string(),
            })?;
            onexit.push(OnExit { task: target });
        }

        Ok(TaskSpec {
            name: name.to_string(),
            control,
            count,
            requires: conf.requires.clone(),
            start_delay: Duration::from_secs_f64(conf.start_delay.unwrap_or(0.0).max(0.0)),
            time_limit: conf
                .time_limit
                .filter(|t| *t > 0.0)
                .map(Duration::from_secs_f64),
            user: conf.user.clone(),
            group: conf.group.clone(),
            cwd: conf.cwd.clone(),
            procname: conf.procname.clone(),
            pidfile: conf.pidfile.clone(),
            commands: conf.commands.clone(),
            events,
            onexit,
            roles: conf.roles.clone(),
            defines: scalar_map(&conf.defines),
            defaults: scalar_map(&conf.defaults),
            role_defines: scalar_role_map(&conf.role_defines),
            role_defaults: scalar_role_map(&conf.role_defaults),
        })
    }

    /// The event that replaces the built-in SIGTERM at stop time, if any.
    /// `resetting` selects `restart` bindings in preference to `stop`.
    pub fn stop_event(&self, resetting: bool) -> Option<&EventSpec> {
        if resetting {
            if let Some(ev) = self.events.iter().find(|e| e.bind == EventBind::Restart) {
                return Some(ev);
            }
        }
        self.events.iter().find(|e| e.bind == EventBind::Stop)
    }

    /// True when the task is gated in by the active role set.
    ///
    /// `active_roles == None` inhibits role processing (all tasks in
    /// scope). A task with no roles is always in scope. `all_roles`
    /// demands every listed role be active instead of any.
    pub fn participant(&self, active_roles: Option<&[String]>, all_roles: bool) -> bool {
        let Some(active) = active_roles else {
            return true;
        };
        if self.roles.is_empty() {
            return true;
        }
        let matched = self
            .roles
            .iter()
            .filter(|r| active.contains(r))
            .count();
        if all_roles {
            matched == self.roles.len()
        } else {
            matched > 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(yaml: &str) -> TaskConf {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn defaults_applied() {
        let spec = TaskSpec::from_conf("t", &conf("commands: {start: [t]}")).unwrap();
        assert_eq!(spec.control, ControlMode::Wait);
        assert_eq!(spec.count, 1);
        assert_eq!(spec.start_delay, Duration::ZERO);
        assert!(spec.time_limit.is_none());
    }

    #[test]
    fn reserved_controls_rejected() {
        for control in ["nowait", "adopt"] {
            let err = TaskSpec::from_conf(
                "t",
                &conf(&format!("control: {control}\ncommands: {{start: [t]}}")),
            )
            .unwrap_err();
            assert!(matches!(err, ConfigError::ReservedControl { .. }));
        }
    }

    #[test]
    fn zero_count_rejected() {
        let err = TaskSpec::from_conf("t", &conf("count: 0\ncommands: {start: [t]}"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Task { .. }));
    }

    #[test]
    fn missing_start_rejected() {
        let err = TaskSpec::from_conf("t", &conf("commands: {stop: [t]}")).unwrap_err();
        assert!(matches!(err, ConfigError::Task { .. }));
    }

    #[test]
    fn event_actions_parse() {
        assert_eq!(
            EventAction::parse("command:reconfig"),
            Some(EventAction::Command("reconfig".into()))
        );
        let hup = signum("HUP").unwrap();
        assert_eq!(EventAction::parse("signal:HUP"), Some(EventAction::Signal(hup)));
        assert_eq!(
            EventAction::parse(&format!("signal:{hup}")),
            Some(EventAction::Signal(hup))
        );
        assert_eq!(EventAction::parse("signal:NOPE"), None);
        assert_eq!(EventAction::parse("poke:thing"), None);
    }

    #[test]
    fn bad_event_action_rejected() {
        let err = TaskSpec::from_conf(
            "t",
            &conf(
                r#"
commands: {start: [t]}
events:
  - type: file_change
    path: [/etc/x]
    action: "frob:1"
"#,
            ),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::BadAction { .. }));
    }

    #[test]
    fn stop_command_ignored_on_once_controls() {
        let spec = TaskSpec::from_conf(
            "t",
            &conf(
                r#"
control: event
commands: {start: [t]}
events:
  - type: file_change
    path: [/etc/x]
    action: "command:stop"
"#,
            ),
        )
        .unwrap();
        assert!(spec.events.is_empty());
    }

    #[test]
    fn stop_event_prefers_restart_when_resetting() {
        let spec = TaskSpec::from_conf(
            "t",
            &conf(
                r#"
commands: {start: [t], graceful: [t, -g]}
events:
  - type: stop
    action: "signal:TERM"
  - type: restart
    action: "command:graceful"
"#,
            ),
        )
        .unwrap();
        assert_eq!(spec.stop_event(false).unwrap().bind, EventBind::Stop);
        assert_eq!(spec.stop_event(true).unwrap().bind, EventBind::Restart);
    }

    #[test]
    fn participant_role_gating() {
        let spec = TaskSpec::from_conf(
            "t",
            &conf("roles: [frontend, edge]\ncommands: {start: [t]}"),
        )
        .unwrap();
        // Inhibited role processing: always in scope.
        assert!(spec.participant(None, false));
        // Any-match.
        let active = vec!["frontend".to_string()];
        assert!(spec.participant(Some(active.as_slice()), false));
        // All-match.
        assert!(!spec.participant(Some(active.as_slice()), true));
        let both = vec!["frontend".to_string(), "edge".to_string()];
        assert!(spec.participant(Some(both.as_slice()), true));
        // No match.
        let other = vec!["backend".to_string()];
        assert!(!spec.participant(Some(other.as_slice()), false));
        // Empty active set scopes out role-bearing tasks...
        let none: Vec<String> = Vec::new();
        assert!(!spec.participant(Some(none.as_slice()), false));
        // ...but not roleless ones.
        let roleless = TaskSpec::from_conf("r", &conf("commands: {start: [r]}")).unwrap();
        assert!(roleless.participant(Some(none.as_slice()), false));
    }
}
