//! # Serde model of the configuration document.
//!
//! The document is YAML (a superset of JSON, so JSON-with-comments style
//! documents load unchanged): top-level `defaults`, `defines`,
//! `role_defaults`, `role_defines`, `settings`, and `tasks`. Values that
//! feed argv templates are [`ConfValue`] trees so conditional `{KEY: V}`
//! entries survive parsing; scalar task fields are typed directly.
//!
//! Parsing is deliberately lenient about unknown keys; structural rules
//! live in the loader so they can produce task-scoped errors.

use std::collections::BTreeMap;

use serde::Deserialize;

/// A configuration value: scalar, list, or conditional mapping.
///
/// Conditional mappings are resolved against the context at argv build
/// time (see [`Context::expand_list`](crate::context::Context::expand_list)).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConfValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ConfValue>),
    Cond(BTreeMap<String, ConfValue>),
}

impl ConfValue {
    /// The value as a plain scalar string, if it is one.
    pub fn as_scalar(&self) -> Option<String> {
        match self {
            ConfValue::Str(s) => Some(s.clone()),
            ConfValue::Int(n) => Some(n.to_string()),
            ConfValue::Float(n) => Some(n.to_string()),
            ConfValue::Bool(b) => Some(b.to_string()),
            ConfValue::List(_) | ConfValue::Cond(_) => None,
        }
    }
}

/// Converts a `defines`/`defaults` mapping into plain strings, skipping
/// non-scalar values (the loader reports those).
pub fn scalar_map(src: &BTreeMap<String, ConfValue>) -> BTreeMap<String, String> {
    src.iter()
        .filter_map(|(k, v)| v.as_scalar().map(|s| (k.clone(), s)))
        .collect()
}

/// Converts a role→mapping table into plain strings.
pub fn scalar_role_map(
    src: &BTreeMap<String, BTreeMap<String, ConfValue>>,
) -> BTreeMap<String, BTreeMap<String, String>> {
    src.iter().map(|(k, v)| (k.clone(), scalar_map(v))).collect()
}

/// The whole configuration document.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct ConfigDoc {
    #[serde(default)]
    pub defaults: BTreeMap<String, ConfValue>,
    #[serde(default)]
    pub defines: BTreeMap<String, ConfValue>,
    #[serde(default)]
    pub role_defaults: BTreeMap<String, BTreeMap<String, ConfValue>>,
    #[serde(default)]
    pub role_defines: BTreeMap<String, BTreeMap<String, ConfValue>>,
    #[serde(default)]
    pub settings: Settings,
    /// Task name → declaration. Present-but-empty is legal; a document
    /// without the key is rejected by the loader.
    pub tasks: Option<BTreeMap<String, TaskConf>>,
}

/// `settings` section.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct Settings {
    /// HTTP listener descriptors, in slot order.
    #[serde(default)]
    pub http: Vec<ListenerConf>,
    /// When true, a task listing several roles is in scope only if all of
    /// them are active.
    #[serde(default)]
    pub all_roles: bool,
}

/// One control-plane listener.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListenerConf {
    /// `host:port` or an absolute path for a Unix socket.
    pub listen: String,
    /// PEM file with certificate chain and key; enables TLS.
    pub certfile: Option<String>,
    /// Whether `manage/*` verbs are served on this listener.
    #[serde(default)]
    pub allow_control: bool,
}

/// One task declaration.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct TaskConf {
    /// `wait` (default), `once`, `event`; `nowait`/`adopt` are reserved.
    pub control: Option<String>,
    /// Process slots to maintain; default 1.
    pub count: Option<u32>,
    #[serde(default)]
    pub requires: Vec<String>,
    /// Seconds after spawn before this task counts as started for its
    /// dependents and its `time_limit` clock begins.
    pub start_delay: Option<f64>,
    /// Seconds a process may run before being stopped.
    pub time_limit: Option<f64>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub cwd: Option<String>,
    /// Template overriding the child's argv[0].
    pub procname: Option<String>,
    /// Template naming the pidfile the child maintains.
    pub pidfile: Option<String>,
    /// Command name → argv template.
    #[serde(default)]
    pub commands: BTreeMap<String, ConfValue>,
    #[serde(default)]
    pub events: Vec<EventConf>,
    #[serde(default)]
    pub onexit: Vec<OnexitConf>,
    /// Role gate; empty means all roles.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub defines: BTreeMap<String, ConfValue>,
    #[serde(default)]
    pub defaults: BTreeMap<String, ConfValue>,
    #[serde(default)]
    pub role_defines: BTreeMap<String, BTreeMap<String, ConfValue>>,
    #[serde(default)]
    pub role_defaults: BTreeMap<String, BTreeMap<String, ConfValue>>,
}

/// One `events` entry: `{type, path|nil, action}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventConf {
    #[serde(rename = "type")]
    pub kind: String,
    /// Paths for `file_change` events; templates allowed.
    pub path: Option<ConfValue>,
    /// `command:<name>` or `signal:<name|number>`.
    pub action: Option<String>,
}

/// One `onexit` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OnexitConf {
    #[serde(rename = "type")]
    pub kind: String,
    pub task: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let doc: ConfigDoc = serde_yaml::from_str(
            r#"
tasks:
  sshd:
    commands:
      start: ["/usr/sbin/sshd", "-D"]
"#,
        )
        .unwrap();
        let tasks = doc.tasks.unwrap();
        let sshd = &tasks["sshd"];
        assert!(sshd.control.is_none());
        assert_eq!(
            sshd.commands["start"],
            ConfValue::List(vec![
                ConfValue::Str("/usr/sbin/sshd".into()),
                ConfValue::Str("-D".into())
            ])
        );
    }

    #[test]
    fn parses_conditional_argv_and_layers() {
        let doc: ConfigDoc = serde_yaml::from_str(
            r#"
defines:
  CONF: /etc/ntp.conf
role_defaults:
  frontend:
    EDGE: "1"
settings:
  http:
    - listen: "127.0.0.1:8080"
      allow_control: true
tasks:
  ntpd:
    control: wait
    requires: [sshd]
    start_delay: 1
    events:
      - type: file_change
        path: ["{CONF}"]
        action: "signal:HUP"
    commands:
      start:
        - ntpd
        - {VERBOSE: "-v"}
  sshd:
    commands:
      start: [sshd]
"#,
        )
        .unwrap();
        let tasks = doc.tasks.unwrap();
        let ntpd = &tasks["ntpd"];
        assert_eq!(ntpd.requires, vec!["sshd"]);
        assert_eq!(ntpd.start_delay, Some(1.0));
        assert_eq!(ntpd.events[0].kind, "file_change");
        assert_eq!(ntpd.events[0].action.as_deref(), Some("signal:HUP"));
        match &ntpd.commands["start"] {
            ConfValue::List(items) => {
                assert!(matches!(items[1], ConfValue::Cond(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(doc.settings.http[0].allow_control);
        assert_eq!(scalar_map(&doc.defines)["CONF"], "/etc/ntp.conf");
        assert_eq!(scalar_role_map(&doc.role_defaults)["frontend"]["EDGE"], "1");
    }

    #[test]
    fn json_documents_load_unchanged() {
        let doc: ConfigDoc = serde_yaml::from_str(
            r#"{"tasks": {"a": {"count": 2, "commands": {"start": ["a"]}}}}"#,
        )
        .unwrap();
        assert_eq!(doc.tasks.unwrap()["a"].count, Some(2));
    }

    #[test]
    fn missing_tasks_key_is_none() {
        let doc: ConfigDoc = serde_yaml::from_str("defines: {A: 1}").unwrap();
        assert!(doc.tasks.is_none());
    }
}
