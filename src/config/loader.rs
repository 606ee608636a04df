//! # ConfigLoader: parse, validate, and project the configuration.
//!
//! Loading is transactional: the caller only replaces its running table
//! when the whole document parses and validates; any error leaves the
//! previous configuration in force.
//!
//! Validation covers the cross-task rules: every `requires` reference
//! resolves, the `requires` relation is a DAG, `onexit: start` only
//! targets `once` tasks, and `python` events are only accepted when the
//! task's start command names an analyzable script (probed through the
//! callback so the loader stays decoupled from the module watcher).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::context::Context;
use crate::error::{ConfigError, WatchError};
use crate::task::{EventBind, TaskSpec};

use super::model::ConfigDoc;

/// Validated result of one load: the raw document (kept for `/status/config`
/// and change diffing) plus the projected task table in name order.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub doc: ConfigDoc,
    pub table: BTreeMap<String, TaskSpec>,
}

/// Probe used to vet `python` events at load time.
pub type ScriptProbe<'a> = &'a dyn Fn(&str) -> Result<(), WatchError>;

/// Reads and validates the document at `path`.
pub fn load_file(path: &Path, probe: ScriptProbe<'_>) -> Result<LoadedConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_str(&text, path, probe)
}

/// Parses and validates document text. `path` is only used in errors.
pub fn load_str(
    text: &str,
    path: &Path,
    probe: ScriptProbe<'_>,
) -> Result<LoadedConfig, ConfigError> {
    let doc: ConfigDoc = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let table = validate(&doc, probe)?;
    Ok(LoadedConfig { doc, table })
}

/// Structural and cross-task validation; returns the projected table.
pub fn validate(
    doc: &ConfigDoc,
    probe: ScriptProbe<'_>,
) -> Result<BTreeMap<String, TaskSpec>, ConfigError> {
    let tasks = doc
        .tasks
        .as_ref()
        .ok_or(ConfigError::MissingSection { key: "tasks" })?;

    for (idx, listener) in doc.settings.http.iter().enumerate() {
        if listener.listen.trim().is_empty() {
            return Err(ConfigError::Listener {
                index: idx,
                reason: "empty listen address".to_string(),
            });
        }
    }

    let mut table = BTreeMap::new();
    for (name, conf) in tasks {
        table.insert(name.clone(), TaskSpec::from_conf(name, conf)?);
    }

    for spec in table.values() {
        for req in &spec.requires {
            if !table.contains_key(req) {
                return Err(ConfigError::UnknownRequires {
                    task: spec.name.clone(),
                    requires: req.clone(),
                });
            }
        }
        for op in &spec.onexit {
            match table.get(&op.task) {
                None => {
                    return Err(ConfigError::Task {
                        task: spec.name.clone(),
                        reason: format!("onexit start targets unknown task '{}'", op.task),
                    });
                }
                Some(target) if !target.control.is_once() => {
                    return Err(ConfigError::OnexitNotOnce {
                        task: spec.name.clone(),
                        target: op.task.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        if spec.events.iter().any(|e| e.bind == EventBind::Python) {
            let script = start_script(spec);
            probe(&script).map_err(|source| {
                if source.is_not_python() {
                    ConfigError::NotAnalyzable {
                        task: spec.name.clone(),
                        source,
                    }
                } else {
                    ConfigError::Task {
                        task: spec.name.clone(),
                        reason: source.to_string(),
                    }
                }
            })?;
        }
    }

    start_order(&table)?;
    Ok(table)
}

/// First element of a task's start command, expanded against a plain
/// environment context. Used for the `python` probe.
fn start_script(spec: &TaskSpec) -> String {
    let ctx = Context::from_env();
    spec.commands
        .get("start")
        .map(|v| ctx.resolve_list(v))
        .unwrap_or_default()
        .into_iter()
        .next()
        .unwrap_or_default()
}

/// Dependency-ordered task list; errors when `requires` is not a DAG.
///
/// Iterative elimination: each cycle admits every task whose requirements
/// are all admitted. A pass that admits nothing with tasks remaining
/// proves a cycle.
pub fn start_order(table: &BTreeMap<String, TaskSpec>) -> Result<Vec<String>, ConfigError> {
    let mut done: Vec<String> = Vec::with_capacity(table.len());
    while done.len() < table.len() {
        let mut changed = false;
        for (name, spec) in table {
            if done.contains(name) {
                continue;
            }
            if spec.requires.iter().all(|r| done.contains(r)) {
                done.push(name.clone());
                changed = true;
            }
        }
        if !changed {
            let remaining = table
                .keys()
                .filter(|n| !done.contains(*n))
                .cloned()
                .collect();
            return Err(ConfigError::RequiresCycle { remaining });
        }
    }
    Ok(done)
}

/// Loads the roles file next to a config reload. Thin wrapper so callers
/// treat both files uniformly.
pub fn load_roles(path: Option<&PathBuf>) -> Option<super::roles::RoleMap> {
    path.and_then(|p| super::roles::RoleMap::load(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_probe(_: &str) -> Result<(), WatchError> {
        Ok(())
    }

    fn load(text: &str) -> Result<LoadedConfig, ConfigError> {
        load_str(text, Path::new("test.conf"), &ok_probe)
    }

    #[test]
    fn valid_document_projects_table() {
        let loaded = load(
            r#"
tasks:
  sshd:
    commands: {start: [/usr/sbin/sshd, -D]}
  ntpd:
    control: wait
    requires: [sshd]
    commands: {start: [ntpd]}
"#,
        )
        .unwrap();
        assert_eq!(loaded.table.len(), 2);
        assert_eq!(loaded.table["ntpd"].requires, vec!["sshd"]);
    }

    #[test]
    fn missing_tasks_section_rejected() {
        let err = load("defines: {A: 1}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection { key: "tasks" }));
    }

    #[test]
    fn unknown_requires_rejected() {
        let err = load(
            r#"
tasks:
  a:
    requires: [ghost]
    commands: {start: [a]}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRequires { .. }));
    }

    #[test]
    fn requires_cycle_rejected() {
        let err = load(
            r#"
tasks:
  a:
    requires: [b]
    commands: {start: [a]}
  b:
    requires: [a]
    commands: {start: [b]}
"#,
        )
        .unwrap_err();
        match err {
            ConfigError::RequiresCycle { remaining } => {
                assert_eq!(remaining.len(), 2);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn onexit_must_target_once_task() {
        let err = load(
            r#"
tasks:
  timeset:
    control: wait
    commands: {start: [timeset]}
  ntpd:
    requires: [timeset]
    onexit: [{type: start, task: timeset}]
    commands: {start: [ntpd]}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::OnexitNotOnce { .. }));

        let ok = load(
            r#"
tasks:
  timeset:
    control: once
    commands: {start: [timeset]}
  ntpd:
    requires: [timeset]
    onexit: [{type: start, task: timeset}]
    commands: {start: [ntpd]}
"#,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn python_event_uses_probe() {
        let text = r#"
tasks:
  webapp:
    commands: {start: [/srv/app/main.py]}
    events:
      - type: python
        action: "signal:HUP"
"#;
        let reject = |_: &str| {
            Err(WatchError::NotPython {
                path: "/srv/app/main.py".into(),
            })
        };
        let err = load_str(text, Path::new("t"), &reject).unwrap_err();
        assert!(matches!(err, ConfigError::NotAnalyzable { .. }));
        assert!(load_str(text, Path::new("t"), &ok_probe).is_ok());
    }

    #[test]
    fn start_order_respects_requires() {
        let loaded = load(
            r#"
tasks:
  c:
    requires: [b]
    commands: {start: [c]}
  b:
    requires: [a]
    commands: {start: [b]}
  a:
    commands: {start: [a]}
"#,
        )
        .unwrap();
        let order = start_order(&loaded.table).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn reload_of_identical_text_projects_equal_tables() {
        let text = r#"
tasks:
  a:
    count: 2
    commands: {start: [a, --flag]}
"#;
        let one = load(text).unwrap();
        let two = load(text).unwrap();
        assert_eq!(one.table, two.table);
        assert_eq!(one.doc, two.doc);
    }

    #[test]
    fn empty_listen_rejected() {
        let err = load(
            r#"
settings:
  http:
    - listen: ""
tasks:
  a:
    commands: {start: [a]}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Listener { .. }));
    }
}
