//! End-to-end configuration loading against real files.

use std::collections::BTreeMap;
use std::path::Path;

use legiond::config::{load_file, load_roles, ConfValue};
use legiond::context::Context;
use legiond::error::WatchError;
use legiond::task::ControlMode;

fn ok_probe(_: &str) -> Result<(), WatchError> {
    Ok(())
}

const FULL_CONFIG: &str = r#"
defines:
  NTP_CONF: /etc/ntp.conf
defaults:
  LOG_DIR: /var/log
role_defines:
  frontend:
    EDGE: "1"
settings:
  http:
    - listen: "127.0.0.1:8089"
      allow_control: true
tasks:
  timeset:
    control: once
    commands:
      start: [ntpd, -gqx]
  sshd:
    control: wait
    commands:
      start: [/usr/sbin/sshd, -D]
    events:
      - type: self
        action: "command:stop"
  ntpd:
    control: wait
    requires: [timeset, sshd]
    start_delay: 1
    pidfile: "/run/{Task_name}-{Task_instance}.pid"
    onexit:
      - type: start
        task: timeset
    commands:
      start:
        - ntpd
        - -n
        - {NTPD_OPTS: "{NTPD_OPTS}"}
    events:
      - type: file_change
        path: ["{NTP_CONF}"]
        action: "signal:HUP"
  haproxy:
    roles: [frontend]
    commands:
      start: [haproxy, -f, /etc/haproxy.cfg]
  db_server:
    roles: [backend]
    commands:
      start: [postgres]
"#;

#[test]
fn loads_a_full_document_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legiond.conf");
    std::fs::write(&path, FULL_CONFIG).unwrap();

    let loaded = load_file(&path, &ok_probe).unwrap();
    assert_eq!(loaded.table.len(), 5);

    let ntpd = &loaded.table["ntpd"];
    assert_eq!(ntpd.control, ControlMode::Wait);
    assert_eq!(ntpd.requires, vec!["timeset", "sshd"]);
    assert_eq!(ntpd.start_delay.as_secs(), 1);
    assert_eq!(ntpd.onexit[0].task, "timeset");
    assert_eq!(
        ntpd.pidfile.as_deref(),
        Some("/run/{Task_name}-{Task_instance}.pid")
    );

    let timeset = &loaded.table["timeset"];
    assert_eq!(timeset.control, ControlMode::Once);
    assert!(loaded.doc.settings.http[0].allow_control);
}

#[test]
fn argv_conditionals_resolve_against_defines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legiond.conf");
    std::fs::write(&path, FULL_CONFIG).unwrap();
    let loaded = load_file(&path, &ok_probe).unwrap();

    let mut ctx = Context::new();
    ctx.define("NTP_CONF", "/etc/ntp.conf");

    // Without NTPD_OPTS present the conditional is elided.
    let start = &loaded.table["ntpd"].commands["start"];
    assert_eq!(ctx.resolve_list(start), vec!["ntpd", "-n"]);

    // With it present the value is spliced and substituted.
    ctx.define("NTPD_OPTS", "-x");
    assert_eq!(ctx.resolve_list(start), vec!["ntpd", "-n", "-x"]);

    // Event paths template-resolve too.
    let event = &loaded.table["ntpd"].events[0];
    let paths = ctx.resolve_list(event.paths.as_ref().unwrap());
    assert_eq!(paths, vec!["/etc/ntp.conf"]);
}

#[test]
fn roles_file_drives_scope() {
    let dir = tempfile::tempdir().unwrap();
    let conf = dir.path().join("legiond.conf");
    let roles_path = dir.path().join("roles");
    std::fs::write(&conf, FULL_CONFIG).unwrap();
    std::fs::write(&roles_path, "frontend\n").unwrap();

    let loaded = load_file(&conf, &ok_probe).unwrap();
    let roles = load_roles(Some(&roles_path)).unwrap();
    let active: Vec<String> = roles.active().to_vec();

    assert!(loaded.table["haproxy"].participant(Some(active.as_slice()), false));
    assert!(!loaded.table["db_server"].participant(Some(active.as_slice()), false));
    // Roleless tasks are always in scope.
    assert!(loaded.table["sshd"].participant(Some(active.as_slice()), false));

    // Swap the roles file: scope flips without touching the config.
    std::fs::write(&roles_path, "backend\n").unwrap();
    let roles = load_roles(Some(&roles_path)).unwrap();
    let active: Vec<String> = roles.active().to_vec();
    assert!(!loaded.table["haproxy"].participant(Some(active.as_slice()), false));
    assert!(loaded.table["db_server"].participant(Some(active.as_slice()), false));
}

#[test]
fn missing_roles_file_inhibits_role_processing() {
    let missing = Path::new("/no/such/roles/file").to_path_buf();
    assert!(load_roles(Some(&missing)).is_none());
}

#[test]
fn defines_layering_matches_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legiond.conf");
    std::fs::write(&path, FULL_CONFIG).unwrap();
    let loaded = load_file(&path, &ok_probe).unwrap();

    let defines = legiond::config::scalar_map(&loaded.doc.defines);
    let defaults = legiond::config::scalar_map(&loaded.doc.defaults);
    let role_defines = legiond::config::scalar_role_map(&loaded.doc.role_defines);

    let mut ctx = Context::new();
    ctx.define("LOG_DIR", "/srv/log");
    let roles = vec!["frontend".to_string()];
    ctx.apply_defaults(&defaults, &BTreeMap::new(), &roles);
    ctx.apply_defines(&defines, &role_defines, &roles);

    // defaults never override, defines always do, role defines apply
    // for active roles.
    assert_eq!(ctx.get("LOG_DIR"), Some("/srv/log"));
    assert_eq!(ctx.get("NTP_CONF"), Some("/etc/ntp.conf"));
    assert_eq!(ctx.get("EDGE"), Some("1"));
}

#[test]
fn commands_survive_as_trees_until_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legiond.conf");
    std::fs::write(&path, FULL_CONFIG).unwrap();
    let loaded = load_file(&path, &ok_probe).unwrap();
    match &loaded.table["ntpd"].commands["start"] {
        ConfValue::List(items) => assert!(matches!(items[2], ConfValue::Cond(_))),
        other => panic!("unexpected shape: {other:?}"),
    }
}
