//! Live supervisor scenarios: real configs, real child processes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

use legiond::control::ControlRequest;
use legiond::events::Bus;
use legiond::legion::{Legion, LegionParams, Outcome};
use legiond::poller::Stimulus;
use legiond::task::TaskStatus;

struct Running {
    ctl: mpsc::UnboundedSender<Stimulus>,
    handle: tokio::task::JoinHandle<Result<Outcome, legiond::LegionError>>,
}

fn start(config_file: PathBuf, roles_file: Option<PathBuf>) -> Running {
    let params = LegionParams {
        config_file,
        roles_file,
        // Safety net so a wedged test cannot leave a supervisor behind.
        expires: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    let mut legion = Legion::new(params, Bus::new(256));
    let ctl = legion.control_sender();
    let handle = tokio::spawn(async move { legion.run().await });
    Running { ctl, handle }
}

async fn status_of(ctl: &mpsc::UnboundedSender<Stimulus>) -> BTreeMap<String, TaskStatus> {
    let (reply, rx) = oneshot::channel();
    ctl.send(Stimulus::Control(ControlRequest::Status { reply }))
        .unwrap();
    timeout(Duration::from_secs(5), rx).await.unwrap().unwrap()
}

async fn stop(running: Running) -> Outcome {
    let (reply, rx) = oneshot::channel();
    running
        .ctl
        .send(Stimulus::Control(ControlRequest::Stop { reply }))
        .unwrap();
    timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    timeout(Duration::from_secs(20), running.handle)
        .await
        .expect("legion did not stop in time")
        .unwrap()
        .unwrap()
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn once_task_runs_and_stop_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let conf = dir.path().join("legiond.conf");
    std::fs::write(
        &conf,
        format!(
            r#"
tasks:
  marker:
    control: once
    commands:
      start: [/bin/sh, -c, "echo done > {}"]
"#,
            marker.display()
        ),
    )
    .unwrap();

    let running = start(conf, None);
    wait_for("marker file", || marker.exists()).await;

    let status = status_of(&running.ctl).await;
    assert_eq!(status["marker"].control, "once");

    assert_eq!(stop(running).await, Outcome::Stopped);
}

#[tokio::test]
async fn requires_chain_orders_startup() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("order.log");
    let conf = dir.path().join("legiond.conf");
    std::fs::write(
        &conf,
        format!(
            r#"
tasks:
  first:
    control: once
    commands:
      start: [/bin/sh, -c, "echo first >> {log}"]
  second:
    control: wait
    requires: [first]
    commands:
      start: [/bin/sh, -c, "echo second >> {log}; exec sleep 30"]
"#,
            log = log.display()
        ),
    )
    .unwrap();

    let running = start(conf, None);
    wait_for("both tasks to have run", || {
        std::fs::read_to_string(&log)
            .map(|t| t.contains("second"))
            .unwrap_or(false)
    })
    .await;

    let text = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec!["first", "second"]);

    let status = status_of(&running.ctl).await;
    let second = &status["second"];
    assert!(second.processes.iter().any(|p| p.pid.is_some()));

    assert_eq!(stop(running).await, Outcome::Stopped);
}

#[tokio::test]
async fn roles_file_change_reshapes_the_running_set() {
    let dir = tempfile::tempdir().unwrap();
    let conf = dir.path().join("legiond.conf");
    let roles = dir.path().join("roles");
    std::fs::write(
        &conf,
        r#"
tasks:
  edge:
    roles: [frontend]
    commands:
      start: [/bin/sleep, "30"]
  store:
    roles: [backend]
    commands:
      start: [/bin/sleep, "30"]
"#,
    )
    .unwrap();
    std::fs::write(&roles, "frontend\n").unwrap();

    let running = start(conf, Some(roles.clone()));

    let alive = |status: &BTreeMap<String, TaskStatus>, name: &str| {
        status
            .get(name)
            .map(|t| t.processes.iter().any(|p| p.pid.is_some()))
            .unwrap_or(false)
    };

    // frontend in force: edge runs, store does not.
    for _ in 0..200 {
        let status = status_of(&running.ctl).await;
        if alive(&status, "edge") && !alive(&status, "store") {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    let status = status_of(&running.ctl).await;
    assert!(alive(&status, "edge"));
    assert!(!alive(&status, "store"));

    // Swap roles: the transition is driven by the roles-file watch.
    std::fs::write(&roles, "backend\n").unwrap();
    let mut flipped = false;
    for _ in 0..400 {
        let status = status_of(&running.ctl).await;
        if alive(&status, "store") && !alive(&status, "edge") {
            flipped = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(flipped, "role swap did not reshape the running set");

    assert_eq!(stop(running).await, Outcome::Stopped);
}

#[tokio::test]
async fn reload_of_unchanged_config_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let conf = dir.path().join("legiond.conf");
    let text = r#"
tasks:
  steady:
    commands:
      start: [/bin/sleep, "30"]
"#;
    std::fs::write(&conf, text).unwrap();

    let running = start(conf.clone(), None);
    wait_for_pid(&running.ctl, "steady").await;
    let before = pid_of(&status_of(&running.ctl).await, "steady");

    // Rewrite identical content and force a reload.
    std::fs::write(&conf, text).unwrap();
    let (reply, rx) = oneshot::channel();
    running
        .ctl
        .send(Stimulus::Control(ControlRequest::Reload { reply }))
        .unwrap();
    rx.await.unwrap();

    sleep(Duration::from_millis(500)).await;
    let after = pid_of(&status_of(&running.ctl).await, "steady");
    assert_eq!(before, after, "unchanged reload must not restart anything");

    assert_eq!(stop(running).await, Outcome::Stopped);
}

fn pid_of(status: &BTreeMap<String, TaskStatus>, name: &str) -> Option<i32> {
    status
        .get(name)
        .and_then(|t| t.processes.iter().find_map(|p| p.pid))
}

async fn wait_for_pid(ctl: &mpsc::UnboundedSender<Stimulus>, name: &str) {
    for _ in 0..200 {
        if pid_of(&status_of(ctl).await, name).is_some() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("task {name} never started");
}

#[tokio::test]
async fn check_config_distinguishes_good_and_bad() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.conf");
    let bad = dir.path().join("bad.conf");
    std::fs::write(&good, "tasks:\n  a:\n    commands: {start: [/bin/true]}\n").unwrap();
    std::fs::write(&bad, "tasks:\n  a:\n    requires: [missing]\n    commands: {start: [/bin/true]}\n").unwrap();

    let params = |p: &Path| LegionParams {
        config_file: p.to_path_buf(),
        ..Default::default()
    };
    assert!(Legion::check_config(&params(&good)).is_ok());
    assert!(Legion::check_config(&params(&bad)).is_err());
}
