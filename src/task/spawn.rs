//! # Process spawning.
//!
//! Turns a resolved argv + environment into a running child: PATH lookup
//! of bare command names, `procname` installed as argv[0], uid/gid from
//! the `user`/`group` settings, `cwd`, and all three stdio streams on
//! /dev/null. Children are intentionally not detached into their own
//! session or process group; `wait`-control tasks must stay attached.
//!
//! Each spawn installs a wait future that forwards the reaped status into
//! the event loop as a [`Stimulus::ChildExit`].

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::unistd::{Group, Uid, User};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::TaskError;
use crate::poller::Stimulus;
use crate::signals::ExitDetail;

/// Resolved identity for a child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user: Option<String>,
    pub uid: Option<u32>,
    pub group: Option<String>,
    pub gid: Option<u32>,
}

/// Resolves `user`/`group` settings to numeric ids.
///
/// Either may be a name or a decimal id; a `group` overrides the gid
/// implied by `user`. Unknown identities are errors: a task explicitly
/// configured to drop privilege must never silently run with more.
pub fn resolve_identity(
    task: &str,
    user: Option<&str>,
    group: Option<&str>,
) -> Result<Identity, TaskError> {
    let mut id = Identity::default();
    if let Some(user) = user {
        let entry = match user.parse::<u32>() {
            Ok(n) => User::from_uid(Uid::from_raw(n)).ok().flatten(),
            Err(_) => User::from_name(user).ok().flatten(),
        };
        let entry = entry.ok_or_else(|| TaskError::Identity {
            task: task.to_string(),
            name: user.to_string(),
            reason: "no such user".to_string(),
        })?;
        id.uid = Some(entry.uid.as_raw());
        id.gid = Some(entry.gid.as_raw());
        id.user = Some(entry.name);
    }
    if let Some(group) = group {
        let entry = match group.parse::<u32>() {
            Ok(n) => Group::from_gid(nix::unistd::Gid::from_raw(n)).ok().flatten(),
            Err(_) => Group::from_name(group).ok().flatten(),
        };
        let entry = entry.ok_or_else(|| TaskError::Identity {
            task: task.to_string(),
            name: group.to_string(),
            reason: "no such group".to_string(),
        })?;
        if let (Some(user_gid), true) = (id.gid, id.uid.is_some()) {
            if user_gid != entry.gid.as_raw() {
                info!(
                    task,
                    user_gid,
                    group_gid = entry.gid.as_raw(),
                    "group setting overrides user's gid"
                );
            }
        }
        id.gid = Some(entry.gid.as_raw());
        id.group = Some(entry.name);
    }
    Ok(id)
}

/// Locates a command on a `PATH` string, preferring readable+executable
/// entries. Names containing a separator are returned as given.
pub fn lookup_path(name: &str, path_var: Option<&str>) -> Option<PathBuf> {
    if name.contains('/') {
        return Some(PathBuf::from(name));
    }
    let path_var = match path_var {
        Some(p) => p.to_string(),
        None => std::env::var("PATH").ok()?,
    };
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    // Fall back to a merely readable match, as scripts fed to an
    // interpreter need not be executable.
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|md| md.is_file() && md.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Everything needed to exec one process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task: String,
    pub instance: u32,
    /// Fully resolved argument vector; element 0 is the program.
    pub argv: Vec<String>,
    /// Resolved `procname`, installed as argv[0] when set.
    pub procname: Option<String>,
    /// The child's entire environment.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
    pub identity: Identity,
}

/// Forks and execs the request. On success the child's exit will arrive
/// on `exit_tx` as a [`Stimulus::ChildExit`]; the returned pid keys it.
pub fn spawn(req: &SpawnRequest, exit_tx: &mpsc::UnboundedSender<Stimulus>) -> Result<i32, TaskError> {
    let first = req
        .argv
        .first()
        .ok_or_else(|| TaskError::NoStartCommand {
            task: req.task.clone(),
        })?;
    let program = lookup_path(first, req.env.get("PATH").map(String::as_str)).ok_or_else(|| {
        TaskError::PathLookup {
            task: req.task.clone(),
        }
    })?;

    if let Some(cwd) = &req.cwd {
        if !Path::new(cwd).is_dir() {
            return Err(TaskError::BadCwd {
                task: req.task.clone(),
                cwd: cwd.clone(),
            });
        }
    }

    let mut cmd = tokio::process::Command::new(&program);
    cmd.args(&req.argv[1..]);
    if let Some(procname) = &req.procname {
        cmd.arg0(procname);
    }
    cmd.env_clear();
    cmd.envs(&req.env);
    if let Some(cwd) = &req.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(gid) = req.identity.gid {
        cmd.gid(gid);
    }
    if let Some(uid) = req.identity.uid {
        cmd.uid(uid);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.kill_on_drop(false);

    let mut child = cmd.spawn().map_err(|source| TaskError::Spawn {
        task: req.task.clone(),
        instance: req.instance,
        source,
    })?;
    let pid = child.id().map(|p| p as i32).ok_or_else(|| TaskError::Spawn {
        task: req.task.clone(),
        instance: req.instance,
        source: std::io::Error::other("child exited before pid was read"),
    })?;
    debug!(task = %req.task, instance = req.instance, pid, program = %program.display(), "forked");

    let tx = exit_tx.clone();
    tokio::spawn(async move {
        let detail = match child.wait().await {
            Ok(status) => ExitDetail::from_status(status),
            Err(_) => ExitDetail::unknown(),
        };
        let _ = tx.send(Stimulus::ChildExit { pid, detail });
    });
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn lookup_prefers_executables_and_honors_slash() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("tool");
        fs::write(&plain, "#!/bin/sh\n").unwrap();
        let mut perms = fs::metadata(&plain).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&plain, perms).unwrap();

        let path_var = dir.path().to_str().unwrap().to_string();
        assert_eq!(lookup_path("tool", Some(&path_var)), Some(plain.clone()));
        assert_eq!(lookup_path("absent", Some(&path_var)), None);
        assert_eq!(
            lookup_path("/usr/bin/tool", Some(&path_var)),
            Some(PathBuf::from("/usr/bin/tool"))
        );
    }

    #[test]
    fn lookup_falls_back_to_readable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.py");
        fs::write(&script, "print()\n").unwrap();
        let path_var = dir.path().to_str().unwrap().to_string();
        assert_eq!(lookup_path("job.py", Some(&path_var)), Some(script));
    }

    #[test]
    fn unknown_identity_is_an_error() {
        let err = resolve_identity("t", Some("no-such-user-herein"), None).unwrap_err();
        assert!(matches!(err, TaskError::Identity { .. }));
    }

    #[test]
    fn root_resolves_when_present() {
        // Root exists on any Unix this supervisor targets.
        let id = resolve_identity("t", Some("root"), None).unwrap();
        assert_eq!(id.uid, Some(0));
        assert_eq!(id.gid, Some(0));
    }

    #[tokio::test]
    async fn spawn_reports_exit_through_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = SpawnRequest {
            task: "true".to_string(),
            instance: 0,
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            procname: None,
            env: BTreeMap::from([(
                "PATH".to_string(),
                "/usr/bin:/bin".to_string(),
            )]),
            cwd: None,
            identity: Identity::default(),
        };
        let pid = spawn(&req, &tx).unwrap();
        assert!(pid > 0);
        match rx.recv().await {
            Some(Stimulus::ChildExit { pid: got, detail }) => {
                assert_eq!(got, pid);
                assert_eq!(detail, ExitDetail::exited(3));
            }
            other => panic!("unexpected stimulus: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_cwd_is_rejected_before_fork() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let req = SpawnRequest {
            task: "t".to_string(),
            instance: 0,
            argv: vec!["/bin/true".to_string()],
            procname: None,
            env: BTreeMap::new(),
            cwd: Some("/no/such/dir/anywhere".to_string()),
            identity: Identity::default(),
        };
        assert!(matches!(
            spawn(&req, &tx),
            Err(TaskError::BadCwd { .. })
        ));
    }
}
