//! # WatchSet: refcounted mapping from watched path to subscribers.
//!
//! Subscribers hold the task by **name**, never by handle; the name is
//! resolved against the legion's task table at delivery time, which
//! keeps the watch registry free of cycles. The refcount of a path is
//! its subscriber count: the first subscriber establishes the underlying
//! watch, the last one leaving releases it.
//!
//! Registration is declarative: each apply presents the complete desired
//! set (task event paths plus the config and roles files) and
//! [`WatchSet::reconcile`] diffs it against reality, so after any reload
//! the watched set is exactly the union the configuration implies.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::task::EventAction;
use crate::watch::FileWatcher;

/// Who asked for a path, and what firing it should do.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum WatchOwner {
    /// The configuration file; a change schedules a reload.
    Config,
    /// The roles file; same.
    Roles,
    /// The supervisor's own executable; a change schedules a reset so
    /// the re-exec picks up the new binary.
    SelfExe,
    /// A task event, by task name.
    Task(String),
}

/// One desired subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub path: PathBuf,
    pub owner: WatchOwner,
    /// Action to run; `None` for config/roles reload triggers.
    pub action: Option<EventAction>,
}

#[derive(Default)]
pub struct WatchSet {
    entries: BTreeMap<PathBuf, Vec<(WatchOwner, Option<EventAction>)>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the subscription set, adding and removing underlying
    /// watches as refcounts rise from or fall to zero.
    pub fn reconcile(&mut self, desired: Vec<Subscription>, watcher: &mut FileWatcher) {
        let mut next: BTreeMap<PathBuf, Vec<(WatchOwner, Option<EventAction>)>> = BTreeMap::new();
        for sub in desired {
            let entry = next.entry(sub.path).or_default();
            let item = (sub.owner, sub.action);
            if !entry.contains(&item) {
                entry.push(item);
            }
        }

        for path in self.entries.keys() {
            if !next.contains_key(path) {
                if let Err(e) = watcher.remove([path.clone()]) {
                    warn!(path = %path.display(), error = %e, "watch release failed");
                }
            }
        }
        for path in next.keys() {
            if !self.entries.contains_key(path) {
                if let Err(e) = watcher.add([path.clone()], true) {
                    warn!(path = %path.display(), error = %e, "watch add failed");
                }
            }
        }
        self.entries = next;
    }

    /// Subscribers of a path, in insertion order.
    pub fn subscribers(&self, path: &Path) -> &[(WatchOwner, Option<EventAction>)] {
        self.entries.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Current refcount of a path.
    pub fn refcount(&self, path: &Path) -> usize {
        self.entries.get(path).map(Vec::len).unwrap_or(0)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Stimulus;
    use crate::watch::{WakeKind, WatchOptions};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn watcher() -> FileWatcher {
        let (tx, _rx) = mpsc::unbounded_channel::<Stimulus>();
        FileWatcher::new(
            tx,
            WakeKind::File,
            WatchOptions {
                polling: true,
                timeout: Duration::ZERO,
                limit: None,
            },
        )
    }

    fn sub(path: &str, owner: WatchOwner) -> Subscription {
        Subscription {
            path: PathBuf::from(path),
            owner,
            action: None,
        }
    }

    #[tokio::test]
    async fn shared_path_is_watched_once_and_released_last() {
        let mut ws = WatchSet::new();
        let mut fw = watcher();
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.conf");
        std::fs::write(&shared, "x").unwrap();
        let shared_s = shared.to_str().unwrap();

        ws.reconcile(
            vec![
                sub(shared_s, WatchOwner::Task("a".into())),
                sub(shared_s, WatchOwner::Task("b".into())),
            ],
            &mut fw,
        );
        assert_eq!(ws.refcount(&shared), 2);
        assert_eq!(fw.len(), 1);

        // One subscriber leaves: watch retained.
        ws.reconcile(vec![sub(shared_s, WatchOwner::Task("b".into()))], &mut fw);
        assert_eq!(ws.refcount(&shared), 1);
        assert_eq!(fw.len(), 1);

        // Last subscriber leaves: watch released.
        ws.reconcile(vec![], &mut fw);
        assert_eq!(ws.refcount(&shared), 0);
        assert_eq!(fw.len(), 0);
    }

    #[tokio::test]
    async fn reconcile_converges_to_exact_union() {
        let mut ws = WatchSet::new();
        let mut fw = watcher();
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, "").unwrap();
        std::fs::write(&b, "").unwrap();

        ws.reconcile(
            vec![
                sub(a.to_str().unwrap(), WatchOwner::Config),
                sub(b.to_str().unwrap(), WatchOwner::Task("t".into())),
            ],
            &mut fw,
        );
        let watched: Vec<_> = ws.paths().map(Path::to_path_buf).collect();
        assert_eq!(watched, vec![a.clone(), b.clone()]);

        // Task drops out of scope; config remains.
        ws.reconcile(vec![sub(a.to_str().unwrap(), WatchOwner::Config)], &mut fw);
        let watched: Vec<_> = ws.paths().map(Path::to_path_buf).collect();
        assert_eq!(watched, vec![a]);
        assert_eq!(fw.len(), 1);
    }
}
