//! # FileWatcher: change notifications for a dynamic path set.
//!
//! Delivers change notifications for individually watched files through a
//! wakeup stimulus registered with the Poller. Two back-ends:
//!
//! - **Native**: the platform notification facility via `notify`
//!   (inotify/kqueue/FSEvents). Raw events arrive on the backend's thread
//!   and are forwarded into an internal queue; [`FileWatcher::drain`]
//!   consumes the queue, maps events back to paths, and aggregates bursts.
//! - **Polling**: [`FileWatcher::scan`] stats every watched path at the
//!   caller's cadence and compares identity tuples
//!   (dev/inode/mode/nlink/uid/gid/size/mtime).
//!
//! A watched file that is renamed or deleted is reported as a change and
//! the watch is re-established on the replacement inode; if none exists
//! yet the path joins the pending-appearance set, which `scan()` promotes
//! (with a `created` change) when the path shows up. A path the native
//! backend refuses to watch degrades to per-path polling rather than
//! failing the caller. An unreadable path reports a change so the
//! consumer re-validates.
//!
//! Aggregation: after the first change, `drain()` keeps collecting until
//! `timeout` passes with no further events or `limit` distinct paths have
//! accumulated, collapsing editor-style save storms into one wakeup.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind as NotifyKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::poller::Stimulus;

/// Which back-end the watcher ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Native,
    Polling,
}

/// Which stimulus this watcher emits on wakeup.
#[derive(Debug, Clone, Copy)]
pub enum WakeKind {
    File,
    Module,
}

impl WakeKind {
    fn stimulus(self) -> Stimulus {
        match self {
            WakeKind::File => Stimulus::FileWake,
            WakeKind::Module => Stimulus::ModuleWake,
        }
    }
}

/// Tuning knobs; `Default` matches the supervisor's use.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Force polling mode (native mode is used when available otherwise).
    pub polling: bool,
    /// Aggregation window after the first change.
    pub timeout: Duration,
    /// Stop aggregating after this many distinct paths.
    pub limit: Option<usize>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            polling: false,
            timeout: Duration::from_millis(100),
            limit: None,
        }
    }
}

/// Identity tuple for polling comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatSig {
    dev: u64,
    ino: u64,
    mode: u32,
    nlink: u64,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
}

impl StatSig {
    fn of(path: &Path) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        let md = std::fs::metadata(path).ok()?;
        Some(Self {
            dev: md.dev(),
            ino: md.ino(),
            mode: md.mode(),
            nlink: md.nlink(),
            uid: md.uid(),
            gid: md.gid(),
            size: md.size(),
            mtime: md.mtime(),
            mtime_nsec: md.mtime_nsec(),
        })
    }
}

/// Per-path watch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathState {
    /// Covered by the native backend.
    Native,
    /// Compared by stat tuple on every `scan()`.
    Polled(StatSig),
    /// Does not exist yet; promoted by `scan()` on appearance.
    Pending,
}

struct WatchedPath {
    state: PathState,
    missing_ok: bool,
}

/// Raw event forwarded from the native backend thread.
#[derive(Debug)]
struct NativeEvent {
    path: PathBuf,
    gone: bool,
}

/// Tracks a set of paths and reports de-duplicated changes.
pub struct FileWatcher {
    mode: WatchMode,
    opts: WatchOptions,
    wake_kind: WakeKind,
    wake: mpsc::UnboundedSender<Stimulus>,
    paths: BTreeMap<PathBuf, WatchedPath>,
    changes: BTreeSet<PathBuf>,
    backend: Option<notify::RecommendedWatcher>,
    native_rx: mpsc::UnboundedReceiver<NativeEvent>,
}

impl FileWatcher {
    /// Builds a watcher whose wakeups go to `wake` as `kind` stimuli.
    ///
    /// Native mode is chosen when the platform backend can be
    /// constructed; otherwise the watcher starts in polling mode and
    /// relies entirely on `scan()`.
    pub fn new(
        wake: mpsc::UnboundedSender<Stimulus>,
        kind: WakeKind,
        opts: WatchOptions,
    ) -> Self {
        let (native_tx, native_rx) = mpsc::unbounded_channel();
        let mut backend = None;
        let mut mode = WatchMode::Polling;
        if !opts.polling {
            let fwd_wake = wake.clone();
            let fwd_kind = kind;
            let result = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let ev = match res {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!(error = %e, "native watch backend error");
                        return;
                    }
                };
                let gone = matches!(
                    ev.kind,
                    NotifyKind::Remove(_) | NotifyKind::Modify(ModifyKind::Name(_))
                );
                for path in ev.paths {
                    let _ = native_tx.send(NativeEvent { path, gone });
                }
                let _ = fwd_wake.send(fwd_kind.stimulus());
            });
            match result {
                Ok(w) => {
                    backend = Some(w);
                    mode = WatchMode::Native;
                }
                Err(e) => {
                    warn!(error = %e, "native watch unavailable, falling back to polling");
                }
            }
        }
        Self {
            mode,
            opts,
            wake_kind: kind,
            wake,
            paths: BTreeMap::new(),
            changes: BTreeSet::new(),
            backend,
            native_rx,
        }
    }

    /// The backend actually in use.
    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// Number of tracked paths (watched or pending).
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// All tracked paths, for invariant checks.
    pub fn tracked(&self) -> impl Iterator<Item = &Path> {
        self.paths.keys().map(PathBuf::as_path)
    }

    /// Begins watching each path. `missing_ok` permits paths that do not
    /// exist yet; their appearance is reported as a change.
    pub fn add<I, P>(&mut self, paths: I, missing_ok: bool) -> Result<(), WatchError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            let path = path.into();
            if let Some(entry) = self.paths.get_mut(&path) {
                entry.missing_ok = missing_ok;
                continue;
            }
            let state = self.establish(&path, missing_ok)?;
            self.paths.insert(path, WatchedPath { state, missing_ok });
        }
        Ok(())
    }

    /// Stops watching each path.
    pub fn remove<I, P>(&mut self, paths: I) -> Result<(), WatchError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            let path = path.into();
            match self.paths.remove(&path) {
                Some(entry) => {
                    if entry.state == PathState::Native {
                        self.unwatch_native(&path);
                    }
                    self.changes.remove(&path);
                }
                None => return Err(WatchError::NeverAdded { path }),
            }
        }
        Ok(())
    }

    /// Works out how a new path will be covered.
    fn establish(&mut self, path: &Path, missing_ok: bool) -> Result<PathState, WatchError> {
        if self.mode == WatchMode::Native {
            if let Some(backend) = self.backend.as_mut() {
                match backend.watch(path, RecursiveMode::NonRecursive) {
                    Ok(()) => return Ok(PathState::Native),
                    Err(e) => {
                        if missing_ok && !path.exists() {
                            return Ok(PathState::Pending);
                        }
                        // Watch slots can run out; stat-polling the one
                        // path keeps it covered.
                        warn!(path = %path.display(), error = %e, "watch degraded to polling");
                        return self.polled_state(path, missing_ok);
                    }
                }
            }
        }
        self.polled_state(path, missing_ok)
    }

    fn polled_state(&mut self, path: &Path, missing_ok: bool) -> Result<PathState, WatchError> {
        match StatSig::of(path) {
            Some(sig) => Ok(PathState::Polled(sig)),
            None if missing_ok => Ok(PathState::Pending),
            None => Err(WatchError::Watch {
                path: path.to_path_buf(),
                reason: "path does not exist".to_string(),
            }),
        }
    }

    fn unwatch_native(&mut self, path: &Path) {
        if let Some(backend) = self.backend.as_mut() {
            if let Err(e) = backend.unwatch(path) {
                debug!(path = %path.display(), error = %e, "unwatch failed");
            }
        }
    }

    /// Consumes and returns the de-duplicated set of changed paths since
    /// the previous call, finishing any in-progress native burst first.
    pub async fn drain(&mut self) -> BTreeSet<PathBuf> {
        if self.mode == WatchMode::Native {
            self.collect_native_burst().await;
        }
        std::mem::take(&mut self.changes)
    }

    /// Pulls queued native events, then keeps collecting until the
    /// aggregation timeout passes quietly or the distinct-path limit is
    /// reached.
    async fn collect_native_burst(&mut self) {
        loop {
            while let Ok(ev) = self.native_rx.try_recv() {
                self.apply_native(ev);
            }
            if self.opts.timeout.is_zero() {
                return;
            }
            if let Some(limit) = self.opts.limit {
                if self.changes.len() >= limit {
                    return;
                }
            }
            match time::timeout(self.opts.timeout, self.native_rx.recv()).await {
                Ok(Some(ev)) => self.apply_native(ev),
                Ok(None) | Err(_) => return,
            }
        }
    }

    fn apply_native(&mut self, ev: NativeEvent) {
        let Some(entry) = self.paths.get(&ev.path) else {
            debug!(path = %ev.path.display(), "event for unknown path ignored");
            return;
        };
        let missing_ok = entry.missing_ok;
        self.changes.insert(ev.path.clone());
        if !ev.gone {
            return;
        }
        // Removed or renamed away: chase the replacement inode.
        self.unwatch_native(&ev.path);
        let next = if ev.path.exists() {
            match self
                .backend
                .as_mut()
                .map(|b| b.watch(&ev.path, RecursiveMode::NonRecursive))
            {
                Some(Ok(())) => PathState::Native,
                _ => self
                    .polled_state(&ev.path, missing_ok)
                    .unwrap_or(PathState::Pending),
            }
        } else if missing_ok {
            PathState::Pending
        } else {
            warn!(path = %ev.path.display(), "watched path removed and missing not allowed");
            self.paths.remove(&ev.path);
            return;
        };
        if let Some(entry) = self.paths.get_mut(&ev.path) {
            entry.state = next;
        }
    }

    /// Forces a polling sweep: promotes pending paths that appeared and,
    /// for polled paths, compares stat tuples. Call at idle cadence; in
    /// polling mode this is the only change detector.
    pub fn scan(&mut self) {
        let mut newly_changed = Vec::new();
        for (path, entry) in &mut self.paths {
            match entry.state {
                PathState::Pending => {
                    if let Some(sig) = StatSig::of(path) {
                        info!(path = %path.display(), "pending path appeared");
                        // Native re-establishment happens on the next
                        // event; stat coverage is already correct.
                        let state = match (self.mode, self.backend.as_mut()) {
                            (WatchMode::Native, Some(backend)) => {
                                match backend.watch(path, RecursiveMode::NonRecursive) {
                                    Ok(()) => PathState::Native,
                                    Err(_) => PathState::Polled(sig),
                                }
                            }
                            _ => PathState::Polled(sig),
                        };
                        entry.state = state;
                        newly_changed.push(path.clone());
                    }
                }
                PathState::Polled(prev) => match StatSig::of(path) {
                    Some(sig) if sig != prev => {
                        entry.state = PathState::Polled(sig);
                        newly_changed.push(path.clone());
                    }
                    Some(_) => {}
                    None => {
                        if !entry.missing_ok {
                            warn!(path = %path.display(), "watched path removed or renamed");
                        }
                        entry.state = PathState::Pending;
                        newly_changed.push(path.clone());
                    }
                },
                PathState::Native => {}
            }
        }
        if !newly_changed.is_empty() {
            self.changes.extend(newly_changed);
            let _ = self.wake.send(self.wake_kind.stimulus());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn polling_watcher() -> (FileWatcher, mpsc::UnboundedReceiver<Stimulus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let w = FileWatcher::new(
            tx,
            WakeKind::File,
            WatchOptions {
                polling: true,
                timeout: Duration::ZERO,
                limit: None,
            },
        );
        (w, rx)
    }

    #[tokio::test]
    async fn polling_detects_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("watched.conf");
        fs::write(&file, "one").unwrap();

        let (mut w, mut wake) = polling_watcher();
        assert_eq!(w.mode(), WatchMode::Polling);
        w.add([&file], true).unwrap();

        w.scan();
        assert!(w.drain().await.is_empty());

        fs::write(&file, "one-two-three").unwrap();
        w.scan();
        let changed = w.drain().await;
        assert!(changed.contains(&file));
        assert!(wake.try_recv().is_ok());
    }

    #[tokio::test]
    async fn change_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "a").unwrap();

        let (mut w, _wake) = polling_watcher();
        w.add([&file], true).unwrap();
        fs::write(&file, "abc").unwrap();
        w.scan();
        assert_eq!(w.drain().await.len(), 1);
        // No further change, no further report.
        w.scan();
        assert!(w.drain().await.is_empty());
    }

    #[tokio::test]
    async fn missing_path_appears_as_created() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-yet");

        let (mut w, _wake) = polling_watcher();
        w.add([&file], true).unwrap();
        w.scan();
        assert!(w.drain().await.is_empty());

        fs::write(&file, "here").unwrap();
        w.scan();
        let changed = w.drain().await;
        assert!(changed.contains(&file));
    }

    #[tokio::test]
    async fn missing_not_ok_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ghost = dir.path().join("ghost");
        let (mut w, _wake) = polling_watcher();
        let err = w.add([&ghost], false).unwrap_err();
        assert!(matches!(err, WatchError::Watch { .. }));
    }

    #[tokio::test]
    async fn disappear_and_reappear_collapse_into_one_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cycled");
        fs::write(&file, "v1").unwrap();

        let (mut w, _wake) = polling_watcher();
        w.add([&file], true).unwrap();

        fs::remove_file(&file).unwrap();
        w.scan();
        fs::write(&file, "v2").unwrap();
        w.scan();

        let changed = w.drain().await;
        assert_eq!(changed.len(), 1);
        assert!(changed.contains(&file));
    }

    #[tokio::test]
    async fn remove_forgets_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "a").unwrap();

        let (mut w, _wake) = polling_watcher();
        w.add([&file], true).unwrap();
        assert_eq!(w.len(), 1);
        w.remove([&file]).unwrap();
        assert_eq!(w.len(), 0);

        let err = w.remove([&file]).unwrap_err();
        assert!(matches!(err, WatchError::NeverAdded { .. }));
    }
}
