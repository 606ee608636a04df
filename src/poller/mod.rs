//! # Poller: uniform multiplexer over stimulus sources.
//!
//! The event loop owns exactly one [`Poller`]. Every asynchronous input —
//! OS signals, child exits, file-watch wakeups, control-plane requests —
//! is registered as a source and consumed through [`Poller::poll`], which
//! waits up to a millisecond timeout and returns the pending
//! `(source, stimulus)` pairs.
//!
//! ## Ordering
//! Stimuli delivered in the same wakeup are returned in a deterministic
//! order: signals first, then child exits in numeric pid order, then
//! watcher wakeups, then control requests. This makes configuration
//! reloads precede the respawn decisions they may obviate.
//!
//! ## Timeout semantics
//! - `timeout_ms < 0` waits until a stimulus arrives
//! - `timeout_ms == 0` is a non-blocking sweep
//! - interrupted or source-less waits return an empty list, never an error
//!
//! The poller is owned by the single event-loop task; no concurrent calls.

use tokio::sync::mpsc;
use tokio::time::{self, Duration};

use crate::control::ControlRequest;
use crate::signals::ExitDetail;

/// Identifies a registered stimulus source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceId {
    /// OS termination/reset signals.
    Signals,
    /// Child-exit notifications.
    Reaper,
    /// File watcher wakeups.
    FileEvents,
    /// Module watcher wakeups.
    ModuleEvents,
    /// Control-plane requests.
    Control,
}

/// A delivered OS signal, already classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGTERM: stop everything, then exit.
    Terminate,
    /// SIGINT: same as terminate.
    Interrupt,
    /// SIGHUP: stop everything, then re-exec.
    Hangup,
}

/// One unit of external stimulus for the event loop.
#[derive(Debug)]
pub enum Stimulus {
    /// An OS signal arrived.
    Signal(SignalEvent),
    /// A child process was reaped.
    ChildExit { pid: i32, detail: ExitDetail },
    /// The file watcher has pending changes; drain it.
    FileWake,
    /// The module watcher has pending changes; drain it.
    ModuleWake,
    /// An operator request from the control plane.
    Control(ControlRequest),
}

impl Stimulus {
    /// Dispatch class rank, smaller first.
    fn class_rank(&self) -> u8 {
        match self {
            Stimulus::Signal(_) => 0,
            Stimulus::ChildExit { .. } => 1,
            Stimulus::FileWake | Stimulus::ModuleWake => 2,
            Stimulus::Control(_) => 3,
        }
    }

    /// Secondary sort key within a class.
    fn within_class(&self) -> i32 {
        match self {
            Stimulus::ChildExit { pid, .. } => *pid,
            _ => 0,
        }
    }
}

struct Source {
    id: SourceId,
    rx: mpsc::UnboundedReceiver<Stimulus>,
}

/// Multiplexer over registered stimulus sources.
pub struct Poller {
    sources: Vec<Source>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Registers a source. Re-registering an id replaces the previous
    /// receiver.
    pub fn register(&mut self, id: SourceId, rx: mpsc::UnboundedReceiver<Stimulus>) {
        self.unregister(id);
        self.sources.push(Source { id, rx });
    }

    /// Removes a source; unknown ids are ignored.
    pub fn unregister(&mut self, id: SourceId) {
        self.sources.retain(|s| s.id != id);
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Waits up to `timeout_ms` for stimuli and returns everything
    /// pending, ordered by dispatch class.
    pub async fn poll(&mut self, timeout_ms: i64) -> Vec<(SourceId, Stimulus)> {
        let mut ready = self.sweep();
        if ready.is_empty() && timeout_ms != 0 {
            let first = if timeout_ms < 0 {
                self.wait_any().await
            } else {
                let window = Duration::from_millis(timeout_ms as u64);
                match time::timeout(window, self.wait_any()).await {
                    Ok(first) => first,
                    Err(_) => None,
                }
            };
            if let Some(item) = first {
                ready.push(item);
                ready.extend(self.sweep());
            }
        }
        ready.sort_by_key(|(_, s)| (s.class_rank(), s.within_class()));
        ready
    }

    /// Non-blocking collection of everything already queued.
    fn sweep(&mut self) -> Vec<(SourceId, Stimulus)> {
        let mut out = Vec::new();
        for src in &mut self.sources {
            while let Ok(st) = src.rx.try_recv() {
                out.push((src.id, st));
            }
        }
        out
    }

    /// Waits until any source yields one stimulus. Closed sources are
    /// dropped; returns `None` only when no sources remain.
    async fn wait_any(&mut self) -> Option<(SourceId, Stimulus)> {
        loop {
            if self.sources.is_empty() {
                return None;
            }
            let (res, idx) = {
                let futs: Vec<_> = self
                    .sources
                    .iter_mut()
                    .map(|s| Box::pin(s.rx.recv()))
                    .collect();
                let (res, idx, rest) = futures::future::select_all(futs).await;
                drop(rest);
                (res, idx)
            };
            match res {
                Some(st) => {
                    let id = self.sources[idx].id;
                    return Some((id, st));
                }
                None => {
                    self.sources.remove(idx);
                }
            }
        }
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poller_with(id: SourceId) -> (Poller, mpsc::UnboundedSender<Stimulus>) {
        let mut p = Poller::new();
        let (tx, rx) = mpsc::unbounded_channel();
        p.register(id, rx);
        (p, tx)
    }

    #[tokio::test]
    async fn zero_timeout_is_non_blocking() {
        let (mut p, tx) = poller_with(SourceId::Signals);
        assert!(p.poll(0).await.is_empty());
        tx.send(Stimulus::Signal(SignalEvent::Terminate)).unwrap();
        let got = p.poll(0).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, SourceId::Signals);
    }

    #[tokio::test]
    async fn timeout_expires_without_stimulus() {
        let (mut p, _tx) = poller_with(SourceId::FileEvents);
        let got = p.poll(10).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn pending_stimuli_are_class_ordered() {
        let mut p = Poller::new();
        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        let (file_tx, file_rx) = mpsc::unbounded_channel();
        p.register(SourceId::Reaper, reap_rx);
        p.register(SourceId::FileEvents, file_rx);
        p.register(SourceId::Signals, sig_rx);

        file_tx.send(Stimulus::FileWake).unwrap();
        reap_tx
            .send(Stimulus::ChildExit {
                pid: 900,
                detail: ExitDetail::exited(0),
            })
            .unwrap();
        reap_tx
            .send(Stimulus::ChildExit {
                pid: 7,
                detail: ExitDetail::exited(1),
            })
            .unwrap();
        sig_tx.send(Stimulus::Signal(SignalEvent::Hangup)).unwrap();

        let got = p.poll(0).await;
        let kinds: Vec<u8> = got.iter().map(|(_, s)| s.class_rank()).collect();
        assert_eq!(kinds, vec![0, 1, 1, 2]);
        // Child exits in numeric pid order.
        match (&got[1].1, &got[2].1) {
            (Stimulus::ChildExit { pid: a, .. }, Stimulus::ChildExit { pid: b, .. }) => {
                assert!(a < b);
            }
            other => panic!("unexpected order: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wakes_on_late_stimulus() {
        let (mut p, tx) = poller_with(SourceId::Control);
        let sender = tokio::spawn(async move {
            time::sleep(Duration::from_millis(5)).await;
            tx.send(Stimulus::FileWake).unwrap();
        });
        let got = p.poll(1000).await;
        assert_eq!(got.len(), 1);
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn closed_source_is_dropped() {
        let (mut p, tx) = poller_with(SourceId::ModuleEvents);
        drop(tx);
        let got = p.poll(5).await;
        assert!(got.is_empty());
        assert_eq!(p.len(), 0);
    }
}
