//! Tracing-backed subscriber for the event bus.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::event::{Event, EventKind};
use super::subscriber::Subscribe;

/// Emits each runtime event as a structured log line.
///
/// Installed by the binary; library embedders can supply their own
/// [`Subscribe`] implementations instead.
pub struct LogSubscriber;

#[async_trait]
impl Subscribe for LogSubscriber {
    async fn on_event(&self, e: &Event) {
        let task = e.task.as_deref().unwrap_or("-");
        match e.kind {
            EventKind::ProcStarted => {
                info!(task, instance = e.instance, pid = e.pid, "process started");
            }
            EventKind::ProcExited => {
                info!(
                    task,
                    instance = e.instance,
                    pid = e.pid,
                    status = e.status.as_deref(),
                    "process exited"
                );
            }
            EventKind::SpawnFailed => {
                warn!(task, instance = e.instance, error = e.error.as_deref(), "spawn failed");
            }
            EventKind::BackoffScheduled => {
                info!(task, instance = e.instance, delay = ?e.delay, "restart cooldown");
            }
            EventKind::StopEscalated => {
                warn!(task, "escalating to SIGKILL");
            }
            EventKind::TimeLimitHit => {
                info!(task, "time limit exceeded, stopping");
            }
            EventKind::OrphanAdopted => {
                info!(task, pid = e.pid, "adopted running orphan");
            }
            EventKind::TaskScoped => info!(task, "task in scope"),
            EventKind::TaskUnscoped => info!(task, "task leaving scope"),
            EventKind::ConfigReloaded => info!(path = ?e.path, "configuration reloaded"),
            EventKind::ConfigRejected => {
                warn!(error = e.error.as_deref(), "configuration rejected, previous retained");
            }
            EventKind::RolesChanged => info!("active roles changed"),
            EventKind::WatchDegraded => {
                warn!(path = ?e.path, "watch degraded to polling");
            }
            EventKind::ShutdownRequested => info!("shutdown requested"),
            EventKind::ResetRequested => info!("reset requested"),
            EventKind::AllStoppedWithin => info!("all processes stopped"),
            EventKind::StopLimitExceeded => {
                warn!(error = e.error.as_deref(), "stop limit exceeded");
            }
            EventKind::SubscriberOverflow => {
                debug!(error = e.error.as_deref(), "subscriber queue overflow");
            }
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
