//! # Event subscriber trait and fan-out set.
//!
//! [`Subscribe`] is the extension point for plugging event handlers into
//! the runtime. Each subscriber gets a dedicated worker task fed from a
//! bounded queue, so a slow subscriber only affects itself: when its queue
//! is full the event is dropped for that subscriber and a
//! `SubscriberOverflow` event is published for observability.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::bus::Bus;
use super::event::{Event, EventKind};

/// Event subscriber for runtime observability.
///
/// `on_event` runs in a dedicated worker task, never in the publisher's
/// context, and events arrive in FIFO order.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Processes a single event.
    async fn on_event(&self, event: &Event);

    /// Subscriber name used in overflow reports.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Queue capacity for this subscriber's worker.
    fn queue_capacity(&self) -> usize {
        1024
    }
}

/// Fan-out set: one bounded queue + worker task per subscriber.
pub struct SubscriberSet {
    workers: Vec<Worker>,
    bus: Bus,
}

struct Worker {
    name: &'static str,
    tx: mpsc::Sender<Arc<Event>>,
}

impl SubscriberSet {
    /// Builds the set and spawns one worker per subscriber.
    pub fn new(subscribers: Vec<Arc<dyn Subscribe>>, bus: Bus) -> Self {
        let mut workers = Vec::with_capacity(subscribers.len());
        for sub in subscribers {
            let (tx, mut rx) = mpsc::channel::<Arc<Event>>(sub.queue_capacity());
            let name = sub.name();
            tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    sub.on_event(&ev).await;
                }
            });
            workers.push(Worker { name, tx });
        }
        Self { workers, bus }
    }

    /// Spawns the listener that drains the bus into the per-subscriber
    /// queues. Call once at runtime start, before the first publish.
    pub fn spawn_listener(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let me = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => me.emit(Arc::new(ev)),
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
    }

    fn emit(&self, ev: Arc<Event>) {
        for w in &self.workers {
            if ev.kind == EventKind::SubscriberOverflow {
                // Overflow reports are best-effort; never recurse on them.
                let _ = w.tx.try_send(Arc::clone(&ev));
                continue;
            }
            if w.tx.try_send(Arc::clone(&ev)).is_err() {
                self.bus.publish(Event::subscriber_overflow(w.name));
            }
        }
    }
}
