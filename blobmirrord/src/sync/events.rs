use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use super::engine::PassSummary;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedWork {
    pub id: Uuid,
    pub enqueued_at: SystemTime,
}

impl QueuedWork {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            enqueued_at: SystemTime::now(),
        }
    }
}

impl Default for QueuedWork {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued(QueuedWork),
    Started(QueuedWork),
    Finished {
        work: QueuedWork,
        summary: PassSummary,
    },
    Errored {
        work: QueuedWork,
        cause: FailureCause,
    },
    QueueStarted,
    QueueStopped,
}

impl QueueEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::Enqueued(_) => "enqueued",
            QueueEvent::Started(_) => "started",
            QueueEvent::Finished { .. } => "finished",
            QueueEvent::Errored { .. } => "errored",
            QueueEvent::QueueStarted => "queue_started",
            QueueEvent::QueueStopped => "queue_stopped",
        }
    }
}

pub trait QueueObserver: Send + Sync {
    fn on_event(&self, event: &QueueEvent) -> anyhow::Result<()>;
}

impl<F> QueueObserver for F
where
    F: Fn(&QueueEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &QueueEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Observer failures and panics are logged and never reach the emitter.
pub struct EventHub {
    observers: RwLock<Vec<Arc<dyn QueueObserver>>>,
    sender: broadcast::Sender<QueueEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            observers: RwLock::new(Vec::new()),
            sender,
        }
    }
}

impl EventHub {
    pub fn add_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: QueueEvent) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for observer in observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(event = event.kind(), error = %err, "queue observer failed"),
                Err(_) => warn!(event = event.kind(), "queue observer panicked"),
            }
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}
