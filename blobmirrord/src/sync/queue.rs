use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::engine::{EngineError, PassSummary};
use super::events::{EventHub, FailureCause, QueueEvent, QueueObserver, QueuedWork};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue manager has been shut down")]
    Disposed,
}

/// `cancel` is the in-flight token: it fires only on a forced stop.
pub trait WorkExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        work: QueuedWork,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<PassSummary, EngineError>>;
}

struct RunningLoop {
    loop_token: CancellationToken,
    work_token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct QueueState {
    pending: Option<QueuedWork>,
    current: Option<QueuedWork>,
    running: Option<RunningLoop>,
    disposed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    // Serializes start/stop so a new loop never overlaps a draining one.
    lifecycle: Mutex<()>,
    wake: Notify,
    executor: Arc<dyn WorkExecutor>,
    events: EventHub,
}

#[derive(Clone)]
pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    pub fn new(executor: Arc<dyn WorkExecutor>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                lifecycle: Mutex::new(()),
                wake: Notify::new(),
                executor,
                events: EventHub::default(),
            }),
        }
    }

    pub async fn enqueue_work(&self) -> Result<QueuedWork, QueueError> {
        let mut state = self.shared.state.lock().await;
        if state.disposed {
            return Err(QueueError::Disposed);
        }
        if let Some(pending) = &state.pending {
            debug!(work_id = %pending.id, "sync pass already pending");
            return Ok(pending.clone());
        }
        let work = QueuedWork::new();
        state.pending = Some(work.clone());
        self.shared.wake.notify_one();
        info!(work_id = %work.id, "sync pass enqueued");
        // Emitted under the lock so Enqueued always precedes Started.
        self.shared.events.emit(QueueEvent::Enqueued(work.clone()));
        Ok(work)
    }

    pub async fn start_queue(&self) -> Result<(), QueueError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let mut state = self.shared.state.lock().await;
        if state.disposed {
            return Err(QueueError::Disposed);
        }
        if state.running.is_some() {
            info!("sync queue already running");
            return Ok(());
        }
        info!("sync queue started");
        // Emitted before the loop exists so QueueStarted precedes any Started.
        self.shared.events.emit(QueueEvent::QueueStarted);

        let loop_token = CancellationToken::new();
        let work_token = CancellationToken::new();
        let handle = tokio::spawn(process_loop(
            Arc::clone(&self.shared),
            loop_token.clone(),
            work_token.clone(),
        ));
        state.running = Some(RunningLoop {
            loop_token,
            work_token,
            handle,
        });
        Ok(())
    }

    /// Stops dequeuing. With `finish_processing` the pass in flight runs to
    /// completion; without it the pass is cancelled. Returns once the
    /// processing loop has exited.
    pub async fn stop_queue(&self, finish_processing: bool) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let running = {
            let mut state = self.shared.state.lock().await;
            let running = state.running.take();
            if let Some(running) = &running {
                running.loop_token.cancel();
                if !finish_processing {
                    running.work_token.cancel();
                }
            }
            running
        };
        let Some(running) = running else {
            info!("sync queue is not running");
            return;
        };
        if let Err(err) = running.handle.await {
            if err.is_panic() {
                error!(error = %err, "sync queue loop panicked");
            } else {
                debug!("sync queue loop aborted");
            }
        }

        info!(finish_processing, "sync queue stopped");
        self.shared.events.emit(QueueEvent::QueueStopped);
    }

    pub async fn stop_queue_graceful(&self) {
        self.stop_queue(true).await;
    }

    pub async fn clear_queue(&self) {
        let mut state = self.shared.state.lock().await;
        if let Some(dropped) = state.pending.take() {
            info!(work_id = %dropped.id, "pending sync pass cleared");
        }
    }

    pub async fn queue_size(&self) -> usize {
        usize::from(self.shared.state.lock().await.pending.is_some())
    }

    pub async fn queued_items(&self) -> Vec<QueuedWork> {
        self.shared
            .state
            .lock()
            .await
            .pending
            .iter()
            .cloned()
            .collect()
    }

    pub async fn current_item(&self) -> Option<QueuedWork> {
        self.shared.state.lock().await.current.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.shared.state.lock().await.running.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.shared.events.add_observer(observer);
    }

    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().await;
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.pending = None;
        }
        self.stop_queue(false).await;
        debug!("sync queue disposed");
    }
}

async fn process_loop(
    shared: Arc<Shared>,
    loop_token: CancellationToken,
    work_token: CancellationToken,
) {
    loop {
        if loop_token.is_cancelled() {
            debug!("sync queue loop cancelled");
            break;
        }

        let next = {
            let mut state = shared.state.lock().await;
            // A stop may have landed while this task waited for the lock.
            let next = if loop_token.is_cancelled() {
                None
            } else {
                state.pending.take()
            };
            state.current = next.clone();
            next
        };
        let Some(work) = next else {
            tokio::select! {
                biased;
                _ = loop_token.cancelled() => {
                    debug!("sync queue loop cancelled while idle");
                    break;
                }
                _ = shared.wake.notified() => {}
            }
            continue;
        };

        info!(work_id = %work.id, "sync pass dequeued");
        shared.events.emit(QueueEvent::Started(work.clone()));

        let executor = Arc::clone(&shared.executor);
        let run = {
            let work = work.clone();
            let cancel = work_token.clone();
            async move { executor.execute(work, cancel).await }
        };
        let event = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(summary)) => QueueEvent::Finished {
                work: work.clone(),
                summary,
            },
            Ok(Err(err)) if err.is_cancelled() => {
                debug!(work_id = %work.id, "sync pass cancelled");
                QueueEvent::Errored {
                    work: work.clone(),
                    cause: FailureCause::Cancelled,
                }
            }
            Ok(Err(err)) => {
                error!(work_id = %work.id, error = %err, "sync pass failed");
                QueueEvent::Errored {
                    work: work.clone(),
                    cause: FailureCause::Failed(err.to_string()),
                }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(work_id = %work.id, panic = %message, "sync pass panicked");
                QueueEvent::Errored {
                    work: work.clone(),
                    cause: FailureCause::Failed(message),
                }
            }
        };
        shared.events.emit(event);
        shared.state.lock().await.current = None;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "executor panicked".to_string()
    }
}
