use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::queue::{QueueError, QueueManager};

pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub period: Duration,
    pub auto_start: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            period: DEFAULT_SYNC_PERIOD,
            auto_start: true,
        }
    }
}

pub struct Scheduler {
    queue: QueueManager,
    settings: SchedulerSettings,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(queue: QueueManager, settings: SchedulerSettings) -> Self {
        Self {
            queue,
            settings,
            timer: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), QueueError> {
        if self.settings.auto_start {
            self.queue.start_queue().await?;
        }

        let mut timer = self
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if timer.is_some() {
            debug!("sync scheduler already active");
            return Ok(());
        }
        let queue = self.queue.clone();
        let period = self.settings.period.max(Duration::from_millis(1));
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let queue = queue.clone();
                tokio::spawn(async move {
                    if let Err(err) = queue.enqueue_work().await {
                        warn!(error = %err, "scheduled sync enqueue failed");
                    }
                });
            }
        }));
        info!(
            period_secs = period.as_secs(),
            auto_start = self.settings.auto_start,
            "sync scheduler started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(timer) = timer {
            timer.abort();
            info!("sync scheduler stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
