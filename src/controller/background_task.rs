use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// A periodic job running on the runtime until stopped.
///
/// A run that is in progress when `stop` is called finishes first; no new run starts after.
pub struct BackgroundTask {
    name: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn spawn<F, Fut>(name: &str, period: Duration, initial_delay: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let task_name = name.to_string();
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => job().await,
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Background task '{}' left its loop", task_name);
        });
        info!("Started background task '{}' (every {:?})", name, period);
        Self {
            name: name.to_string(),
            stop,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the task and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        match self.handle.await {
            Ok(()) => info!("Stopped background task '{}'", self.name),
            Err(e) => warn!("Background task '{}' ended abnormally: {}", self.name, e),
        }
    }
}
