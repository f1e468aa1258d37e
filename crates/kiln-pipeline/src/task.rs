use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shortest period a loop runs at; zero is raised to this.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A periodic loop owned by the component that spawned it.
///
/// The loop runs `tick` every `period` until [`stop`](Self::stop) signals it
/// through a watch channel; `stop` then waits for the task to finish. Dropping
/// the handle without stopping also ends the loop on its next wake-up.
pub struct BackgroundTask {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// The first tick fires one full `period` after spawning.
    pub fn spawn_periodic<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let name = name.into();
        let period = if period.is_zero() {
            tracing::warn!(task = %name, "Zero period requested, using the minimum");
            MIN_PERIOD
        } else {
            period
        };
        let (shutdown, mut signal) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if !tick().await {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(task = %task_name, "Background task stopped");
        });

        tracing::debug!(
            task = %name,
            period_ms = period.as_millis() as u64,
            "Background task started"
        );
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await
            && !e.is_cancelled()
        {
            tracing::warn!(task = %self.name, error = %e, "Background task panicked");
        }
    }
}
