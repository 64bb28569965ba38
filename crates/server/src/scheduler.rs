//! Periodic drivers for the chat sweep and the deadline scan.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pledge_agent::{AgentRuntime, DeadlineScanner};
use pledge_core::config::SchedulerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(config: &SchedulerConfig, runtime: Arc<AgentRuntime>, scanner: Arc<DeadlineScanner>) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let mut handles = Vec::new();

        if config.enabled {
            let chats_every = Duration::from_secs(config.check_chats_interval_secs.max(1));
            let deadlines_every = Duration::from_secs(config.check_deadlines_interval_secs.max(1));

            handles.push(tokio::spawn(run_every(chats_every, signal.clone(), move || {
                let runtime = Arc::clone(&runtime);
                async move {
                    if let Err(error) = runtime.check_chats(Utc::now()).await {
                        warn!(event_name = "server.scheduler.chats_failed", error = %error, "chat sweep failed");
                    }
                }
            })));
            handles.push(tokio::spawn(run_every(deadlines_every, signal, move || {
                let scanner = Arc::clone(&scanner);
                async move {
                    if let Err(error) = scanner.scan(Utc::now()).await {
                        warn!(
                            event_name = "server.scheduler.deadlines_failed",
                            error = %error,
                            "deadline scan failed"
                        );
                    }
                }
            })));

            info!(
                event_name = "server.scheduler.started",
                check_chats_interval_secs = chats_every.as_secs(),
                check_deadlines_interval_secs = deadlines_every.as_secs(),
                "schedulers started"
            );
        } else {
            info!(event_name = "server.scheduler.disabled", "periodic sweeps disabled by configuration");
        }

        Self { shutdown, handles }
    }

    /// Signals the loops and waits for any in-flight tick to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(error) = handle.await {
                warn!(event_name = "server.scheduler.join_failed", error = %error, "scheduler task ended abnormally");
            }
        }
    }
}

async fn run_every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;

    use super::run_every;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let (shutdown, signal) = watch::channel(false);
        let counter = Arc::clone(&ticks);

        let handle = tokio::spawn(run_every(Duration::from_secs(15), signal, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_secs(31)).await;
        shutdown.send(true).expect("send shutdown");
        handle.await.expect("join");

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
