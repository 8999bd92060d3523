//! Graceful shutdown
//!
//! Background tasks are spawned through [`ShutdownCoordinator::spawn`],
//! which races each task against a broadcast stop signal. On shutdown the
//! coordinator signals every task and waits for each one up to the grace
//! period, aborting the ones that do not finish.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Grace period for task termination
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// How the registered tasks ended
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub completed: usize,
    pub panicked: usize,
    pub aborted: usize,
}

pub struct ShutdownCoordinator {
    notify: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            notify,
            tasks: Vec::new(),
            grace,
        }
    }

    /// Receiver for the stop signal
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    /// Spawn a task that stops on the shutdown signal
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stop = self.subscribe();
        let handle = tokio::spawn(run_until_shutdown(task, stop));
        self.tasks.push((name, handle));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every task and wait for them to finish
    pub async fn shutdown(self) -> ShutdownSummary {
        info!(
            tasks = self.tasks.len(),
            grace_ms = self.grace.as_millis() as u64,
            "Stopping background tasks"
        );

        if self.notify.send(()).is_err() {
            // every task already finished and dropped its receiver
            info!("No task listening for the stop signal");
        }

        let mut summary = ShutdownSummary::default();
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout(self.grace, &mut handle).await {
                Ok(Ok(())) => {
                    info!("Task '{}' stopped", name);
                    summary.completed += 1;
                }
                Ok(Err(e)) => {
                    warn!("Task '{}' panicked: {}", name, e);
                    summary.panicked += 1;
                }
                Err(_) => {
                    warn!("Task '{}' did not stop within {:?}, aborting", name, self.grace);
                    handle.abort();
                    summary.aborted += 1;
                }
            }
        }

        summary
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS))
    }
}

/// Run a future until it completes or the stop signal arrives
pub async fn run_until_shutdown<F>(task: F, mut stop: broadcast::Receiver<()>)
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = task => {}
        _ = stop.recv() => {
            info!("Shutdown signal received");
        }
    }
}

/// Process-level shutdown request, set from signal handlers
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Wait until shutdown is requested or every sender is gone
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                warn!("Shutdown signal source dropped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_coordinator_stops_long_running_task() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.spawn("forever", async {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        assert_eq!(coordinator.task_count(), 1);

        let summary = coordinator.shutdown().await;

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.aborted, 0);
    }

    #[tokio::test]
    async fn test_coordinator_aborts_stuck_task() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let stop = coordinator.subscribe();
        drop(stop);

        // ignores the stop signal entirely
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        coordinator.tasks.push(("stuck", handle));

        let summary = coordinator.shutdown().await;

        assert_eq!(summary.aborted, 1);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (tx, rx) = broadcast::channel(1);

        let task_handle = tokio::spawn(run_until_shutdown(
            async {
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            rx,
        ));

        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task_handle)
            .await
            .expect("Task should complete after shutdown signal")
            .expect("Task should not panic");
    }

    #[tokio::test]
    async fn test_shutdown_signal_wait() {
        let (tx, rx) = watch::channel(false);
        let mut signal = ShutdownSignal::new(rx);

        let waiter = tokio::spawn(async move { signal.wait().await });
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should return after the request")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_signal_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        let mut signal = ShutdownSignal::new(rx);
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("wait should return when the source is gone");
    }
}
