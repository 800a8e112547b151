use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::workers::jobs::{JobOptions, JobPayload, JobScheduler, QueueName};

/// Enqueues a reconciliation run on a fixed interval, independent of traffic
pub struct ReconciliationScheduler {
    scheduler: Arc<dyn JobScheduler>,
    interval: Duration,
}

impl ReconciliationScheduler {
    pub fn new(scheduler: Arc<dyn JobScheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "reconciliation scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; skip it so startup does not trigger a run.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.scheduler.enqueue(
                        QueueName::Reconciliation,
                        JobPayload::Reconcile,
                        JobOptions::default(),
                    ) {
                        Ok(job_id) => info!(job_id = %job_id, "reconciliation run scheduled"),
                        Err(e) => warn!(error = %e, "failed to schedule reconciliation"),
                    }
                }
            }
        }

        info!("reconciliation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::RecordingScheduler;

    #[tokio::test(start_paused = true)]
    async fn enqueues_each_interval_until_shutdown() {
        let recorder = Arc::new(RecordingScheduler::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            ReconciliationScheduler::new(recorder.clone(), Duration::from_secs(60)).run(shutdown_rx),
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(recorder.on(QueueName::Reconciliation).len(), 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
