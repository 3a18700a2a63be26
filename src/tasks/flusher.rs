use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::db::TallyStore;
use crate::tally::Accumulator;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// What happens to an option's count when its database update fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Put the count back so the next tick retries it.
    #[default]
    Requeue,
    /// Forget the count.
    Drop,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(Self::Requeue),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown failure policy '{}' (expected 'requeue' or 'drop')", other)),
        }
    }
}

// Outcome of one flush cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub options: usize,
    pub applied: usize,
    pub failed: usize,
    pub requeued_votes: u64,
    pub dropped_votes: u64,
}

pub struct FlushScheduler {
    accumulator: Arc<Accumulator>,
    store: Arc<dyn TallyStore>,
    interval: Duration,
    policy: FailurePolicy,
}

impl FlushScheduler {
    pub fn new(
        accumulator: Arc<Accumulator>,
        store: Arc<dyn TallyStore>,
        interval: Duration,
        policy: FailurePolicy,
    ) -> Self {
        Self { accumulator, store, interval, policy }
    }

    /// Runs one flush cycle: drains the accumulator and writes each option's
    /// count to the store. A failed option does not stop the others.
    pub async fn flush(&self) -> FlushReport {
        let snapshot = self.accumulator.drain();
        let mut report = FlushReport { options: snapshot.len(), ..Default::default() };

        if snapshot.is_empty() {
            info!("No new votes. Skipping database update.");
            return report;
        }

        info!(
            "Updating database with {}",
            serde_json::to_string(&snapshot).unwrap_or_else(|_| format!("{:?}", snapshot))
        );

        // The lock is already released here, so slow writes never block voting
        let mut failed = Vec::new();
        for (option, count) in snapshot {
            match self.store.apply_tally(&option, count).await {
                Ok(_) => report.applied += 1,
                Err(e) => {
                    error!("Failed to update results for '{}': {}", option, e);
                    failed.push((option, count));
                }
            }
        }

        report.failed = failed.len();
        if failed.is_empty() {
            info!("Database update complete");
            return report;
        }

        let votes: u64 = failed.iter().map(|(_, count)| count).sum();
        match self.policy {
            FailurePolicy::Requeue => {
                warn!("Requeuing {} vote(s) for {} failed option(s)", votes, failed.len());
                self.accumulator.restore(failed);
                report.requeued_votes = votes;
            }
            FailurePolicy::Drop => {
                warn!("Dropping {} vote(s) for {} failed option(s)", votes, failed.len());
                report.dropped_votes = votes;
            }
        }
        report
    }

    /// Spawns the flush loop. The next tick is scheduled only after the
    /// previous cycle finished, so cycles never overlap.
    pub fn start(self) -> FlushHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        FlushHandle { stop_tx, task }
    }

    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        info!("Flushing votes every {:?}", self.interval);

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = sleep(self.interval) => {}
            }
            // Not raced against stop: a cycle that started always finishes
            self.flush().await;
        }

        info!("Flush scheduler stopped");
    }
}

pub struct FlushHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FlushHandle {
    /// Prevents further ticks. A cycle already running is left to finish.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Waits for the flush loop to exit, including any cycle in progress.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            error!("Flush task failed: {}", e);
        }
    }
}
