//! Background reconciliation.
//!
//! Plans are queued on a bounded flume channel and applied by a single worker
//! task, so a slow resource API never stalls the request path. A plan that does
//! not fully apply is re-applied, unchanged, after a delay.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;

use common::plan::ProvisionPlan;

use super::Reconciler;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("reconcile queue is full - worker may be overloaded")]
    Full,
    #[error("reconcile worker has been stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Applies per plan, including the first
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Job {
    /// Where the plan came from, for logs
    pub source: String,
    pub plan: Arc<ProvisionPlan>,
}

#[derive(Debug, Clone)]
pub struct ReconcileQueue {
    tx: flume::Sender<Job>,
}

impl ReconcileQueue {
    /// Returns the queue and the receiver to hand to [`run_worker`].
    pub fn new(size: usize) -> (Self, JobReceiver) {
        tracing::info!("Creating bounded reconcile queue with size {}", size);
        let (tx, rx) = flume::bounded(size.max(1));
        (Self { tx }, JobReceiver { rx })
    }

    pub fn submit(&self, source: impl Into<String>, plan: ProvisionPlan) -> Result<(), QueueError> {
        let job = Job {
            source: source.into(),
            plan: Arc::new(plan),
        };
        tracing::debug!(source = %job.source, "queueing provision plan");
        self.tx.try_send(job).map_err(|e| match e {
            flume::TrySendError::Full(_) => QueueError::Full,
            flume::TrySendError::Disconnected(_) => QueueError::Stopped,
        })
    }
}

#[derive(Debug)]
pub struct JobReceiver {
    rx: flume::Receiver<Job>,
}

impl JobReceiver {
    pub fn into_async(self) -> flume::r#async::RecvStream<'static, Job> {
        self.rx.into_stream()
    }
}

/// Apply queued plans until every sender is dropped or shutdown is signalled.
pub async fn run_worker(
    reconciler: Reconciler,
    receiver: JobReceiver,
    policy: RetryPolicy,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut jobs = receiver.into_async();
    tracing::info!("Starting reconcile worker");

    loop {
        tokio::select! {
            job = jobs.next() => match job {
                Some(job) => {
                    if !apply_with_retries(&reconciler, &job, policy, &mut shutdown_rx).await {
                        break;
                    }
                }
                None => {
                    tracing::info!("Reconcile queue closed");
                    break;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    tracing::info!("Reconcile worker shutting down");
}

/// Returns false if shutdown arrived while waiting to retry.
async fn apply_with_retries(
    reconciler: &Reconciler,
    job: &Job,
    policy: RetryPolicy,
    shutdown_rx: &mut watch::Receiver<()>,
) -> bool {
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let report = reconciler.apply(&job.plan).await;
        if report.is_success() {
            tracing::info!(source = %job.source, attempt, "plan reconciled");
            return true;
        }

        if attempt == max_attempts {
            tracing::error!(
                source = %job.source,
                attempts = max_attempts,
                report = %report,
                "giving up on plan"
            );
            return true;
        }

        tracing::warn!(
            source = %job.source,
            attempt,
            retry_in = ?policy.retry_delay,
            "plan incomplete, will resubmit"
        );
        tokio::select! {
            _ = tokio::time::sleep(policy.retry_delay) => {}
            _ = shutdown_rx.changed() => {
                tracing::info!(source = %job.source, "shutdown during retry wait");
                return false;
            }
        }
    }
    true
}
