//! Fanout job queue and its worker pool.
//!
//! Jobs are idempotent: the executor only advances cursors with take-max
//! upserts and appends updates under a per-message dedupe key, so a job
//! that is retried or executed twice leaves the same state behind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use seqline_shared::{ChatId, MessageId, UserId};

use crate::fanout::FanoutExecutor;

/// Deliver one message to a set of recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutJob {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub seq: u64,
    pub sender_id: UserId,
    pub recipient_ids: Vec<UserId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Fanout queue is full")]
    Full,

    #[error("Fanout queue is closed")]
    Closed,
}

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn enqueue(&self, job: FanoutJob) -> Result<(), QueueError>;
}

/// In-process queue on a bounded tokio channel. A full channel is reported
/// as unavailable instead of applying backpressure to the sender.
#[derive(Clone)]
pub struct TokioJobQueue {
    tx: mpsc::Sender<FanoutJob>,
}

impl TokioJobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FanoutJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for TokioJobQueue {
    async fn enqueue(&self, job: FanoutJob) -> Result<(), QueueError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2*base, 4*base...
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Spawn `workers` tasks draining `rx`. They exit once every sender is
/// dropped and the channel is empty.
pub fn spawn_fanout_workers(
    rx: mpsc::Receiver<FanoutJob>,
    executor: Arc<FanoutExecutor>,
    workers: usize,
    retry: RetryPolicy,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..workers.max(1))
        .map(|worker| {
            let rx = rx.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { break };
                    run_with_retry(&executor, &job, retry).await;
                }
                debug!(worker, "Fanout worker stopped");
            })
        })
        .collect()
}

async fn run_with_retry(executor: &FanoutExecutor, job: &FanoutJob, retry: RetryPolicy) {
    for attempt in 1..=retry.attempts {
        match executor.execute(job).await {
            Ok(()) => return,
            Err(e) if attempt < retry.attempts => {
                let delay = retry.delay(attempt);
                warn!(
                    message_id = %job.message_id,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Fanout job failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    message_id = %job.message_id,
                    chat = %job.chat_id,
                    error = %e,
                    "Fanout job dropped after final attempt"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> FanoutJob {
        FanoutJob {
            message_id: MessageId::new(),
            chat_id: "g:team".parse().unwrap(),
            seq: 1,
            sender_id: UserId::from("alice"),
            recipient_ids: vec![UserId::from("bob")],
        }
    }

    #[tokio::test]
    async fn full_queue_reports_unavailable() {
        let (queue, _rx) = TokioJobQueue::new(1);
        assert!(queue.enqueue(job()).await.is_ok());
        assert_eq!(queue.enqueue(job()).await, Err(QueueError::Full));
    }

    #[tokio::test]
    async fn closed_queue_reports_unavailable() {
        let (queue, rx) = TokioJobQueue::new(4);
        drop(rx);
        assert_eq!(queue.enqueue(job()).await, Err(QueueError::Closed));
    }

    #[test]
    fn retry_delay_doubles() {
        let r = RetryPolicy::default();
        assert_eq!(r.delay(1), Duration::from_millis(500));
        assert_eq!(r.delay(2), Duration::from_millis(1000));
        assert_eq!(r.delay(4), Duration::from_millis(4000));
    }
}
