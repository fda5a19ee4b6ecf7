use std::sync::Arc;

use thiserror::Error;
use tracing::error;

use seqline_shared::ChatId;

use crate::db::{CounterStore, DbError};

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("Sequence store unavailable: {0}")]
    Unavailable(#[from] DbError),
}

/// Hands out per-chat sequence numbers.
///
/// The counter lives entirely in the store; the increment is one atomic
/// statement, so concurrent senders in the same chat always receive
/// distinct values. There is no in-process fallback: if the store cannot be
/// reached the send fails.
#[derive(Clone)]
pub struct Sequencer {
    counters: Arc<dyn CounterStore>,
}

impl Sequencer {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    pub async fn next_seq(&self, chat_id: &ChatId) -> Result<u64, SequencerError> {
        self.counters
            .increment_chat_counter(chat_id)
            .await
            .map_err(|e| {
                error!(chat = %chat_id, error = %e, "Failed to allocate seq");
                SequencerError::Unavailable(e)
            })
    }

    /// Highest seq allocated in `chat_id` so far.
    pub async fn latest_seq(&self, chat_id: &ChatId) -> Result<u64, SequencerError> {
        Ok(self.counters.chat_counter(chat_id).await?)
    }
}
