//! Records persisted in the cache besides messages themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use seqline_shared::ChatId;

// ---------------------------------------------------------------------------
// Chat metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMeta {
    pub chat_id: ChatId,
    /// Highest seq ever cached for this chat. Never decreases.
    pub last_seq: u64,
    /// Last time this chat was refreshed from the network.
    pub last_fetched: DateTime<Utc>,
    /// Rows currently held for this chat.
    pub message_count: u64,
}

// ---------------------------------------------------------------------------
// Pruning
// ---------------------------------------------------------------------------

/// Bounds on cached rows.
///
/// Each chat keeps at most `per_chat_max` of its highest-seq messages and the
/// whole cache keeps at most `total_max` rows, evicting the oldest `sent_at`
/// first. Automatic pruning only runs once the total exceeds `total_max` by
/// more than `slack_percent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunePolicy {
    pub per_chat_max: u64,
    pub total_max: u64,
    pub slack_percent: u64,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            per_chat_max: 2_000,
            total_max: 50_000,
            slack_percent: 10,
        }
    }
}

impl PrunePolicy {
    pub fn trigger_threshold(&self) -> u64 {
        self.total_max + self.total_max * self.slack_percent / 100
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub per_chat_removed: u64,
    pub total_removed: u64,
}
