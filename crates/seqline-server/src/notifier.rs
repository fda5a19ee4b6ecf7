//! Wake-ups for long-polling sync clients.
//!
//! Each user gets a `watch` channel holding their latest pts. Long-poll
//! handlers subscribe *before* querying the log so an append that lands
//! between the query and the wait is never missed.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use seqline_shared::UserId;

#[derive(Clone, Default)]
pub struct UpdateNotifier {
    channels: Arc<DashMap<UserId, watch::Sender<u64>>>,
}

impl UpdateNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: &UserId) -> watch::Receiver<u64> {
        self.channels
            .entry(user_id.clone())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Publish a new pts for `user_id`. Lower values than the last published
    /// one are ignored.
    pub fn notify(&self, user_id: &UserId, pts: u64) {
        if let Some(tx) = self.channels.get(user_id) {
            tx.send_if_modified(|current| {
                if pts > *current {
                    *current = pts;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Drop channels nobody is waiting on.
    pub fn purge_idle(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}
