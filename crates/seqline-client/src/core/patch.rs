//! Typed store patches and the budgeted dispatch queue.
//!
//! Every store mutation the UI needs to see becomes a [`ChatPatch`]. Patches
//! are split to bounded sizes, queued in three priority lanes, coalesced at
//! the lane tail, and drained once per tick in a batch capped by patch count
//! and estimated op count.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tracing::{debug, warn};

use seqline_shared::{ChatId, Message, MessageId, UserId};

use super::store::MessageUpdate;
use crate::sync::SyncPhase;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChatPatch {
    /// Replace the active view.
    Reset {
        chat_id: ChatId,
        load_seq: u64,
        messages: Vec<Message>,
        has_more: bool,
        next_before_seq: Option<u64>,
    },
    Append {
        chat_id: ChatId,
        load_seq: u64,
        messages: Vec<Message>,
    },
    Prepend {
        chat_id: ChatId,
        load_seq: u64,
        messages: Vec<Message>,
        has_more: bool,
        next_before_seq: Option<u64>,
    },
    Delete {
        chat_id: ChatId,
        load_seq: u64,
        ids: Vec<MessageId>,
    },
    Update {
        chat_id: ChatId,
        load_seq: u64,
        updates: Vec<MessageUpdate>,
    },
    Meta(MetaPatch),
    Sync {
        phase: SyncPhase,
        pts: u64,
        socket_connected: bool,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Structural = 0,
    Incremental = 1,
    Cosmetic = 2,
}

impl ChatPatch {
    pub fn lane(&self) -> Lane {
        match self {
            Self::Reset { .. } | Self::Delete { .. } | Self::Sync { .. } => Lane::Structural,
            Self::Append { .. } | Self::Prepend { .. } | Self::Update { .. } => Lane::Incremental,
            Self::Meta(_) => Lane::Cosmetic,
        }
    }

    /// Estimated UI work, used against the per-tick op budget.
    pub fn ops(&self) -> usize {
        let n = match self {
            Self::Reset { messages, .. }
            | Self::Append { messages, .. }
            | Self::Prepend { messages, .. } => messages.len(),
            Self::Delete { ids, .. } => ids.len(),
            Self::Update { updates, .. } => updates.len(),
            Self::Meta(meta) => meta.entries(),
            Self::Sync { .. } => 1,
        };
        n.max(1)
    }

    /// `(chat, load_seq)` for patches that target a chat view.
    pub fn view(&self) -> Option<(&ChatId, u64)> {
        match self {
            Self::Reset { chat_id, load_seq, .. }
            | Self::Append { chat_id, load_seq, .. }
            | Self::Prepend { chat_id, load_seq, .. }
            | Self::Delete { chat_id, load_seq, .. }
            | Self::Update { chat_id, load_seq, .. } => Some((chat_id, *load_seq)),
            Self::Meta(_) | Self::Sync { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

/// Chat list key: the group id for groups, the other participant otherwise.
pub fn list_id(chat: &ChatId, me: &UserId) -> String {
    match chat {
        ChatId::Group(g) => g.to_string(),
        ChatId::Private { .. } => chat
            .peer_of(me)
            .map(|p| p.to_string())
            .unwrap_or_else(|| chat.to_string()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUpsert {
    pub chat_id: Option<ChatId>,
    pub title: Option<String>,
    pub is_group: bool,
}

impl ChatUpsert {
    fn absorb(&mut self, newer: ChatUpsert) {
        if newer.chat_id.is_some() {
            self.chat_id = newer.chat_id;
        }
        if newer.title.is_some() {
            self.title = newer.title;
        }
        self.is_group |= newer.is_group;
    }
}

/// Chat-list level changes, keyed by [`list_id`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaPatch {
    pub last_messages: BTreeMap<String, Message>,
    pub unread_delta: BTreeMap<String, i64>,
    pub online: BTreeMap<String, bool>,
    pub chat_upserts: BTreeMap<String, ChatUpsert>,
    pub chat_removals: Vec<String>,
}

impl MetaPatch {
    pub fn entries(&self) -> usize {
        self.last_messages.len()
            + self.unread_delta.len()
            + self.online.len()
            + self.chat_upserts.len()
            + self.chat_removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries() == 0
    }
}

/// Meta changes accumulated between ticks and flushed as one patch.
#[derive(Debug, Default)]
pub struct PendingMeta {
    meta: MetaPatch,
}

impl PendingMeta {
    pub fn last_message(&mut self, list_id: String, message: &Message) {
        match self.meta.last_messages.get(&list_id) {
            Some(prev) if prev.display_cmp(message).is_gt() => {}
            _ => {
                self.meta.last_messages.insert(list_id, message.clone());
            }
        }
    }

    pub fn add_unread(&mut self, list_id: String, delta: i64) {
        if delta != 0 {
            *self.meta.unread_delta.entry(list_id).or_default() += delta;
        }
    }

    pub fn set_online(&mut self, user_id: String, online: bool) {
        self.meta.online.insert(user_id, online);
    }

    pub fn upsert_chat(&mut self, list_id: String, upsert: ChatUpsert) {
        self.meta.chat_removals.retain(|r| r != &list_id);
        self.meta
            .chat_upserts
            .entry(list_id)
            .or_default()
            .absorb(upsert);
    }

    pub fn remove_chat(&mut self, list_id: String) {
        self.meta.chat_upserts.remove(&list_id);
        self.meta.last_messages.remove(&list_id);
        self.meta.unread_delta.remove(&list_id);
        if !self.meta.chat_removals.contains(&list_id) {
            self.meta.chat_removals.push(list_id);
        }
    }

    pub fn take(&mut self) -> Option<ChatPatch> {
        if self.meta.is_empty() {
            return None;
        }
        Some(ChatPatch::Meta(std::mem::take(&mut self.meta)))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PatchLimits {
    pub max_messages_per_patch: usize,
    pub max_ids_per_patch: usize,
    pub max_updates_per_patch: usize,
    pub patches_per_dispatch: usize,
    pub ops_per_dispatch: usize,
    /// Per-dispatch quota of each lane, indexed by [`Lane`].
    pub lane_quota: [usize; 3],
    pub warn_at: usize,
    pub warn_reset: usize,
}

impl Default for PatchLimits {
    fn default() -> Self {
        Self {
            max_messages_per_patch: 120,
            max_ids_per_patch: 256,
            max_updates_per_patch: 256,
            patches_per_dispatch: 24,
            ops_per_dispatch: 1_800,
            lane_quota: [12, 8, 4],
            warn_at: 300,
            warn_reset: 150,
        }
    }
}

/// Break a patch into pieces within the per-patch limits.
///
/// A reset keeps its first chunk as the reset and sends the rest as appends.
/// Prepend chunks come out newest first, so applying them in order rebuilds
/// the original ascending run at the head of the view.
pub fn split(patch: ChatPatch, limits: &PatchLimits) -> Vec<ChatPatch> {
    let max_m = limits.max_messages_per_patch.max(1);
    match patch {
        ChatPatch::Append { chat_id, load_seq, messages } if messages.len() > max_m => messages
            .chunks(max_m)
            .map(|c| ChatPatch::Append {
                chat_id: chat_id.clone(),
                load_seq,
                messages: c.to_vec(),
            })
            .collect(),
        ChatPatch::Reset {
            chat_id,
            load_seq,
            messages,
            has_more,
            next_before_seq,
        } if messages.len() > max_m => {
            let mut chunks = messages.chunks(max_m);
            let mut out = Vec::new();
            if let Some(first) = chunks.next() {
                out.push(ChatPatch::Reset {
                    chat_id: chat_id.clone(),
                    load_seq,
                    messages: first.to_vec(),
                    has_more,
                    next_before_seq,
                });
            }
            out.extend(chunks.map(|c| ChatPatch::Append {
                chat_id: chat_id.clone(),
                load_seq,
                messages: c.to_vec(),
            }));
            out
        }
        ChatPatch::Prepend {
            chat_id,
            load_seq,
            messages,
            has_more,
            next_before_seq,
        } if messages.len() > max_m => messages
            .chunks(max_m)
            .rev()
            .map(|c| ChatPatch::Prepend {
                chat_id: chat_id.clone(),
                load_seq,
                messages: c.to_vec(),
                has_more,
                next_before_seq,
            })
            .collect(),
        ChatPatch::Delete { chat_id, load_seq, ids } if ids.len() > limits.max_ids_per_patch => ids
            .chunks(limits.max_ids_per_patch.max(1))
            .map(|c| ChatPatch::Delete {
                chat_id: chat_id.clone(),
                load_seq,
                ids: c.to_vec(),
            })
            .collect(),
        ChatPatch::Update { chat_id, load_seq, updates }
            if updates.len() > limits.max_updates_per_patch =>
        {
            updates
                .chunks(limits.max_updates_per_patch.max(1))
                .map(|c| ChatPatch::Update {
                    chat_id: chat_id.clone(),
                    load_seq,
                    updates: c.to_vec(),
                })
                .collect()
        }
        other => vec![other],
    }
}

/// A queued patch and its push order.
#[derive(Debug)]
struct Queued {
    order: u64,
    patch: ChatPatch,
}

#[derive(Debug, Default)]
pub struct PatchQueue {
    lanes: [VecDeque<Queued>; 3],
    limits: PatchLimits,
    next_order: u64,
    pressure_warned: bool,
}

impl PatchQueue {
    pub fn new(limits: PatchLimits) -> Self {
        Self {
            lanes: Default::default(),
            limits,
            next_order: 0,
            pressure_warned: false,
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn push(&mut self, patch: ChatPatch) {
        for piece in split(patch, &self.limits) {
            let lane_idx = piece.lane() as usize;
            let foldable = self.lanes[lane_idx]
                .back()
                .is_some_and(|tail| !self.has_later_in_other_lane(lane_idx, &tail.patch, tail.order));
            let piece = match self.lanes[lane_idx].back_mut() {
                Some(tail) if foldable => coalesce_tail(&mut tail.patch, piece, &self.limits),
                _ => Some(piece),
            };
            if let Some(patch) = piece {
                self.next_order += 1;
                self.lanes[lane_idx].push_back(Queued {
                    order: self.next_order,
                    patch,
                });
            }
        }

        let queued = self.len();
        if queued >= self.limits.warn_at && !self.pressure_warned {
            warn!(queued, "Patch queue under pressure");
            self.pressure_warned = true;
        }
    }

    /// Whether another lane holds a patch for the same view as `patch` that
    /// was pushed after `order`. Folding into `patch` would then overtake it.
    fn has_later_in_other_lane(&self, lane_idx: usize, patch: &ChatPatch, order: u64) -> bool {
        let Some(view) = patch.view() else {
            return false;
        };
        self.lanes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != lane_idx)
            .any(|(_, lane)| {
                lane.iter()
                    .rev()
                    .take_while(|q| q.order > order)
                    .any(|q| q.patch.view() == Some(view))
            })
    }

    /// Whether another lane still holds an older patch for the same view.
    fn waits_on_other_lane(&self, lane_idx: usize, front: &Queued) -> bool {
        let Some(view) = front.patch.view() else {
            return false;
        };
        self.lanes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != lane_idx)
            .any(|(_, lane)| {
                lane.iter()
                    .take_while(|q| q.order < front.order)
                    .any(|q| q.patch.view() == Some(view))
            })
    }

    /// Take the next dispatch batch.
    ///
    /// Lanes are visited round-robin in priority order, each up to its quota.
    /// Patches for one view always leave in the order they were pushed: a
    /// lane whose front is behind an older patch of the same view in another
    /// lane waits its turn. A patch that would overflow the op budget waits
    /// for the next tick unless the batch is still empty. View patches for
    /// which `is_current` returns false are dropped.
    pub fn next_batch(&mut self, is_current: impl Fn(&ChatId, u64) -> bool) -> Vec<ChatPatch> {
        let mut batch: Vec<ChatPatch> = Vec::new();
        let mut ops = 0usize;
        let mut taken = [0usize; 3];
        let mut dropped = 0usize;

        for lane in self.lanes.iter_mut() {
            let before = lane.len();
            lane.retain(|q| {
                q.patch
                    .view()
                    .map_or(true, |(chat, load_seq)| is_current(chat, load_seq))
            });
            dropped += before - lane.len();
        }

        'rounds: loop {
            let mut progressed = false;
            for lane_idx in 0..self.lanes.len() {
                if batch.len() >= self.limits.patches_per_dispatch {
                    break 'rounds;
                }
                if taken[lane_idx] >= self.limits.lane_quota[lane_idx] && !batch.is_empty() {
                    continue;
                }
                let Some(front) = self.lanes[lane_idx].front() else {
                    continue;
                };
                if self.waits_on_other_lane(lane_idx, front) {
                    continue;
                }
                let cost = front.patch.ops();
                if ops + cost > self.limits.ops_per_dispatch && !batch.is_empty() {
                    continue;
                }
                if let Some(q) = self.lanes[lane_idx].pop_front() {
                    ops += cost;
                    taken[lane_idx] += 1;
                    batch.push(q.patch);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        if dropped > 0 {
            debug!(dropped, "Dropped patches for an inactive view");
        }
        if self.pressure_warned && self.len() < self.limits.warn_reset {
            self.pressure_warned = false;
        }
        batch
    }

    pub fn clear(&mut self) {
        self.lanes.iter_mut().for_each(VecDeque::clear);
    }
}

/// Fold `piece` into `tail` when both address the same view and the result
/// stays within limits. Returns the piece if it was not absorbed.
fn coalesce_tail(tail: &mut ChatPatch, piece: ChatPatch, limits: &PatchLimits) -> Option<ChatPatch> {
    match (tail, piece) {
        (
            ChatPatch::Append { chat_id, load_seq, messages },
            ChatPatch::Append { chat_id: c, load_seq: l, messages: mut more },
        ) if *chat_id == c
            && *load_seq == l
            && messages.len() + more.len() <= limits.max_messages_per_patch =>
        {
            messages.append(&mut more);
            None
        }
        (
            ChatPatch::Delete { chat_id, load_seq, ids },
            ChatPatch::Delete { chat_id: c, load_seq: l, ids: mut more },
        ) if *chat_id == c && *load_seq == l && ids.len() + more.len() <= limits.max_ids_per_patch => {
            ids.append(&mut more);
            None
        }
        (
            ChatPatch::Update { chat_id, load_seq, updates },
            ChatPatch::Update { chat_id: c, load_seq: l, updates: mut more },
        ) if *chat_id == c
            && *load_seq == l
            && updates.len() + more.len() <= limits.max_updates_per_patch =>
        {
            updates.append(&mut more);
            None
        }
        (_, piece) => Some(piece),
    }
}
