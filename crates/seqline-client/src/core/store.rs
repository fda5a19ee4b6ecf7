//! In-memory message cache, one [`ChatCacheState`] per chat.
//!
//! Messages are kept in display order ([`Message::display_cmp`]): unsequenced
//! local messages first, then ascending seq. Ids and seqs are unique within a
//! chat. A redelivered id is reconciled with [`Message::reconcile`], the same
//! rule the durable cache applies, so both layers converge on one copy.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use seqline_shared::{ChatId, Message, MessageId, MessageStatus, UserId};

use super::merge::SeqMergeStrategy;

/// Large batches against large chats pre-filter fresh seqs with the merge
/// strategy's `diff` instead of probing the seq set per message.
const DIFF_MIN_INCOMING: usize = 32;
const DIFF_MIN_EXISTING: usize = 64;

pub const SEARCH_MAX_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionAnchor {
    /// Following the live tail; trimming drops the oldest messages.
    #[default]
    Newest,
    /// Reading history; trimming drops the newest messages.
    Oldest,
}

/// Change to one message, as carried by `update` patches. Status-only
/// changes leave `message` empty; edits and tombstones carry the new copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    pub id: MessageId,
    pub status: MessageStatus,
    pub read_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

impl MessageUpdate {
    pub fn status_of(m: &Message) -> Self {
        Self {
            id: m.id,
            status: m.status,
            read_count: m.read_count,
            message: None,
        }
    }

    pub fn from_message(m: &Message) -> Self {
        Self {
            message: Some(m.clone()),
            ..Self::status_of(m)
        }
    }
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Newly inserted messages, in display order.
    pub added: Vec<Message>,
    /// Existing messages replaced by a newer revision.
    pub updated: Vec<Message>,
}

#[derive(Debug)]
pub struct ChatCacheState {
    pub chat_id: ChatId,
    pub is_group: bool,
    messages: Vec<Message>,
    by_id: HashMap<MessageId, Message>,
    seq_set: HashSet<u64>,
    seq_list: Vec<u64>,
    pub read_receipt_seq: u64,
    pub read_receipt_count: u32,
    pub has_more: bool,
    pub next_before_seq: Option<u64>,
    pub retention_anchor: RetentionAnchor,
}

impl ChatCacheState {
    fn new(chat_id: ChatId) -> Self {
        Self {
            is_group: chat_id.is_group(),
            chat_id,
            messages: Vec::new(),
            by_id: HashMap::new(),
            seq_set: HashSet::new(),
            seq_list: Vec::new(),
            read_receipt_seq: 0,
            read_receipt_count: 0,
            has_more: true,
            next_before_seq: None,
            retention_anchor: RetentionAnchor::Newest,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.by_id.get(id)
    }

    pub fn seq_list(&self) -> &[u64] {
        &self.seq_list
    }

    pub fn min_seq(&self) -> Option<u64> {
        self.seq_list.first().copied()
    }

    pub fn max_seq(&self) -> Option<u64> {
        self.seq_list.last().copied()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The newest `n` messages.
    pub fn tail(&self, n: usize) -> &[Message] {
        &self.messages[self.messages.len().saturating_sub(n)..]
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.by_id.clear();
        self.seq_set.clear();
        self.seq_list.clear();
        self.read_receipt_seq = 0;
        self.read_receipt_count = 0;
    }

    fn first_seq_index(&self) -> usize {
        self.messages.partition_point(|m| m.seq().is_none())
    }

    fn position_of(&self, m: &Message) -> Option<usize> {
        self.messages.binary_search_by(|x| x.display_cmp(m)).ok()
    }

    fn rebuild_seq_list(&mut self) {
        self.seq_list = self.messages.iter().filter_map(Message::seq).collect();
    }

    fn forget(&mut self, m: &Message) {
        self.by_id.remove(&m.id);
        if let Some(seq) = m.seq() {
            self.seq_set.remove(&seq);
        }
    }

    /// Swap `old` for its reconciled copy, moving it if its display key changed.
    fn replace_entity(&mut self, old: &Message, mut next: Message) -> Message {
        if next.seq() != old.seq() {
            match next.seq() {
                Some(seq) if !self.seq_set.contains(&seq) => {
                    self.seq_set.insert(seq);
                    if let Some(prev) = old.seq() {
                        self.seq_set.remove(&prev);
                    }
                }
                _ => next.seq = old.seq,
            }
        }

        match self.position_of(old) {
            Some(idx) if old.display_cmp(&next) == Ordering::Equal => {
                self.messages[idx] = next.clone();
            }
            Some(idx) => {
                self.messages.remove(idx);
                let at = self
                    .messages
                    .partition_point(|m| m.display_cmp(&next) == Ordering::Less);
                self.messages.insert(at, next.clone());
                self.rebuild_seq_list();
            }
            None => {}
        }
        self.by_id.insert(next.id, next.clone());
        next
    }

    /// Splice an out-of-range batch: seq'd messages through the merge
    /// strategy, unseq'd ones by sorting.
    fn merge_unordered(
        &mut self,
        strategy: &dyn SeqMergeStrategy,
        added: &[Message],
        added_seqs: &[u64],
    ) {
        let split = self.first_seq_index();
        let mut unseq: Vec<Message> = self.messages.drain(..split).collect();
        let existing = std::mem::take(&mut self.messages);

        let merged = strategy.merge(&self.seq_list, added_seqs);
        let mut by_seq: HashMap<u64, Message> = existing
            .into_iter()
            .filter_map(|m| m.seq().map(|s| (s, m)))
            .collect();
        for m in added {
            match m.seq() {
                Some(s) => {
                    by_seq.insert(s, m.clone());
                }
                None => unseq.push(m.clone()),
            }
        }
        unseq.sort_by(Message::display_cmp);

        let mut messages = unseq;
        messages.extend(merged.iter().filter_map(|s| by_seq.remove(s)));
        self.messages = messages;
        self.seq_list = merged;
    }
}

// ---------------------------------------------------------------------------
// LRU of chats
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ChatLru {
    limit: usize,
    entries: HashMap<ChatId, ChatCacheState>,
    order: VecDeque<ChatId>,
}

impl ChatLru {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, chat_id: &ChatId) {
        if let Some(pos) = self.order.iter().position(|c| c == chat_id) {
            if let Some(c) = self.order.remove(pos) {
                self.order.push_back(c);
            }
        }
    }

    fn peek(&self, chat_id: &ChatId) -> Option<&ChatCacheState> {
        self.entries.get(chat_id)
    }

    fn peek_mut(&mut self, chat_id: &ChatId) -> Option<&mut ChatCacheState> {
        self.entries.get_mut(chat_id)
    }

    /// Fetch or create a chat, evicting the least recently used one that is
    /// not `pinned`.
    fn get_or_create(&mut self, chat_id: &ChatId, pinned: Option<&ChatId>) -> &mut ChatCacheState {
        if self.entries.contains_key(chat_id) {
            self.touch(chat_id);
        } else {
            while self.entries.len() >= self.limit {
                let Some(victim) = self
                    .order
                    .iter()
                    .position(|c| Some(c) != pinned)
                    .and_then(|pos| self.order.remove(pos))
                else {
                    break;
                };
                self.entries.remove(&victim);
                debug!(chat = %victim, "Evicted chat from memory");
            }
            self.order.push_back(chat_id.clone());
        }
        self.entries
            .entry(chat_id.clone())
            .or_insert_with(|| ChatCacheState::new(chat_id.clone()))
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ChatCoreStore {
    chats: ChatLru,
    strategy: Box<dyn SeqMergeStrategy>,
    active: Option<ChatId>,
    active_load_seq: u64,
}

impl ChatCoreStore {
    pub fn new(chat_cache_limit: usize, strategy: Box<dyn SeqMergeStrategy>) -> Self {
        Self {
            chats: ChatLru::new(chat_cache_limit),
            strategy,
            active: None,
            active_load_seq: 0,
        }
    }

    pub fn chat(&self, chat_id: &ChatId) -> Option<&ChatCacheState> {
        self.chats.peek(chat_id)
    }

    pub fn get_or_create(&mut self, chat_id: &ChatId) -> &mut ChatCacheState {
        self.chats.get_or_create(chat_id, self.active.as_ref())
    }

    pub fn cached_chats(&self) -> usize {
        self.chats.entries.len()
    }

    // --- active view ---

    pub fn set_active(&mut self, chat_id: &ChatId, load_seq: u64) -> &mut ChatCacheState {
        self.active = Some(chat_id.clone());
        self.active_load_seq = load_seq;
        self.chats.get_or_create(chat_id, Some(chat_id))
    }

    pub fn clear_active(&mut self) {
        self.active = None;
        self.active_load_seq = 0;
    }

    pub fn active_chat(&self) -> Option<&ChatId> {
        self.active.as_ref()
    }

    pub fn active_load_seq(&self) -> u64 {
        self.active_load_seq
    }

    /// Whether `(chat_id, load_seq)` still names the active view.
    pub fn is_active(&self, chat_id: &ChatId, load_seq: u64) -> bool {
        self.active.as_ref() == Some(chat_id) && self.active_load_seq == load_seq
    }

    pub fn clear_all(&mut self) {
        self.chats.clear();
        self.clear_active();
    }

    // --- mutation ---

    /// Merge a batch into a chat. Messages addressed to another chat are
    /// ignored; a seq already held by a different id is skipped.
    pub fn merge_messages(&mut self, chat_id: &ChatId, incoming: Vec<Message>) -> MergeOutcome {
        let strategy = self.strategy.as_ref();
        let chat = self.chats.get_or_create(chat_id, self.active.as_ref());
        let mut outcome = MergeOutcome::default();

        let fresh: Option<HashSet<u64>> =
            if incoming.len() >= DIFF_MIN_INCOMING && chat.messages.len() >= DIFF_MIN_EXISTING {
                let mut seqs: Vec<u64> = incoming.iter().filter_map(Message::seq).collect();
                seqs.sort_unstable();
                Some(strategy.diff(&chat.seq_list, &seqs).into_iter().collect())
            } else {
                None
            };

        for m in incoming {
            if &m.chat_id != chat_id {
                debug!(chat = %chat_id, other = %m.chat_id, "Dropping message for another chat");
                continue;
            }

            if let Some(stored) = chat.by_id.get(&m.id) {
                let Some(next) = Message::reconcile(stored, &m) else {
                    continue;
                };
                if let Some(pending) = outcome.added.iter_mut().find(|a| a.id == m.id) {
                    *pending = next.clone();
                    chat.by_id.insert(next.id, next);
                } else {
                    let old = stored.clone();
                    outcome.updated.push(chat.replace_entity(&old, next));
                }
                continue;
            }

            if let Some(seq) = m.seq() {
                let known = fresh.as_ref().is_some_and(|f| !f.contains(&seq));
                if known || !chat.seq_set.insert(seq) {
                    continue;
                }
            }
            chat.by_id.insert(m.id, m.clone());
            outcome.added.push(m);
        }

        if outcome.added.is_empty() {
            return outcome;
        }
        outcome.added.sort_by(Message::display_cmp);

        let added = &outcome.added;
        let added_seqs: Vec<u64> = added.iter().filter_map(Message::seq).collect();
        let all_seq = added_seqs.len() == added.len();

        if chat.messages.is_empty() {
            chat.messages = added.clone();
            chat.seq_list = added_seqs;
        } else if all_seq
            && added_seqs
                .first()
                .is_some_and(|lo| chat.max_seq().map_or(true, |max| *lo > max))
        {
            chat.messages.extend(added.iter().cloned());
            chat.seq_list.extend(added_seqs);
        } else if all_seq
            && chat.first_seq_index() == 0
            && added_seqs
                .last()
                .is_some_and(|hi| chat.min_seq().is_some_and(|min| *hi < min))
        {
            let mut messages = added.clone();
            messages.append(&mut chat.messages);
            chat.messages = messages;
            let mut seqs = added_seqs;
            seqs.extend_from_slice(&chat.seq_list);
            chat.seq_list = seqs;
        } else {
            chat.merge_unordered(strategy, added, &added_seqs);
        }

        outcome
    }

    /// Replace a chat's contents. Read-receipt watermarks reset; paging
    /// cursors are left to the caller.
    pub fn replace_messages(&mut self, chat_id: &ChatId, messages: Vec<Message>) -> &[Message] {
        let chat = self.chats.get_or_create(chat_id, self.active.as_ref());
        chat.clear();

        let mut kept: Vec<Message> = Vec::with_capacity(messages.len());
        let mut index: HashMap<MessageId, usize> = HashMap::new();
        for m in messages {
            if &m.chat_id != chat_id {
                continue;
            }
            if let Some(&i) = index.get(&m.id) {
                if let Some(next) = Message::reconcile(&kept[i], &m) {
                    kept[i] = next;
                }
                continue;
            }
            if let Some(seq) = m.seq() {
                if !chat.seq_set.insert(seq) {
                    continue;
                }
            }
            index.insert(m.id, kept.len());
            kept.push(m);
        }
        kept.sort_by(Message::display_cmp);

        chat.by_id = kept.iter().map(|m| (m.id, m.clone())).collect();
        chat.messages = kept;
        chat.rebuild_seq_list();
        &chat.messages
    }

    /// Drop the lowest seqs until at most `max` messages remain; returns the
    /// removed ids. Unsequenced pending sends are never evicted.
    pub fn trim_oldest(&mut self, chat_id: &ChatId, max: usize) -> Vec<MessageId> {
        let Some(chat) = self.chats.peek_mut(chat_id) else {
            return Vec::new();
        };
        if max == 0 || chat.messages.len() <= max {
            return Vec::new();
        }
        let split = chat.first_seq_index();
        let excess = (chat.messages.len() - max).min(chat.messages.len() - split);
        if excess == 0 {
            return Vec::new();
        }
        let removed: Vec<Message> = chat.messages.drain(split..split + excess).collect();
        for m in &removed {
            chat.forget(m);
        }
        chat.rebuild_seq_list();
        chat.has_more = true;
        chat.next_before_seq = chat.min_seq();
        removed.into_iter().map(|m| m.id).collect()
    }

    /// Mirror of [`trim_oldest`](Self::trim_oldest): keeps the lowest seqs.
    pub fn trim_newest(&mut self, chat_id: &ChatId, max: usize) -> Vec<MessageId> {
        let Some(chat) = self.chats.peek_mut(chat_id) else {
            return Vec::new();
        };
        let keep = max.max(chat.first_seq_index());
        if max == 0 || chat.messages.len() <= keep {
            return Vec::new();
        }
        let removed: Vec<Message> = chat.messages.drain(keep..).collect();
        for m in &removed {
            chat.forget(m);
        }
        chat.rebuild_seq_list();
        removed.into_iter().map(|m| m.id).collect()
    }

    /// Trim toward the chat's retention anchor.
    pub fn enforce_retention(&mut self, chat_id: &ChatId, max: usize) -> Vec<MessageId> {
        match self.chats.peek(chat_id).map(|c| c.retention_anchor) {
            Some(RetentionAnchor::Newest) => self.trim_oldest(chat_id, max),
            Some(RetentionAnchor::Oldest) => self.trim_newest(chat_id, max),
            None => Vec::new(),
        }
    }

    pub fn set_retention_anchor(&mut self, chat_id: &ChatId, anchor: RetentionAnchor) {
        if let Some(chat) = self.chats.peek_mut(chat_id) {
            chat.retention_anchor = anchor;
        }
    }

    pub fn set_paging(&mut self, chat_id: &ChatId, has_more: bool, next_before_seq: Option<u64>) {
        if let Some(chat) = self.chats.peek_mut(chat_id) {
            chat.has_more = has_more;
            chat.next_before_seq = next_before_seq;
        }
    }

    /// Remove messages by id; returns the ids that were present.
    pub fn remove_messages(&mut self, chat_id: &ChatId, ids: &[MessageId]) -> Vec<MessageId> {
        let Some(chat) = self.chats.peek_mut(chat_id) else {
            return Vec::new();
        };
        let doomed: HashSet<MessageId> = ids
            .iter()
            .filter(|id| chat.by_id.contains_key(id))
            .copied()
            .collect();
        if doomed.is_empty() {
            return Vec::new();
        }
        let (gone, kept): (Vec<Message>, Vec<Message>) = std::mem::take(&mut chat.messages)
            .into_iter()
            .partition(|m| doomed.contains(&m.id));
        chat.messages = kept;
        for m in &gone {
            chat.forget(m);
        }
        chat.rebuild_seq_list();
        gone.into_iter().map(|m| m.id).collect()
    }

    /// Mark `me`'s own messages up to `seq` as read.
    ///
    /// Receipts older than the chat's watermark are ignored. In groups a
    /// higher reader count is backfilled onto already-read messages.
    pub fn apply_read_receipt(
        &mut self,
        chat_id: &ChatId,
        seq: u64,
        read_count: u32,
        me: &UserId,
    ) -> Vec<MessageUpdate> {
        let Some(chat) = self.chats.peek_mut(chat_id) else {
            return Vec::new();
        };
        if seq == 0 || seq < chat.read_receipt_seq {
            return Vec::new();
        }

        let prev_seq = chat.read_receipt_seq;
        let prev_count = chat.read_receipt_count;
        let backfill = chat.is_group && read_count > prev_count;
        let start_seq = if !backfill && seq > prev_seq {
            prev_seq + 1
        } else {
            1
        };

        let first = chat.first_seq_index();
        let tail = &chat.messages[first..];
        let lo = first + tail.partition_point(|m| m.seq().unwrap_or(0) < start_seq);
        let hi = first + tail.partition_point(|m| m.seq().unwrap_or(0) <= seq);

        let mut updates = Vec::new();
        for i in lo..hi {
            let m = &mut chat.messages[i];
            if &m.sender_id != me {
                continue;
            }
            let next_count = if chat.is_group {
                m.read_count.max(read_count)
            } else {
                m.read_count
            };
            if m.status != MessageStatus::Read || m.read_count != next_count {
                m.status = MessageStatus::Read;
                m.read_count = next_count;
                chat.by_id.insert(m.id, m.clone());
                updates.push(MessageUpdate::status_of(m));
            }
        }

        chat.read_receipt_seq = prev_seq.max(seq);
        if chat.is_group {
            chat.read_receipt_count = prev_count.max(read_count);
        }
        updates
    }

    /// Force a message's delivery status, e.g. a local send that failed.
    pub fn set_status(
        &mut self,
        chat_id: &ChatId,
        id: &MessageId,
        status: MessageStatus,
    ) -> Option<MessageUpdate> {
        let chat = self.chats.peek_mut(chat_id)?;
        let stored = chat.by_id.get(id)?.clone();
        if stored.status == status {
            return None;
        }
        let mut next = stored.clone();
        next.status = status;
        let next = chat.replace_entity(&stored, next);
        Some(MessageUpdate::status_of(&next))
    }

    // --- queries ---

    pub fn messages_by_ids(&self, chat_id: &ChatId, ids: &[MessageId]) -> Vec<Message> {
        let Some(chat) = self.chats.peek(chat_id) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| chat.by_id.get(id).cloned()).collect()
    }

    /// Substring search over text and attachment names. Every whitespace
    /// separated term must match; results are newest first.
    pub fn search(&self, chat_id: &ChatId, query: &str, limit: usize) -> Vec<Message> {
        let terms = search_terms(query);
        if terms.is_empty() {
            return Vec::new();
        }
        let Some(chat) = self.chats.peek(chat_id) else {
            return Vec::new();
        };
        let limit = limit.clamp(1, SEARCH_MAX_LIMIT);

        chat.messages
            .iter()
            .rev()
            .filter(|m| matches_terms(m, &terms))
            .take(limit)
            .cloned()
            .collect()
    }
}

pub fn search_terms(query: &str) -> Vec<String> {
    query.split_whitespace().map(str::to_lowercase).collect()
}

/// Whether a live message matches every term.
pub fn matches_terms(m: &Message, terms: &[String]) -> bool {
    if m.is_deleted() {
        return false;
    }
    let haystack = haystack(m);
    terms.iter().all(|t| haystack.contains(t.as_str()))
}

fn haystack(m: &Message) -> String {
    let mut text = m.content.to_lowercase();
    for a in &m.attachments {
        text.push(' ');
        text.push_str(&a.file_name.to_lowercase());
    }
    text
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use seqline_shared::MessageKind;

    use crate::core::merge::{SortDedupMerge, TwoPointerMerge};

    pub(crate) fn msg(chat: &str, seq: Option<u64>, sender: &str, text: &str) -> Message {
        Message {
            id: MessageId::new(),
            chat_id: chat.parse().unwrap(),
            seq,
            sender_id: UserId::from(sender),
            kind: MessageKind::Text,
            content: text.to_string(),
            attachments: vec![],
            status: MessageStatus::Sent,
            read_count: 0,
            sent_at: Utc.timestamp_opt(1_700_000_000 + seq.unwrap_or(0) as i64, 0).unwrap(),
            edited_at: None,
            deleted_at: None,
            reply_to: None,
        }
    }

    fn run(chat: &str, from: u64, to: u64) -> Vec<Message> {
        (from..=to)
            .map(|s| msg(chat, Some(s), "alice", &format!("m{s}")))
            .collect()
    }

    fn store() -> ChatCoreStore {
        ChatCoreStore::new(30, Box::new(TwoPointerMerge))
    }

    fn seqs(store: &ChatCoreStore, chat: &ChatId) -> Vec<u64> {
        store.chat(chat).unwrap().messages().iter().filter_map(Message::seq).collect()
    }

    const PAIR: &str = "p:alice:bob";

    #[test]
    fn append_prepend_and_interleave_keep_order() {
        let chat: ChatId = PAIR.parse().unwrap();
        let mut s = store();
        let all = run(PAIR, 1, 12);

        s.merge_messages(&chat, all[4..8].to_vec());
        s.merge_messages(&chat, all[8..].to_vec());
        s.merge_messages(&chat, all[..2].to_vec());
        s.merge_messages(&chat, vec![all[3].clone(), all[2].clone()]);

        assert_eq!(seqs(&s, &chat), (1..=12).collect::<Vec<_>>());
        let state = s.chat(&chat).unwrap();
        assert_eq!(state.seq_list(), (1..=12).collect::<Vec<_>>().as_slice());
        assert_eq!((state.min_seq(), state.max_seq()), (Some(1), Some(12)));
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let chat: ChatId = PAIR.parse().unwrap();
        let all = run(PAIR, 1, 40);
        let mut pending = msg(PAIR, None, "alice", "sending");
        pending.status = MessageStatus::Sending;
        let b1: Vec<Message> = all.iter().step_by(2).cloned().chain([pending]).collect();
        let b2: Vec<Message> = all.iter().skip(5).take(20).cloned().collect();

        for strategy in [
            Box::new(TwoPointerMerge) as Box<dyn SeqMergeStrategy>,
            Box::new(SortDedupMerge),
        ] {
            let mut left = ChatCoreStore::new(30, strategy);
            left.merge_messages(&chat, b1.clone());
            left.merge_messages(&chat, b2.clone());

            let mut right = store();
            right.merge_messages(&chat, b2.clone());
            right.merge_messages(&chat, b1.clone());

            let l = left.chat(&chat).unwrap().messages().to_vec();
            assert_eq!(l, right.chat(&chat).unwrap().messages());
            assert!(l[0].seq().is_none());

            let again = left.merge_messages(&chat, b1.clone());
            assert!(again.added.is_empty() && again.updated.is_empty());
            assert_eq!(left.chat(&chat).unwrap().messages(), l.as_slice());
        }
    }

    #[test]
    fn redelivered_edit_wins_and_status_never_regresses() {
        let chat: ChatId = PAIR.parse().unwrap();
        let mut s = store();
        let mut original = msg(PAIR, Some(1), "alice", "helo");
        original.status = MessageStatus::Read;
        s.merge_messages(&chat, vec![original.clone()]);

        let mut edited = original.clone();
        edited.content = "hello".into();
        edited.status = MessageStatus::Sent;
        edited.edited_at = Some(original.sent_at + Duration::seconds(30));
        let out = s.merge_messages(&chat, vec![edited]);

        assert_eq!(out.updated.len(), 1);
        let stored = s.chat(&chat).unwrap().get(&original.id).unwrap();
        assert_eq!(stored.content, "hello");
        assert_eq!(stored.status, MessageStatus::Read);

        let mut stale = original.clone();
        stale.content = "older".into();
        assert!(s.merge_messages(&chat, vec![stale]).updated.is_empty());
        assert_eq!(s.chat(&chat).unwrap().messages()[0].content, "hello");
    }

    #[test]
    fn seq_collisions_keep_the_first_id() {
        let chat: ChatId = PAIR.parse().unwrap();
        let mut s = store();
        let first = msg(PAIR, Some(3), "alice", "first");
        let imposter = msg(PAIR, Some(3), "bob", "imposter");
        s.merge_messages(&chat, vec![first.clone(), imposter]);
        let state = s.chat(&chat).unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state.messages()[0].id, first.id);
    }

    #[test]
    fn large_batches_use_seq_diff() {
        let chat: ChatId = PAIR.parse().unwrap();
        let mut s = ChatCoreStore::new(30, Box::new(SortDedupMerge));
        let all = run(PAIR, 1, 200);
        s.merge_messages(&chat, all[..100].to_vec());
        let out = s.merge_messages(&chat, all[60..140].to_vec());
        assert_eq!(out.added.len(), 40);
        assert_eq!(seqs(&s, &chat), (1..=140).collect::<Vec<_>>());
    }

    #[test]
    fn trims_keep_the_requested_end() {
        let chat: ChatId = PAIR.parse().unwrap();
        let mut s = store();
        let all = run(PAIR, 1, 10);
        s.merge_messages(&chat, all.clone());

        let removed = s.trim_oldest(&chat, 4);
        assert_eq!(removed, all[..6].iter().map(|m| m.id).collect::<Vec<_>>());
        assert_eq!(seqs(&s, &chat), vec![7, 8, 9, 10]);
        assert!(s.messages_by_ids(&chat, &removed).is_empty());
        assert_eq!(s.chat(&chat).unwrap().next_before_seq, Some(7));

        assert!(s.trim_oldest(&chat, 10).is_empty());
        let removed = s.trim_newest(&chat, 1);
        assert_eq!(removed.len(), 3);
        assert_eq!(seqs(&s, &chat), vec![7]);

        // Trimmed seqs can be merged back.
        s.merge_messages(&chat, all[7..].to_vec());
        assert_eq!(seqs(&s, &chat), vec![7, 8, 9, 10]);
    }

    #[test]
    fn trims_spare_pending_sends() {
        let chat: ChatId = PAIR.parse().unwrap();
        let mut s = store();
        let mut pending = msg(PAIR, None, "alice", "sending");
        pending.status = MessageStatus::Sending;
        s.merge_messages(&chat, run(PAIR, 1, 5));
        s.merge_messages(&chat, vec![pending.clone()]);

        let removed = s.trim_oldest(&chat, 3);
        assert_eq!(removed.len(), 3);
        let state = s.chat(&chat).unwrap();
        assert_eq!(state.messages()[0].id, pending.id);
        assert_eq!(seqs(&s, &chat), vec![4, 5]);

        s.trim_newest(&chat, 1);
        let state = s.chat(&chat).unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state.messages()[0].id, pending.id);
    }

    #[test]
    fn retention_follows_anchor() {
        let chat: ChatId = PAIR.parse().unwrap();
        let mut s = store();
        s.merge_messages(&chat, run(PAIR, 1, 6));
        s.set_retention_anchor(&chat, RetentionAnchor::Oldest);
        s.enforce_retention(&chat, 4);
        assert_eq!(seqs(&s, &chat), vec![1, 2, 3, 4]);
        s.set_retention_anchor(&chat, RetentionAnchor::Newest);
        s.enforce_retention(&chat, 2);
        assert_eq!(seqs(&s, &chat), vec![3, 4]);
    }

    #[test]
    fn read_receipt_touches_only_own_messages_up_to_seq() {
        let chat: ChatId = PAIR.parse().unwrap();
        let me = UserId::from("alice");
        let mut s = store();
        let mut batch = run(PAIR, 1, 6);
        batch[2].sender_id = UserId::from("bob");
        s.merge_messages(&chat, batch);

        let updates = s.apply_read_receipt(&chat, 4, 1, &me);
        let touched: Vec<u64> = updates
            .iter()
            .map(|u| s.chat(&chat).unwrap().get(&u.id).unwrap().seq().unwrap())
            .collect();
        assert_eq!(touched, vec![1, 2, 4]);

        let state = s.chat(&chat).unwrap();
        assert_eq!(state.messages()[2].status, MessageStatus::Sent);
        assert_eq!(state.messages()[4].status, MessageStatus::Sent);
        assert_eq!(state.read_receipt_seq, 4);

        assert!(s.apply_read_receipt(&chat, 3, 1, &me).is_empty());
        assert_eq!(s.apply_read_receipt(&chat, 6, 1, &me).len(), 2);
    }

    #[test]
    fn group_receipts_backfill_read_counts() {
        let chat: ChatId = "g:team".parse().unwrap();
        let me = UserId::from("alice");
        let mut s = store();
        s.merge_messages(&chat, run("g:team", 1, 3));

        assert_eq!(s.apply_read_receipt(&chat, 3, 1, &me).len(), 3);
        let updates = s.apply_read_receipt(&chat, 3, 2, &me);
        assert_eq!(updates.len(), 3);
        assert!(updates.iter().all(|u| u.read_count == 2));
    }

    #[test]
    fn lru_spares_the_active_chat() {
        let mut s = ChatCoreStore::new(2, Box::new(TwoPointerMerge));
        let a: ChatId = "g:a".parse().unwrap();
        let b: ChatId = "g:b".parse().unwrap();
        let c: ChatId = "g:c".parse().unwrap();
        s.set_active(&a, 1);
        s.get_or_create(&b);
        s.get_or_create(&c);
        assert!(s.chat(&a).is_some());
        assert!(s.chat(&b).is_none());
        assert_eq!(s.cached_chats(), 2);
    }

    #[test]
    fn search_requires_every_term() {
        let chat: ChatId = PAIR.parse().unwrap();
        let mut s = store();
        s.merge_messages(
            &chat,
            vec![
                msg(PAIR, Some(1), "alice", "Lunch at noon"),
                msg(PAIR, Some(2), "bob", "noon works, lunch it is"),
                msg(PAIR, Some(3), "alice", "dinner?"),
            ],
        );
        let hits = s.search(&chat, "LUNCH noon", 10);
        assert_eq!(hits.iter().filter_map(Message::seq).collect::<Vec<_>>(), vec![2, 1]);
        assert!(s.search(&chat, "   ", 10).is_empty());
        assert_eq!(s.search(&chat, "noon", 1).len(), 1);
    }

    #[test]
    fn failed_send_is_marked_in_place() {
        let chat: ChatId = PAIR.parse().unwrap();
        let mut s = store();
        let mut local = msg(PAIR, None, "alice", "draft");
        local.status = MessageStatus::Sending;
        s.merge_messages(&chat, vec![local.clone()]);

        let update = s.set_status(&chat, &local.id, MessageStatus::Failed).unwrap();
        assert_eq!(update.status, MessageStatus::Failed);
        assert!(update.message.is_none());
        assert_eq!(s.chat(&chat).unwrap().get(&local.id).unwrap().status, MessageStatus::Failed);
        assert!(s.set_status(&chat, &local.id, MessageStatus::Failed).is_none());
    }
}
