//! The chat core actor.
//!
//! A single task owns the in-memory store, the durable cache handle, the
//! patch queue and the sync watermark. Everything else talks to it through
//! [`CoreHandle`], which sends [`CoreCommand`]s over an mpsc channel. Network
//! fetches run in spawned tasks and report back as [`CoreCommand::Fetched`];
//! a result is applied only if its epoch and `(chat, load_seq)` still name
//! the active view.
//!
//! Patches are flushed to the consumer once per `patch_tick`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use seqline_shared::constants::MESSAGE_CONTEXT_DEFAULT_LIMIT;
use seqline_shared::protocol::{
    ContextPage, MessagePage, PageQuery, ReadUpdatePayload, Update, UpdateKind,
};
use seqline_shared::realtime::{GroupAction, ServerEvent};
use seqline_shared::{ChatId, GroupId, Message, MessageId, MessageStatus, UserId};
use seqline_store::{Database, PrunePolicy};

use super::patch::{list_id, ChatPatch, ChatUpsert, PatchQueue, PendingMeta};
use super::store::{
    matches_terms, search_terms, ChatCacheState, ChatCoreStore, MessageUpdate, RetentionAnchor,
    SEARCH_MAX_LIMIT,
};
use crate::api::{ApiError, MessagesApi};
use crate::config::ClientConfig;
use crate::sync::{SyncPayload, SyncSink, SyncStatus};

/// Rows of durable cache scanned when in-memory search comes up short.
const SEARCH_FALLBACK_SCAN: u32 = 1_600;

const COMMAND_BUFFER: usize = 256;
const PATCH_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Chat core has stopped")]
    Stopped,

    #[error("Superseded by a newer view")]
    Superseded,

    #[error("No active chat")]
    NoActiveChat,

    #[error(transparent)]
    Api(#[from] ApiError),
}

type Done = oneshot::Sender<Result<(), CoreError>>;

/// Commands accepted by the core task.
#[derive(Debug)]
pub enum CoreCommand {
    /// Open a chat: hydrate from cache, emit a reset, then fetch.
    SetActiveChat { chat_id: ChatId, done: Done },
    ClearActiveChat,
    /// Fetch the page before the oldest loaded message of the active chat.
    LoadMoreBefore { done: Done },
    /// Open a chat centered on `seq`.
    JumpToMessage { chat_id: ChatId, seq: u64, done: Done },
    /// Whether the user has scrolled away from the live tail.
    SetScrolled(bool),
    Search {
        chat_id: ChatId,
        query: String,
        limit: usize,
        reply: oneshot::Sender<Vec<Message>>,
    },
    /// Warm likely-next chats in the background.
    Prefetch(Vec<ChatId>),
    /// Messages from any source, already sequenced.
    Ingest(Vec<Message>),
    /// An optimistic local copy of a message being sent.
    IngestLocal(Message),
    /// Swap the optimistic copy for the acknowledged one.
    ConfirmSent { local_id: MessageId, message: Message },
    MarkFailed { chat_id: ChatId, local_id: MessageId },
    Realtime(Vec<ServerEvent>),
    ApplySync {
        payload: SyncPayload,
        reply: oneshot::Sender<u64>,
    },
    LocalPts(oneshot::Sender<u64>),
    SyncStatus(SyncStatus),
    Snapshot {
        chat_id: ChatId,
        reply: oneshot::Sender<Vec<Message>>,
    },
    Fetched(Box<FetchOutcome>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Catch-up after the newest cached seq.
    Warm,
    /// Latest page, replacing the view.
    Cold,
    Older,
    Context { seq: u64 },
    Prefetch,
}

#[derive(Debug)]
pub struct FetchRequest {
    epoch: u64,
    chat_id: ChatId,
    load_seq: u64,
    kind: FetchKind,
    query: PageQuery,
    done: Option<Done>,
}

#[derive(Debug)]
pub enum Fetched {
    Page(MessagePage),
    Context(ContextPage),
}

#[derive(Debug)]
pub struct FetchOutcome {
    request: FetchRequest,
    result: Result<Fetched, ApiError>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<CoreCommand>,
}

impl CoreHandle {
    async fn send(&self, cmd: CoreCommand) -> Result<(), CoreError> {
        self.tx.send(cmd).await.map_err(|_| CoreError::Stopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CoreCommand,
    ) -> Result<T, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| CoreError::Stopped)
    }

    pub async fn set_active_chat(&self, chat_id: ChatId) -> Result<(), CoreError> {
        self.request(|done| CoreCommand::SetActiveChat { chat_id, done })
            .await?
    }

    pub async fn clear_active_chat(&self) -> Result<(), CoreError> {
        self.send(CoreCommand::ClearActiveChat).await
    }

    pub async fn load_more_before(&self) -> Result<(), CoreError> {
        self.request(|done| CoreCommand::LoadMoreBefore { done })
            .await?
    }

    pub async fn jump_to_message(&self, chat_id: ChatId, seq: u64) -> Result<(), CoreError> {
        self.request(|done| CoreCommand::JumpToMessage { chat_id, seq, done })
            .await?
    }

    pub async fn set_scrolled(&self, scrolled: bool) -> Result<(), CoreError> {
        self.send(CoreCommand::SetScrolled(scrolled)).await
    }

    pub async fn search(
        &self,
        chat_id: ChatId,
        query: impl Into<String>,
        limit: usize,
    ) -> Result<Vec<Message>, CoreError> {
        let query = query.into();
        self.request(|reply| CoreCommand::Search {
            chat_id,
            query,
            limit,
            reply,
        })
        .await
    }

    pub async fn prefetch(&self, chats: Vec<ChatId>) -> Result<(), CoreError> {
        self.send(CoreCommand::Prefetch(chats)).await
    }

    pub async fn ingest(&self, messages: Vec<Message>) -> Result<(), CoreError> {
        self.send(CoreCommand::Ingest(messages)).await
    }

    pub async fn ingest_local(&self, message: Message) -> Result<(), CoreError> {
        self.send(CoreCommand::IngestLocal(message)).await
    }

    pub async fn confirm_sent(&self, local_id: MessageId, message: Message) -> Result<(), CoreError> {
        self.send(CoreCommand::ConfirmSent { local_id, message })
            .await
    }

    pub async fn mark_failed(&self, chat_id: ChatId, local_id: MessageId) -> Result<(), CoreError> {
        self.send(CoreCommand::MarkFailed { chat_id, local_id })
            .await
    }

    pub async fn realtime(&self, events: Vec<ServerEvent>) -> Result<(), CoreError> {
        self.send(CoreCommand::Realtime(events)).await
    }

    /// Messages currently held in memory for a chat, in display order.
    pub async fn snapshot(&self, chat_id: ChatId) -> Result<Vec<Message>, CoreError> {
        self.request(|reply| CoreCommand::Snapshot { chat_id, reply })
            .await
    }

    pub async fn pts(&self) -> Result<u64, CoreError> {
        self.request(CoreCommand::LocalPts).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CoreCommand::Shutdown).await;
    }
}

#[async_trait]
impl SyncSink for CoreHandle {
    async fn local_pts(&self) -> u64 {
        self.pts().await.unwrap_or_default()
    }

    async fn apply(&self, payload: SyncPayload) -> u64 {
        let fallback = payload.pts;
        self.request(|reply| CoreCommand::ApplySync { payload, reply })
            .await
            .unwrap_or(fallback)
    }

    async fn status(&self, status: SyncStatus) {
        let _ = self.send(CoreCommand::SyncStatus(status)).await;
    }
}

/// Start the core task. Returns its handle, the patch stream and the task.
pub fn spawn_core(
    me: UserId,
    config: ClientConfig,
    api: Arc<dyn MessagesApi>,
    cache: Option<Database>,
) -> (CoreHandle, mpsc::Receiver<Vec<ChatPatch>>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (patch_tx, patch_rx) = mpsc::channel(PATCH_BUFFER);
    let core = ChatCore::new(me, config, api, cache, cmd_tx.downgrade(), patch_tx);
    let task = tokio::spawn(core.run(cmd_rx));
    (CoreHandle { tx: cmd_tx }, patch_rx, task)
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct ChatCore {
    me: UserId,
    config: ClientConfig,
    store: ChatCoreStore,
    queue: PatchQueue,
    meta: PendingMeta,
    cache: Option<Database>,
    prune_policy: PrunePolicy,
    api: Arc<dyn MessagesApi>,
    self_tx: mpsc::WeakSender<CoreCommand>,
    patches: mpsc::Sender<Vec<ChatPatch>>,

    epoch: u64,
    next_load_seq: u64,
    scrolled: bool,
    view_cancel: CancellationToken,
    shutdown: CancellationToken,

    prefetch_in_flight: HashSet<ChatId>,
    prefetch_last: HashMap<ChatId, Instant>,

    pts: u64,
}

impl ChatCore {
    fn new(
        me: UserId,
        config: ClientConfig,
        api: Arc<dyn MessagesApi>,
        cache: Option<Database>,
        self_tx: mpsc::WeakSender<CoreCommand>,
        patches: mpsc::Sender<Vec<ChatPatch>>,
    ) -> Self {
        let pts = cache
            .as_ref()
            .and_then(|db| match db.load_pts(&me) {
                Ok(pts) => pts,
                Err(e) => {
                    warn!(error = %e, "Failed to load sync watermark");
                    None
                }
            })
            .unwrap_or_default();
        let shutdown = CancellationToken::new();
        Self {
            store: ChatCoreStore::new(config.chat_cache_limit, config.merge_strategy.build()),
            me,
            queue: PatchQueue::default(),
            meta: PendingMeta::default(),
            cache,
            prune_policy: PrunePolicy::default(),
            api,
            self_tx,
            patches,
            epoch: 0,
            next_load_seq: 0,
            scrolled: false,
            view_cancel: shutdown.child_token(),
            shutdown,
            prefetch_in_flight: HashSet::new(),
            prefetch_last: HashMap::new(),
            pts,
            config,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<CoreCommand>) {
        info!(user = %self.me, pts = self.pts, "Chat core started");
        let mut tick = interval(self.config.patch_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(CoreCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle(cmd),
                },
                _ = tick.tick() => self.dispatch().await,
            }
        }

        self.shutdown.cancel();
        self.dispatch().await;
        info!(user = %self.me, "Chat core stopped");
    }

    fn handle(&mut self, cmd: CoreCommand) {
        match cmd {
            CoreCommand::SetActiveChat { chat_id, done } => self.set_active_chat(chat_id, done),
            CoreCommand::ClearActiveChat => self.clear_active_chat(),
            CoreCommand::LoadMoreBefore { done } => self.load_more_before(done),
            CoreCommand::JumpToMessage { chat_id, seq, done } => {
                self.jump_to_message(chat_id, seq, done)
            }
            CoreCommand::SetScrolled(scrolled) => {
                self.scrolled = scrolled;
                if !scrolled {
                    if let Some(chat) = self.store.active_chat().cloned() {
                        self.store
                            .set_retention_anchor(&chat, RetentionAnchor::Newest);
                    }
                }
            }
            CoreCommand::Search {
                chat_id,
                query,
                limit,
                reply,
            } => {
                let _ = reply.send(self.search(&chat_id, &query, limit));
            }
            CoreCommand::Prefetch(chats) => self.prefetch(chats),
            CoreCommand::Ingest(messages) => self.ingest(messages),
            CoreCommand::IngestLocal(message) => self.ingest_local(message),
            CoreCommand::ConfirmSent { local_id, message } => {
                self.confirm_sent(local_id, message)
            }
            CoreCommand::MarkFailed { chat_id, local_id } => self.mark_failed(&chat_id, local_id),
            CoreCommand::Realtime(events) => self.apply_realtime(events),
            CoreCommand::ApplySync { payload, reply } => {
                let pts = self.apply_sync(payload);
                let _ = reply.send(pts);
            }
            CoreCommand::LocalPts(reply) => {
                let _ = reply.send(self.pts);
            }
            CoreCommand::SyncStatus(status) => self.queue.push(ChatPatch::Sync {
                phase: status.phase,
                pts: status.pts,
                socket_connected: status.socket_connected,
                reason: status.reason,
            }),
            CoreCommand::Snapshot { chat_id, reply } => {
                let messages = self
                    .store
                    .chat(&chat_id)
                    .map(|c| c.messages().to_vec())
                    .unwrap_or_default();
                let _ = reply.send(messages);
            }
            CoreCommand::Fetched(outcome) => {
                let FetchOutcome { request, result } = *outcome;
                self.on_fetched(request, result);
            }
            CoreCommand::Shutdown => {}
        }
    }

    /// Flush pending meta and send one budgeted batch.
    async fn dispatch(&mut self) {
        if let Some(meta) = self.meta.take() {
            self.queue.push(meta);
        }
        // A full channel leaves patches queued, where they keep coalescing.
        if self.queue.is_empty() || self.patches.capacity() == 0 {
            return;
        }
        let store = &self.store;
        let batch = self
            .queue
            .next_batch(|chat, load_seq| store.is_active(chat, load_seq));
        if batch.is_empty() {
            return;
        }
        if self.patches.send(batch).await.is_err() {
            debug!("Patch consumer gone; discarding batch");
            self.queue.clear();
        }
    }

    // --- view ---

    fn view_of(&self, chat_id: &ChatId) -> Option<u64> {
        (self.store.active_chat() == Some(chat_id)).then(|| self.store.active_load_seq())
    }

    fn begin_view(&mut self) -> u64 {
        self.epoch += 1;
        self.next_load_seq += 1;
        self.view_cancel.cancel();
        self.view_cancel = self.shutdown.child_token();
        self.next_load_seq
    }

    fn emit_reset(&mut self, chat_id: &ChatId, load_seq: u64) {
        let Some(state) = self.store.chat(chat_id) else {
            return;
        };
        let patch = ChatPatch::Reset {
            chat_id: chat_id.clone(),
            load_seq,
            messages: state.messages().to_vec(),
            has_more: state.has_more,
            next_before_seq: state.next_before_seq,
        };
        self.queue.push(patch);
    }

    fn set_active_chat(&mut self, chat_id: ChatId, done: Done) {
        let load_seq = self.begin_view();
        self.scrolled = false;

        let mut seed = self.cached_recent(&chat_id);
        if let Some(state) = self.store.chat(&chat_id) {
            seed.extend(state.messages().iter().cloned());
        }
        self.store.set_active(&chat_id, load_seq);
        self.store
            .set_retention_anchor(&chat_id, RetentionAnchor::Newest);
        self.store.replace_messages(&chat_id, seed);
        self.store
            .enforce_retention(&chat_id, self.config.max_chat_messages);
        let (min, max) = self
            .store
            .chat(&chat_id)
            .map(|c| (c.min_seq(), c.max_seq()))
            .unwrap_or_default();
        self.store.set_paging(&chat_id, true, min);
        self.emit_reset(&chat_id, load_seq);

        let (kind, query) = match max {
            Some(after) => (
                FetchKind::Warm,
                PageQuery {
                    after_seq: Some(after),
                    limit: Some(self.config.page_limit),
                    ..Default::default()
                },
            ),
            None => (FetchKind::Cold, self.latest_query()),
        };
        debug!(chat = %chat_id, load_seq, ?kind, "Opening chat");
        self.spawn_fetch(
            FetchRequest {
                epoch: self.epoch,
                chat_id,
                load_seq,
                kind,
                query,
                done: Some(done),
            },
            self.view_cancel.clone(),
        );
    }

    fn clear_active_chat(&mut self) {
        self.begin_view();
        self.store.clear_active();
    }

    fn load_more_before(&mut self, done: Done) {
        let Some(chat_id) = self.store.active_chat().cloned() else {
            let _ = done.send(Err(CoreError::NoActiveChat));
            return;
        };
        let load_seq = self.store.active_load_seq();
        let (has_more, before) = self
            .store
            .chat(&chat_id)
            .map(|c| (c.has_more, c.next_before_seq.or(c.min_seq())))
            .unwrap_or((false, None));
        self.scrolled = true;

        let Some(before) = before.filter(|_| has_more) else {
            self.queue.push(ChatPatch::Prepend {
                chat_id,
                load_seq,
                messages: Vec::new(),
                has_more: false,
                next_before_seq: before,
            });
            let _ = done.send(Ok(()));
            return;
        };
        let query = PageQuery {
            before_seq: Some(before),
            limit: Some(self.config.page_limit),
            ..Default::default()
        };
        self.spawn_fetch(
            FetchRequest {
                epoch: self.epoch,
                chat_id,
                load_seq,
                kind: FetchKind::Older,
                query,
                done: Some(done),
            },
            self.view_cancel.clone(),
        );
    }

    fn jump_to_message(&mut self, chat_id: ChatId, seq: u64, done: Done) {
        let load_seq = self.begin_view();
        self.scrolled = true;
        self.store.set_active(&chat_id, load_seq);
        self.spawn_fetch(
            FetchRequest {
                epoch: self.epoch,
                chat_id,
                load_seq,
                kind: FetchKind::Context { seq },
                query: PageQuery::default(),
                done: Some(done),
            },
            self.view_cancel.clone(),
        );
    }

    fn latest_query(&self) -> PageQuery {
        PageQuery {
            limit: Some(self.config.page_limit),
            ..Default::default()
        }
    }

    // --- fetching ---

    fn spawn_fetch(&self, request: FetchRequest, cancel: CancellationToken) {
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ApiError::Cancelled),
                r = run_fetch(api.as_ref(), &request) => r,
            };
            let outcome = Box::new(FetchOutcome { request, result });
            let _ = tx.send(CoreCommand::Fetched(outcome)).await;
        });
    }

    fn on_fetched(&mut self, request: FetchRequest, result: Result<Fetched, ApiError>) {
        let FetchRequest {
            epoch,
            chat_id,
            load_seq,
            kind,
            done,
            ..
        } = request;

        if kind == FetchKind::Prefetch {
            self.on_prefetched(chat_id, result);
            return;
        }

        let reply = |done: Option<Done>, r: Result<(), CoreError>| {
            if let Some(done) = done {
                let _ = done.send(r);
            }
        };

        if epoch != self.epoch || !self.store.is_active(&chat_id, load_seq) {
            debug!(chat = %chat_id, load_seq, ?kind, "Discarding stale fetch");
            reply(done, Err(CoreError::Superseded));
            return;
        }

        match (kind, result) {
            (_, Err(ApiError::Cancelled)) => reply(done, Err(CoreError::Superseded)),
            (FetchKind::Warm, Err(e)) if !e.is_auth() => {
                warn!(chat = %chat_id, error = %e, "Catch-up failed, loading latest page");
                self.spawn_fetch(
                    FetchRequest {
                        epoch,
                        chat_id,
                        load_seq,
                        kind: FetchKind::Cold,
                        query: self.latest_query(),
                        done,
                    },
                    self.view_cancel.clone(),
                );
            }
            (_, Err(e)) => {
                warn!(chat = %chat_id, ?kind, error = %e, "Fetch failed");
                reply(done, Err(e.into()));
            }
            (FetchKind::Warm, Ok(Fetched::Page(page))) => {
                if page.paging.has_more {
                    // More than a page behind: start over from the latest page.
                    self.spawn_fetch(
                        FetchRequest {
                            epoch,
                            chat_id,
                            load_seq,
                            kind: FetchKind::Cold,
                            query: self.latest_query(),
                            done,
                        },
                        self.view_cancel.clone(),
                    );
                    return;
                }
                self.ingest_chat(&chat_id, page.messages);
                reply(done, Ok(()));
            }
            (FetchKind::Cold, Ok(Fetched::Page(page))) => {
                let mut seed: Vec<Message> = self
                    .store
                    .chat(&chat_id)
                    .map(|c| {
                        c.messages()
                            .iter()
                            .filter(|m| m.seq().is_none())
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                self.persist(&page.messages);
                if let Some(last) = page.messages.last() {
                    self.meta.last_message(list_id(&chat_id, &self.me), last);
                }
                seed.extend(page.messages);
                self.store.replace_messages(&chat_id, seed);
                let min = self.store.chat(&chat_id).and_then(ChatCacheState::min_seq);
                self.store.set_paging(
                    &chat_id,
                    page.paging.has_more,
                    page.paging.next_before_seq.or(min),
                );
                self.emit_reset(&chat_id, load_seq);
                reply(done, Ok(()));
            }
            (FetchKind::Older, Ok(Fetched::Page(page))) => {
                self.store
                    .set_retention_anchor(&chat_id, RetentionAnchor::Oldest);
                self.persist(&page.messages);
                let outcome = self.store.merge_messages(&chat_id, page.messages);
                let min = self.store.chat(&chat_id).and_then(ChatCacheState::min_seq);
                let next_before = page.paging.next_before_seq.or(min);
                self.store
                    .set_paging(&chat_id, page.paging.has_more, next_before);
                self.queue.push(ChatPatch::Prepend {
                    chat_id: chat_id.clone(),
                    load_seq,
                    messages: outcome.added,
                    has_more: page.paging.has_more,
                    next_before_seq: next_before,
                });
                self.trim(&chat_id, Some(load_seq));
                reply(done, Ok(()));
            }
            (FetchKind::Context { seq }, Ok(Fetched::Context(ctx))) => {
                self.persist(&ctx.messages);
                let first = ctx.messages.first().and_then(Message::seq);
                self.store.replace_messages(&chat_id, ctx.messages);
                self.store
                    .set_retention_anchor(&chat_id, RetentionAnchor::Oldest);
                self.store.set_paging(&chat_id, ctx.has_more_before, first);
                debug!(chat = %chat_id, seq, "Loaded message context");
                self.emit_reset(&chat_id, load_seq);
                reply(done, Ok(()));
            }
            (kind, Ok(_)) => {
                warn!(chat = %chat_id, ?kind, "Unexpected fetch payload");
                reply(done, Ok(()));
            }
        }
    }

    // --- prefetch ---

    fn prefetch(&mut self, chats: Vec<ChatId>) {
        let now = Instant::now();
        for chat_id in chats {
            if self.store.active_chat() == Some(&chat_id) {
                continue;
            }
            if self.store.chat(&chat_id).map_or(true, ChatCacheState::is_empty) {
                let cached = self.cached_recent(&chat_id);
                if !cached.is_empty() {
                    self.store.merge_messages(&chat_id, cached);
                }
            }

            if self.prefetch_in_flight.len() >= self.config.prefetch_max_in_flight {
                continue;
            }
            if self.prefetch_in_flight.contains(&chat_id)
                || self
                    .prefetch_last
                    .get(&chat_id)
                    .is_some_and(|at| now.duration_since(*at) < self.config.prefetch_cooldown)
            {
                continue;
            }

            let query = match self.store.chat(&chat_id).and_then(ChatCacheState::max_seq) {
                Some(after) => PageQuery {
                    after_seq: Some(after),
                    limit: Some(self.config.page_limit),
                    ..Default::default()
                },
                None => self.latest_query(),
            };
            self.prefetch_in_flight.insert(chat_id.clone());
            self.prefetch_last.insert(chat_id.clone(), now);
            debug!(chat = %chat_id, "Prefetching");
            self.spawn_fetch(
                FetchRequest {
                    epoch: self.epoch,
                    chat_id,
                    load_seq: 0,
                    kind: FetchKind::Prefetch,
                    query,
                    done: None,
                },
                self.shutdown.child_token(),
            );
        }
    }

    fn on_prefetched(&mut self, chat_id: ChatId, result: Result<Fetched, ApiError>) {
        self.prefetch_in_flight.remove(&chat_id);
        match result {
            Ok(Fetched::Page(page)) => self.ingest_chat(&chat_id, page.messages),
            Ok(Fetched::Context(_)) => {}
            Err(e) => debug!(chat = %chat_id, error = %e, "Prefetch failed"),
        }
    }

    // --- ingest ---

    fn ingest(&mut self, messages: Vec<Message>) {
        let mut by_chat: HashMap<ChatId, Vec<Message>> = HashMap::new();
        for m in messages {
            by_chat.entry(m.chat_id.clone()).or_default().push(m);
        }
        for (chat_id, batch) in by_chat {
            self.ingest_chat(&chat_id, batch);
        }
    }

    fn ingest_chat(&mut self, chat_id: &ChatId, batch: Vec<Message>) {
        if batch.is_empty() {
            return;
        }
        let outcome = self.store.merge_messages(chat_id, batch);
        if outcome.added.is_empty() && outcome.updated.is_empty() {
            return;
        }

        let list = list_id(chat_id, &self.me);
        if let Some(last) = outcome.added.last() {
            self.meta.last_message(list.clone(), last);
        }
        let view = self.view_of(chat_id);
        if view.is_none() {
            let unread = outcome
                .added
                .iter()
                .filter(|m| m.sender_id != self.me && !m.is_deleted())
                .count();
            self.meta.add_unread(list, unread as i64);
        }

        let changed: Vec<Message> = outcome
            .added
            .iter()
            .chain(&outcome.updated)
            .cloned()
            .collect();
        self.persist(&changed);

        let Some(load_seq) = view else {
            self.trim(chat_id, None);
            return;
        };
        if !self.scrolled {
            self.store
                .set_retention_anchor(chat_id, RetentionAnchor::Newest);
        }

        // Rows added and trimmed in the same step never reach the view.
        let removed: HashSet<MessageId> = self
            .store
            .enforce_retention(chat_id, self.config.max_chat_messages)
            .into_iter()
            .collect();
        let fresh: HashSet<MessageId> = outcome.added.iter().map(|m| m.id).collect();
        let updates: Vec<MessageUpdate> = outcome
            .updated
            .iter()
            .filter(|m| !removed.contains(&m.id))
            .map(MessageUpdate::from_message)
            .collect();
        let added: Vec<Message> = outcome
            .added
            .into_iter()
            .filter(|m| !removed.contains(&m.id))
            .collect();
        let gone: Vec<MessageId> = removed
            .iter()
            .filter(|id| !fresh.contains(id))
            .copied()
            .collect();

        if !gone.is_empty() {
            self.queue.push(ChatPatch::Delete {
                chat_id: chat_id.clone(),
                load_seq,
                ids: gone,
            });
        }
        if !updates.is_empty() {
            self.queue.push(ChatPatch::Update {
                chat_id: chat_id.clone(),
                load_seq,
                updates,
            });
        }
        if !added.is_empty() {
            self.queue.push(ChatPatch::Append {
                chat_id: chat_id.clone(),
                load_seq,
                messages: added,
            });
        }
    }

    fn trim(&mut self, chat_id: &ChatId, view: Option<u64>) {
        let removed = self
            .store
            .enforce_retention(chat_id, self.config.max_chat_messages);
        if let (Some(load_seq), false) = (view, removed.is_empty()) {
            self.queue.push(ChatPatch::Delete {
                chat_id: chat_id.clone(),
                load_seq,
                ids: removed,
            });
        }
    }

    fn ingest_local(&mut self, message: Message) {
        let chat_id = message.chat_id.clone();
        let outcome = self.store.merge_messages(&chat_id, vec![message]);
        if let Some(last) = outcome.added.last() {
            self.meta.last_message(list_id(&chat_id, &self.me), last);
        }
        if let (Some(load_seq), false) = (self.view_of(&chat_id), outcome.added.is_empty()) {
            self.queue.push(ChatPatch::Append {
                chat_id,
                load_seq,
                messages: outcome.added,
            });
        }
    }

    fn confirm_sent(&mut self, local_id: MessageId, message: Message) {
        let chat_id = message.chat_id.clone();
        let removed = self.store.remove_messages(&chat_id, &[local_id]);
        if let (Some(load_seq), false) = (self.view_of(&chat_id), removed.is_empty()) {
            self.queue.push(ChatPatch::Delete {
                chat_id: chat_id.clone(),
                load_seq,
                ids: removed,
            });
        }
        self.ingest_chat(&chat_id, vec![message]);
    }

    fn mark_failed(&mut self, chat_id: &ChatId, local_id: MessageId) {
        let Some(update) = self
            .store
            .set_status(chat_id, &local_id, MessageStatus::Failed)
        else {
            return;
        };
        if let Some(load_seq) = self.view_of(chat_id) {
            self.queue.push(ChatPatch::Update {
                chat_id: chat_id.clone(),
                load_seq,
                updates: vec![update],
            });
        }
    }

    fn remove_message(&mut self, chat_id: &ChatId, id: MessageId) {
        let removed = self.store.remove_messages(chat_id, &[id]);
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.delete_message(id) {
                warn!(id = %id, error = %e, "Failed to delete cached message");
            }
        }
        if let (Some(load_seq), false) = (self.view_of(chat_id), removed.is_empty()) {
            self.queue.push(ChatPatch::Delete {
                chat_id: chat_id.clone(),
                load_seq,
                ids: removed,
            });
        }
    }

    // --- receipts ---

    fn apply_receipts(&mut self, receipts: Vec<(ChatId, u64, u32)>) {
        for (chat_id, seq, read_count) in coalesce_receipts(receipts) {
            let updates = self
                .store
                .apply_read_receipt(&chat_id, seq, read_count, &self.me);
            if updates.is_empty() {
                continue;
            }
            let ids: Vec<MessageId> = updates.iter().map(|u| u.id).collect();
            let changed = self.store.messages_by_ids(&chat_id, &ids);
            self.persist(&changed);
            if let Some(load_seq) = self.view_of(&chat_id) {
                self.queue.push(ChatPatch::Update {
                    chat_id,
                    load_seq,
                    updates,
                });
            }
        }
    }

    // --- realtime ---

    fn apply_realtime(&mut self, events: Vec<ServerEvent>) {
        let mut messages = Vec::new();
        let mut receipts = Vec::new();
        for event in events.into_iter().flat_map(ServerEvent::into_events) {
            match event {
                ServerEvent::Message { message } => messages.push(message),
                ServerEvent::ReadReceipt {
                    chat_id,
                    seq,
                    read_count,
                    reader_id,
                } => {
                    if reader_id != self.me {
                        receipts.push((chat_id, seq, read_count));
                    }
                }
                ServerEvent::GroupUpdate {
                    group_id,
                    action,
                    user_id,
                    payload,
                } => self.apply_group_event(&group_id, action, user_id.as_ref(), &payload),
                ServerEvent::Presence {
                    user_id, is_online, ..
                } => self.meta.set_online(user_id.to_string(), is_online),
                ServerEvent::Error { code, message } => {
                    warn!(?code, message = %message, "Realtime error");
                }
                _ => {}
            }
        }
        self.ingest(messages);
        self.apply_receipts(receipts);
    }

    /// Group lifecycle changes become chat-list changes. Changes to other
    /// members do not touch the list.
    fn apply_group_event(
        &mut self,
        group_id: &GroupId,
        action: GroupAction,
        user_id: Option<&UserId>,
        payload: &serde_json::Value,
    ) {
        let chat_id = ChatId::Group(group_id.clone());
        let list = group_id.to_string();
        let is_me = user_id == Some(&self.me);
        let title = payload
            .get("name")
            .or_else(|| payload.get("title"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        match action {
            GroupAction::GroupDeleted => self.drop_chat(&chat_id, list),
            GroupAction::MemberRemoved | GroupAction::MemberLeft if is_me => {
                self.drop_chat(&chat_id, list)
            }
            GroupAction::GroupUpdated => self.meta.upsert_chat(
                list,
                ChatUpsert {
                    chat_id: Some(chat_id),
                    title,
                    is_group: true,
                },
            ),
            GroupAction::MemberAdded if is_me => self.meta.upsert_chat(
                list,
                ChatUpsert {
                    chat_id: Some(chat_id),
                    title,
                    is_group: true,
                },
            ),
            _ => {}
        }
    }

    fn drop_chat(&mut self, chat_id: &ChatId, list: String) {
        info!(chat = %chat_id, "Chat removed");
        self.meta.remove_chat(list);
        if self.store.active_chat() == Some(chat_id) {
            self.clear_active_chat();
        }
    }

    // --- sync ---

    fn apply_sync(&mut self, payload: SyncPayload) -> u64 {
        let SyncPayload {
            updates,
            messages,
            pts,
        } = payload;

        let mut receipts = Vec::new();
        let mut removals = Vec::new();
        for update in &updates {
            match update.kind {
                UpdateKind::Read => {
                    if let Some(receipt) = self.read_receipt_of(update) {
                        receipts.push(receipt);
                    }
                }
                UpdateKind::MemberChange => self.apply_member_change(update),
                UpdateKind::Delete => {
                    if let Some(id) = update.message_id {
                        removals.push((update.chat_id.clone(), id));
                    }
                }
                UpdateKind::Message | UpdateKind::Edit => {}
            }
        }

        self.ingest(messages);
        for (chat_id, id) in removals {
            self.remove_message(&chat_id, id);
        }
        self.apply_receipts(receipts);
        self.commit_pts(pts)
    }

    fn read_receipt_of(&self, update: &Update) -> Option<(ChatId, u64, u32)> {
        let seq = update.seq?;
        let payload = serde_json::from_value::<ReadUpdatePayload>(update.payload.clone()).ok();
        if payload
            .as_ref()
            .is_some_and(|p| p.reader_id == self.me.as_str())
        {
            return None;
        }
        let read_count = payload.map_or(1, |p| p.read_count.max(1));
        Some((update.chat_id.clone(), seq, read_count))
    }

    fn apply_member_change(&mut self, update: &Update) {
        let ChatId::Group(group_id) = &update.chat_id else {
            return;
        };
        let Some(action) = update
            .payload
            .get("action")
            .and_then(|a| serde_json::from_value::<GroupAction>(a.clone()).ok())
        else {
            debug!(chat = %update.chat_id, "Member change without action");
            return;
        };
        let user_id = update
            .payload
            .get("userId")
            .and_then(|u| u.as_str())
            .map(UserId::from);
        self.apply_group_event(group_id, action, user_id.as_ref(), &update.payload);
    }

    fn commit_pts(&mut self, pts: u64) -> u64 {
        if pts <= self.pts {
            return self.pts;
        }
        self.pts = pts;
        if let Some(cache) = &self.cache {
            match cache.save_pts(&self.me, pts) {
                Ok(stored) => self.pts = self.pts.max(stored),
                Err(e) => warn!(pts, error = %e, "Failed to persist sync watermark"),
            }
        }
        self.pts
    }

    // --- search ---

    fn search(&self, chat_id: &ChatId, query: &str, limit: usize) -> Vec<Message> {
        let limit = limit.clamp(1, SEARCH_MAX_LIMIT);
        let mut hits = self.store.search(chat_id, query, limit);
        if hits.len() >= limit {
            return hits;
        }
        let Some(cache) = &self.cache else {
            return hits;
        };
        let terms = search_terms(query);
        if terms.is_empty() {
            return hits;
        }
        let scanned = match cache.load_recent(chat_id, SEARCH_FALLBACK_SCAN) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(chat = %chat_id, error = %e, "Cache search failed");
                return hits;
            }
        };
        let seen: HashSet<MessageId> = hits.iter().map(|m| m.id).collect();
        hits.extend(
            scanned
                .into_iter()
                .filter(|m| !seen.contains(&m.id) && matches_terms(m, &terms)),
        );
        hits.sort_by(|a, b| b.display_cmp(a));
        hits.truncate(limit);
        hits
    }

    // --- durable cache ---

    fn cached_recent(&self, chat_id: &ChatId) -> Vec<Message> {
        let Some(cache) = &self.cache else {
            return Vec::new();
        };
        cache
            .load_recent(chat_id, self.config.recent_limit)
            .unwrap_or_else(|e| {
                warn!(chat = %chat_id, error = %e, "Failed to hydrate from cache");
                Vec::new()
            })
    }

    fn persist(&mut self, messages: &[Message]) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        if messages.is_empty() {
            return;
        }
        match cache.save_messages(messages) {
            Ok(report) => debug!(
                inserted = report.inserted,
                updated = report.updated,
                skipped = report.skipped,
                "Cached messages"
            ),
            Err(e) => warn!(error = %e, "Failed to cache messages"),
        }
        if let Err(e) = cache.maybe_prune(&self.prune_policy) {
            warn!(error = %e, "Cache prune failed");
        }
    }
}

async fn run_fetch(api: &dyn MessagesApi, request: &FetchRequest) -> Result<Fetched, ApiError> {
    match request.kind {
        FetchKind::Context { seq } => api
            .context(&request.chat_id, seq, Some(MESSAGE_CONTEXT_DEFAULT_LIMIT))
            .await
            .map(Fetched::Context),
        _ => api
            .page(&request.chat_id, request.query.clone())
            .await
            .map(Fetched::Page),
    }
}

/// One receipt per chat: the highest seq, with the highest count seen at it.
fn coalesce_receipts(receipts: Vec<(ChatId, u64, u32)>) -> Vec<(ChatId, u64, u32)> {
    let mut best: HashMap<ChatId, (u64, u32)> = HashMap::new();
    for (chat_id, seq, count) in receipts {
        let entry = best.entry(chat_id).or_insert((seq, count));
        if seq > entry.0 {
            *entry = (seq, count);
        } else if seq == entry.0 {
            entry.1 = entry.1.max(count);
        }
    }
    best.into_iter()
        .map(|(chat_id, (seq, count))| (chat_id, seq, count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use seqline_shared::constants::CURSOR_PROTOCOL_VERSION;
    use seqline_shared::protocol::{PageMode, Paging};
    use tokio::time::timeout;

    use crate::core::store::tests::msg;

    const PAIR: &str = "p:alice:bob";

    /// Serves pages out of a fixed list, optionally after a delay.
    #[derive(Default)]
    struct FakeMessages {
        history: Mutex<HashMap<ChatId, Vec<Message>>>,
        delay: Option<Duration>,
    }

    impl FakeMessages {
        fn with(chat: &str, messages: Vec<Message>) -> Self {
            let fake = Self::default();
            fake.history
                .lock()
                .unwrap()
                .insert(chat.parse().unwrap(), messages);
            fake
        }
    }

    #[async_trait]
    impl MessagesApi for FakeMessages {
        async fn page(&self, chat: &ChatId, query: PageQuery) -> Result<MessagePage, ApiError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let all = self
                .history
                .lock()
                .unwrap()
                .get(chat)
                .cloned()
                .unwrap_or_default();
            let limit = query.limit.unwrap_or(50) as usize;
            let (messages, has_more, mode) = if let Some(after) = query.after_seq {
                let newer: Vec<Message> = all
                    .into_iter()
                    .filter(|m| m.seq().is_some_and(|s| s > after))
                    .collect();
                let more = newer.len() > limit;
                (newer.into_iter().take(limit).collect(), more, PageMode::After)
            } else {
                let older: Vec<Message> = all
                    .into_iter()
                    .filter(|m| query.before_seq.map_or(true, |b| m.seq().is_some_and(|s| s < b)))
                    .collect();
                let more = older.len() > limit;
                let page = older[older.len().saturating_sub(limit)..].to_vec();
                let mode = if query.before_seq.is_some() {
                    PageMode::Before
                } else {
                    PageMode::Latest
                };
                (page, more, mode)
            };
            let first = messages.first().and_then(Message::seq);
            let last = messages.last().and_then(Message::seq);
            Ok(MessagePage {
                chat_id: chat.to_string(),
                cursor_protocol: CURSOR_PROTOCOL_VERSION,
                paging: Paging {
                    has_more,
                    next_before_seq: first,
                    next_after_seq: last,
                    latest_seq: last.unwrap_or_default(),
                    mode,
                    limit: limit as u32,
                },
                messages,
            })
        }

        async fn context(
            &self,
            chat: &ChatId,
            seq: u64,
            _limit: Option<u32>,
        ) -> Result<ContextPage, ApiError> {
            let all = self
                .history
                .lock()
                .unwrap()
                .get(chat)
                .cloned()
                .unwrap_or_default();
            let messages: Vec<Message> = all
                .into_iter()
                .filter(|m| m.seq().is_some_and(|s| s + 2 >= seq && s <= seq + 2))
                .collect();
            Ok(ContextPage {
                chat_id: chat.to_string(),
                seq,
                has_more_before: messages.first().and_then(Message::seq).is_some_and(|s| s > 1),
                has_more_after: true,
                messages,
            })
        }
    }

    fn history(chat: &str, n: u64) -> Vec<Message> {
        (1..=n)
            .map(|s| msg(chat, Some(s), if s % 2 == 0 { "alice" } else { "bob" }, &format!("m{s}")))
            .collect()
    }

    fn config() -> ClientConfig {
        ClientConfig {
            patch_tick: Duration::from_millis(5),
            page_limit: 10,
            ..ClientConfig::default()
        }
    }

    fn start(
        api: FakeMessages,
        config: ClientConfig,
        cache: Option<Database>,
    ) -> (CoreHandle, mpsc::Receiver<Vec<ChatPatch>>) {
        let (handle, patches, _task) = spawn_core("alice".into(), config, Arc::new(api), cache);
        (handle, patches)
    }

    /// Collect patches until `stop` matches one, or time out.
    async fn until(
        patches: &mut mpsc::Receiver<Vec<ChatPatch>>,
        stop: impl Fn(&ChatPatch) -> bool,
    ) -> Vec<ChatPatch> {
        let mut seen = Vec::new();
        timeout(Duration::from_secs(2), async {
            while let Some(batch) = patches.recv().await {
                let done = batch.iter().any(&stop);
                seen.extend(batch);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for patch");
        seen
    }

    fn seqs(messages: &[Message]) -> Vec<u64> {
        messages.iter().filter_map(Message::seq).collect()
    }

    #[tokio::test]
    async fn opening_a_chat_resets_to_the_latest_page() {
        let chat: ChatId = PAIR.parse().unwrap();
        let (core, mut patches) = start(FakeMessages::with(PAIR, history(PAIR, 25)), config(), None);

        core.set_active_chat(chat.clone()).await.unwrap();
        let seen = until(&mut patches, |p| {
            matches!(p, ChatPatch::Reset { messages, .. } if !messages.is_empty())
        })
        .await;

        let Some(ChatPatch::Reset {
            messages,
            has_more,
            next_before_seq,
            ..
        }) = seen.iter().rev().find(|p| matches!(p, ChatPatch::Reset { .. }))
        else {
            panic!("expected reset, got {seen:?}");
        };
        assert_eq!(seqs(messages), (16..=25).collect::<Vec<_>>());
        assert!(*has_more);
        assert_eq!(*next_before_seq, Some(16));

        core.load_more_before().await.unwrap();
        let seen = until(&mut patches, |p| matches!(p, ChatPatch::Prepend { .. })).await;
        let Some(ChatPatch::Prepend { messages, .. }) =
            seen.iter().rev().find(|p| matches!(p, ChatPatch::Prepend { .. }))
        else {
            panic!("expected prepend");
        };
        assert_eq!(seqs(messages), (6..=15).collect::<Vec<_>>());
        assert_eq!(seqs(&core.snapshot(chat).await.unwrap()).len(), 20);
    }

    #[tokio::test]
    async fn switching_chats_discards_the_stale_fetch() {
        let slow = FakeMessages {
            delay: Some(Duration::from_millis(100)),
            ..FakeMessages::with(PAIR, history(PAIR, 5))
        };
        slow.history
            .lock()
            .unwrap()
            .insert("g:team".parse().unwrap(), history("g:team", 3));
        let (core, mut patches) = start(slow, config(), None);

        let first = {
            let core = core.clone();
            tokio::spawn(async move { core.set_active_chat(PAIR.parse().unwrap()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        core.set_active_chat("g:team".parse().unwrap()).await.unwrap();

        assert!(matches!(first.await.unwrap(), Err(CoreError::Superseded)));
        let seen = until(&mut patches, |p| {
            matches!(p, ChatPatch::Reset { messages, .. } if !messages.is_empty())
        })
        .await;
        let filled: Vec<String> = seen
            .iter()
            .filter_map(|p| match p {
                ChatPatch::Reset {
                    chat_id, messages, ..
                } if !messages.is_empty() => Some(chat_id.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(filled, vec!["g:team".to_string()]);
    }

    #[tokio::test]
    async fn sync_commits_pts_monotonically_and_applies_receipts() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = Database::open_at(&dir.path().join("cache.db")).unwrap();
        let (core, mut patches) = start(FakeMessages::default(), config(), Some(cache));
        let chat: ChatId = PAIR.parse().unwrap();

        core.set_active_chat(chat.clone()).await.unwrap();
        let mine = msg(PAIR, Some(1), "alice", "hi bob");
        let pts = core
            .apply(SyncPayload {
                updates: vec![],
                messages: vec![mine.clone()],
                pts: 4,
            })
            .await;
        assert_eq!(pts, 4);

        let read = Update {
            update_id: 5,
            kind: UpdateKind::Read,
            chat_id: chat.clone(),
            seq: Some(1),
            message_id: None,
            payload: serde_json::json!({ "readerId": "bob", "readCount": 1 }),
        };
        let pts = core
            .apply(SyncPayload {
                updates: vec![read],
                messages: vec![],
                pts: 5,
            })
            .await;
        assert_eq!(pts, 5);

        let stale = core
            .apply(SyncPayload {
                updates: vec![],
                messages: vec![],
                pts: 3,
            })
            .await;
        assert_eq!(stale, 5);
        assert_eq!(core.local_pts().await, 5);

        let seen = until(&mut patches, |p| matches!(p, ChatPatch::Update { .. })).await;
        let Some(ChatPatch::Update { updates, .. }) =
            seen.iter().rev().find(|p| matches!(p, ChatPatch::Update { .. }))
        else {
            panic!("expected update");
        };
        assert_eq!(updates[0].id, mine.id);
        assert_eq!(updates[0].status, MessageStatus::Read);

        core.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cache = Database::open_at(&dir.path().join("cache.db")).unwrap();
        assert_eq!(cache.load_pts(&"alice".into()).unwrap(), Some(5));
        assert_eq!(
            cache.get_message(mine.id).unwrap().status,
            MessageStatus::Read
        );
    }

    /// A list view driven only by dispatched patches.
    #[derive(Default)]
    struct ViewModel {
        messages: Vec<Message>,
    }

    impl ViewModel {
        fn apply(&mut self, patch: &ChatPatch) {
            match patch {
                ChatPatch::Reset { messages, .. } => self.messages = messages.clone(),
                ChatPatch::Append { messages, .. } | ChatPatch::Prepend { messages, .. } => {
                    for m in messages {
                        self.messages.retain(|x| x.id != m.id);
                        let at = self
                            .messages
                            .partition_point(|x| x.display_cmp(m).is_lt());
                        self.messages.insert(at, m.clone());
                    }
                }
                ChatPatch::Delete { ids, .. } => self.messages.retain(|m| !ids.contains(&m.id)),
                ChatPatch::Update { updates, .. } => {
                    for u in updates {
                        if let Some(m) = self.messages.iter_mut().find(|m| m.id == u.id) {
                            if let Some(full) = &u.message {
                                *m = full.clone();
                            }
                            m.status = u.status;
                            m.read_count = u.read_count;
                        }
                    }
                }
                ChatPatch::Meta(_) | ChatPatch::Sync { .. } => {}
            }
        }
    }

    /// Replay batches into `view` until the stream has been quiet for a while.
    async fn settle(patches: &mut mpsc::Receiver<Vec<ChatPatch>>, view: &mut ViewModel) {
        while let Ok(Some(batch)) = timeout(Duration::from_millis(100), patches.recv()).await {
            batch.iter().for_each(|p| view.apply(p));
        }
    }

    #[tokio::test]
    async fn live_append_on_a_full_window_stays_in_step() {
        let config = ClientConfig {
            max_chat_messages: 5,
            ..config()
        };
        let (core, mut patches) = start(FakeMessages::default(), config, None);
        let chat: ChatId = PAIR.parse().unwrap();
        core.set_active_chat(chat.clone()).await.unwrap();

        core.ingest(history(PAIR, 8)).await.unwrap();
        let mut view = ViewModel::default();
        settle(&mut patches, &mut view).await;

        let held = core.snapshot(chat).await.unwrap();
        assert_eq!(seqs(&held), vec![4, 5, 6, 7, 8]);
        assert_eq!(view.messages, held);
    }

    #[tokio::test]
    async fn history_view_matches_store_through_trims_and_live_messages() {
        let config = ClientConfig {
            max_chat_messages: 5,
            page_limit: 5,
            ..config()
        };
        let all = history(PAIR, 10);
        let (core, mut patches) = start(FakeMessages::with(PAIR, all[..8].to_vec()), config, None);
        let chat: ChatId = PAIR.parse().unwrap();
        let mut view = ViewModel::default();

        core.set_active_chat(chat.clone()).await.unwrap();
        core.load_more_before().await.unwrap();
        core.ingest(vec![all[8].clone()]).await.unwrap();
        settle(&mut patches, &mut view).await;

        // Reading history keeps the oldest rows; the live message is held back.
        let held = core.snapshot(chat.clone()).await.unwrap();
        assert_eq!(seqs(&held), vec![1, 2, 3, 4, 5]);
        assert_eq!(view.messages, held);

        core.set_scrolled(false).await.unwrap();
        core.ingest(vec![all[9].clone()]).await.unwrap();
        settle(&mut patches, &mut view).await;

        let held = core.snapshot(chat).await.unwrap();
        assert_eq!(seqs(&held), vec![2, 3, 4, 5, 10]);
        assert_eq!(view.messages, held);
    }

    #[tokio::test]
    async fn messages_for_other_chats_count_as_unread() {
        let (core, mut patches) = start(FakeMessages::default(), config(), None);
        core.ingest(vec![
            msg("g:team", Some(1), "bob", "one"),
            msg("g:team", Some(2), "carol", "two"),
            msg("g:team", Some(3), "alice", "mine"),
        ])
        .await
        .unwrap();

        let seen = until(&mut patches, |p| matches!(p, ChatPatch::Meta(_))).await;
        let Some(ChatPatch::Meta(meta)) =
            seen.iter().rev().find(|p| matches!(p, ChatPatch::Meta(_)))
        else {
            panic!("expected meta");
        };
        assert_eq!(meta.unread_delta.get("team"), Some(&2));
        assert_eq!(meta.last_messages.get("team").and_then(Message::seq), Some(3));
    }

    #[tokio::test]
    async fn failed_send_stays_visible() {
        let (core, _patches) = start(FakeMessages::default(), config(), None);
        let chat: ChatId = PAIR.parse().unwrap();
        let mut local = msg(PAIR, None, "alice", "draft");
        local.status = MessageStatus::Sending;
        core.ingest_local(local.clone()).await.unwrap();
        core.mark_failed(chat.clone(), local.id).await.unwrap();

        let held = core.snapshot(chat).await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn confirmed_send_replaces_the_optimistic_copy() {
        let (core, _patches) = start(FakeMessages::default(), config(), None);
        let chat: ChatId = PAIR.parse().unwrap();
        let mut local = msg(PAIR, None, "alice", "hello");
        local.status = MessageStatus::Sending;
        core.ingest_local(local.clone()).await.unwrap();

        let confirmed = Message {
            id: MessageId::new(),
            seq: Some(1),
            status: MessageStatus::Sent,
            ..local.clone()
        };
        core.confirm_sent(local.id, confirmed.clone()).await.unwrap();

        let held = core.snapshot(chat).await.unwrap();
        assert_eq!(held, vec![confirmed]);
    }

    #[tokio::test]
    async fn group_removal_drops_the_chat() {
        let (core, mut patches) = start(FakeMessages::default(), config(), None);
        core.realtime(vec![ServerEvent::GroupUpdate {
            group_id: GroupId::from("team"),
            action: GroupAction::MemberRemoved,
            user_id: Some("alice".into()),
            payload: serde_json::Value::Null,
        }])
        .await
        .unwrap();

        let seen = until(&mut patches, |p| matches!(p, ChatPatch::Meta(_))).await;
        let Some(ChatPatch::Meta(meta)) =
            seen.iter().rev().find(|p| matches!(p, ChatPatch::Meta(_)))
        else {
            panic!("expected meta");
        };
        assert_eq!(meta.chat_removals, vec!["team".to_string()]);
    }

    #[test]
    fn receipts_coalesce_per_chat() {
        let a: ChatId = "g:a".parse().unwrap();
        let b: ChatId = PAIR.parse().unwrap();
        let mut out = coalesce_receipts(vec![
            (a.clone(), 3, 1),
            (a.clone(), 5, 1),
            (a.clone(), 5, 3),
            (a.clone(), 4, 9),
            (b.clone(), 2, 1),
        ]);
        out.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(out, vec![(a, 5, 3), (b, 2, 1)]);
    }
}
