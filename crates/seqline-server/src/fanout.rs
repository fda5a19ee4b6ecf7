//! Message send path: validation, sequencing, recipient resolution and
//! fanout, plus read receipts.
//!
//! Small groups and private chats get full fanout: every recipient's
//! delivery cursor is advanced and an update is appended to their log. Groups
//! above the threshold switch to read-scaling: only the shared
//! [`GroupState`] pointer moves and the message is pushed to the group room;
//! members pull history through the listing API.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use seqline_shared::constants::MIN_GROUP_FANOUT_THRESHOLD;
use seqline_shared::protocol::{ReadUpdatePayload, UpdateKind};
use seqline_shared::realtime::ServerEvent;
use seqline_shared::types::{Attachment, GroupState};
use seqline_shared::{
    ChatId, ErrorCode, GroupId, Message, MessageId, MessageKind, MessageStatus, UserId,
};

use crate::db::{Backend, DbError, MemberStatus, UpdateEvent};
use crate::notifier::UpdateNotifier;
use crate::queue::{FanoutJob, JobQueue};
use crate::sequencer::{Sequencer, SequencerError};

/// Where realtime events go. Implemented by the WebSocket hub.
pub trait EventSink: Send + Sync + 'static {
    fn push_to_users(&self, users: &[UserId], event: &ServerEvent);
    fn push_to_group(&self, group_id: &GroupId, event: &ServerEvent);
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Group not found")]
    GroupNotFound,

    #[error("Not a member of this chat")]
    NotAMember,

    #[error("Muted in this group")]
    ForbiddenMuted,

    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    #[error(transparent)]
    Store(#[from] DbError),
}

impl SendError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::GroupNotFound => ErrorCode::NotFound,
            Self::NotAMember => ErrorCode::NotAMember,
            Self::ForbiddenMuted => ErrorCode::ForbiddenMuted,
            Self::Sequencer(_) | Self::Store(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub sender_id: UserId,
    pub receiver_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub content: String,
    pub kind: MessageKind,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutMode {
    Full,
    ReadScaling,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    pub mode: FanoutMode,
    /// Recipients other than the sender handed to fanout.
    pub fanout_recipients: usize,
    /// `false` when the queue was unavailable and fanout ran inline.
    pub queued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub chat_id: ChatId,
    pub seq: u64,
    pub read_count: u32,
    pub reader_id: UserId,
}

impl From<ReadReceipt> for ServerEvent {
    fn from(r: ReadReceipt) -> Self {
        ServerEvent::ReadReceipt {
            chat_id: r.chat_id,
            seq: r.seq,
            read_count: r.read_count,
            reader_id: r.reader_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs one [`FanoutJob`]. Shared by the workers and the inline path.
pub struct FanoutExecutor {
    backend: Backend,
    notifier: UpdateNotifier,
    sink: Arc<dyn EventSink>,
}

impl FanoutExecutor {
    pub fn new(backend: Backend, notifier: UpdateNotifier, sink: Arc<dyn EventSink>) -> Self {
        Self {
            backend,
            notifier,
            sink,
        }
    }

    pub async fn execute(&self, job: &FanoutJob) -> Result<(), DbError> {
        for user in &job.recipient_ids {
            self.backend
                .chats
                .advance_member_state(&job.chat_id, user, job.seq, None)
                .await?;
        }

        let event = UpdateEvent {
            kind: UpdateKind::Message,
            chat_id: job.chat_id.clone(),
            seq: Some(job.seq),
            message_id: Some(job.message_id),
            payload: serde_json::Value::Null,
            dedupe_key: Some(format!("message:{}", job.message_id)),
        };
        let appended = self
            .backend
            .log
            .append_updates(&job.recipient_ids, &event)
            .await?;
        for (user, pts) in &appended {
            self.notifier.notify(user, *pts);
        }

        // A redelivered job appends nothing; it was already pushed.
        if appended.is_empty() {
            return Ok(());
        }
        let users: Vec<UserId> = appended.into_iter().map(|(u, _)| u).collect();
        if let Some(message) = self
            .backend
            .chats
            .messages_by_ids(&[job.message_id])
            .await?
            .into_iter()
            .next()
        {
            self.sink
                .push_to_users(&users, &ServerEvent::Message { message });
        }

        debug!(
            message_id = %job.message_id,
            chat = %job.chat_id,
            seq = job.seq,
            recipients = users.len(),
            "Fanout job executed"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct FanoutDispatcher {
    sequencer: Sequencer,
    backend: Backend,
    queue: Arc<dyn JobQueue>,
    executor: Arc<FanoutExecutor>,
    notifier: UpdateNotifier,
    sink: Arc<dyn EventSink>,
    threshold: usize,
}

impl FanoutDispatcher {
    pub fn new(
        backend: Backend,
        queue: Arc<dyn JobQueue>,
        notifier: UpdateNotifier,
        sink: Arc<dyn EventSink>,
        threshold: usize,
    ) -> Self {
        let executor = Arc::new(FanoutExecutor::new(
            backend.clone(),
            notifier.clone(),
            sink.clone(),
        ));
        Self {
            sequencer: Sequencer::new(backend.counters.clone()),
            backend,
            queue,
            executor,
            notifier,
            sink,
            threshold: threshold.max(MIN_GROUP_FANOUT_THRESHOLD),
        }
    }

    pub fn executor(&self) -> Arc<FanoutExecutor> {
        self.executor.clone()
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub async fn send(&self, req: SendRequest) -> Result<SendOutcome, SendError> {
        let chat_id = match (&req.receiver_id, &req.group_id) {
            (Some(peer), None) => ChatId::private(&req.sender_id, peer),
            (None, Some(group)) => ChatId::group(group),
            _ => {
                return Err(SendError::BadRequest(
                    "exactly one of receiverId or groupId is required".into(),
                ))
            }
        };
        let content = normalize_content(&req.content, &req.attachments)?;

        let members = match &req.group_id {
            Some(group) => {
                self.check_sender(group, &req.sender_id).await?;
                Some(self.backend.directory.receiving_members(group).await?)
            }
            None => None,
        };

        let seq = self.sequencer.next_seq(&chat_id).await?;
        let message = Message {
            id: MessageId::new(),
            chat_id: chat_id.clone(),
            seq: Some(seq),
            sender_id: req.sender_id.clone(),
            kind: req.kind,
            content,
            attachments: req.attachments,
            status: MessageStatus::Sent,
            read_count: 0,
            sent_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
            reply_to: req.reply_to,
        };
        self.backend.chats.insert_message(&message).await?;

        let (mode, others) = match (members, &req.group_id) {
            (Some(members), Some(group)) if members.len() > self.threshold => {
                self.backend
                    .chats
                    .advance_group_state(&GroupState {
                        group_id: group.clone(),
                        last_seq: seq,
                        last_message_id: message.id,
                    })
                    .await?;
                self.sink.push_to_group(
                    group,
                    &ServerEvent::Message {
                        message: message.clone(),
                    },
                );
                (FanoutMode::ReadScaling, Vec::new())
            }
            (Some(members), _) => (
                FanoutMode::Full,
                members
                    .into_iter()
                    .filter(|u| u != &req.sender_id)
                    .collect(),
            ),
            (None, _) => {
                let peer = req.receiver_id.clone().filter(|p| p != &req.sender_id);
                (FanoutMode::Full, peer.into_iter().collect())
            }
        };

        // The sender has trivially seen their own message.
        self.backend
            .chats
            .advance_member_state(&chat_id, &req.sender_id, seq, Some(seq))
            .await?;

        let fanout_recipients = others.len();
        let mut queued = true;
        if !others.is_empty() {
            let job = FanoutJob {
                message_id: message.id,
                chat_id: chat_id.clone(),
                seq,
                sender_id: req.sender_id.clone(),
                recipient_ids: others,
            };
            if let Err(e) = self.queue.enqueue(job.clone()).await {
                warn!(
                    code = %ErrorCode::QueueUnavailable,
                    error = %e,
                    message_id = %message.id,
                    "Fanout queue unavailable, delivering inline"
                );
                queued = false;
                // The message is already stored and sequenced; a failed
                // delivery is left to recipients' next difference call.
                if let Err(e) = self.executor.execute(&job).await {
                    warn!(
                        code = %ErrorCode::QueueUnavailable,
                        error = %e,
                        message_id = %message.id,
                        "Inline fanout failed"
                    );
                }
            }
        }

        info!(
            chat = %chat_id,
            seq,
            message_id = %message.id,
            mode = ?mode,
            recipients = fanout_recipients,
            "Message sent"
        );

        Ok(SendOutcome {
            message,
            mode,
            fanout_recipients,
            queued,
        })
    }

    async fn check_sender(&self, group: &GroupId, sender: &UserId) -> Result<(), SendError> {
        let dir = &self.backend.directory;
        dir.group(group)
            .await?
            .filter(|g| g.is_active)
            .ok_or(SendError::GroupNotFound)?;
        let member = dir
            .membership(group, sender)
            .await?
            .ok_or(SendError::NotAMember)?;

        match member.status {
            MemberStatus::Banned | MemberStatus::Left => return Err(SendError::NotAMember),
            MemberStatus::Muted if member.muted_until.is_none() => {
                return Err(SendError::ForbiddenMuted)
            }
            _ => {}
        }
        match member.muted_until {
            Some(until) if until > Utc::now() => Err(SendError::ForbiddenMuted),
            Some(_) => {
                debug!(group = %group, user = %sender, "Clearing expired mute");
                dir.clear_mute(group, sender).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Check that `user` may read `chat_id`.
    pub async fn check_access(&self, chat_id: &ChatId, user: &UserId) -> Result<(), SendError> {
        match chat_id {
            ChatId::Private { .. } if chat_id.involves(user) => Ok(()),
            ChatId::Private { .. } => Err(SendError::NotAMember),
            ChatId::Group(group) => {
                let member = self.backend.directory.membership(group, user).await?;
                match member {
                    Some(m) if m.status.receives_messages() => Ok(()),
                    _ => Err(SendError::NotAMember),
                }
            }
        }
    }

    /// Advance `reader`'s read cursor in `chat_id` to `seq` and publish the
    /// resulting receipt.
    pub async fn mark_read(
        &self,
        reader: &UserId,
        chat_id: &ChatId,
        seq: u64,
    ) -> Result<ReadReceipt, SendError> {
        if seq == 0 {
            return Err(SendError::BadRequest("seq must be positive".into()));
        }
        self.check_access(chat_id, reader).await?;

        let chats = &self.backend.chats;
        let before = chats
            .member_state(chat_id, reader)
            .await?
            .map(|s| s.last_read_seq)
            .unwrap_or(0);
        let after = chats
            .advance_member_state(chat_id, reader, seq, Some(seq))
            .await?;

        let message = chats.message_by_seq(chat_id, seq).await?;
        let read_count = match &message {
            Some(m) => chats.count_readers(chat_id, seq, &m.sender_id).await?,
            None => 0,
        };

        if let Some(m) = message.filter(|m| &m.sender_id != reader) {
            if after.last_read_seq > before {
                let payload = ReadUpdatePayload {
                    reader_id: reader.to_string(),
                    read_count,
                };
                let event = UpdateEvent {
                    kind: UpdateKind::Read,
                    chat_id: chat_id.clone(),
                    seq: Some(seq),
                    message_id: Some(m.id),
                    payload: serde_json::to_value(payload).map_err(DbError::from)?,
                    dedupe_key: Some(format!("read:{chat_id}:{seq}:{reader}")),
                };
                let appended = self
                    .backend
                    .log
                    .append_updates(std::slice::from_ref(&m.sender_id), &event)
                    .await?;
                for (user, pts) in appended {
                    self.notifier.notify(&user, pts);
                }
            }
        }

        let receipt = ReadReceipt {
            chat_id: chat_id.clone(),
            seq,
            read_count,
            reader_id: reader.clone(),
        };
        let event = ServerEvent::from(receipt.clone());
        match chat_id {
            ChatId::Group(group) => self.sink.push_to_group(group, &event),
            ChatId::Private { .. } => {
                if let Some(peer) = chat_id.peer_of(reader) {
                    self.sink.push_to_users(std::slice::from_ref(peer), &event);
                }
            }
        }
        Ok(receipt)
    }
}

/// Empty text falls back to the first attachment's name, or a single space
/// when that is empty too. A message with neither is rejected.
fn normalize_content(content: &str, attachments: &[Attachment]) -> Result<String, SendError> {
    if !content.trim().is_empty() {
        return Ok(content.to_string());
    }
    match attachments.first() {
        Some(a) if !a.file_name.trim().is_empty() => Ok(a.file_name.clone()),
        Some(_) => Ok(" ".to_string()),
        None => Err(SendError::BadRequest(
            "content or attachments required".into(),
        )),
    }
}
