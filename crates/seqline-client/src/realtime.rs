//! Realtime WebSocket client.
//!
//! One connection per session: a writer task drains outbound frames, a
//! reader task decodes server frames, resolves pending send acks and
//! forwards everything else as [`TransportEvent`]s. Sends wait for their
//! ack with a bounded timeout and never assume delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, info, warn};
use uuid::Uuid;

use seqline_shared::realtime::{ClientEvent, ClientFrame, FrameError, ServerEvent, ServerFrame};
use seqline_shared::types::Attachment;
use seqline_shared::{ChatId, ErrorCode, GroupId, MessageId, MessageKind, UserId};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Realtime transport unavailable")]
    Unavailable,

    #[error("No ack within {0:?}")]
    AckTimeout(Duration),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Send rejected: {code}")]
    Rejected { code: ErrorCode },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

impl TransportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AckTimeout(_) => ErrorCode::AckTimeout,
            Self::Auth(_) => ErrorCode::AuthError,
            Self::Rejected { code } => *code,
            Self::Unavailable | Self::WebSocket(_) | Self::Frame(_) => {
                ErrorCode::TransportUnavailable
            }
        }
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Server(ServerEvent),
    Disconnected,
}

/// A message to send, addressed by chat.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub chat_id: ChatId,
    pub content: String,
    pub kind: MessageKind,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<MessageId>,
}

impl OutgoingMessage {
    pub fn text(chat_id: ChatId, content: impl Into<String>) -> Self {
        Self {
            chat_id,
            content: content.into(),
            kind: MessageKind::Text,
            attachments: Vec::new(),
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAck {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub seq: u64,
}

type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<ServerEvent>>>>;

/// Cloneable handle to a live connection.
#[derive(Clone, Debug)]
pub struct RealtimeClient {
    user_id: UserId,
    outbound: mpsc::Sender<ClientFrame>,
    pending: PendingAcks,
    ack_timeout: Duration,
}

impl RealtimeClient {
    /// Connect and authenticate. Server events flow into `events` until the
    /// connection drops, after which a single [`TransportEvent::Disconnected`]
    /// is sent. The returned handle finishes with the reader task.
    pub async fn connect(
        url: &str,
        token: &str,
        ack_timeout: Duration,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(Self, JoinHandle<()>), TransportError> {
        let (ws, _) = connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        let auth = ClientFrame::new(ClientEvent::Authenticate {
            token: token.to_string(),
        });
        write.send(WsMessage::Text(auth.encode()?.into())).await?;

        let user_id = tokio::time::timeout(AUTH_TIMEOUT, await_authenticated(&mut read))
            .await
            .map_err(|_| TransportError::Auth("no answer to authenticate".into()))??;
        info!(user = %user_id, url, "Realtime connected");

        let (outbound, mut outbound_rx) = mpsc::channel::<ClientFrame>(OUTBOUND_CAPACITY);
        let pending: PendingAcks = Arc::default();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                    debug!(error = %e, "Realtime write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "Realtime read failed");
                        break;
                    }
                };
                let frame = match ServerFrame::decode(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed server frame");
                        continue;
                    }
                };
                for event in frame.event.into_events() {
                    if let ServerEvent::Ack { ack_id, .. } = &event {
                        if let Some(tx) = reader_pending.lock().await.remove(ack_id) {
                            let _ = tx.send(event);
                        }
                        continue;
                    }
                    if events.send(TransportEvent::Server(event)).await.is_err() {
                        return;
                    }
                }
            }
            // Dropping the senders fails every outstanding send.
            reader_pending.lock().await.clear();
            info!("Realtime disconnected");
            let _ = events.send(TransportEvent::Disconnected).await;
        });

        Ok((
            Self {
                user_id,
                outbound,
                pending,
                ack_timeout,
            },
            reader,
        ))
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    async fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        self.outbound
            .send(ClientFrame::new(event))
            .await
            .map_err(|_| TransportError::Unavailable)
    }

    /// Send a message and wait for the server to sequence it.
    pub async fn send_message(&self, msg: OutgoingMessage) -> Result<SendAck, TransportError> {
        let (receiver_id, group_id) = match &msg.chat_id {
            ChatId::Group(g) => (None, Some(g.clone())),
            private => (private.peer_of(&self.user_id).cloned(), None::<GroupId>),
        };
        if receiver_id.is_none() && group_id.is_none() {
            return Err(TransportError::Rejected {
                code: ErrorCode::NotAMember,
            });
        }

        let ack_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(ack_id.clone(), tx);

        let sent = self
            .emit(ClientEvent::SendMessage {
                ack_id: ack_id.clone(),
                receiver_id,
                group_id,
                content: msg.content,
                kind: msg.kind,
                attachments: msg.attachments,
                reply_to: msg.reply_to,
            })
            .await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&ack_id);
            return Err(e);
        }

        let ack = match tokio::time::timeout(self.ack_timeout, rx).await {
            Err(_) => {
                self.pending.lock().await.remove(&ack_id);
                return Err(TransportError::AckTimeout(self.ack_timeout));
            }
            Ok(Err(_)) => return Err(TransportError::Unavailable),
            Ok(Ok(ack)) => ack,
        };

        match ack {
            ServerEvent::Ack {
                ok: true,
                message_id: Some(message_id),
                chat_id: Some(chat_id),
                seq: Some(seq),
                ..
            } => Ok(SendAck {
                message_id,
                chat_id,
                seq,
            }),
            ServerEvent::Ack { error, .. } => Err(TransportError::Rejected {
                code: error.unwrap_or(ErrorCode::Internal),
            }),
            _ => Err(TransportError::Unavailable),
        }
    }

    pub async fn read_chat(&self, chat_id: ChatId, seq: u64) -> Result<(), TransportError> {
        self.emit(ClientEvent::ReadChat { chat_id, seq }).await
    }

    pub async fn join_room(&self, room: impl Into<String>) -> Result<(), TransportError> {
        self.emit(ClientEvent::JoinRoom { room: room.into() }).await
    }

    pub async fn leave_room(&self, room: impl Into<String>) -> Result<(), TransportError> {
        self.emit(ClientEvent::LeaveRoom { room: room.into() }).await
    }

    pub async fn typing(&self, chat_id: ChatId, typing: bool) -> Result<(), TransportError> {
        let event = if typing {
            ClientEvent::TypingStart { chat_id }
        } else {
            ClientEvent::TypingStop { chat_id }
        };
        self.emit(event).await
    }

    pub async fn subscribe_presence(&self, user_ids: Vec<UserId>) -> Result<(), TransportError> {
        self.emit(ClientEvent::PresenceSubscribe { user_ids }).await
    }

    pub async fn ping(&self) -> Result<(), TransportError> {
        self.emit(ClientEvent::Ping).await
    }
}

async fn await_authenticated<S>(read: &mut S) -> Result<UserId, TransportError>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = read.next().await {
        let WsMessage::Text(text) = msg? else {
            continue;
        };
        match ServerFrame::decode(text.as_str())?.event {
            ServerEvent::Authenticated { user_id } => return Ok(user_id),
            ServerEvent::AuthError { message } => return Err(TransportError::Auth(message)),
            other => debug!(?other, "Ignoring event before authentication"),
        }
    }
    Err(TransportError::Unavailable)
}
