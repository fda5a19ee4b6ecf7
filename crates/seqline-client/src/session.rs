//! A signed-in client session.
//!
//! Wires the HTTP API, the realtime connection, the sync loop and the chat
//! core together. Realtime events are drained into batches and handed to
//! the core; socket state changes are forwarded to the sync loop so the
//! long-poll fallback can take over while the socket is down.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use seqline_shared::{ChatId, Message, MessageId, MessageStatus, UserId};
use seqline_store::Database;

use crate::api::{ApiError, HttpApi};
use crate::config::ClientConfig;
use crate::core::engine::{spawn_core, CoreError, CoreHandle};
use crate::core::patch::ChatPatch;
use crate::realtime::{OutgoingMessage, RealtimeClient, SendAck, TransportError, TransportEvent};
use crate::sync::{SyncLoop, SyncSignal};

const EVENT_BUFFER: usize = 512;
const SIGNAL_BUFFER: usize = 16;
/// Upper bound on realtime events folded into one core command.
const EVENT_BATCH: usize = 128;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

pub struct Session {
    me: UserId,
    core: CoreHandle,
    api: Arc<HttpApi>,
    realtime: Option<RealtimeClient>,
    signals: mpsc::Sender<SyncSignal>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Start a session for `me`. With `realtime` off, or if the socket
    /// cannot be opened, updates arrive through the long-poll fallback.
    pub async fn start(
        me: UserId,
        token: &str,
        config: ClientConfig,
        cache: Option<Database>,
        realtime: bool,
    ) -> Result<(Self, mpsc::Receiver<Vec<ChatPatch>>), SessionError> {
        let api = Arc::new(HttpApi::new(config.api_base.clone())?);
        api.set_token(token).await;

        let cancel = CancellationToken::new();
        let (core, patches, core_task) =
            spawn_core(me.clone(), config.clone(), api.clone(), cache);

        let (signals, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let sync = SyncLoop::new(
            api.clone(),
            Arc::new(core.clone()),
            config.sync.clone(),
            cancel.child_token(),
        );
        let mut tasks = vec![core_task, tokio::spawn(sync.run(signal_rx))];

        let mut client = None;
        if realtime {
            let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
            match RealtimeClient::connect(&config.ws_url, token, config.send_ack_timeout, event_tx)
                .await
            {
                Ok((rt, reader)) => {
                    if rt.user_id() != &me {
                        warn!(
                            expected = %me,
                            actual = %rt.user_id(),
                            "Socket authenticated as another user"
                        );
                    }
                    let _ = signals.send(SyncSignal::SocketConnected).await;
                    tasks.push(reader);
                    tasks.push(tokio::spawn(pump_events(
                        event_rx,
                        core.clone(),
                        signals.clone(),
                        cancel.child_token(),
                    )));
                    client = Some(rt);
                }
                Err(e) => warn!(error = %e, "Realtime unavailable, using long-poll"),
            }
        }

        info!(user = %me, realtime = client.is_some(), "Session started");
        Ok((
            Self {
                me,
                core,
                api,
                realtime: client,
                signals,
                cancel,
                tasks,
            },
            patches,
        ))
    }

    pub fn user_id(&self) -> &UserId {
        &self.me
    }

    pub fn core(&self) -> &CoreHandle {
        &self.core
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime.as_ref().is_some_and(|rt| !rt.is_closed())
    }

    /// Send a message through the realtime transport.
    ///
    /// An optimistic copy is shown right away. On ack it is swapped for the
    /// sequenced copy; on failure it stays, marked failed.
    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<SendAck, SessionError> {
        let rt = self
            .realtime
            .as_ref()
            .filter(|rt| !rt.is_closed())
            .ok_or(TransportError::Unavailable)?;

        let local = Message {
            id: MessageId::new(),
            chat_id: outgoing.chat_id.clone(),
            seq: None,
            sender_id: self.me.clone(),
            kind: outgoing.kind,
            content: outgoing.content.clone(),
            attachments: outgoing.attachments.clone(),
            status: MessageStatus::Sending,
            read_count: 0,
            sent_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
            reply_to: outgoing.reply_to,
        };
        let local_id = local.id;
        let chat_id = local.chat_id.clone();
        self.core.ingest_local(local.clone()).await?;

        match rt.send_message(outgoing).await {
            Ok(ack) => {
                let confirmed = Message {
                    id: ack.message_id,
                    chat_id: ack.chat_id.clone(),
                    seq: Some(ack.seq),
                    status: MessageStatus::Sent,
                    ..local
                };
                self.core.confirm_sent(local_id, confirmed).await?;
                Ok(ack)
            }
            Err(e) => {
                debug!(chat = %chat_id, error = %e, "Send failed");
                self.core.mark_failed(chat_id, local_id).await?;
                Err(e.into())
            }
        }
    }

    /// Report the local read position. Without a socket this is a no-op.
    pub async fn mark_read(&self, chat_id: ChatId, seq: u64) -> Result<(), SessionError> {
        match &self.realtime {
            Some(rt) if !rt.is_closed() => Ok(rt.read_chat(chat_id, seq).await?),
            _ => Ok(()),
        }
    }

    pub async fn typing(&self, chat_id: ChatId, typing: bool) -> Result<(), SessionError> {
        match &self.realtime {
            Some(rt) if !rt.is_closed() => Ok(rt.typing(chat_id, typing).await?),
            _ => Ok(()),
        }
    }

    pub async fn subscribe_presence(&self, users: Vec<UserId>) -> Result<(), SessionError> {
        match &self.realtime {
            Some(rt) if !rt.is_closed() => Ok(rt.subscribe_presence(users).await?),
            _ => Ok(()),
        }
    }

    pub async fn refresh_token(&self, token: &str) {
        self.api.set_token(token).await;
        let _ = self.signals.send(SyncSignal::TokenRefreshed).await;
    }

    /// Ask the sync loop for an immediate difference run.
    pub async fn recover(&self) {
        let _ = self
            .signals
            .send(SyncSignal::Recover { force: true })
            .await;
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.core.shutdown().await;
        drop(self.realtime);
        for mut task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        info!(user = %self.me, "Session closed");
    }
}

/// Forward realtime events to the core in batches.
async fn pump_events(
    mut events: mpsc::Receiver<TransportEvent>,
    core: CoreHandle,
    signals: mpsc::Sender<SyncSignal>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };

        let mut batch = Vec::new();
        let mut disconnected = false;
        let mut next = Some(first);
        while let Some(ev) = next.take() {
            match ev {
                TransportEvent::Server(event) => batch.push(event),
                TransportEvent::Disconnected => disconnected = true,
            }
            if batch.len() < EVENT_BATCH {
                next = events.try_recv().ok();
            }
        }

        if !batch.is_empty() && core.realtime(batch).await.is_err() {
            break;
        }
        if disconnected {
            let _ = signals.send(SyncSignal::SocketDisconnected).await;
        }
    }
}
