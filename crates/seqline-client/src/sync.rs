//! Gap recovery and the HTTP fallback loop.
//!
//! The realtime socket is the happy path. Whenever it is down, [`SyncLoop`]
//! long-polls `/sync/updates`, and runs bounded `/sync/difference` catch-ups
//! whenever the local pts may be behind. Phase bookkeeping lives in the
//! IO-free [`SyncMachine`]; the loop only performs the requests and feeds
//! the outcomes back into it.
//!
//! Payloads are never applied here. They go to a [`SyncSink`] (the core
//! actor), which ingests them and commits the watermark.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use seqline_shared::constants::{SYNC_DIFFERENCE_DEFAULT_LIMIT, SYNC_POLL_DEFAULT_TIMEOUT_MS};
use seqline_shared::protocol::Update;
use seqline_shared::Message;

use crate::api::{ApiError, SyncApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Disconnected,
    CatchingUp,
    Live,
    Backoff,
    AuthError,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub disconnect_grace: Duration,
    pub recovery_cooldown: Duration,
    /// `Difference` calls allowed per recovery.
    pub step_budget: u32,
    pub step_delay: Duration,
    /// Consecutive steps without pts progress before a recovery gives up.
    pub stall_limit: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Relative jitter applied to backoff delays (0.2 = ±20%).
    pub backoff_jitter: f64,
    pub contract_cooldown: Duration,
    pub poll_timeout: Duration,
    pub difference_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            disconnect_grace: Duration::from_millis(1_500),
            recovery_cooldown: Duration::from_secs(3),
            step_budget: 8,
            step_delay: Duration::from_millis(120),
            stall_limit: 2,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            backoff_jitter: 0.2,
            contract_cooldown: Duration::from_secs(30),
            poll_timeout: Duration::from_millis(SYNC_POLL_DEFAULT_TIMEOUT_MS),
            difference_limit: SYNC_DIFFERENCE_DEFAULT_LIMIT,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SyncMachine {
    config: SyncConfig,
    phase: SyncPhase,
    socket_connected: bool,
    backoff_attempt: u32,
    contract_until: Option<Instant>,
    last_recovery: Option<Instant>,
    recovering: bool,
}

impl SyncMachine {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            phase: SyncPhase::Idle,
            socket_connected: false,
            backoff_attempt: 0,
            contract_until: None,
            last_recovery: None,
            recovering: false,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn socket_connected(&self) -> bool {
        self.socket_connected
    }

    /// Whether the HTTP fallback should be running.
    pub fn fallback_active(&self) -> bool {
        !self.socket_connected && !matches!(self.phase, SyncPhase::Idle | SyncPhase::AuthError)
    }

    pub fn contract_remaining(&self, now: Instant) -> Duration {
        self.contract_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Leave `idle`. Returns how long to wait before the fallback starts.
    pub fn start(&mut self, now: Instant) -> Duration {
        if self.socket_connected {
            self.phase = SyncPhase::Live;
            return Duration::ZERO;
        }
        self.phase = SyncPhase::Disconnected;
        self.config.disconnect_grace + self.contract_remaining(now)
    }

    pub fn on_socket_connected(&mut self) {
        self.socket_connected = true;
        self.backoff_attempt = 0;
        if self.phase != SyncPhase::AuthError {
            self.phase = SyncPhase::Live;
        }
    }

    /// Returns the grace delay before polling resumes.
    pub fn on_socket_disconnected(&mut self, now: Instant) -> Duration {
        self.socket_connected = false;
        if self.phase == SyncPhase::AuthError {
            return Duration::ZERO;
        }
        self.phase = SyncPhase::Disconnected;
        self.config.disconnect_grace + self.contract_remaining(now)
    }

    /// Single-flight and cooldown guard. On success, and unless the socket
    /// is up, the phase becomes `catching_up` until
    /// [`end_recovery`](Self::end_recovery).
    pub fn begin_recovery(&mut self, now: Instant, force: bool) -> bool {
        if self.recovering || self.phase == SyncPhase::AuthError {
            return false;
        }
        let cooled = self
            .last_recovery
            .map_or(true, |at| now.duration_since(at) >= self.config.recovery_cooldown);
        if !force && !cooled {
            return false;
        }
        self.recovering = true;
        self.last_recovery = Some(now);
        if !self.socket_connected {
            self.phase = SyncPhase::CatchingUp;
        }
        true
    }

    pub fn end_recovery(&mut self, reached_latest: bool) {
        self.recovering = false;
        if reached_latest || self.socket_connected {
            self.phase = SyncPhase::Live;
        }
    }

    pub fn on_poll_ok(&mut self) {
        self.backoff_attempt = 0;
        self.phase = SyncPhase::Live;
    }

    /// Exponential backoff; `jitter` is a relative offset in
    /// `[-backoff_jitter, backoff_jitter]`.
    pub fn on_transient_error(&mut self, jitter: f64) -> Duration {
        let exp = self.backoff_attempt.min(16);
        self.backoff_attempt = self.backoff_attempt.saturating_add(1);
        self.phase = SyncPhase::Backoff;

        let raw = self
            .config
            .backoff_base
            .saturating_mul(1 << exp)
            .min(self.config.backoff_max);
        let bound = self.config.backoff_jitter.abs();
        raw.mul_f64(1.0 + jitter.clamp(-bound, bound))
    }

    /// Fixed cooldown; the exponential counter is left alone.
    pub fn on_contract_violation(&mut self, now: Instant) -> Duration {
        self.contract_until = Some(now + self.config.contract_cooldown);
        self.phase = SyncPhase::Backoff;
        self.config.contract_cooldown
    }

    pub fn on_auth_error(&mut self) {
        self.phase = SyncPhase::AuthError;
    }

    pub fn on_token_refreshed(&mut self) {
        if self.phase != SyncPhase::AuthError {
            return;
        }
        self.backoff_attempt = 0;
        self.phase = if self.socket_connected {
            SyncPhase::Live
        } else {
            SyncPhase::Disconnected
        };
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Updates and messages to ingest, and the pts to commit afterwards.
#[derive(Debug, Clone, Default)]
pub struct SyncPayload {
    pub updates: Vec<Update>,
    pub messages: Vec<Message>,
    pub pts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub pts: u64,
    pub socket_connected: bool,
    pub reason: Option<String>,
}

#[async_trait]
pub trait SyncSink: Send + Sync {
    async fn local_pts(&self) -> u64;

    /// Ingest a payload and commit its pts. Returns the committed pts, which
    /// never goes below the previous value.
    async fn apply(&self, payload: SyncPayload) -> u64;

    async fn status(&self, status: SyncStatus);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    SocketConnected,
    SocketDisconnected,
    TokenRefreshed,
    Recover { force: bool },
}

pub struct SyncLoop {
    api: Arc<dyn SyncApi>,
    sink: Arc<dyn SyncSink>,
    machine: SyncMachine,
    config: SyncConfig,
    cancel: CancellationToken,
    needs_recovery: bool,
    deferred: Option<SyncSignal>,
    closed: bool,
    last_emitted: Option<(SyncPhase, bool)>,
}

impl SyncLoop {
    pub fn new(
        api: Arc<dyn SyncApi>,
        sink: Arc<dyn SyncSink>,
        config: SyncConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            sink,
            machine: SyncMachine::new(config.clone()),
            config,
            cancel,
            needs_recovery: true,
            deferred: None,
            closed: false,
            last_emitted: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.machine.phase()
    }

    pub async fn run(mut self, mut signals: mpsc::Receiver<SyncSignal>) {
        let mut wait = self.machine.start(Instant::now());
        self.emit(None).await;
        info!(grace_ms = wait.as_millis() as u64, "Sync loop started");

        loop {
            if let Some(signal) = self.deferred.take() {
                wait = self.on_signal(signal).await;
                continue;
            }
            if self.closed {
                break;
            }
            let active = self.machine.fallback_active();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => wait = self.on_signal(signal).await,
                    None => break,
                },
                _ = tokio::time::sleep(wait), if active => {
                    wait = self.fallback_step(&mut signals).await;
                }
            }
        }
        debug!("Sync loop stopped");
    }

    async fn on_signal(&mut self, signal: SyncSignal) -> Duration {
        debug!(?signal, phase = ?self.machine.phase(), "Sync signal");
        match signal {
            SyncSignal::SocketConnected => {
                self.machine.on_socket_connected();
                self.emit(None).await;
                // Reconnects do not redeliver what was missed while away.
                if let Err(e) = self.gap_recover(true).await {
                    if e.is_auth() {
                        return self.on_error(e).await;
                    }
                    warn!(error = %e, "Background recovery after reconnect failed");
                }
                Duration::ZERO
            }
            SyncSignal::SocketDisconnected => {
                let grace = self.machine.on_socket_disconnected(Instant::now());
                self.needs_recovery = true;
                self.emit(None).await;
                grace
            }
            SyncSignal::TokenRefreshed => {
                self.machine.on_token_refreshed();
                self.needs_recovery = true;
                self.emit(None).await;
                Duration::ZERO
            }
            SyncSignal::Recover { force } => match self.gap_recover(force).await {
                Ok(_) => Duration::ZERO,
                Err(e) => self.on_error(e).await,
            },
        }
    }

    async fn fallback_step(&mut self, signals: &mut mpsc::Receiver<SyncSignal>) -> Duration {
        if self.needs_recovery {
            if let Err(e) = self.gap_recover(false).await {
                return self.on_error(e).await;
            }
            self.needs_recovery = false;
        }
        match self.poll_once(signals).await {
            Ok(delay) => delay,
            Err(e) => {
                self.needs_recovery = true;
                self.on_error(e).await
            }
        }
    }

    /// Catch up with bounded `Difference` calls. Returns `Ok(false)` when the
    /// single-flight or cooldown guard skipped the attempt.
    async fn gap_recover(&mut self, force: bool) -> Result<bool, ApiError> {
        if !self.machine.begin_recovery(Instant::now(), force) {
            debug!(force, "Gap recovery skipped");
            return Ok(false);
        }
        self.emit(None).await;

        let result = self.recover_steps().await;
        self.machine.end_recovery(matches!(result, Ok(true)));
        if let Ok(true) = result {
            self.emit(None).await;
            let pts = self.sink.local_pts().await;
            if let Err(e) = self.api.ack(pts).await {
                debug!(pts, error = %e, "Sync ack failed");
            }
        }
        result.map(|_| true)
    }

    /// Returns whether the server reported nothing further.
    async fn recover_steps(&mut self) -> Result<bool, ApiError> {
        let state = self.api.state().await?;
        state.contract.verify()?;

        let mut local = self.sink.local_pts().await;
        if state.pts <= local {
            debug!(local, server = state.pts, "Already up to date");
            return Ok(true);
        }
        info!(local, server = state.pts, "Gap recovery started");

        let mut stalls = 0;
        for step in 0..self.config.step_budget {
            if step > 0 && !self.config.step_delay.is_zero() {
                tokio::time::sleep(self.config.step_delay).await;
            }
            if self.cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }

            let from = local;
            let diff = self.api.difference(from, self.config.difference_limit).await?;
            diff.contract.verify()?;

            let returned = !diff.updates.is_empty() || !diff.messages.is_empty();
            let state_pts = diff.state.pts;
            local = self
                .sink
                .apply(SyncPayload {
                    updates: diff.updates,
                    messages: diff.messages,
                    pts: state_pts,
                })
                .await;
            debug!(step, from, pts = local, is_latest = diff.is_latest, "Difference applied");

            if diff.is_latest {
                return Ok(true);
            }
            if !returned && state_pts <= from {
                return Ok(true);
            }
            if local <= from {
                stalls += 1;
                if stalls >= self.config.stall_limit {
                    warn!(pts = local, "Gap recovery stalled");
                    return Ok(false);
                }
            } else {
                stalls = 0;
            }
        }
        warn!(pts = local, budget = self.config.step_budget, "Gap recovery step budget exhausted");
        Ok(false)
    }

    /// One long-poll round. Returns how long to wait before the next one.
    async fn poll_once(
        &mut self,
        signals: &mut mpsc::Receiver<SyncSignal>,
    ) -> Result<Duration, ApiError> {
        let from = self.sink.local_pts().await;
        let resp = tokio::select! {
            r = self.api.updates(from, self.config.poll_timeout) => r?,
            signal = signals.recv() => {
                match signal {
                    Some(signal) => self.deferred = Some(signal),
                    None => self.closed = true,
                }
                return Ok(Duration::ZERO);
            }
            _ = self.cancel.cancelled() => return Ok(Duration::ZERO),
        };
        resp.contract.verify()?;

        let count = resp.updates.len();
        let state_pts = resp.state.pts;
        if count > 0 || !resp.messages.is_empty() {
            self.sink
                .apply(SyncPayload {
                    updates: resp.updates,
                    messages: resp.messages,
                    pts: state_pts,
                })
                .await;
            if count + 1 >= self.config.difference_limit as usize {
                self.gap_recover(true).await?;
            }
        } else if state_pts > from {
            debug!(from, server = state_pts, "Server advanced without updates");
            self.gap_recover(true).await?;
        } else if state_pts < from {
            // The watermark never moves back; wait for the log to catch up.
            warn!(local = from, server = state_pts, "Server pts is behind the local watermark");
            self.machine.on_poll_ok();
            self.emit(None).await;
            return Ok(self.config.backoff_max);
        }

        self.machine.on_poll_ok();
        self.emit(None).await;
        Ok(Duration::ZERO)
    }

    async fn on_error(&mut self, e: ApiError) -> Duration {
        let reason = Some(e.code().to_string());
        let delay = match &e {
            ApiError::Auth(_) => {
                warn!(error = %e, "Sync suspended until the token is refreshed");
                self.machine.on_auth_error();
                self.config.backoff_max
            }
            ApiError::Contract(_) => {
                warn!(error = %e, "Sync contract mismatch, cooling down");
                self.machine.on_contract_violation(Instant::now())
            }
            _ => {
                let bound = self.config.backoff_jitter.abs();
                let jitter = if bound > 0.0 {
                    rand::thread_rng().gen_range(-bound..=bound)
                } else {
                    0.0
                };
                let delay = self.machine.on_transient_error(jitter);
                debug!(error = %e, delay_ms = delay.as_millis() as u64, "Sync backing off");
                delay
            }
        };
        self.emit(reason).await;
        delay
    }

    async fn emit(&mut self, reason: Option<String>) {
        let key = (self.machine.phase(), self.machine.socket_connected());
        if reason.is_none() && self.last_emitted == Some(key) {
            return;
        }
        self.last_emitted = Some(key);
        let pts = self.sink.local_pts().await;
        self.sink
            .status(SyncStatus {
                phase: key.0,
                pts,
                socket_connected: key.1,
                reason,
            })
            .await;
    }
}
