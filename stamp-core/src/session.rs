//! Connection supervision with bounded exponential backoff.
//!
//! After a failed connect or an unexpected disconnect the supervisor
//! waits `2^retry` seconds and tries again. At most one reconnect is
//! pending at any time; a successful connect or an explicit stop
//! cancels it. Once `max_retry_count` consecutive retries have failed
//! the supervisor gives up and reports
//! [`StampError::FailedStartingSession`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::error::StampError;

// ── ReconnectPolicy ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Retries allowed before the failure becomes terminal.
    pub max_retry_count: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retry_count: 5 }
    }
}

impl ReconnectPolicy {
    /// Wait before retry number `retry` (1-based): `2^retry` seconds.
    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_secs(2u64.checked_pow(retry).unwrap_or(u64::MAX))
    }
}

// ── Collaborators ────────────────────────────────────────────────

/// The output stream connection being supervised.
#[async_trait]
pub trait StreamSession: Send + Sync {
    async fn connect(&self) -> Result<(), StampError>;
    async fn close(&self) -> Result<(), StampError>;
}

/// Progress reported by the supervisor.
#[derive(Debug)]
pub enum SessionEvent {
    /// A connect attempt is starting (1 for the first try).
    Connecting { attempt: u32 },
    Connected,
    /// The link dropped without a stop request.
    Disconnected,
    RetryScheduled { retry: u32, delay: Duration },
    Stopped,
    /// Retries are exhausted; the supervisor will not try again.
    Terminal(StampError),
}

// ── SessionSupervisor ────────────────────────────────────────────

#[derive(Debug, Default)]
struct SupervisorState {
    retry_count: u32,
    stopping: bool,
    connected: bool,
    pending: Option<CancellationToken>,
}

impl SupervisorState {
    fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}

struct Shared {
    session: Arc<dyn StreamSession>,
    policy: ReconnectPolicy,
    state: Mutex<SupervisorState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    span: Span,
}

/// Drives one [`StreamSession`] through connect, backoff and stop.
#[derive(Clone)]
pub struct SessionSupervisor {
    shared: Arc<Shared>,
}

impl SessionSupervisor {
    pub fn new(
        session: Arc<dyn StreamSession>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::with_span(session, policy, tracing::info_span!("session"))
    }

    pub fn with_span(
        session: Arc<dyn StreamSession>,
        policy: ReconnectPolicy,
        span: Span,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            session,
            policy,
            state: Mutex::new(SupervisorState::default()),
            events,
            span,
        });
        (Self { shared }, rx)
    }

    /// Connect now. On failure a retry is scheduled (or the terminal
    /// error reported) and the connect error is returned.
    pub async fn start(&self) -> Result<(), StampError> {
        {
            let mut state = self.shared.state();
            state.cancel_pending();
            state.stopping = false;
            state.retry_count = 0;
        }
        Arc::clone(&self.shared).attempt().await
    }

    /// Report that an established connection dropped.
    pub fn notify_disconnected(&self, reason: &str) {
        {
            let mut state = self.shared.state();
            if state.stopping || !state.connected {
                return;
            }
            state.connected = false;
        }
        warn!(parent: &self.shared.span, reason, "session disconnected");
        self.shared.emit(SessionEvent::Disconnected);
        self.shared.on_failure(reason.to_string());
    }

    /// Cancel any pending reconnect and close the session.
    pub async fn stop(&self) -> Result<(), StampError> {
        {
            let mut state = self.shared.state();
            state.stopping = true;
            state.connected = false;
            state.cancel_pending();
        }
        let closed = self.shared.session.close().await;
        info!(parent: &self.shared.span, "session stopped");
        self.shared.emit(SessionEvent::Stopped);
        closed
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state().connected
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.state().retry_count
    }

    pub fn has_pending_retry(&self) -> bool {
        self.shared.state().pending.is_some()
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn attempt(self: Arc<Self>) -> BoxFuture<'static, Result<(), StampError>> {
        let span = self.span.clone();
        async move {
            let attempt = {
                let state = self.state();
                if state.stopping {
                    return Ok(());
                }
                state.retry_count + 1
            };
            debug!(attempt, "connecting");
            self.emit(SessionEvent::Connecting { attempt });

            match self.session.connect().await {
                Ok(()) => {
                    let stopping = {
                        let mut state = self.state();
                        if !state.stopping {
                            state.retry_count = 0;
                            state.connected = true;
                            state.cancel_pending();
                        }
                        state.stopping
                    };
                    if stopping {
                        // Stop raced the connect; undo it.
                        let _ = self.session.close().await;
                        return Ok(());
                    }
                    info!(attempt, "session connected");
                    self.emit(SessionEvent::Connected);
                    Ok(())
                }
                Err(e) => {
                    warn!(attempt, error = %e, "connect failed");
                    self.on_failure(e.to_string());
                    Err(e)
                }
            }
        }
        .instrument(span)
        .boxed()
    }

    fn on_failure(self: &Arc<Self>, reason: String) {
        let (retry, token) = {
            let mut state = self.state();
            if state.stopping {
                return;
            }
            state.connected = false;
            state.retry_count += 1;
            state.cancel_pending();
            if state.retry_count > self.policy.max_retry_count {
                state.stopping = true;
                let attempts = state.retry_count;
                drop(state);
                error!(parent: &self.span, attempts, %reason, "giving up on session");
                self.emit(SessionEvent::Terminal(StampError::FailedStartingSession {
                    attempts,
                    reason,
                }));
                return;
            }
            let token = CancellationToken::new();
            state.pending = Some(token.clone());
            (state.retry_count, token)
        };

        let delay = self.policy.delay(retry);
        info!(parent: &self.span, retry, ?delay, "reconnect scheduled");
        self.emit(SessionEvent::RetryScheduled { retry, delay });

        let shared = Arc::clone(self);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = token.cancelled() => debug!(retry, "pending reconnect cancelled"),
                    _ = tokio::time::sleep(delay) => {
                        {
                            let mut state = shared.state();
                            if token.is_cancelled() {
                                return;
                            }
                            state.pending = None;
                        }
                        let _ = shared.attempt().await;
                    }
                }
            }
            .instrument(self.span.clone()),
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────
