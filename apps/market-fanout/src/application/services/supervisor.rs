//! Connection Supervisor
//!
//! Drives the [`ConnectionStateMachine`] against a real [`Transport`]:
//! connects, pulls records into the [`Ingestor`], detects silent feeds
//! with a heartbeat timeout, and waits out backoff delays between
//! reconnection attempts.
//!
//! Every suspension point (connect, record pull, ingest, backoff timer)
//! is raced against the shared [`CancellationToken`], so stopping never
//! waits for the upstream.
//!
//! State is published in two ways: the latest [`ConnectionState`] on a
//! `watch` channel, and every [`Transition`] as a
//! [`FeedEvent::ConnectionTransition`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::ingestor::Ingestor;
use crate::application::ports::{Clock, Connection, FeedEvent, ObservabilitySink, Transport};
use crate::domain::connection::{
    ConnectionState, ConnectionStateMachine, FailureOutcome, Transition,
};
use crate::domain::error::{FatalConnectivityError, TransportError};
use crate::domain::streaming::RawRecord;

/// Why a streaming session ended.
enum SessionEnd {
    Cancelled,
    Failed(TransportError),
}

/// Owns the connection lifecycle and the single ingestor.
pub struct ConnectionSupervisor {
    machine: ConnectionStateMachine,
    transport: Arc<dyn Transport>,
    ingestor: Ingestor,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ObservabilitySink>,
    state_tx: watch::Sender<ConnectionState>,
    heartbeat_timeout: Duration,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    /// Create a supervisor.
    ///
    /// `heartbeat_timeout` of zero disables idle detection.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        machine: ConnectionStateMachine,
        transport: Arc<dyn Transport>,
        ingestor: Ingestor,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ObservabilitySink>,
        state_tx: watch::Sender<ConnectionState>,
        heartbeat_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            machine,
            transport,
            ingestor,
            clock,
            sink,
            state_tx,
            heartbeat_timeout,
            cancel,
        }
    }

    /// Run until cancelled or the reconnection budget is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`FatalConnectivityError`] once no further reconnection
    /// attempt is allowed. The machine is `Closed` by then.
    pub async fn run(mut self) -> Result<(), FatalConnectivityError> {
        match self.machine.connect() {
            Ok(transition) => self.publish(transition),
            Err(e) => {
                tracing::warn!(error = %e, "Supervisor started in unexpected state");
                return Ok(());
            }
        }

        loop {
            let connected = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                result = self.transport.connect() => Some(result),
            };

            let failure = match connected {
                None => {
                    self.close("cancelled while connecting");
                    return Ok(());
                }
                Some(Ok(mut connection)) => {
                    if let Ok(transition) = self.machine.on_connected() {
                        self.publish(transition);
                    }
                    tracing::info!("Upstream connected, streaming");

                    let end = self.stream(connection.as_mut()).await;
                    connection.close().await;
                    match end {
                        SessionEnd::Cancelled => {
                            self.close("cancelled while streaming");
                            return Ok(());
                        }
                        SessionEnd::Failed(error) => error,
                    }
                }
                Some(Err(error)) => error,
            };

            if !self.backoff(&failure).await? {
                self.close("cancelled during backoff");
                return Ok(());
            }
        }
    }

    /// Pull records until the session fails or is cancelled.
    async fn stream(&mut self, connection: &mut dyn Connection) -> SessionEnd {
        loop {
            let pulled = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                result = next_record(connection, self.heartbeat_timeout) => Some(result),
            };

            let record = match pulled {
                None => return SessionEnd::Cancelled,
                Some(Ok(Some(record))) => record,
                Some(Ok(None)) => return SessionEnd::Failed(TransportError::EndOfStream),
                Some(Err(error)) => return SessionEnd::Failed(error),
            };

            let ingested = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                outcome = self.ingestor.ingest(record) => Some(outcome),
            };
            if ingested.is_none() {
                return SessionEnd::Cancelled;
            }
        }
    }

    /// Apply a failure to the machine and wait out the backoff delay.
    ///
    /// Returns `Ok(false)` if cancelled while waiting.
    async fn backoff(&mut self, failure: &TransportError) -> Result<bool, FatalConnectivityError> {
        let reason = failure.to_string();
        let outcome = match self.machine.on_failure(self.clock.now(), &reason) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "Failure reported in unexpected state");
                return Ok(false);
            }
        };

        let (next_retry_at, delay) = match outcome {
            FailureOutcome::Retry { transition, delay } => {
                self.publish(transition);
                let ConnectionState::Backoff {
                    attempt,
                    next_retry_at,
                } = transition.to
                else {
                    return Ok(false);
                };
                tracing::warn!(
                    error = %reason,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Upstream failed, reconnecting after backoff"
                );
                (next_retry_at, delay)
            }
            FailureOutcome::Fatal { transition, error } => {
                self.publish(transition);
                tracing::error!(
                    attempts = error.attempts,
                    error = %error.last_error,
                    "Reconnection attempts exhausted"
                );
                self.sink.record(&FeedEvent::FatalConnectivity(error.clone()));
                return Err(error);
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(false),
            () = tokio::time::sleep(delay) => {}
        }

        // The timer has fired, so the deadline has been reached even if the
        // injected clock lags behind Tokio's.
        let now = self.clock.now().max(next_retry_at);
        match self.machine.on_retry_due(now) {
            Ok(Some(transition)) => {
                self.publish(transition);
                Ok(true)
            }
            Ok(None) | Err(_) => Ok(false),
        }
    }

    fn close(&mut self, reason: &str) {
        if let Some(transition) = self.machine.stop() {
            self.publish(transition);
        }
        tracing::info!(reason, "Supervisor stopped");
    }

    fn publish(&self, transition: Transition) {
        tracing::debug!(from = %transition.from, to = %transition.to, "Connection transition");
        self.state_tx.send_replace(transition.to);
        self.sink.record(&FeedEvent::ConnectionTransition(transition));
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("state", &self.machine.state())
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .finish_non_exhaustive()
    }
}

/// Pull one record, treating `heartbeat` of silence as a transport error.
async fn next_record(
    connection: &mut dyn Connection,
    heartbeat: Duration,
) -> Result<Option<RawRecord>, TransportError> {
    if heartbeat.is_zero() {
        return connection.next_record().await;
    }
    tokio::time::timeout(heartbeat, connection.next_record())
        .await
        .unwrap_or(Err(TransportError::HeartbeatTimeout(heartbeat)))
}

// =============================================================================
// Tests
// =============================================================================
