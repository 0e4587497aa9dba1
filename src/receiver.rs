//! Inbound loop - continuous receive.
//!
//! One task per session pulls the next [`AgentState`] off the response
//! stream, decodes it and publishes it. Failures are classified with the
//! receive table:
//!
//! - `Continue` - logged at debug, read again immediately
//! - `Cancelled` - stop quietly
//! - `Recoverable` - logged at error, stop quietly; subscribers simply
//!   stop receiving events
//! - `FatalUnexpected` - logged as fatal, the loop returns an error
//!
//! The loop never restarts itself. A new session is needed to reconnect.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Code;

use crate::classify::{classify_status, Operation, Outcome};
use crate::error::{CreatureError, Result};
use crate::protocol::{AgentState, InboundState};
use crate::publisher::Publisher;
use crate::transport::InboundSource;

/// Why the inbound loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The server closed the stream.
    EndOfStream,
    /// The session scope was cancelled or the server reported `Cancelled`.
    Cancelled,
    /// The stream became unusable with a transient status.
    Recoverable(Code),
    /// The server reported a status the protocol rules out.
    Fatal { code: Code, message: String },
    /// The loop task unwound or was dropped before deciding to exit.
    Aborted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "end of stream"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Recoverable(code) => write!(f, "recoverable failure ({:?})", code),
            Self::Fatal { code, message } => write!(f, "fatal status {:?}: {}", code, message),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Lifecycle of the inbound loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// Exit decided, releasing the response side.
    Draining,
    /// Terminal.
    Stopped(StopReason),
}

impl LoopState {
    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

/// Spawn the inbound loop for one session.
pub(crate) fn spawn_receive_loop(
    source: Box<dyn InboundSource>,
    publisher: Arc<Publisher>,
    scope: CancellationToken,
) -> (watch::Receiver<LoopState>, JoinHandle<Result<()>>) {
    let (state_tx, state_rx) = watch::channel(LoopState::Running);
    let task = tokio::spawn(async move { receive_loop(source, &publisher, &scope, &state_tx).await });
    (state_rx, task)
}

/// Publishes `Stopped(Aborted)` unless the loop reached its own exit.
struct StopGuard<'a> {
    state: &'a watch::Sender<LoopState>,
    finished: bool,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!("Inbound loop aborted");
            self.state
                .send_replace(LoopState::Stopped(StopReason::Aborted));
        }
    }
}

async fn receive_loop(
    mut source: Box<dyn InboundSource>,
    publisher: &Publisher,
    scope: &CancellationToken,
    state: &watch::Sender<LoopState>,
) -> Result<()> {
    let mut guard = StopGuard {
        state,
        finished: false,
    };
    let mut escalated = None;

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            result = source.message() => Some(result),
        };

        let Some(result) = next else {
            tracing::debug!("Finished to receive state with cancellation");
            break StopReason::Cancelled;
        };

        match result {
            Ok(Some(message)) => deliver(publisher, message),
            Ok(None) => {
                tracing::info!("Finished to receive state, stream closed by server");
                break StopReason::EndOfStream;
            }
            Err(status) => match classify_status(Operation::Receive, &status) {
                Outcome::Continue => {
                    tracing::debug!(
                        code = ?status.code(),
                        "Failed to receive state, stream still usable: {}",
                        status.message()
                    );
                }
                Outcome::Cancelled => {
                    tracing::debug!("Finished to receive state, call cancelled");
                    break StopReason::Cancelled;
                }
                Outcome::Recoverable => {
                    tracing::error!(
                        code = ?status.code(),
                        "Failed to receive state, stopping: {}",
                        status.message()
                    );
                    break StopReason::Recoverable(status.code());
                }
                Outcome::FatalUnexpected => {
                    tracing::error!(
                        severity = "fatal",
                        code = ?status.code(),
                        "Unexpected status while receiving state: {}",
                        status.message()
                    );
                    escalated = Some(CreatureError::unexpected(Operation::Receive, &status));
                    break StopReason::Fatal {
                        code: status.code(),
                        message: status.message().to_string(),
                    };
                }
            },
        }
    };

    state.send_replace(LoopState::Draining);
    drop(source);
    state.send_replace(LoopState::Stopped(reason));
    guard.finished = true;

    match escalated {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn deliver(publisher: &Publisher, message: AgentState) {
    let state = InboundState::from(message);
    tracing::info!(
        emotion = state.emotion.as_str_name(),
        motion = state.motion.as_str_name(),
        auxiliary_signal = %state.auxiliary_signal,
        "Received state"
    );
    publisher.publish(&state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Motion;
    use crate::transport::{Channel, Connector, MemoryTransport};
    use crate::{Address, SessionConfig};
    use parking_lot::Mutex;
    use tonic::Status;

    struct Harness {
        transport: MemoryTransport,
        seen: Arc<Mutex<Vec<Motion>>>,
        scope: CancellationToken,
        state: watch::Receiver<LoopState>,
        task: JoinHandle<Result<()>>,
        _channel: Box<dyn Channel>,
        _subscription: crate::publisher::Subscription,
    }

    async fn harness() -> Harness {
        let transport = MemoryTransport::new();
        let address = Address::parse("https://creature.test").unwrap();
        let channel = transport
            .connect(&address, &SessionConfig::default())
            .await
            .unwrap();
        let call = channel.open_call(8).unwrap();

        let publisher = Publisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = publisher.subscribe(move |s| sink.lock().push(s.motion));

        let scope = CancellationToken::new();
        let (state, task) = spawn_receive_loop(call.source, publisher, scope.clone());

        Harness {
            transport,
            seen,
            scope,
            state,
            task,
            _channel: channel,
            _subscription: subscription,
        }
    }

    fn motion(motion: Motion) -> AgentState {
        AgentState {
            motion: motion as i32,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_end_of_stream_stops_cleanly() {
        let mut h = harness().await;
        h.transport.push_state(motion(Motion::Jump));
        h.transport.finish();

        h.task.await.unwrap().unwrap();
        assert_eq!(*h.seen.lock(), vec![Motion::Jump]);
        assert_eq!(
            *h.state.borrow_and_update(),
            LoopState::Stopped(StopReason::EndOfStream)
        );
    }

    #[tokio::test]
    async fn test_continue_codes_keep_running() {
        for code in [Code::Aborted, Code::Internal, Code::Unknown, Code::DataLoss] {
            let h = harness().await;
            h.transport.push_error(Status::new(code, "transient"));
            h.transport.push_state(motion(Motion::Run));
            h.transport.finish();

            h.task.await.unwrap().unwrap();
            assert_eq!(*h.seen.lock(), vec![Motion::Run], "{code:?}");
        }
    }

    #[tokio::test]
    async fn test_recoverable_code_stops_quietly() {
        let h = harness().await;
        h.transport.push_state(motion(Motion::Walk));
        h.transport.push_error(Status::unavailable("connection reset"));
        h.transport.push_state(motion(Motion::Die));

        h.task.await.unwrap().unwrap();
        assert_eq!(*h.seen.lock(), vec![Motion::Walk]);
        assert_eq!(
            *h.state.borrow(),
            LoopState::Stopped(StopReason::Recoverable(Code::Unavailable))
        );
    }

    #[tokio::test]
    async fn test_fatal_code_escalates_without_publishing() {
        let h = harness().await;
        h.transport.push_error(Status::new(Code::Ok, "success as a fault"));
        h.transport.push_state(motion(Motion::Jump));

        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            CreatureError::Unexpected {
                operation: Operation::Receive,
                code: Code::Ok,
                ..
            }
        ));
        assert!(h.seen.lock().is_empty());
        assert!(matches!(
            *h.state.borrow(),
            LoopState::Stopped(StopReason::Fatal { code: Code::Ok, .. })
        ));
    }

    #[tokio::test]
    async fn test_server_cancelled_stops_quietly() {
        let h = harness().await;
        h.transport.push_error(Status::cancelled("server shutting down"));

        h.task.await.unwrap().unwrap();
        assert_eq!(*h.state.borrow(), LoopState::Stopped(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn test_scope_cancellation_while_waiting() {
        let h = harness().await;
        assert!(h.state.borrow().is_running());

        h.scope.cancel();
        h.task.await.unwrap().unwrap();
        assert_eq!(*h.state.borrow(), LoopState::Stopped(StopReason::Cancelled));
    }

    struct PanickingSource;

    #[async_trait::async_trait]
    impl InboundSource for PanickingSource {
        async fn message(&mut self) -> std::result::Result<Option<AgentState>, Status> {
            panic!("source failure");
        }
    }

    #[tokio::test]
    async fn test_unwinding_loop_reports_aborted() {
        let (mut state, task) = spawn_receive_loop(
            Box::new(PanickingSource),
            Publisher::new(),
            CancellationToken::new(),
        );

        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(
            *state.borrow_and_update(),
            LoopState::Stopped(StopReason::Aborted)
        );
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_queued_items() {
        let h = harness().await;
        h.scope.cancel();
        h.transport.push_state(motion(Motion::Flying));

        h.task.await.unwrap().unwrap();
        assert!(h.seen.lock().is_empty());
    }
}
