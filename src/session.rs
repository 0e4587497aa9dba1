//! Session builder and lifecycle.
//!
//! The [`SessionBuilder`] provides a fluent API for configuring the channel
//! and opening a session. The [`Session`] manages the lifecycle:
//! 1. Validate the address (no network activity before this succeeds)
//! 2. Open the channel
//! 3. Open the duplex call
//! 4. Spawn the writer task and the inbound loop
//!
//! # Example
//!
//! ```ignore
//! use creature_client::{OutboundMessage, Session};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> creature_client::Result<()> {
//!     let session = Session::builder("https://127.0.0.1:50051")
//!         .default_author("Mochineko")
//!         .open()
//!         .await?;
//!
//!     let _subscription = session.subscribe(|state| println!("{state}"));
//!
//!     session
//!         .send(OutboundMessage::new("Good morning!"), &CancellationToken::new())
//!         .await?;
//!
//!     session.dispose().await;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Code;

use crate::address::Address;
use crate::classify::{classify_status, Operation, Outcome};
use crate::config::SessionConfig;
use crate::error::{CreatureError, Result};
use crate::protocol::{InboundState, OutboundMessage};
use crate::publisher::{Publisher, StateReceiver, Subscription};
use crate::receiver::{spawn_receive_loop, LoopState, StopReason};
use crate::transport::{Channel, Connector, GrpcConnector};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Builder for configuring and opening a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
}

impl SessionBuilder {
    /// Create a builder for `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self::from_config(SessionConfig::new(address))
    }

    /// Start from an existing configuration.
    pub fn from_config(config: SessionConfig) -> Self {
        Self {
            config,
            connector: None,
        }
    }

    /// Use a custom connector instead of [`GrpcConnector`].
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Set the dial timeout.
    ///
    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = millis(timeout);
        self
    }

    /// Enable TCP keepalive on the channel socket.
    ///
    /// Default: off
    pub fn tcp_keepalive(mut self, keepalive: Duration) -> Self {
        self.config.tcp_keepalive_ms = Some(millis(keepalive));
        self
    }

    /// Send HTTP/2 keepalive pings at this interval, also while idle.
    ///
    /// Default: off
    pub fn http2_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.http2_keepalive_interval_ms = Some(millis(interval));
        self
    }

    /// Trust the CA in this PEM file instead of the native roots.
    pub fn ca_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_certificate = Some(path.into());
        self
    }

    /// Override the TLS server name.
    pub fn domain_name(mut self, domain: impl Into<String>) -> Self {
        self.config.domain_name = Some(domain.into());
        self
    }

    /// Create the channel without dialing.
    ///
    /// Default: false
    pub fn lazy_connect(mut self, lazy: bool) -> Self {
        self.config.lazy_connect = lazy;
        self
    }

    /// Capacity of the outbound write queue.
    ///
    /// Default: 64
    pub fn request_buffer(mut self, capacity: usize) -> Self {
        self.config.request_buffer = capacity;
        self
    }

    /// Author attached to stimuli that carry none.
    pub fn default_author(mut self, author: impl Into<String>) -> Self {
        self.config.default_author = Some(author.into());
        self
    }

    /// Validate, connect and start the session.
    ///
    /// # Errors
    ///
    /// [`CreatureError::InvalidAddress`] before any network activity if the
    /// address is unusable; [`CreatureError::Config`] for out-of-range
    /// settings; transport errors if the channel cannot be dialed.
    pub async fn open(self) -> Result<Session> {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(GrpcConnector));
        Session::start(self.config, connector).await
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Resources released by [`Session::dispose`], each exactly once.
struct Resources {
    receive_task: Option<JoinHandle<Result<()>>>,
    writer_task: Option<JoinHandle<()>>,
    channel: Option<Box<dyn Channel>>,
}

/// An open duplex session with the creature service.
///
/// Use `send()` to push stimuli and `subscribe()` to observe states.
/// Call `dispose()` when done; dropping the session only cancels it.
pub struct Session {
    address: Address,
    default_author: Option<String>,
    /// Cancellation scope shared by the inbound loop and every send.
    scope: CancellationToken,
    writer: WriterHandle,
    writer_shutdown: CancellationToken,
    publisher: Arc<Publisher>,
    loop_state: watch::Receiver<LoopState>,
    resources: Mutex<Resources>,
    disposed: AtomicBool,
}

impl Session {
    /// Create a session builder.
    pub fn builder(address: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(address)
    }

    /// Open a session to `address` with default settings.
    pub async fn open(address: impl Into<String>) -> Result<Self> {
        SessionBuilder::new(address).open().await
    }

    /// Open a session from a configuration.
    pub async fn from_config(config: SessionConfig) -> Result<Self> {
        SessionBuilder::from_config(config).open().await
    }

    async fn start(config: SessionConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        // 1. Local validation
        let address = Address::parse(&config.address).map_err(|e| {
            tracing::error!("{}", e);
            e
        })?;
        config.validate()?;

        tracing::info!(%address, "Begin to connect");

        // 2. Channel
        let mut channel = connector.connect(&address, &config).await?;

        // 3. Duplex call
        let call = match channel.open_call(config.request_buffer) {
            Ok(call) => call,
            Err(e) => {
                channel.close();
                return Err(e);
            }
        };

        // 4. Writer task and inbound loop
        let writer_shutdown = CancellationToken::new();
        let (writer, writer_task) =
            spawn_writer_task(call.sink, config.request_buffer, writer_shutdown.clone());

        let scope = CancellationToken::new();
        let publisher = Publisher::new();
        let (loop_state, receive_task) =
            spawn_receive_loop(call.source, publisher.clone(), scope.clone());

        tracing::info!(%address, "Succeeded to connect");

        Ok(Self {
            address,
            default_author: config.default_author,
            scope,
            writer,
            writer_shutdown,
            publisher,
            loop_state,
            resources: Mutex::new(Resources {
                receive_task: Some(receive_task),
                writer_task: Some(writer_task),
                channel: Some(channel),
            }),
            disposed: AtomicBool::new(false),
        })
    }

    /// Write one stimulus onto the call.
    ///
    /// Makes exactly one write attempt. Returns `Ok(())` if the write landed,
    /// if `cancel` or the session fired first, or if the transport reported
    /// a cancelled or transient status; the caller may retry with a new
    /// `send`.
    ///
    /// # Errors
    ///
    /// [`CreatureError::Unexpected`] if the transport reported a status the
    /// protocol rules out for writes.
    pub async fn send(&self, message: OutboundMessage, cancel: &CancellationToken) -> Result<()> {
        if self.is_disposed() || self.scope.is_cancelled() {
            tracing::debug!("Session closed, dropping stimulus");
            return Ok(());
        }
        if cancel.is_cancelled() {
            tracing::debug!("Send cancelled before write");
            return Ok(());
        }

        let stimulus = message.into_wire(self.default_author.as_deref());
        tracing::debug!(text = %stimulus.text, "Begin to send stimulus");

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = self.scope.cancelled() => None,
            result = self.writer.write(stimulus) => Some(result),
        };

        let status = match written {
            None => {
                tracing::debug!("Send cancelled during write");
                return Ok(());
            }
            Some(Ok(())) => {
                tracing::debug!("Finished to send stimulus");
                return Ok(());
            }
            Some(Err(status)) => status,
        };

        // A write racing teardown sees a closed request side.
        let outcome = if status.code() == Code::Unavailable && self.scope.is_cancelled() {
            Outcome::Cancelled
        } else {
            classify_status(Operation::Send, &status)
        };

        match outcome {
            Outcome::Cancelled => {
                tracing::debug!("Send cancelled: {}", status.message());
                Ok(())
            }
            Outcome::Continue | Outcome::Recoverable => {
                tracing::error!(
                    code = ?status.code(),
                    "Failed to send stimulus: {}",
                    status.message()
                );
                Ok(())
            }
            Outcome::FatalUnexpected => {
                tracing::error!(
                    severity = "fatal",
                    code = ?status.code(),
                    "Unexpected status while sending stimulus: {}",
                    status.message()
                );
                Err(CreatureError::unexpected(Operation::Send, &status))
            }
        }
    }

    /// Send `text` with no caller cancellation.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(OutboundMessage::new(text), &CancellationToken::new())
            .await
    }

    /// Register an observer for every state received from now on.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&InboundState) + Send + Sync + 'static,
    {
        self.publisher.subscribe(observer)
    }

    /// Receive states through an async channel instead of a callback.
    pub fn subscribe_channel(&self) -> StateReceiver {
        self.publisher.subscribe_channel()
    }

    /// Current inbound loop state.
    pub fn loop_state(&self) -> LoopState {
        self.loop_state.borrow().clone()
    }

    /// Wait for the inbound loop to stop.
    ///
    /// # Errors
    ///
    /// [`CreatureError::Unexpected`] if the loop stopped on a status the
    /// protocol rules out; [`CreatureError::LoopAborted`] if the loop task
    /// died without reaching its own exit.
    pub async fn stopped(&self) -> Result<()> {
        let mut state = self.loop_state.clone();
        let observed = state
            .wait_for(LoopState::is_stopped)
            .await
            .map(|s| s.clone())
            .ok();
        let last = observed.unwrap_or_else(|| state.borrow().clone());

        match last {
            LoopState::Stopped(StopReason::Fatal { code, message }) => {
                Err(CreatureError::Unexpected {
                    operation: Operation::Receive,
                    code,
                    message,
                })
            }
            LoopState::Stopped(StopReason::Aborted) => Err(CreatureError::LoopAborted),
            LoopState::Stopped(_) => Ok(()),
            // Sender gone without a terminal state.
            LoopState::Running | LoopState::Draining => Err(CreatureError::LoopAborted),
        }
    }

    /// Endpoint this session is bound to.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Tear the session down.
    ///
    /// In order: cancel and await the inbound loop, release subscriber
    /// registrations, close the call, close the channel. Calling it again
    /// is a no-op.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(address = %self.address, "Disposing session");

        let (receive_task, writer_task, channel) = {
            let mut resources = self.resources.lock();
            (
                resources.receive_task.take(),
                resources.writer_task.take(),
                resources.channel.take(),
            )
        };

        // 1. Inbound loop
        self.scope.cancel();
        if let Some(task) = receive_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(severity = "fatal", "Inbound loop had escalated: {}", e)
                }
                Err(e) => tracing::error!("Inbound loop panicked: {}", e),
            }
        }

        // 2. Subscriber registrations
        self.publisher.clear();

        // 3. Duplex call
        self.writer_shutdown.cancel();
        if let Some(task) = writer_task {
            if let Err(e) = task.await {
                tracing::error!("Writer task panicked: {}", e);
            }
        }

        // 4. Channel
        if let Some(mut channel) = channel {
            channel.close();
        }

        tracing::info!(address = %self.address, "Session disposed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_disposed() {
            // Tasks observe these and exit on their own.
            self.scope.cancel();
            self.writer_shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("loop_state", &*self.loop_state.borrow())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
