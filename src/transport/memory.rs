//! In-process transport.
//!
//! [`MemoryTransport`] is both the connector handed to a session and the
//! "server" side a test drives. Inbound results are scripted with
//! [`MemoryTransport::push_state`], [`MemoryTransport::push_error`] and
//! [`MemoryTransport::finish`]. Outbound writes are encoded as
//! length-delimited protobuf and staged a few bytes at a time with a yield
//! in between. A frame reaches the shared buffer in one step once staging
//! completes, so a write dropped partway leaves nothing behind. Writes that
//! overlap in time are counted by [`MemoryTransport::overlapping_writes`].
//!
//! # Example
//!
//! ```ignore
//! let transport = MemoryTransport::new();
//! let session = Session::builder("https://creature.test")
//!     .connector(transport.clone())
//!     .open()
//!     .await?;
//!
//! transport.push_state(AgentState { motion: Motion::Jump as i32, ..Default::default() });
//! transport.finish();
//! session.stopped().await?;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::{mpsc, watch};
use tonic::Status;

use super::{Channel, Connector, DuplexCall, InboundSource, OutboundSink};
use crate::address::Address;
use crate::config::SessionConfig;
use crate::error::{CreatureError, Result};
use crate::protocol::{AgentState, Stimulus};

/// Bytes appended per step when writing a frame.
pub const DEFAULT_CHUNK_SIZE: usize = 3;

enum Inbound {
    State(AgentState),
    Error(Status),
}

struct Shared {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    wire: Mutex<BytesMut>,
    write_failures: Mutex<VecDeque<Status>>,
    paused: watch::Sender<bool>,
    chunk_size: usize,
    in_flight: AtomicBool,
    overlapping_writes: AtomicUsize,
    abandoned_writes: AtomicUsize,
    connects: AtomicUsize,
    calls_opened: AtomicUsize,
    call_closes: AtomicUsize,
    channel_closes: AtomicUsize,
}

/// Scriptable in-process duplex transport.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Write frames `chunk_size` bytes at a time.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                inbound_tx: Mutex::new(Some(tx)),
                inbound_rx: Mutex::new(Some(rx)),
                wire: Mutex::new(BytesMut::new()),
                write_failures: Mutex::new(VecDeque::new()),
                paused,
                chunk_size: chunk_size.max(1),
                in_flight: AtomicBool::new(false),
                overlapping_writes: AtomicUsize::new(0),
                abandoned_writes: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                calls_opened: AtomicUsize::new(0),
                call_closes: AtomicUsize::new(0),
                channel_closes: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue a successful read. Returns false after [`MemoryTransport::finish`].
    pub fn push_state(&self, state: AgentState) -> bool {
        self.push(Inbound::State(state))
    }

    /// Queue a failed read.
    pub fn push_error(&self, status: Status) -> bool {
        self.push(Inbound::Error(status))
    }

    /// End the response stream after everything already queued.
    pub fn finish(&self) {
        self.shared.inbound_tx.lock().take();
    }

    /// Fail the next write with `status` instead of writing.
    pub fn fail_next_write(&self, status: Status) {
        self.shared.write_failures.lock().push_back(status);
    }

    /// Block writes until [`MemoryTransport::resume_writes`].
    pub fn pause_writes(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.shared.paused.send_replace(false);
    }

    /// Decode every frame written so far.
    ///
    /// # Errors
    ///
    /// Fails if the buffer does not hold a clean sequence of frames.
    pub fn written(&self) -> std::result::Result<Vec<Stimulus>, prost::DecodeError> {
        let mut buf = self.shared.wire.lock().clone().freeze();
        let mut messages = Vec::new();
        while buf.has_remaining() {
            messages.push(Stimulus::decode_length_delimited(&mut buf)?);
        }
        Ok(messages)
    }

    /// Raw bytes written so far.
    pub fn written_len(&self) -> usize {
        self.shared.wire.lock().len()
    }

    /// Writes that started while another write was still staging.
    pub fn overlapping_writes(&self) -> usize {
        self.shared.overlapping_writes.load(Ordering::Acquire)
    }

    /// Writes dropped before their frame was committed.
    pub fn abandoned_writes(&self) -> usize {
        self.shared.abandoned_writes.load(Ordering::Acquire)
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::Acquire)
    }

    pub fn calls_opened(&self) -> usize {
        self.shared.calls_opened.load(Ordering::Acquire)
    }

    pub fn call_closes(&self) -> usize {
        self.shared.call_closes.load(Ordering::Acquire)
    }

    pub fn channel_closes(&self) -> usize {
        self.shared.channel_closes.load(Ordering::Acquire)
    }

    fn push(&self, inbound: Inbound) -> bool {
        match self.shared.inbound_tx.lock().as_ref() {
            Some(tx) => tx.send(inbound).is_ok(),
            None => false,
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryTransport {
    async fn connect(&self, address: &Address, _config: &SessionConfig) -> Result<Box<dyn Channel>> {
        self.shared.connects.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(%address, "Opened in-memory channel");
        Ok(Box::new(MemoryChannel {
            shared: self.shared.clone(),
            closed: false,
        }))
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    closed: bool,
}

impl Channel for MemoryChannel {
    fn open_call(&self, _request_buffer: usize) -> Result<DuplexCall> {
        if self.closed {
            return Err(CreatureError::ConnectionClosed);
        }
        // One response stream per transport.
        let rx = self
            .shared
            .inbound_rx
            .lock()
            .take()
            .ok_or(CreatureError::ConnectionClosed)?;
        self.shared.calls_opened.fetch_add(1, Ordering::AcqRel);

        Ok(DuplexCall {
            sink: Box::new(MemorySink {
                shared: self.shared.clone(),
                paused: self.shared.paused.subscribe(),
                closed: false,
            }),
            source: Box::new(MemorySource { rx }),
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.channel_closes.fetch_add(1, Ordering::AcqRel);
        }
    }
}

struct MemorySink {
    shared: Arc<Shared>,
    paused: watch::Receiver<bool>,
    closed: bool,
}

#[async_trait]
impl OutboundSink for MemorySink {
    async fn write(&mut self, message: Stimulus) -> std::result::Result<(), Status> {
        if self.closed {
            return Err(Status::unavailable("request stream closed"));
        }

        let resumed = self.paused.wait_for(|paused| !*paused).await.is_ok();
        if !resumed {
            return Err(Status::unavailable("transport dropped"));
        }

        let failure = self.shared.write_failures.lock().pop_front();
        if let Some(status) = failure {
            return Err(status);
        }

        let mut staging = InFlight::begin(&self.shared);
        let frame = message.encode_length_delimited_to_vec();
        for chunk in frame.chunks(self.shared.chunk_size) {
            staging.buf.extend_from_slice(chunk);
            tokio::task::yield_now().await;
        }
        staging.commit();
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.call_closes.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// One write between its first staged byte and its commit.
struct InFlight<'a> {
    shared: &'a Shared,
    buf: BytesMut,
    committed: bool,
}

impl<'a> InFlight<'a> {
    fn begin(shared: &'a Shared) -> Self {
        if shared.in_flight.swap(true, Ordering::AcqRel) {
            shared.overlapping_writes.fetch_add(1, Ordering::AcqRel);
        }
        Self {
            shared,
            buf: BytesMut::new(),
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.shared.wire.lock().extend_from_slice(&self.buf);
        self.committed = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.abandoned_writes.fetch_add(1, Ordering::AcqRel);
        }
        self.shared.in_flight.store(false, Ordering::Release);
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl InboundSource for MemorySource {
    async fn message(&mut self) -> std::result::Result<Option<AgentState>, Status> {
        match self.rx.recv().await {
            Some(Inbound::State(state)) => Ok(Some(state)),
            Some(Inbound::Error(status)) => Err(status),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> Address {
        Address::parse("https://creature.test").unwrap()
    }

    #[tokio::test]
    async fn test_scripted_reads() {
        let transport = MemoryTransport::new();
        let channel = transport
            .connect(&address(), &SessionConfig::default())
            .await
            .unwrap();
        let mut call = channel.open_call(8).unwrap();

        transport.push_state(AgentState::default());
        transport.push_error(Status::internal("hiccup"));
        transport.finish();
        assert!(!transport.push_state(AgentState::default()));

        assert!(matches!(call.source.message().await, Ok(Some(_))));
        let err = call.source.message().await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(matches!(call.source.message().await, Ok(None)));
    }

    #[tokio::test]
    async fn test_writes_decode_from_wire() {
        let transport = MemoryTransport::new();
        let channel = transport
            .connect(&address(), &SessionConfig::default())
            .await
            .unwrap();
        let mut call = channel.open_call(8).unwrap();

        for text in ["one", "two"] {
            call.sink
                .write(Stimulus {
                    text: text.to_string(),
                    author: None,
                })
                .await
                .unwrap();
        }

        let written = transport.written().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].text, "two");
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let transport = MemoryTransport::new();
        let channel = transport
            .connect(&address(), &SessionConfig::default())
            .await
            .unwrap();
        let mut call = channel.open_call(8).unwrap();

        transport.fail_next_write(Status::unavailable("down"));
        let err = call.sink.write(Stimulus::default()).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
        assert_eq!(transport.written_len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_write_leaves_no_partial_frame() {
        let transport = MemoryTransport::with_chunk_size(1);
        let channel = transport
            .connect(&address(), &SessionConfig::default())
            .await
            .unwrap();
        let mut call = channel.open_call(8).unwrap();

        let long = Stimulus {
            text: "x".repeat(64),
            author: None,
        };
        tokio::select! {
            _ = call.sink.write(long) => panic!("write should not finish first"),
            _ = async {
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }
            } => {}
        }

        assert_eq!(transport.written_len(), 0);
        assert_eq!(transport.abandoned_writes(), 1);

        call.sink.write(Stimulus::default()).await.unwrap();
        assert_eq!(transport.written().unwrap(), vec![Stimulus::default()]);
        assert_eq!(transport.overlapping_writes(), 0);
    }

    #[tokio::test]
    async fn test_close_counts_once() {
        let transport = MemoryTransport::new();
        let mut channel = transport
            .connect(&address(), &SessionConfig::default())
            .await
            .unwrap();
        let mut call = channel.open_call(8).unwrap();

        call.sink.close();
        call.sink.close();
        channel.close();
        channel.close();

        assert_eq!(transport.call_closes(), 1);
        assert_eq!(transport.channel_closes(), 1);
        assert!(call.sink.write(Stimulus::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_single_call_per_transport() {
        let transport = MemoryTransport::new();
        let channel = transport
            .connect(&address(), &SessionConfig::default())
            .await
            .unwrap();
        let _call = channel.open_call(8).unwrap();
        assert!(matches!(
            channel.open_call(8),
            Err(CreatureError::ConnectionClosed)
        ));
    }
}
