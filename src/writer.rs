//! Dedicated writer task for the request side of the call.
//!
//! Every write goes through one task that owns the [`OutboundSink`], so
//! writes from concurrent callers can never interleave on the wire.
//! Callers enqueue a request and wait on a oneshot for its result.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<WriteRequest> ─► Writer Task ─► OutboundSink
//! Caller N ─┘           ◄── oneshot result ──┘
//! ```
//!
//! A request whose caller gave up before the writer reached it is skipped,
//! not written.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::protocol::Stimulus;
use crate::transport::OutboundSink;

type WriteResult = std::result::Result<(), Status>;

/// A stimulus waiting for the writer task.
struct WriteRequest {
    message: Stimulus,
    reply: oneshot::Sender<WriteResult>,
}

/// Handle for submitting writes to the writer task.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Write `message` and wait for the transport's verdict.
    ///
    /// Once the writer has stopped this reports `Cancelled`.
    pub async fn write(&self, message: Stimulus) -> WriteResult {
        let (reply, response) = oneshot::channel();

        self.tx
            .send(WriteRequest { message, reply })
            .await
            .map_err(|_| writer_stopped())?;

        response.await.unwrap_or_else(|_| Err(writer_stopped()))
    }

    /// Whether the writer task is still accepting requests.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

fn writer_stopped() -> Status {
    Status::cancelled("writer stopped")
}

/// Spawn the writer task.
///
/// The task runs until `shutdown` fires or every handle is dropped, then
/// closes `sink` exactly once.
pub fn spawn_writer_task(
    sink: Box<dyn OutboundSink>,
    capacity: usize,
    shutdown: CancellationToken,
) -> (WriterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let task = tokio::spawn(writer_loop(rx, sink, shutdown));
    (WriterHandle { tx }, task)
}

async fn writer_loop(
    mut rx: mpsc::Receiver<WriteRequest>,
    mut sink: Box<dyn OutboundSink>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            request = rx.recv() => request,
        };
        let Some(request) = next else { break };

        if request.reply.is_closed() {
            tracing::debug!("Caller gave up before write, skipping stimulus");
            continue;
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(Status::cancelled("session closing")),
            result = sink.write(request.message) => result,
        };

        // Caller may have stopped waiting; the result is dropped then.
        let _ = request.reply.send(result);
    }

    // Pending requests are dropped with their reply senders.
    rx.close();
    drop(rx);
    sink.close();
    tracing::debug!("Writer stopped, request side closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::transport::{Channel, Connector};
    use crate::{Address, SessionConfig};
    use std::time::Duration;

    async fn open(transport: &MemoryTransport) -> (Box<dyn Channel>, Box<dyn OutboundSink>) {
        let address = Address::parse("https://creature.test").unwrap();
        let channel = transport
            .connect(&address, &SessionConfig::default())
            .await
            .unwrap();
        let call = channel.open_call(8).unwrap();
        (channel, call.sink)
    }

    fn stimulus(text: &str) -> Stimulus {
        Stimulus {
            text: text.to_string(),
            author: None,
        }
    }

    #[tokio::test]
    async fn test_writer_handle_write() {
        let transport = MemoryTransport::new();
        let (_channel, sink) = open(&transport).await;
        let (handle, _task) = spawn_writer_task(sink, 8, CancellationToken::new());

        handle.write(stimulus("hello")).await.unwrap();

        let written = transport.written().unwrap();
        assert_eq!(written, vec![stimulus("hello")]);
    }

    #[tokio::test]
    async fn test_write_error_reaches_caller() {
        let transport = MemoryTransport::new();
        let (_channel, sink) = open(&transport).await;
        let (handle, _task) = spawn_writer_task(sink, 8, CancellationToken::new());

        transport.fail_next_write(Status::aborted("retry"));
        let err = handle.write(stimulus("x")).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);

        // The next write is unaffected.
        handle.write(stimulus("y")).await.unwrap();
        assert_eq!(transport.written().unwrap(), vec![stimulus("y")]);
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_interleave() {
        let transport = MemoryTransport::with_chunk_size(1);
        let (_channel, sink) = open(&transport).await;
        let (handle, _task) = spawn_writer_task(sink, 4, CancellationToken::new());

        let mut joins = Vec::new();
        for i in 0..16 {
            let handle = handle.clone();
            joins.push(tokio::spawn(async move {
                handle.write(stimulus(&format!("stimulus number {i}"))).await
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        let mut texts: Vec<String> = transport
            .written()
            .unwrap()
            .into_iter()
            .map(|s| s.text)
            .collect();
        texts.sort();
        let mut expected: Vec<String> = (0..16).map(|i| format!("stimulus number {i}")).collect();
        expected.sort();
        assert_eq!(texts, expected);
        assert_eq!(transport.overlapping_writes(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_mid_frame_leaves_clean_wire() {
        let transport = MemoryTransport::with_chunk_size(1);
        let (_channel, sink) = open(&transport).await;
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_writer_task(sink, 8, shutdown.clone());

        let pending = tokio::spawn(async move { handle.write(stimulus(&"y".repeat(64))).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        shutdown.cancel();
        task.await.unwrap();

        assert!(pending.await.unwrap().is_err());
        assert_eq!(transport.written_len(), 0);
        assert!(transport.written().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_sink_once() {
        let transport = MemoryTransport::new();
        let (_channel, sink) = open(&transport).await;
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_writer_task(sink, 8, shutdown.clone());

        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(transport.call_closes(), 1);
        assert!(!handle.is_open());
        let err = handle.write(stimulus("late")).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_paused_write() {
        let transport = MemoryTransport::new();
        let (_channel, sink) = open(&transport).await;
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_writer_task(sink, 8, shutdown.clone());

        transport.pause_writes();
        let pending = tokio::spawn(async move { handle.write(stimulus("stuck")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown.cancel();
        task.await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.code(), tonic::Code::Cancelled);
        assert_eq!(transport.written_len(), 0);
    }

    #[tokio::test]
    async fn test_writer_stops_when_handles_dropped() {
        let transport = MemoryTransport::new();
        let (_channel, sink) = open(&transport).await;
        let (handle, task) = spawn_writer_task(sink, 8, CancellationToken::new());

        drop(handle);
        task.await.unwrap();
        assert_eq!(transport.call_closes(), 1);
    }
}
