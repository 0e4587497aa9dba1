//! Transport module - the seam between a session and the RPC stack.
//!
//! A [`Connector`] dials a [`Channel`]; the channel opens one [`DuplexCall`],
//! whose request side ([`OutboundSink`]) and response side
//! ([`InboundSource`]) are then owned by the writer task and the receive
//! loop respectively. Failures are reported as raw [`tonic::Status`] values
//! and classified by the session, never by the transport.
//!
//! Provides:
//! - [`GrpcConnector`] - tonic over TLS
//! - [`MemoryTransport`] - in-process duplex for tests and demos

mod grpc;
mod memory;

use async_trait::async_trait;
use tonic::Status;

use crate::address::Address;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::protocol::{AgentState, Stimulus};

pub use grpc::GrpcConnector;
pub use memory::MemoryTransport;

/// Dials channels.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel to `address`.
    async fn connect(&self, address: &Address, config: &SessionConfig) -> Result<Box<dyn Channel>>;
}

/// An open channel.
pub trait Channel: Send {
    /// Open the duplex `Talk` call.
    ///
    /// Does not wait for the server; a call that cannot be established
    /// reports its status on the first read.
    fn open_call(&self, request_buffer: usize) -> Result<DuplexCall>;

    /// Release the channel. Called at most once per session.
    fn close(&mut self);
}

/// Request side of a duplex call.
#[async_trait]
pub trait OutboundSink: Send {
    /// Write one message. Must be cancel safe: dropping the future either
    /// leaves the message unsent or fully handed to the transport.
    async fn write(&mut self, message: Stimulus) -> std::result::Result<(), Status>;

    /// Half-close the request side. Called at most once.
    fn close(&mut self);
}

/// Response side of a duplex call.
#[async_trait]
pub trait InboundSource: Send {
    /// Next message, `Ok(None)` at end of stream. Must be cancel safe.
    async fn message(&mut self) -> std::result::Result<Option<AgentState>, Status>;
}

/// Both halves of one open call.
pub struct DuplexCall {
    pub sink: Box<dyn OutboundSink>,
    pub source: Box<dyn InboundSource>,
}
