//! tonic implementation of the transport seam.
//!
//! The request side is an mpsc channel turned into the request stream of a
//! bidi-streaming call. The call future itself is parked inside the
//! [`GrpcSource`] and driven by the first read, so opening a call never
//! blocks on the server sending response headers.
//!
//! # Example
//!
//! ```ignore
//! use creature_client::transport::GrpcConnector;
//! use creature_client::Session;
//!
//! let session = Session::builder("https://127.0.0.1:50051")
//!     .connector(GrpcConnector)
//!     .open()
//!     .await?;
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint};
use tonic::{Request, Status};

use super::{Channel, Connector, DuplexCall, InboundSource, OutboundSink};
use crate::address::Address;
use crate::config::SessionConfig;
use crate::error::{CreatureError, Result};
use crate::protocol::{AgentState, Stimulus, TALK_PATH};

/// Dials TLS channels with tonic.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcConnector;

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, address: &Address, config: &SessionConfig) -> Result<Box<dyn Channel>> {
        let domain = config
            .domain_name
            .clone()
            .unwrap_or_else(|| address.host().to_string());

        let tls = ClientTlsConfig::new().domain_name(domain);
        let tls = match &config.ca_certificate {
            Some(path) => {
                let pem = tokio::fs::read(path).await?;
                tls.ca_certificate(Certificate::from_pem(pem))
            }
            None => tls.with_native_roots(),
        };

        let mut endpoint = Endpoint::from_shared(address.as_str().to_string())?
            .tls_config(tls)?
            .connect_timeout(config.connect_timeout());

        if let Some(keepalive) = config.tcp_keepalive() {
            endpoint = endpoint.tcp_keepalive(Some(keepalive));
        }
        if let Some(interval) = config.http2_keepalive_interval() {
            endpoint = endpoint
                .http2_keep_alive_interval(interval)
                .keep_alive_while_idle(true);
        }

        let channel = if config.lazy_connect {
            tracing::debug!(%address, "Creating lazy channel");
            endpoint.connect_lazy()
        } else {
            endpoint.connect().await?
        };

        Ok(Box::new(GrpcChannel {
            channel: Some(channel),
        }))
    }
}

struct GrpcChannel {
    channel: Option<tonic::transport::Channel>,
}

impl Channel for GrpcChannel {
    fn open_call(&self, request_buffer: usize) -> Result<DuplexCall> {
        let channel = self.channel.clone().ok_or(CreatureError::ConnectionClosed)?;

        let (tx, rx) = mpsc::channel::<Stimulus>(request_buffer);
        let requests = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });

        let call = async move {
            let mut grpc = Grpc::new(channel);
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("Service was not ready: {}", e)))?;

            let codec: ProstCodec<Stimulus, AgentState> = ProstCodec::default();
            let response = grpc
                .streaming(
                    Request::new(requests),
                    PathAndQuery::from_static(TALK_PATH),
                    codec,
                )
                .await?;
            Ok::<_, Status>(response.into_inner())
        };

        Ok(DuplexCall {
            sink: Box::new(GrpcSink { tx: Some(tx) }),
            source: Box::new(GrpcSource {
                state: CallState::Pending(Box::pin(call)),
            }),
        })
    }

    fn close(&mut self) {
        self.channel.take();
    }
}

struct GrpcSink {
    tx: Option<mpsc::Sender<Stimulus>>,
}

#[async_trait]
impl OutboundSink for GrpcSink {
    async fn write(&mut self, message: Stimulus) -> std::result::Result<(), Status> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Status::unavailable("request stream closed"))?;
        tx.send(message)
            .await
            .map_err(|_| Status::unavailable("request stream closed"))
    }

    fn close(&mut self) {
        // Dropping the sender ends the request stream.
        self.tx.take();
    }
}

enum CallState {
    Pending(BoxFuture<'static, std::result::Result<Streaming<AgentState>, Status>>),
    Open(Streaming<AgentState>),
    Done,
}

struct GrpcSource {
    state: CallState,
}

#[async_trait]
impl InboundSource for GrpcSource {
    async fn message(&mut self) -> std::result::Result<Option<AgentState>, Status> {
        loop {
            match &mut self.state {
                CallState::Pending(call) => {
                    let opened = call.as_mut().await;
                    match opened {
                        Ok(stream) => self.state = CallState::Open(stream),
                        Err(status) => {
                            self.state = CallState::Done;
                            return Err(status);
                        }
                    }
                }
                CallState::Open(stream) => return stream.message().await,
                CallState::Done => return Ok(None),
            }
        }
    }
}
