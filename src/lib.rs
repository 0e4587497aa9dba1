//! # creature-client
//!
//! Rust client for the creature state service.
//!
//! A [`Session`] holds one long-lived bidirectional `Talk` call. Callers
//! push short text stimuli with [`Session::send`]; every state the creature
//! streams back is decoded into an [`InboundState`] and fanned out to
//! subscribers in arrival order.
//!
//! ## Architecture
//!
//! - **Send path**: one writer task owns the request side, so concurrent
//!   sends never interleave on the wire
//! - **Receive path**: one inbound loop per session reads, decodes and
//!   publishes until the stream ends, the session is disposed, or a
//!   status says the stream is no longer usable
//! - **Classification**: every non-OK status is mapped to an [`Outcome`];
//!   only contract-breaking codes ever reach the caller as an error
//!
//! ## Example
//!
//! ```ignore
//! use creature_client::{CancellationToken, OutboundMessage, Session};
//!
//! #[tokio::main]
//! async fn main() -> creature_client::Result<()> {
//!     let session = Session::open("https://127.0.0.1:50051").await?;
//!     let _subscription = session.subscribe(|state| {
//!         println!("{:?} / {:?}", state.emotion, state.motion);
//!     });
//!
//!     session
//!         .send(OutboundMessage::new("Hello!"), &CancellationToken::new())
//!         .await?;
//!
//!     session.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod classify;
pub mod config;
pub mod error;
pub mod protocol;
pub mod publisher;
pub mod transport;

mod receiver;
mod session;
mod writer;

pub use address::Address;
pub use classify::{Operation, Outcome};
pub use config::SessionConfig;
pub use error::{CreatureError, Result};
pub use protocol::{Emotion, InboundState, Motion, OutboundMessage};
pub use publisher::{StateReceiver, Subscription};
pub use receiver::{LoopState, StopReason};
pub use session::{Session, SessionBuilder};

pub use tokio_util::sync::CancellationToken;
