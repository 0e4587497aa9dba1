//! Protocol module - wire messages and the domain records built from them.
//!
//! - [`wire`] - prost messages for the `Talk` duplex call
//! - [`OutboundMessage`] / [`InboundState`] - what callers and subscribers see

pub mod wire;

mod state;

pub use state::{InboundState, OutboundMessage};
pub use wire::{AgentState, Emotion, Motion, Stimulus, TALK_PATH};
