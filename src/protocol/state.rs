//! Domain records exchanged with callers.
//!
//! [`OutboundMessage`] is what a caller hands to `Session::send`;
//! [`InboundState`] is what subscribers receive. Both are plain immutable
//! values converted to and from the wire messages at the session edge.

use std::fmt;

use super::wire::{AgentState, Emotion, Motion, Stimulus};

/// A stimulus to send, created per call to `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    text: String,
    author: Option<String>,
}

impl OutboundMessage {
    /// Stimulus with no author.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            author: None,
        }
    }

    /// Stimulus attributed to `author`.
    pub fn with_author(text: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            author: Some(author.into()),
        }
    }

    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[inline]
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    /// Wire form, filling in `default_author` when none was given.
    pub(crate) fn into_wire(self, default_author: Option<&str>) -> Stimulus {
        Stimulus {
            text: self.text,
            author: self.author.or_else(|| default_author.map(str::to_string)),
        }
    }
}

impl From<&str> for OutboundMessage {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for OutboundMessage {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Decoded state update published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundState {
    pub emotion: Emotion,
    pub motion: Motion,
    pub auxiliary_signal: String,
    pub affinity: Option<f32>,
}

impl From<AgentState> for InboundState {
    fn from(state: AgentState) -> Self {
        if !Emotion::is_valid(state.emotion) {
            tracing::warn!(value = state.emotion, "Unknown emotion on the wire, using neutral");
        }
        if !Motion::is_valid(state.motion) {
            tracing::warn!(value = state.motion, "Unknown motion on the wire, using neutral");
        }

        Self {
            emotion: state.emotion(),
            motion: state.motion(),
            auxiliary_signal: state.auxiliary_signal,
            affinity: state.affinity,
        }
    }
}

impl From<&InboundState> for AgentState {
    fn from(state: &InboundState) -> Self {
        Self {
            emotion: state.emotion.into(),
            motion: state.motion.into(),
            auxiliary_signal: state.auxiliary_signal.clone(),
            affinity: state.affinity,
        }
    }
}

impl fmt::Display for InboundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {:?}",
            self.emotion.as_str_name(),
            self.motion.as_str_name(),
            self.auxiliary_signal
        )?;
        if let Some(affinity) = self.affinity {
            write!(f, ", affinity={affinity}")?;
        }
        Ok(())
    }
}
