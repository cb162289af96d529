//! Event types flowing through the coordinator
//!
//! Engine adapters (keyword spotter, speech engine) emit [`EngineEvent`]s
//! onto a single coordinator-owned channel, preserving per-engine ordering
//! while the engines themselves run concurrently. [`SessionEvent`]s are
//! broadcast outward for UI subscribers and carry no control-flow weight.

use serde::{Deserialize, Serialize};

/// Events emitted by engine adapters onto the coordinator channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Wake phrase heard by the keyword spotter
    WakeTriggered,

    /// Partial transcription from the speech engine; preview only,
    /// never a state transition
    Partial(String),

    /// Speech engine's own silence detector reports end of utterance
    EndOfSpeech,

    /// Final transcript delivered by the speech engine
    Final(String),

    /// Engine heard audio but produced no usable transcript; non-fatal
    NoMatch,

    /// Terminal engine error during capture
    CaptureFailed(String),
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TurnEnding {
    /// Reply received and playback finished
    Completed,
    /// No transcript was produced; the turn ended quietly
    Empty,
    /// The turn failed; message is user-facing
    Failed {
        /// User-facing failure description
        message: String,
    },
}

/// Events broadcast to UI subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A dictation turn began
    TurnStarted {
        /// Whether the wake word triggered this turn
        wake_word: bool,
    },

    /// Live transcription preview updated
    Preview {
        /// Partial transcript text
        text: String,
    },

    /// Acknowledgment finished playing with no response queued yet;
    /// transient status, no effect on playback invariants
    Thinking,

    /// Assistant reply text available
    Reply {
        /// Reply text from the assistant
        text: String,
    },

    /// The turn ended
    TurnEnded {
        /// Outcome summary
        ending: TurnEnding,
    },
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TurnStarted { wake_word } => write!(f, "turn started (wake_word={wake_word})"),
            Self::Preview { text } => write!(f, "preview: {text}"),
            Self::Thinking => write!(f, "thinking"),
            Self::Reply { text } => write!(f, "reply: {text}"),
            Self::TurnEnded { ending } => write!(f, "turn ended: {ending:?}"),
        }
    }
}
