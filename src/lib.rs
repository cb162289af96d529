//! Vigil - Always-listening voice assistant client
//!
//! This library provides the core functionality for the Vigil client:
//! - Wake phrase spotting over a continuous microphone stream
//! - Dictation capture with end-of-speech detection
//! - Two-phase assistant playback (ack clip, then spoken response)
//! - Liveness supervision so listening survives sleep and task discard
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Microphone                         │
//! │        CaptureHandle (one shared input stream)       │
//! └──────────┬─────────────────────────┬────────────────┘
//!            │ MicArbiter grants       │
//! ┌──────────▼──────────┐   ┌──────────▼────────────────┐
//! │   KeywordSpotter    │   │     HttpSpeechEngine      │
//! │  (wake phrase)      │   │  (dictation + endpointing)│
//! └──────────┬──────────┘   └──────────┬────────────────┘
//!            │ EngineEvent             │ EngineEvent
//! ┌──────────▼─────────────────────────▼────────────────┐
//! │               SessionCoordinator                     │
//! │  turn lifecycle │ timers │ remote calls │ playback   │
//! └──────────┬──────────────────────────────────────────┘
//!            │
//! ┌──────────▼──────────┐   ┌───────────────────────────┐
//! │  PlaybackSequencer  │   │    LivenessSupervisor     │
//! │  (ack → response)   │   │  (lease + revival timer)  │
//! └─────────────────────┘   └───────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod coordinator;
pub mod dictation;
pub mod error;
pub mod events;
pub mod mic;
pub mod playback;
pub mod registry;
pub mod remote;
pub mod speech;
pub mod spotter;
pub mod supervisor;

pub use config::Config;
pub use coordinator::{CoordinatorCommand, CoordinatorHandle, SessionCoordinator};
pub use dictation::{CaptureOutcome, DictationSession, SessionEffect, Transcript, TurnTrigger};
pub use error::{Error, Result};
pub use events::{EngineEvent, SessionEvent, TurnEnding};
pub use mic::{Acquisition, MicArbiter, MicConsumer, MicOwner};
pub use playback::{AudioClip, AudioSink, ClipKind, PlaybackSequencer};
pub use remote::{AssistantReply, HttpVoiceClient, VoiceBackend};
pub use speech::{HttpSpeechEngine, SpeechEngine, Transcriber};
pub use spotter::{KeywordSpotter, SpotterControl, WakeVerifier};
pub use supervisor::{LivenessSupervisor, SleepInhibitor};
