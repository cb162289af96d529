//! Dictation turn state machine
//!
//! One [`DictationSession`] lives per turn: created on trigger (wake word or
//! manual press), destroyed when a transcript is delivered or capture fails
//! terminally. The machine is pure: callers feed it events and it returns
//! effects (arm a timer, stop the engine, conclude the turn) which the
//! coordinator executes. Timers never live here, so every transition is
//! testable without wall-clock waits.

use std::time::Duration;

/// Hard ceiling on a wake-word-triggered capture; guarantees a bounded turn
/// even if no stop request or end-of-speech signal ever arrives
pub const CAPTURE_CEILING: Duration = Duration::from_secs(10);

/// Grace window between a stop signal and actually halting capture, so the
/// engine keeps the user's trailing words
pub const TRAILING_GRACE: Duration = Duration::from_secs(2);

/// Dictation session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictationState {
    /// No capture in progress
    Idle,
    /// Engine is capturing audio
    Capturing,
    /// Stop requested; capture continues through the grace window
    TrailingGrace,
    /// Transcript delivered to the coordinator
    Sent,
    /// Terminal without a transcript
    Done,
}

/// What started the turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTrigger {
    /// The keyword spotter heard the wake phrase
    WakeWord,
    /// Explicit user start (press-and-hold or command)
    Manual,
}

/// An utterance transcript; produced once per session and consumed once
/// by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    /// Transcribed text
    pub text: String,
    /// Whether the wake word triggered the turn
    pub wake_word: bool,
}

/// Terminal result of a dictation session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A usable transcript was produced
    Transcript(Transcript),
    /// No match or empty transcript; ends the turn quietly
    Empty,
    /// Engine failure during active capture; surfaced to the user
    Failed(String),
}

/// Effects the coordinator must execute after feeding the machine an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// Clear prior transcript/response display state
    ClearPreview,
    /// Update the live preview
    Preview(String),
    /// Arm the hard capture ceiling (wake-word turns only)
    ArmCeiling(Duration),
    /// Start the trailing grace timer
    BeginGrace(Duration),
    /// Force the speech engine to stop now
    StopEngine,
    /// Session reached a terminal state
    Conclude(CaptureOutcome),
}

/// Dictation state machine for a single turn
#[derive(Debug)]
pub struct DictationSession {
    state: DictationState,
    trigger: TurnTrigger,
}

impl DictationSession {
    /// Start a session: `Idle -> Capturing`.
    ///
    /// The caller must already hold the Dictation mic grant. Wake-word turns
    /// arm the capture ceiling so the turn is bounded even if the user never
    /// releases input.
    #[must_use]
    pub fn start(trigger: TurnTrigger) -> (Self, Vec<SessionEffect>) {
        let mut effects = vec![SessionEffect::ClearPreview];
        if trigger == TurnTrigger::WakeWord {
            effects.push(SessionEffect::ArmCeiling(CAPTURE_CEILING));
        }
        tracing::debug!(trigger = ?trigger, "dictation capturing");
        (
            Self {
                state: DictationState::Capturing,
                trigger,
            },
            effects,
        )
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> DictationState {
        self.state
    }

    /// What started this turn
    #[must_use]
    pub const fn trigger(&self) -> TurnTrigger {
        self.trigger
    }

    /// Whether the session has reached a terminal state
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.state, DictationState::Sent | DictationState::Done)
    }

    /// Explicit stop request: user release, wake-word auto-stop, or an
    /// equivalent signal. `Capturing -> TrailingGrace`.
    pub fn on_stop_request(&mut self) -> Vec<SessionEffect> {
        match self.state {
            DictationState::Capturing => {
                self.state = DictationState::TrailingGrace;
                tracing::debug!("stop requested, entering trailing grace");
                vec![SessionEffect::BeginGrace(TRAILING_GRACE)]
            }
            _ => Vec::new(),
        }
    }

    /// Capture ceiling expired; behaves exactly as a stop request.
    pub fn on_ceiling_expired(&mut self) -> Vec<SessionEffect> {
        if self.state == DictationState::Capturing {
            tracing::debug!("capture ceiling reached, forcing stop");
        }
        self.on_stop_request()
    }

    /// Engine reported end of speech; behaves as a stop request.
    pub fn on_end_of_speech(&mut self) -> Vec<SessionEffect> {
        self.on_stop_request()
    }

    /// Trailing grace elapsed: force the engine stop that was deferred.
    pub fn on_grace_elapsed(&mut self) -> Vec<SessionEffect> {
        match self.state {
            DictationState::TrailingGrace => vec![SessionEffect::StopEngine],
            _ => Vec::new(),
        }
    }

    /// Partial result from the engine; updates the preview only.
    pub fn on_partial(&mut self, text: String) -> Vec<SessionEffect> {
        match self.state {
            DictationState::Capturing | DictationState::TrailingGrace => {
                vec![SessionEffect::Preview(text)]
            }
            _ => Vec::new(),
        }
    }

    /// Final transcript from the engine. An empty transcript concludes the
    /// turn quietly as an empty result.
    pub fn on_final(&mut self, text: String) -> Vec<SessionEffect> {
        match self.state {
            DictationState::Capturing | DictationState::TrailingGrace => {
                if text.trim().is_empty() {
                    self.state = DictationState::Done;
                    vec![SessionEffect::Conclude(CaptureOutcome::Empty)]
                } else {
                    self.state = DictationState::Sent;
                    let transcript = Transcript {
                        text,
                        wake_word: self.trigger == TurnTrigger::WakeWord,
                    };
                    tracing::info!(text = %transcript.text, "transcript delivered");
                    vec![SessionEffect::Conclude(CaptureOutcome::Transcript(
                        transcript,
                    ))]
                }
            }
            _ => Vec::new(),
        }
    }

    /// Engine heard nothing usable; non-fatal, the turn ends quietly.
    pub fn on_no_match(&mut self) -> Vec<SessionEffect> {
        match self.state {
            DictationState::Capturing | DictationState::TrailingGrace => {
                self.state = DictationState::Done;
                tracing::debug!("no match, ending turn quietly");
                vec![SessionEffect::Conclude(CaptureOutcome::Empty)]
            }
            _ => Vec::new(),
        }
    }

    /// Terminal engine error. During the grace window the error is expected
    /// noise from forcing the stop and is suppressed; during active capture
    /// it surfaces as a capture failure.
    pub fn on_engine_error(&mut self, message: String) -> Vec<SessionEffect> {
        match self.state {
            DictationState::Capturing => {
                self.state = DictationState::Done;
                tracing::warn!(error = %message, "capture failed");
                vec![SessionEffect::Conclude(CaptureOutcome::Failed(message))]
            }
            DictationState::TrailingGrace => {
                self.state = DictationState::Done;
                tracing::debug!(error = %message, "engine error during grace suppressed");
                vec![SessionEffect::Conclude(CaptureOutcome::Empty)]
            }
            _ => Vec::new(),
        }
    }
}
