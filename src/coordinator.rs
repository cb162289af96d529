//! Session coordination
//!
//! The coordinator wires trigger → mic handoff → dictation → remote call →
//! playback → mic handoff back. Engine adapters feed one event channel;
//! commands arrive from the UI through a [`CoordinatorHandle`]. All timers
//! (capture ceiling, trailing grace, settle delay) live here as cancelable
//! deadlines so a new turn never races a stale timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::config::Config;
use crate::dictation::{CaptureOutcome, DictationSession, SessionEffect, TurnTrigger};
use crate::events::{EngineEvent, SessionEvent, TurnEnding};
use crate::mic::{MicArbiter, MicOwner};
use crate::playback::PlaybackSequencer;
use crate::remote::VoiceBackend;
use crate::speech::SpeechEngine;
use crate::spotter::SpotterControl;
use crate::supervisor::LivenessSupervisor;
use crate::{Error, Result};

/// Delay between releasing the dictation grant and restoring the keyword
/// spotter, letting the hardware device fully release between owners
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Command queue depth
const COMMAND_BUFFER: usize = 16;

/// Engine event queue depth
const EVENT_BUFFER: usize = 64;

/// Session event fanout capacity
const SESSION_EVENT_CAPACITY: usize = 32;

/// Commands accepted by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorCommand {
    /// Start a manual (non-wake-word) dictation turn
    ManualStart,
    /// User released input; stop capturing
    ManualStop,
    /// The hosting task was discarded by the user
    TaskDiscarded,
    /// Stop everything deliberately
    Shutdown,
}

/// Clonable handle to a running coordinator; looked up through the
/// [`crate::registry::HandleRegistry`] rather than ambient global state
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<CoordinatorCommand>,
    session_events: broadcast::Sender<SessionEvent>,
}

impl CoordinatorHandle {
    pub(crate) fn from_parts(
        commands: mpsc::Sender<CoordinatorCommand>,
        session_events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            commands,
            session_events,
        }
    }

    /// Start a manual dictation turn
    pub async fn manual_start(&self) {
        let _ = self.commands.send(CoordinatorCommand::ManualStart).await;
    }

    /// Stop the active capture (user release)
    pub async fn manual_stop(&self) {
        let _ = self.commands.send(CoordinatorCommand::ManualStop).await;
    }

    /// Report that the hosting task was discarded
    pub async fn task_discarded(&self) {
        let _ = self.commands.send(CoordinatorCommand::TaskDiscarded).await;
    }

    /// Shut the coordinator down deliberately
    pub async fn shutdown(&self) {
        let _ = self.commands.send(CoordinatorCommand::Shutdown).await;
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events.subscribe()
    }
}

enum Phase {
    Idle,
    Capture(DictationSession),
    Remote,
    Settle,
}

struct Core {
    config: Config,
    arbiter: Arc<MicArbiter>,
    spotter: Arc<dyn SpotterControl>,
    engine: Arc<dyn SpeechEngine>,
    backend: Arc<dyn VoiceBackend>,
    sequencer: PlaybackSequencer,
    supervisor: LivenessSupervisor,
    session_events: broadcast::Sender<SessionEvent>,
    turn_done_tx: mpsc::Sender<TurnEnding>,
    phase: Phase,
    ceiling_at: Option<Instant>,
    grace_at: Option<Instant>,
    settle_at: Option<Instant>,
}

/// Top-level orchestrator of the voice session lifecycle
pub struct SessionCoordinator {
    core: Core,
    commands_rx: mpsc::Receiver<CoordinatorCommand>,
    events_rx: mpsc::Receiver<EngineEvent>,
    turn_done_rx: mpsc::Receiver<TurnEnding>,
}

impl SessionCoordinator {
    /// Create a coordinator over its collaborators. `events_rx` is the
    /// single channel all engine adapters emit onto.
    #[must_use]
    pub fn new(
        config: Config,
        arbiter: Arc<MicArbiter>,
        spotter: Arc<dyn SpotterControl>,
        engine: Arc<dyn SpeechEngine>,
        backend: Arc<dyn VoiceBackend>,
        sequencer: PlaybackSequencer,
        supervisor: LivenessSupervisor,
        events_rx: mpsc::Receiver<EngineEvent>,
    ) -> (Self, CoordinatorHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (session_events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let (turn_done_tx, turn_done_rx) = mpsc::channel(1);

        let handle = CoordinatorHandle {
            commands: commands_tx,
            session_events: session_events.clone(),
        };

        let core = Core {
            config,
            arbiter,
            spotter,
            engine,
            backend,
            sequencer,
            supervisor,
            session_events,
            turn_done_tx,
            phase: Phase::Idle,
            ceiling_at: None,
            grace_at: None,
            settle_at: None,
        };

        (
            Self {
                core,
                commands_rx,
                events_rx,
                turn_done_rx,
            },
            handle,
        )
    }

    /// Create the engine event channel for adapters
    #[must_use]
    pub fn event_channel() -> (mpsc::Sender<EngineEvent>, mpsc::Receiver<EngineEvent>) {
        mpsc::channel(EVENT_BUFFER)
    }

    /// Run the coordination loop until shutdown.
    ///
    /// # Errors
    ///
    /// Returns error if the keyword spotter cannot start initially; later
    /// spotter failures are handled by the liveness supervisor.
    pub async fn run(self) -> Result<()> {
        let Self {
            mut core,
            mut commands_rx,
            mut events_rx,
            mut turn_done_rx,
        } = self;

        if core.config.wake_word_enabled {
            core.start_listening().await?;
        }

        loop {
            tokio::select! {
                cmd = commands_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !core.handle_command(cmd).await {
                        break;
                    }
                }

                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    core.handle_event(event).await;
                }

                ending = turn_done_rx.recv() => {
                    if let Some(ending) = ending
                        && matches!(core.phase, Phase::Remote)
                    {
                        core.end_turn(ending);
                    }
                }

                () = sleep_until_opt(core.ceiling_at), if core.ceiling_at.is_some() => {
                    core.ceiling_at = None;
                    core.on_ceiling_expired();
                }

                () = sleep_until_opt(core.grace_at), if core.grace_at.is_some() => {
                    core.grace_at = None;
                    core.on_grace_elapsed();
                }

                () = sleep_until_opt(core.settle_at), if core.settle_at.is_some() => {
                    core.settle_at = None;
                    core.on_settled();
                }
            }
        }

        core.shutdown().await;
        Ok(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Core {
    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.session_events.send(event);
    }

    /// Grant the spotter the microphone, then start the spotting process.
    /// The grant comes first so the spotter may open the shared stream.
    async fn start_listening(&mut self) -> Result<()> {
        self.arbiter.acquire(MicOwner::KeywordSpotter);
        self.spotter
            .start()
            .map_err(|e| Error::Liveness(format!("initial spotter start failed: {e}")))?;
        self.supervisor.spotter_started().await;
        tracing::info!(phrase = %self.config.wake_phrase, "listening for wake phrase");
        Ok(())
    }

    /// Returns false when the loop should exit
    async fn handle_command(&mut self, cmd: CoordinatorCommand) -> bool {
        match cmd {
            CoordinatorCommand::ManualStart => {
                self.begin_turn(TurnTrigger::Manual).await;
                true
            }
            CoordinatorCommand::ManualStop => {
                if let Phase::Capture(session) = &mut self.phase {
                    let effects = session.on_stop_request();
                    self.apply_effects(effects);
                }
                true
            }
            CoordinatorCommand::TaskDiscarded => {
                self.supervisor.task_discarded().await;
                true
            }
            CoordinatorCommand::Shutdown => false,
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::WakeTriggered => {
                self.begin_turn(TurnTrigger::WakeWord).await;
            }
            EngineEvent::Partial(text) => {
                if let Phase::Capture(session) = &mut self.phase {
                    let effects = session.on_partial(text);
                    self.apply_effects(effects);
                }
            }
            EngineEvent::EndOfSpeech => {
                if let Phase::Capture(session) = &mut self.phase {
                    let effects = session.on_end_of_speech();
                    self.apply_effects(effects);
                }
            }
            EngineEvent::Final(text) => {
                if let Phase::Capture(session) = &mut self.phase {
                    let effects = session.on_final(text);
                    self.apply_effects(effects);
                }
            }
            EngineEvent::NoMatch => {
                if let Phase::Capture(session) = &mut self.phase {
                    let effects = session.on_no_match();
                    self.apply_effects(effects);
                }
            }
            EngineEvent::CaptureFailed(message) => {
                if let Phase::Capture(session) = &mut self.phase {
                    let effects = session.on_engine_error(message);
                    self.apply_effects(effects);
                }
            }
        }
    }

    fn on_ceiling_expired(&mut self) {
        if let Phase::Capture(session) = &mut self.phase {
            let effects = session.on_ceiling_expired();
            self.apply_effects(effects);
        }
    }

    fn on_grace_elapsed(&mut self) {
        if let Phase::Capture(session) = &mut self.phase {
            let effects = session.on_grace_elapsed();
            self.apply_effects(effects);
        }
    }

    /// Begin a dictation turn; ignored while one is active
    async fn begin_turn(&mut self, trigger: TurnTrigger) {
        if !matches!(self.phase, Phase::Idle) {
            tracing::debug!(trigger = ?trigger, "turn already active, ignoring trigger");
            return;
        }

        self.sequencer.stop().await;
        self.arbiter.acquire(MicOwner::Dictation);

        let (session, effects) = DictationSession::start(trigger);
        self.phase = Phase::Capture(session);
        self.emit(SessionEvent::TurnStarted {
            wake_word: trigger == TurnTrigger::WakeWord,
        });
        self.apply_effects(effects);

        if let Err(e) = self.engine.start() {
            tracing::error!(error = %e, "speech engine failed to start");
            self.end_turn(TurnEnding::Failed {
                message: e.to_string(),
            });
        }
    }

    fn apply_effects(&mut self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::ClearPreview => {
                    self.emit(SessionEvent::Preview {
                        text: String::new(),
                    });
                }
                SessionEffect::Preview(text) => {
                    self.emit(SessionEvent::Preview { text });
                }
                SessionEffect::ArmCeiling(delay) => {
                    self.ceiling_at = Some(Instant::now() + delay);
                }
                SessionEffect::BeginGrace(delay) => {
                    self.grace_at = Some(Instant::now() + delay);
                }
                SessionEffect::StopEngine => {
                    self.engine.stop();
                }
                SessionEffect::Conclude(outcome) => {
                    self.conclude_capture(outcome);
                }
            }
        }
    }

    /// Capture phase finished; either hand off to the remote phase or end
    /// the turn
    fn conclude_capture(&mut self, outcome: CaptureOutcome) {
        self.ceiling_at = None;
        self.grace_at = None;

        match outcome {
            CaptureOutcome::Transcript(transcript) => {
                self.phase = Phase::Remote;
                let backend = Arc::clone(&self.backend);
                let sequencer = self.sequencer.clone();
                let events = self.session_events.clone();
                let turn_done = self.turn_done_tx.clone();
                tokio::spawn(async move {
                    let ending =
                        run_remote_phase(backend, &sequencer, &events, transcript.text).await;
                    let _ = turn_done.send(ending).await;
                });
            }
            CaptureOutcome::Empty => {
                self.engine.abort();
                self.end_turn(TurnEnding::Empty);
            }
            CaptureOutcome::Failed(message) => {
                self.engine.abort();
                self.end_turn(TurnEnding::Failed { message });
            }
        }
    }

    /// Every terminal outcome funnels through here so no error path can
    /// strand mic ownership
    fn end_turn(&mut self, ending: TurnEnding) {
        self.ceiling_at = None;
        self.grace_at = None;
        self.arbiter.release(MicOwner::Dictation);
        self.emit(SessionEvent::TurnEnded { ending });
        self.phase = Phase::Settle;
        self.settle_at = Some(Instant::now() + SETTLE_DELAY);
    }

    /// Settle delay elapsed: restore the keyword spotter
    fn on_settled(&mut self) {
        self.phase = Phase::Idle;
        if self.config.wake_word_enabled && self.spotter.is_running() {
            self.arbiter.acquire(MicOwner::KeywordSpotter);
            if let Err(e) = self.spotter.resume_stream() {
                tracing::warn!(error = %e, "spotter stream resume failed");
            }
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("coordinator shutting down");
        self.engine.abort();
        self.sequencer.stop().await;
        self.spotter.stop();
        self.supervisor.spotter_stopped().await;
        self.arbiter.release(MicOwner::Dictation);
        self.arbiter.release(MicOwner::KeywordSpotter);
    }
}

/// Drive the remote phase: concurrent ack + response fetches, ordered
/// ack-then-response playback regardless of arrival order
async fn run_remote_phase(
    backend: Arc<dyn VoiceBackend>,
    sequencer: &PlaybackSequencer,
    events: &broadcast::Sender<SessionEvent>,
    text: String,
) -> TurnEnding {
    let mut reply_task = {
        let backend = Arc::clone(&backend);
        let text = text.clone();
        tokio::spawn(async move { backend.send_utterance(&text).await })
    };

    let ack = backend.fetch_ack(&text).await;
    let mut ack_done = sequencer.play_ack(ack).await;

    // If the ack finishes before the response arrives, the assistant is
    // still thinking
    let mut ack_finished = false;
    let reply = tokio::select! {
        res = &mut reply_task => res,
        _ = &mut ack_done => {
            ack_finished = true;
            let _ = events.send(SessionEvent::Thinking);
            (&mut reply_task).await
        }
    };

    let reply = match reply {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "assistant request failed");
            return TurnEnding::Failed {
                message: e.to_string(),
            };
        }
        Err(e) => {
            tracing::error!(error = %e, "assistant request task failed");
            return TurnEnding::Failed {
                message: e.to_string(),
            };
        }
    };

    if !reply.text.is_empty() {
        let _ = events.send(SessionEvent::Reply {
            text: reply.text.clone(),
        });
    }

    if let Some(clip) = reply.audio {
        let done = sequencer.play_after_ack(clip).await;
        // Closed means the clip was cancelled; the turn still ends
        let _ = done.await;
    } else if !ack_finished {
        // No spoken reply: let the ack finish before ending the turn
        let _ = ack_done.await;
    }

    TurnEnding::Completed
}
