//! Keyword spotting
//!
//! A hybrid detector: a local RMS-energy gate segments speech out of the
//! live stream, and an optional verifier transcribes the segment to confirm
//! the wake phrase before the trigger fires. The spotting process is
//! idempotently restartable: `start` while already running is a safe no-op,
//! which both the manual start path and the revival timer rely on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{CaptureSource, SAMPLE_RATE, samples_to_wav};
use crate::events::EngineEvent;
use crate::mic::{MicArbiter, MicConsumer, MicOwner};
use crate::{Error, Result};

/// Energy threshold at zero sensitivity (loudest required speech)
const MAX_THRESHOLD: f32 = 0.06;

/// Energy threshold at full sensitivity (quietest accepted speech)
const MIN_THRESHOLD: f32 = 0.012;

/// Minimum duration of speech to consider a segment (samples at 16kHz)
const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Silence run that ends a segment (samples)
const SILENCE_SAMPLES: usize = 8000; // 0.5 seconds

/// Poll cadence for the spotting task
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Discard the buffer if it grows past this without a segment (samples)
const BUFFER_CAP: usize = SAMPLE_RATE as usize * 5;

/// State of the phrase detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech energy
    Idle,
    /// Accumulating a potential wake utterance
    Listening,
}

/// Energy-gated speech segmenter with wake phrase matching
pub struct WakePhraseDetector {
    phrase: String,
    threshold: f32,
    state: DetectorState,
    speech_buffer: Vec<f32>,
    speech_len: usize,
    silence_counter: usize,
}

impl WakePhraseDetector {
    /// Create a detector for a wake phrase at the given sensitivity
    /// (`0.0` least sensitive, `1.0` most)
    #[must_use]
    pub fn new(phrase: &str, sensitivity: f32) -> Self {
        let sensitivity = sensitivity.clamp(0.0, 1.0);
        let threshold = (MIN_THRESHOLD - MAX_THRESHOLD).mul_add(sensitivity, MAX_THRESHOLD);
        tracing::debug!(phrase, sensitivity, threshold, "wake phrase detector initialized");
        Self {
            phrase: phrase.to_lowercase().trim().to_string(),
            threshold,
            state: DetectorState::Idle,
            speech_buffer: Vec::new(),
            speech_len: 0,
            silence_counter: 0,
        }
    }

    /// Process audio samples; returns true when a speech segment is complete
    pub fn process(&mut self, samples: &[f32]) -> bool {
        let energy = calculate_energy(samples);
        let is_speech = energy > self.threshold;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Listening;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(samples);
                    self.speech_len = self.speech_buffer.len();
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
            }
            DetectorState::Listening => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence_counter = 0;
                    self.speech_len = self.speech_buffer.len();
                } else {
                    self.silence_counter += samples.len();
                }

                if self.silence_counter > SILENCE_SAMPLES && self.speech_len > MIN_SPEECH_SAMPLES {
                    tracing::debug!(samples = self.speech_buffer.len(), "speech segment complete");
                    return true;
                }

                // Too much silence without enough speech, or a runaway
                // buffer that never segmented
                if self.silence_counter > SILENCE_SAMPLES * 2
                    || self.speech_buffer.len() > BUFFER_CAP
                {
                    self.reset();
                }
            }
        }

        false
    }

    /// Whether a transcript contains the wake phrase
    #[must_use]
    pub fn matches_phrase(&self, transcript: &str) -> bool {
        transcript.to_lowercase().contains(&self.phrase)
    }

    /// Take the accumulated speech buffer, clearing it
    pub fn take_speech_buffer(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.speech_buffer)
    }

    /// Reset to idle
    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_buffer.clear();
        self.speech_len = 0;
        self.silence_counter = 0;
    }

    /// Current detector state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
pub(crate) fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Control surface of the keyword-spotting process, shared by the
/// coordinator and the liveness supervisor. The process is the source of
/// truth for its own liveness; supervision only reacts to its absence.
pub trait SpotterControl: Send + Sync {
    /// Start the spotting process. Idempotent: starting while already
    /// running leaves exactly one active instance.
    ///
    /// # Errors
    ///
    /// Returns error if the process could not start; the supervisor logs
    /// this and leaves the next revival to retry.
    fn start(&self) -> Result<()>;

    /// Deliberate stop; cancels spotting entirely.
    fn stop(&self);

    /// Whether the spotting process is currently alive.
    fn is_running(&self) -> bool;

    /// Stop reading the microphone without stopping the process
    /// (mic grant revoked).
    ///
    /// # Errors
    ///
    /// Returns error if the stream could not be stopped.
    fn pause_stream(&self) -> Result<()>;

    /// Resume reading the microphone (mic grant restored).
    ///
    /// # Errors
    ///
    /// Returns error if the stream could not be reopened.
    fn resume_stream(&self) -> Result<()>;
}

/// Adapter registering a spotter as a mic consumer: revocation pauses its
/// stream but leaves the process alive
pub struct SpotterStreamHook(pub Arc<dyn SpotterControl>);

impl MicConsumer for SpotterStreamHook {
    fn stop_stream(&self) -> Result<()> {
        self.0.pause_stream()
    }
}

/// Confirms a candidate segment actually contains the wake phrase
#[async_trait]
pub trait WakeVerifier: Send + Sync {
    /// Transcribe a WAV-encoded speech segment.
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails; the candidate is dropped.
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String>;
}

struct SpotterInner {
    capture: Arc<dyn CaptureSource>,
    arbiter: Arc<MicArbiter>,
    events: mpsc::Sender<EngineEvent>,
    verifier: Option<Arc<dyn WakeVerifier>>,
    phrase: String,
    sensitivity: f32,
    running: AtomicBool,
    generation: AtomicU64,
    cancel: Mutex<Option<CancellationToken>>,
}

/// The keyword-spotting process: capture stream + energy detector +
/// phrase verification, emitting [`EngineEvent::WakeTriggered`]
pub struct KeywordSpotter {
    inner: Arc<SpotterInner>,
}

impl KeywordSpotter {
    /// Create a spotter over a capture source. The arbiter decides whether
    /// a (re)start may open the shared stream. Must be started from within
    /// a tokio runtime.
    #[must_use]
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        arbiter: Arc<MicArbiter>,
        events: mpsc::Sender<EngineEvent>,
        phrase: &str,
        sensitivity: f32,
        verifier: Option<Arc<dyn WakeVerifier>>,
    ) -> Self {
        Self {
            inner: Arc::new(SpotterInner {
                capture,
                arbiter,
                events,
                verifier,
                phrase: phrase.to_string(),
                sensitivity,
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                cancel: Mutex::new(None),
            }),
        }
    }
}

impl SpotterControl for KeywordSpotter {
    fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("spotter already running");
            return Ok(());
        }

        // The revival timer may fire mid-turn; the shared stream then
        // belongs to dictation and must not be reopened underneath it.
        // The process still restarts and the stream resumes on handback.
        if self.inner.arbiter.owner() == MicOwner::Dictation {
            tracing::debug!("dictation holds the mic, spotter starting without the stream");
        } else {
            self.inner.arbiter.acquire(MicOwner::KeywordSpotter);
            if let Err(e) = self.inner.capture.start() {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(Error::Liveness(format!("spotter capture failed: {e}")));
            }
        }

        let token = CancellationToken::new();
        {
            let mut slot = self
                .inner
                .cancel
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *slot = Some(token.clone());
        }

        let inner = Arc::clone(&self.inner);
        let loop_token = token;
        let my_generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            spotting_loop(&inner, loop_token.clone()).await;
            // The loop exits uncancelled only when its event channel is
            // gone; the flag must not report a dead task as alive. The
            // generation check keeps a stale exit from clearing the flag
            // of a newer instance.
            if !loop_token.is_cancelled()
                && inner.generation.load(Ordering::SeqCst) == my_generation
            {
                inner.running.store(false, Ordering::SeqCst);
                tracing::warn!("spotting task exited unexpectedly");
            }
        });

        tracing::info!(phrase = %self.inner.phrase, "keyword spotter started");
        Ok(())
    }

    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let token = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
        let _ = self.inner.capture.stop();
        tracing::info!("keyword spotter stopped");
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn pause_stream(&self) -> Result<()> {
        self.inner.capture.stop()
    }

    fn resume_stream(&self) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            self.inner.capture.start()
        } else {
            Ok(())
        }
    }
}

async fn spotting_loop(inner: &Arc<SpotterInner>, token: CancellationToken) {
    let mut detector = WakePhraseDetector::new(&inner.phrase, inner.sensitivity);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let samples = inner.capture.take_buffer();
        if samples.is_empty() {
            continue;
        }

        if detector.process(&samples) {
            let segment = detector.take_speech_buffer();
            detector.reset();

            let confirmed = match &inner.verifier {
                Some(verifier) => verify_segment(&detector, verifier.as_ref(), &segment).await,
                None => true,
            };

            if confirmed {
                tracing::info!("wake phrase detected");
                if inner.events.send(EngineEvent::WakeTriggered).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn verify_segment(
    detector: &WakePhraseDetector,
    verifier: &dyn WakeVerifier,
    segment: &[f32],
) -> bool {
    let wav = match samples_to_wav(segment, SAMPLE_RATE) {
        Ok(wav) => wav,
        Err(e) => {
            tracing::warn!(error = %e, "segment encoding failed");
            return false;
        }
    };

    match verifier.transcribe(wav).await {
        Ok(transcript) => {
            let matched = detector.matches_phrase(&transcript);
            tracing::debug!(transcript = %transcript, matched, "segment verified");
            matched
        }
        Err(e) => {
            tracing::debug!(error = %e, "segment verification failed");
            false
        }
    }
}
