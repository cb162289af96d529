//! Dictation speech capture and transcription
//!
//! [`SpeechEngine`] is the port the dictation state machine drives;
//! [`HttpSpeechEngine`] is the production adapter: it reads the shared
//! microphone capture, endpoints the utterance with a silence detector
//! (emitting [`EngineEvent::EndOfSpeech`]), and on stop ships the recorded
//! audio to a Whisper-style HTTP transcription endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::audio::{CaptureSource, SAMPLE_RATE, samples_to_wav};
use crate::events::EngineEvent;
use crate::mic::MicConsumer;
use crate::spotter::{WakeVerifier, calculate_energy};
use crate::{Error, Result};

/// Poll cadence for the endpointing task
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Energy above which a chunk counts as speech
const SPEECH_THRESHOLD: f32 = 0.02;

/// Silence run after speech that signals end of utterance (samples)
const END_SILENCE_SAMPLES: usize = SAMPLE_RATE as usize; // 1 second

/// Minimum utterance length worth transcribing (samples)
const MIN_UTTERANCE_SAMPLES: usize = 4800; // 0.3 seconds

/// Response from a Whisper-style transcription API
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// HTTP transcription client (Whisper-style multipart upload)
pub struct Transcriber {
    client: reqwest::Client,
    url: Url,
    model: String,
    api_key: Option<String>,
}

impl Transcriber {
    /// Create a transcriber for the given endpoint
    #[must_use]
    pub fn new(url: Url, model: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            model,
            api_key,
        }
    }

    /// Transcribe WAV audio to text
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the server rejects the audio.
    pub async fn transcribe_wav(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Capture(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let mut request = self.client.post(self.url.clone()).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "transcription request failed");
            Error::Capture(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Capture(format!("transcription error {status}")));
        }

        let result: TranscriptionResponse = response.json().await.map_err(Error::Http)?;
        tracing::debug!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

#[async_trait]
impl WakeVerifier for Transcriber {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        self.transcribe_wav(wav).await
    }
}

/// Speech capture engine driven by the dictation state machine
pub trait SpeechEngine: Send + Sync {
    /// Begin capturing an utterance; results flow back as engine events.
    ///
    /// # Errors
    ///
    /// Returns error if the capture stream cannot be opened.
    fn start(&self) -> Result<()>;

    /// Finalize: stop capture and deliver a final transcript (or error)
    /// via events.
    fn stop(&self);

    /// Cancel without delivering any result.
    fn abort(&self);
}

/// Adapter registering a speech engine as a mic consumer: revocation
/// aborts the capture outright
pub struct EngineStreamHook(pub Arc<dyn SpeechEngine>);

impl MicConsumer for EngineStreamHook {
    fn stop_stream(&self) -> Result<()> {
        self.0.abort();
        Ok(())
    }
}

struct EngineInner {
    capture: Arc<dyn CaptureSource>,
    events: mpsc::Sender<EngineEvent>,
    transcriber: Arc<Transcriber>,
    active: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    recorded: Mutex<Vec<f32>>,
}

/// Production speech engine: shared mic capture + silence endpointing +
/// HTTP transcription
pub struct HttpSpeechEngine {
    inner: Arc<EngineInner>,
}

impl HttpSpeechEngine {
    /// Create an engine over a capture source. Must be started from within
    /// a tokio runtime.
    #[must_use]
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        events: mpsc::Sender<EngineEvent>,
        transcriber: Arc<Transcriber>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                capture,
                events,
                transcriber,
                active: AtomicBool::new(false),
                cancel: Mutex::new(None),
                recorded: Mutex::new(Vec::new()),
            }),
        }
    }

    fn cancel_task(&self) {
        let token = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn take_recorded(&self) -> Vec<f32> {
        let mut recorded = self
            .inner
            .recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *recorded)
    }
}

impl SpeechEngine for HttpSpeechEngine {
    fn start(&self) -> Result<()> {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.take_recorded();
        self.inner.capture.clear_buffer();
        if let Err(e) = self.inner.capture.start() {
            self.inner.active.store(false, Ordering::SeqCst);
            return Err(Error::Capture(format!("capture start failed: {e}")));
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
        tokio::spawn(async move {
            endpointing_loop(&inner, token).await;
        });

        tracing::debug!("speech capture started");
        Ok(())
    }

    fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel_task();
        let _ = self.inner.capture.stop();

        // Pull any samples still sitting in the shared buffer
        let mut recorded = self.take_recorded();
        recorded.extend(self.inner.capture.take_buffer());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let event = transcribe_recording(&inner, recorded).await;
            let _ = inner.events.send(event).await;
        });
    }

    fn abort(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel_task();
        let _ = self.inner.capture.stop();
        self.take_recorded();
        tracing::debug!("speech capture aborted");
    }
}

async fn endpointing_loop(inner: &Arc<EngineInner>, token: CancellationToken) {
    let mut heard_speech = false;
    let mut silence_run = 0usize;
    let mut end_signalled = false;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let chunk = inner.capture.take_buffer();
        if chunk.is_empty() {
            continue;
        }

        if calculate_energy(&chunk) > SPEECH_THRESHOLD {
            heard_speech = true;
            silence_run = 0;
        } else {
            silence_run += chunk.len();
        }

        {
            let mut recorded = inner
                .recorded
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            recorded.extend_from_slice(&chunk);
        }

        // The engine's own silence detector; the session applies its
        // trailing grace before forcing the stop
        if heard_speech && silence_run > END_SILENCE_SAMPLES && !end_signalled {
            end_signalled = true;
            tracing::debug!("end of speech detected");
            if inner.events.send(EngineEvent::EndOfSpeech).await.is_err() {
                break;
            }
        }
    }
}

async fn transcribe_recording(inner: &Arc<EngineInner>, recorded: Vec<f32>) -> EngineEvent {
    if recorded.len() < MIN_UTTERANCE_SAMPLES {
        tracing::debug!(samples = recorded.len(), "utterance too short, no match");
        return EngineEvent::NoMatch;
    }

    let wav = match samples_to_wav(&recorded, SAMPLE_RATE) {
        Ok(wav) => wav,
        Err(e) => return EngineEvent::CaptureFailed(e.to_string()),
    };

    match inner.transcriber.transcribe_wav(wav).await {
        Ok(text) if text.trim().is_empty() => EngineEvent::NoMatch,
        Ok(text) => EngineEvent::Final(text),
        Err(e) => EngineEvent::CaptureFailed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcription_response_parses() {
        let raw = r#"{"text": "turn off the lights"}"#;
        let parsed: TranscriptionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.text, "turn off the lights");
    }
}
