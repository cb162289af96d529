//! Shared test doubles for the session pipeline
//!
//! Each fake records calls through atomics so tests can assert on
//! lifecycle ordering without audio hardware or a live server.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use vigil::playback::{AudioClip, AudioSink, PlaybackSequencer};
use vigil::remote::{AssistantReply, VoiceBackend};
use vigil::speech::{EngineStreamHook, SpeechEngine};
use vigil::spotter::{SpotterControl, SpotterStreamHook};
use vigil::supervisor::{LivenessSupervisor, SleepInhibitor};
use vigil::{
    Config, CoordinatorHandle, EngineEvent, Error, MicArbiter, MicOwner, Result,
    SessionCoordinator, SessionEvent,
};

/// Spotter double tracking lifecycle calls
#[derive(Default)]
pub struct FakeSpotter {
    running: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    pub fail_start: AtomicBool,
}

impl FakeSpotter {
    /// Simulate the spotting process dying without a deliberate stop
    pub fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl SpotterControl for FakeSpotter {
    fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Capture("spotter start refused".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn pause_stream(&self) -> Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resume_stream(&self) -> Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Speech engine double; tests drive transcription results by sending
/// engine events directly
#[derive(Default)]
pub struct FakeEngine {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub aborts: AtomicUsize,
}

impl SpeechEngine for FakeEngine {
    fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink that "plays" one millisecond per encoded byte against the
/// pausable test clock
#[derive(Default)]
pub struct FakeSink {
    pub played: Mutex<Vec<Vec<u8>>>,
    pub halts: AtomicUsize,
}

#[async_trait]
impl AudioSink for FakeSink {
    async fn play(&self, clip: AudioClip) -> Result<()> {
        let millis = clip.bytes.len() as u64;
        self.played
            .lock()
            .expect("sink lock poisoned")
            .push(clip.bytes);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(())
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeSink {
    pub fn played_clips(&self) -> Vec<Vec<u8>> {
        self.played.lock().expect("sink lock poisoned").clone()
    }
}

/// Backend double with scripted reply and ack, each behind a delay
pub struct FakeBackend {
    pub reply_text: String,
    pub reply_audio: Option<Vec<u8>>,
    pub reply_delay: Duration,
    pub ack_audio: Option<Vec<u8>>,
    pub ack_delay: Duration,
    pub fail: bool,
    pub sent: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new(reply_text: &str) -> Self {
        Self {
            reply_text: reply_text.to_string(),
            reply_audio: None,
            reply_delay: Duration::ZERO,
            ack_audio: None,
            ack_delay: Duration::ZERO,
            fail: false,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reply_audio(mut self, bytes: &[u8], delay: Duration) -> Self {
        self.reply_audio = Some(bytes.to_vec());
        self.reply_delay = delay;
        self
    }

    pub fn with_ack(mut self, bytes: &[u8], delay: Duration) -> Self {
        self.ack_audio = Some(bytes.to_vec());
        self.ack_delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn sent_utterances(&self) -> Vec<String> {
        self.sent.lock().expect("backend lock poisoned").clone()
    }
}

#[async_trait]
impl VoiceBackend for FakeBackend {
    async fn send_utterance(&self, text: &str) -> Result<AssistantReply> {
        self.sent
            .lock()
            .expect("backend lock poisoned")
            .push(text.to_string());
        tokio::time::sleep(self.reply_delay).await;
        if self.fail {
            return Err(Error::Remote("backend unavailable".to_string()));
        }
        Ok(AssistantReply {
            text: self.reply_text.clone(),
            audio: self
                .reply_audio
                .clone()
                .map(|bytes| AudioClip { bytes }),
        })
    }

    async fn fetch_ack(&self, _text: &str) -> Option<AudioClip> {
        tokio::time::sleep(self.ack_delay).await;
        self.ack_audio.clone().map(|bytes| AudioClip { bytes })
    }
}

/// Sleep inhibitor double counting acquisitions and releases
#[derive(Default)]
pub struct RecordingInhibitor {
    pub acquires: AtomicUsize,
    pub releases: AtomicUsize,
}

impl SleepInhibitor for RecordingInhibitor {
    fn acquire(&self) -> Result<()> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// A coordinator wired entirely to fakes
pub struct Pipeline {
    pub handle: CoordinatorHandle,
    pub events_tx: mpsc::Sender<EngineEvent>,
    pub session_events: broadcast::Receiver<SessionEvent>,
    pub arbiter: Arc<MicArbiter>,
    pub spotter: Arc<FakeSpotter>,
    pub engine: Arc<FakeEngine>,
    pub sink: Arc<FakeSink>,
    pub backend: Arc<FakeBackend>,
}

/// Spawn a coordinator over test doubles and wait for it to reach its
/// steady listening state
pub async fn spawn_pipeline(backend: FakeBackend, wake_word_enabled: bool) -> Pipeline {
    let config = Config {
        wake_word_enabled,
        ..Config::default()
    };

    let spotter = Arc::new(FakeSpotter::default());
    let engine = Arc::new(FakeEngine::default());
    let sink = Arc::new(FakeSink::default());
    let backend = Arc::new(backend);

    let arbiter = Arc::new(MicArbiter::new());
    arbiter.register(
        MicOwner::KeywordSpotter,
        Arc::new(SpotterStreamHook(
            Arc::clone(&spotter) as Arc<dyn SpotterControl>
        )),
    );
    arbiter.register(
        MicOwner::Dictation,
        Arc::new(EngineStreamHook(Arc::clone(&engine) as Arc<dyn SpeechEngine>)),
    );

    let sequencer = PlaybackSequencer::spawn(Arc::clone(&sink) as Arc<dyn AudioSink>);
    let supervisor = LivenessSupervisor::spawn(
        Arc::clone(&spotter) as Arc<dyn SpotterControl>,
        Arc::new(RecordingInhibitor::default()),
    );

    let (events_tx, events_rx) = SessionCoordinator::event_channel();
    let (coordinator, handle) = SessionCoordinator::new(
        config,
        Arc::clone(&arbiter),
        Arc::clone(&spotter) as Arc<dyn SpotterControl>,
        Arc::clone(&engine) as Arc<dyn SpeechEngine>,
        Arc::clone(&backend) as Arc<dyn VoiceBackend>,
        sequencer,
        supervisor,
        events_rx,
    );

    let session_events = handle.subscribe();
    tokio::spawn(coordinator.run());

    // Let the startup sequence (spotter start, mic grant) settle
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    Pipeline {
        handle,
        events_tx,
        session_events,
        arbiter,
        spotter,
        engine,
        sink,
        backend,
    }
}

/// Receive the next session event, failing loudly on a stalled pipeline
pub async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("no session event within timeout")
        .expect("session event channel closed")
}

/// Assert that no session event is already queued
pub fn assert_no_event(rx: &mut broadcast::Receiver<SessionEvent>) {
    match rx.try_recv() {
        Err(broadcast::error::TryRecvError::Empty) => {}
        other => panic!("expected no queued session event, got {other:?}"),
    }
}
