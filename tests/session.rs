//! Session lifecycle integration tests
//!
//! Drives the coordinator end to end over test doubles with the tokio
//! clock paused, so ceiling, grace, and settle timing are exact.

use std::sync::atomic::Ordering;
use std::time::Duration;

use vigil::dictation::{CAPTURE_CEILING, TRAILING_GRACE};
use vigil::{EngineEvent, MicOwner, SessionEvent, TurnEnding};

mod common;

use common::{FakeBackend, assert_no_event, next_event, spawn_pipeline};

/// A little past the settle delay
const SETTLE: Duration = Duration::from_millis(600);

#[tokio::test(start_paused = true)]
async fn startup_grants_mic_to_spotter() {
    let p = spawn_pipeline(FakeBackend::new("hi"), true).await;
    assert_eq!(p.spotter.starts.load(Ordering::SeqCst), 1);
    assert_eq!(p.arbiter.owner(), MicOwner::KeywordSpotter);
}

#[tokio::test(start_paused = true)]
async fn wake_word_disabled_skips_spotter() {
    let p = spawn_pipeline(FakeBackend::new("hi"), false).await;
    assert_eq!(p.spotter.starts.load(Ordering::SeqCst), 0);
    assert_eq!(p.arbiter.owner(), MicOwner::None);
}

#[tokio::test(start_paused = true)]
async fn wake_turn_runs_to_completion() {
    let backend = FakeBackend::new("It is sunny.")
        .with_ack(b"a", Duration::ZERO)
        .with_reply_audio(b"response audio", Duration::from_millis(50));
    let mut p = spawn_pipeline(backend, true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::TurnStarted { wake_word: true }
    );
    // Preview cleared at turn start
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::Preview {
            text: String::new()
        }
    );
    assert_eq!(p.arbiter.owner(), MicOwner::Dictation);
    assert_eq!(p.engine.starts.load(Ordering::SeqCst), 1);

    p.events_tx
        .send(EngineEvent::Partial("what is".to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::Preview {
            text: "what is".to_string()
        }
    );

    p.events_tx.send(EngineEvent::EndOfSpeech).await.unwrap();
    p.events_tx
        .send(EngineEvent::Final("what is the weather".to_string()))
        .await
        .unwrap();

    // Ack (1 ms) finishes well before the 50 ms reply
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::Thinking
    );
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::Reply {
            text: "It is sunny.".to_string()
        }
    );
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::TurnEnded {
            ending: TurnEnding::Completed
        }
    );
    assert_eq!(p.backend.sent_utterances(), vec!["what is the weather"]);

    // Ack played before the response
    let clips = p.sink.played_clips();
    assert_eq!(clips, vec![b"a".to_vec(), b"response audio".to_vec()]);

    // Settle delay, then the spotter gets the mic back
    tokio::time::sleep(SETTLE).await;
    assert_eq!(p.arbiter.owner(), MicOwner::KeywordSpotter);
    assert!(p.spotter.resumes.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn late_ack_still_plays_before_the_response() {
    // The response is ready before the ack has even been fetched
    let backend = FakeBackend::new("Done.")
        .with_ack(b"ack clip", Duration::from_millis(50))
        .with_reply_audio(b"response audio", Duration::ZERO);
    let mut p = spawn_pipeline(backend, true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    next_event(&mut p.session_events).await;
    next_event(&mut p.session_events).await;

    p.events_tx
        .send(EngineEvent::Final("lights off".to_string()))
        .await
        .unwrap();

    let ended = loop {
        if let SessionEvent::TurnEnded { ending } = next_event(&mut p.session_events).await {
            break ending;
        }
    };
    assert_eq!(ended, TurnEnding::Completed);

    // Playback order holds regardless of arrival order, with nothing cut off
    assert_eq!(
        p.sink.played_clips(),
        vec![b"ack clip".to_vec(), b"response audio".to_vec()]
    );
    assert_eq!(p.sink.halts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_transcript_ends_quietly() {
    let mut p = spawn_pipeline(FakeBackend::new("unused"), true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    next_event(&mut p.session_events).await; // TurnStarted
    next_event(&mut p.session_events).await; // Preview cleared

    p.events_tx
        .send(EngineEvent::Final("   ".to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::TurnEnded {
            ending: TurnEnding::Empty
        }
    );

    // Nothing was sent and nothing played
    assert!(p.backend.sent_utterances().is_empty());
    assert!(p.sink.played_clips().is_empty());

    tokio::time::sleep(SETTLE).await;
    assert_eq!(p.arbiter.owner(), MicOwner::KeywordSpotter);
}

#[tokio::test(start_paused = true)]
async fn no_match_ends_quietly() {
    let mut p = spawn_pipeline(FakeBackend::new("unused"), true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    next_event(&mut p.session_events).await;
    next_event(&mut p.session_events).await;

    p.events_tx.send(EngineEvent::NoMatch).await.unwrap();
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::TurnEnded {
            ending: TurnEnding::Empty
        }
    );
    assert!(p.backend.sent_utterances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn backend_failure_surfaces_once() {
    let mut p = spawn_pipeline(FakeBackend::new("unused").failing(), true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    next_event(&mut p.session_events).await;
    next_event(&mut p.session_events).await;

    p.events_tx
        .send(EngineEvent::Final("hello".to_string()))
        .await
        .unwrap();

    let ended = loop {
        if let SessionEvent::TurnEnded { ending } = next_event(&mut p.session_events).await {
            break ending;
        }
    };
    assert!(matches!(ended, TurnEnding::Failed { .. }));

    // The failed turn still restores listening
    tokio::time::sleep(SETTLE).await;
    assert_eq!(p.arbiter.owner(), MicOwner::KeywordSpotter);
}

#[tokio::test(start_paused = true)]
async fn capture_failure_surfaces() {
    let mut p = spawn_pipeline(FakeBackend::new("unused"), true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    next_event(&mut p.session_events).await;
    next_event(&mut p.session_events).await;

    p.events_tx
        .send(EngineEvent::CaptureFailed("device lost".to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::TurnEnded {
            ending: TurnEnding::Failed {
                message: "device lost".to_string()
            }
        }
    );
}

#[tokio::test(start_paused = true)]
async fn triggers_during_active_turn_are_ignored() {
    let mut p = spawn_pipeline(FakeBackend::new("hi"), true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    next_event(&mut p.session_events).await;
    next_event(&mut p.session_events).await;
    assert_eq!(p.engine.starts.load(Ordering::SeqCst), 1);

    // Second wake trigger and a manual start, both during the turn
    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    p.handle.manual_start().await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(p.engine.starts.load(Ordering::SeqCst), 1);
    assert_no_event(&mut p.session_events);
}

#[tokio::test(start_paused = true)]
async fn ceiling_bounds_a_wake_turn() {
    let mut p = spawn_pipeline(FakeBackend::new("unused"), true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    next_event(&mut p.session_events).await;
    next_event(&mut p.session_events).await;

    // Just under the ceiling nothing happens
    tokio::time::sleep(CAPTURE_CEILING - Duration::from_millis(10)).await;
    assert_eq!(p.engine.stops.load(Ordering::SeqCst), 0);

    // Past the ceiling plus the trailing grace the engine is stopped
    tokio::time::sleep(Duration::from_millis(20) + TRAILING_GRACE).await;
    assert_eq!(p.engine.stops.load(Ordering::SeqCst), 1);

    // The engine's final result still concludes the turn
    p.events_tx
        .send(EngineEvent::Final("trailing words".to_string()))
        .await
        .unwrap();
    let ended = loop {
        if let SessionEvent::TurnEnded { ending } = next_event(&mut p.session_events).await {
            break ending;
        }
    };
    assert_eq!(ended, TurnEnding::Completed);
    assert_eq!(p.backend.sent_utterances(), vec!["trailing words"]);
}

#[tokio::test(start_paused = true)]
async fn manual_turn_has_no_ceiling() {
    let mut p = spawn_pipeline(FakeBackend::new("unused"), false).await;

    p.handle.manual_start().await;
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::TurnStarted { wake_word: false }
    );
    next_event(&mut p.session_events).await; // Preview cleared

    // Far past the wake-word ceiling the capture is still open
    tokio::time::sleep(CAPTURE_CEILING * 3).await;
    assert_eq!(p.engine.stops.load(Ordering::SeqCst), 0);
    assert_no_event(&mut p.session_events);

    // User release enters the grace window, then the engine stops
    p.handle.manual_stop().await;
    tokio::time::sleep(TRAILING_GRACE + Duration::from_millis(10)).await;
    assert_eq!(p.engine.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn grace_preserves_trailing_words() {
    let mut p = spawn_pipeline(FakeBackend::new("ok"), true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    next_event(&mut p.session_events).await;
    next_event(&mut p.session_events).await;

    p.events_tx.send(EngineEvent::EndOfSpeech).await.unwrap();

    // Inside the grace window the engine keeps running and partials
    // still update the preview
    tokio::time::sleep(TRAILING_GRACE / 2).await;
    assert_eq!(p.engine.stops.load(Ordering::SeqCst), 0);
    p.events_tx
        .send(EngineEvent::Partial("set a timer plus".to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::Preview {
            text: "set a timer plus".to_string()
        }
    );

    tokio::time::sleep(TRAILING_GRACE).await;
    assert_eq!(p.engine.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn error_during_grace_is_suppressed() {
    let mut p = spawn_pipeline(FakeBackend::new("unused"), true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    next_event(&mut p.session_events).await;
    next_event(&mut p.session_events).await;

    p.events_tx.send(EngineEvent::EndOfSpeech).await.unwrap();
    p.events_tx
        .send(EngineEvent::CaptureFailed("teardown noise".to_string()))
        .await
        .unwrap();

    // Ends quietly, not as a failure
    assert_eq!(
        next_event(&mut p.session_events).await,
        SessionEvent::TurnEnded {
            ending: TurnEnding::Empty
        }
    );
}

#[tokio::test(start_paused = true)]
async fn reply_without_audio_still_completes() {
    let backend = FakeBackend::new("text only answer").with_ack(b"ac", Duration::ZERO);
    let mut p = spawn_pipeline(backend, true).await;

    p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
    next_event(&mut p.session_events).await;
    next_event(&mut p.session_events).await;

    p.events_tx
        .send(EngineEvent::Final("question".to_string()))
        .await
        .unwrap();

    let ended = loop {
        if let SessionEvent::TurnEnded { ending } = next_event(&mut p.session_events).await {
            break ending;
        }
    };
    assert_eq!(ended, TurnEnding::Completed);
    assert_eq!(p.sink.played_clips(), vec![b"ac".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn consecutive_turns_share_one_pipeline() {
    let backend = FakeBackend::new("done");
    let mut p = spawn_pipeline(backend, true).await;

    for round in 1..=2 {
        p.events_tx.send(EngineEvent::WakeTriggered).await.unwrap();
        next_event(&mut p.session_events).await;
        next_event(&mut p.session_events).await;
        p.events_tx
            .send(EngineEvent::Final(format!("utterance {round}")))
            .await
            .unwrap();
        loop {
            if let SessionEvent::TurnEnded { .. } = next_event(&mut p.session_events).await {
                break;
            }
        }
        tokio::time::sleep(SETTLE).await;
        assert_eq!(p.arbiter.owner(), MicOwner::KeywordSpotter);
    }

    assert_eq!(
        p.backend.sent_utterances(),
        vec!["utterance 1", "utterance 2"]
    );
    assert_eq!(p.engine.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_everything() {
    let mut p = spawn_pipeline(FakeBackend::new("hi"), true).await;
    assert_eq!(p.arbiter.owner(), MicOwner::KeywordSpotter);

    p.handle.shutdown().await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(p.arbiter.owner(), MicOwner::None);
    assert_eq!(p.spotter.stops.load(Ordering::SeqCst), 1);
    assert_no_event(&mut p.session_events);
}
