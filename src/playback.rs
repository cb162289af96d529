//! Two-phase audio playback sequencing
//!
//! The sequencer plays an instant acknowledgment clip and a deferred full
//! response, guaranteeing ack-then-response playback order even when the
//! response data arrives first. Only one clip is ever audible: starting a
//! clip always halts the previous one, and a response requested while the
//! ack is active waits in a single-entry slot until the ack finishes.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::Result;

/// Command queue depth for the sequencer task
const COMMAND_BUFFER: usize = 16;

/// Kind of clip in a playback sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipKind {
    /// Short acknowledgment cue masking remote-call latency
    Ack,
    /// Full assistant response
    Response,
}

impl std::fmt::Display for ClipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::Response => write!(f, "response"),
        }
    }
}

/// Encoded audio ready for a sink to decode and play
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    /// Encoded audio bytes (MP3 or WAV)
    pub bytes: Vec<u8>,
}

impl AudioClip {
    /// Wrap encoded audio bytes
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Whether the clip carries no audio
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Audio output port. `play` resolves when the clip has finished; `halt`
/// interrupts whatever is currently audible.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Decode and play a clip to completion.
    ///
    /// # Errors
    ///
    /// Returns error if decoding or output fails; the sequencer treats an
    /// errored clip as finished.
    async fn play(&self, clip: AudioClip) -> Result<()>;

    /// Interrupt the currently audible clip, if any.
    fn halt(&self);
}

enum Command {
    PlayAck {
        clip: Option<AudioClip>,
        done: oneshot::Sender<()>,
    },
    PlayAfterAck {
        clip: AudioClip,
        done: oneshot::Sender<()>,
    },
    Stop,
}

struct Inflight {
    kind: ClipKind,
    done: Option<oneshot::Sender<()>>,
    fut: BoxFuture<'static, Result<()>>,
}

/// Handle to the playback sequencer task
#[derive(Clone)]
pub struct PlaybackSequencer {
    tx: mpsc::Sender<Command>,
}

impl PlaybackSequencer {
    /// Spawn the sequencer task over the given sink
    #[must_use]
    pub fn spawn(sink: Arc<dyn AudioSink>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run(rx, sink));
        Self { tx }
    }

    /// Start the acknowledgment clip immediately, halting anything already
    /// playing. The returned receiver resolves when the ack finishes, unless
    /// a response was chained behind it, in which case it closes unfired.
    ///
    /// A `None` or empty clip resolves the receiver at once so the pipeline
    /// never stalls waiting on an ack.
    pub async fn play_ack(&self, clip: Option<AudioClip>) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::PlayAck {
                clip,
                done: done_tx,
            })
            .await;
        done_rx
    }

    /// Play the response clip after the ack. Queues behind an active ack;
    /// plays immediately when no ack is active. The receiver resolves when
    /// the response finishes and closes unfired if the clip is cancelled.
    pub async fn play_after_ack(&self, clip: AudioClip) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::PlayAfterAck {
                clip,
                done: done_tx,
            })
            .await;
        done_rx
    }

    /// Cancel any playing or queued clip and clear queued state
    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Stop).await;
    }
}

fn start_clip(
    sink: &Arc<dyn AudioSink>,
    kind: ClipKind,
    clip: AudioClip,
    done: Option<oneshot::Sender<()>>,
) -> Inflight {
    tracing::debug!(kind = %kind, bytes = clip.bytes.len(), "starting clip");
    let sink = Arc::clone(sink);
    let fut = Box::pin(async move { sink.play(clip).await });
    Inflight { kind, done, fut }
}

enum Step {
    Cmd(Option<Command>),
    Finished(Result<()>),
}

#[allow(clippy::too_many_lines)]
async fn run(mut rx: mpsc::Receiver<Command>, sink: Arc<dyn AudioSink>) {
    // At most one pending clip queues behind the active one
    let mut slot: Option<(AudioClip, oneshot::Sender<()>)> = None;
    let mut inflight: Option<Inflight> = None;
    let mut ack_active = false;

    loop {
        let step = match inflight.as_mut() {
            Some(active) => tokio::select! {
                res = &mut active.fut => Step::Finished(res),
                cmd = rx.recv() => Step::Cmd(cmd),
            },
            None => Step::Cmd(rx.recv().await),
        };

        match step {
            Step::Cmd(None) => {
                if inflight.is_some() {
                    sink.halt();
                }
                break;
            }

            Step::Cmd(Some(Command::PlayAck { clip, done })) => {
                // A new sequence always preempts whatever was left over
                if inflight.take().is_some() {
                    sink.halt();
                }
                slot = None;

                match clip {
                    Some(clip) if !clip.is_empty() => {
                        inflight = Some(start_clip(&sink, ClipKind::Ack, clip, Some(done)));
                        ack_active = true;
                    }
                    _ => {
                        // Missing ack still completes so the pipeline
                        // is never stalled
                        tracing::debug!("no ack clip, completing immediately");
                        ack_active = false;
                        let _ = done.send(());
                    }
                }
            }

            Step::Cmd(Some(Command::PlayAfterAck { clip, done })) => {
                if ack_active {
                    if slot.is_some() {
                        tracing::warn!("playback slot occupied, replacing queued clip");
                    }
                    slot = Some((clip, done));
                } else {
                    if inflight.take().is_some() {
                        sink.halt();
                    }
                    inflight = Some(start_clip(&sink, ClipKind::Response, clip, Some(done)));
                }
            }

            Step::Cmd(Some(Command::Stop)) => {
                if inflight.take().is_some() {
                    sink.halt();
                }
                slot = None;
                ack_active = false;
            }

            Step::Finished(res) => {
                let Some(finished) = inflight.take() else {
                    continue;
                };
                if let Err(e) = res {
                    tracing::warn!(kind = %finished.kind, error = %e, "clip playback failed");
                }

                match finished.kind {
                    ClipKind::Ack => {
                        ack_active = false;
                        if let Some((clip, done)) = slot.take() {
                            // The chain consumed the ack's completion; its
                            // sender drops unfired
                            inflight =
                                Some(start_clip(&sink, ClipKind::Response, clip, Some(done)));
                        } else if let Some(done) = finished.done {
                            let _ = done.send(());
                        }
                    }
                    ClipKind::Response => {
                        if let Some(done) = finished.done {
                            let _ = done.send(());
                        }
                    }
                }
            }
        }
    }
}
