//! Audio playback to speakers
//!
//! [`CpalSink`] decodes MP3 or WAV clips and plays them on the default
//! output device. The cpal stream is created inside a blocking task so it
//! never crosses threads; `halt` works through a generation counter so a
//! superseded clip stops even though its blocking task is detached.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::playback::{AudioClip, AudioSink};
use crate::{Error, Result};

/// Poll interval while waiting for a clip to finish
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Plays encoded clips to the default output device
pub struct CpalSink {
    generation: Arc<AtomicU64>,
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalSink {
    /// Create a new sink
    #[must_use]
    pub fn new() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, clip: AudioClip) -> Result<()> {
        // Bumping the generation silences any clip still draining
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.generation);

        tokio::task::spawn_blocking(move || {
            let (samples, sample_rate) = decode_clip(&clip.bytes)?;
            play_samples_blocking(&samples, sample_rate, &generation, my_generation)
        })
        .await
        .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?
    }

    fn halt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Decode a clip to mono f32 samples, sniffing the container format
fn decode_clip(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    if bytes.is_empty() {
        return Ok((Vec::new(), 16000));
    }
    if bytes.len() >= 4 && &bytes[0..4] == b"RIFF" {
        decode_wav(bytes)
    } else {
        decode_mp3(bytes)
    }
}

/// Decode WAV bytes to mono f32 samples
#[allow(clippy::cast_precision_loss)]
fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|v| f32::from(v) / 32768.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok((samples, spec.sample_rate))
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut sample_rate = 24000;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate.max(1)).unwrap_or(24000);
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, sample_rate))
}

fn find_output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let exact = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            (c.channels() == 1 || c.channels() == 2)
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        });

    if let Some(config) = exact {
        return Ok(config.with_sample_rate(SampleRate(sample_rate)).config());
    }

    // Fall back to the device default; pitch will be off but audible
    tracing::warn!(sample_rate, "no output config at clip rate, using device default");
    let default = device
        .default_output_config()
        .map_err(|e| Error::Audio(e.to_string()))?;
    Ok(default.config())
}

#[allow(clippy::significant_drop_tightening)]
fn play_samples_blocking(
    samples: &[f32],
    sample_rate: u32,
    generation: &Arc<AtomicU64>,
    my_generation: u64,
) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;
    let config = find_output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);

    let shared: Arc<Mutex<(Vec<f32>, usize, bool)>> =
        Arc::new(Mutex::new((samples.to_vec(), 0, false)));
    let in_callback = Arc::clone(&shared);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut guard) = in_callback.lock() else {
                    return;
                };
                let (buf, pos, finished) = &mut *guard;
                for frame in data.chunks_mut(channels) {
                    let sample = if *pos < buf.len() {
                        let s = buf[*pos];
                        *pos += 1;
                        s
                    } else {
                        *finished = true;
                        0.0
                    };
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let duration_ms = u64::try_from(samples.len())
        .unwrap_or(u64::MAX)
        .saturating_mul(1000)
        / u64::from(sample_rate.max(1));
    let deadline = std::time::Instant::now() + Duration::from_millis(duration_ms + 500);

    loop {
        if generation.load(Ordering::SeqCst) != my_generation {
            tracing::debug!("clip superseded, halting playback");
            break;
        }
        let finished = shared.lock().map(|guard| guard.2).unwrap_or(true);
        if finished || std::time::Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    drop(stream);
    tracing::debug!(samples = samples.len(), "playback complete");
    Ok(())
}
