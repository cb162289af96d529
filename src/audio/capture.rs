//! Audio capture from the microphone
//!
//! A dedicated thread owns the cpal input stream; [`CaptureHandle`] is the
//! `Send + Sync` face the spotter and speech engine share. Samples accumulate
//! in a shared buffer until taken.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

enum CaptureCmd {
    Start,
    Stop,
    Shutdown,
}

/// Thread-safe handle to the capture thread
pub struct CaptureHandle {
    cmd_tx: std_mpsc::Sender<CaptureCmd>,
    buffer: Arc<Mutex<Vec<f32>>>,
    capturing: Arc<AtomicBool>,
}

impl CaptureHandle {
    /// Spawn the capture thread and open the default input device.
    ///
    /// # Errors
    ///
    /// Returns error if no input device is available or no suitable
    /// configuration exists.
    pub fn spawn() -> Result<Self> {
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (init_tx, init_rx) = std_mpsc::channel();
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let capturing = Arc::new(AtomicBool::new(false));

        let thread_buffer = Arc::clone(&buffer);
        let thread_capturing = Arc::clone(&capturing);
        std::thread::Builder::new()
            .name("vigil-capture".to_string())
            .spawn(move || {
                capture_thread(&cmd_rx, &init_tx, &thread_buffer, &thread_capturing);
            })
            .map_err(|e| Error::Audio(format!("capture thread spawn failed: {e}")))?;

        // The thread validates the device before the handle is returned
        init_rx
            .recv()
            .map_err(|_| Error::Audio("capture thread exited during init".to_string()))??;

        Ok(Self {
            cmd_tx,
            buffer,
            capturing,
        })
    }

    /// Start the input stream. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if the capture thread has exited.
    pub fn start(&self) -> Result<()> {
        self.cmd_tx
            .send(CaptureCmd::Start)
            .map_err(|_| Error::Audio("capture thread gone".to_string()))
    }

    /// Stop the input stream, releasing the hardware device. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if the capture thread has exited.
    pub fn stop(&self) -> Result<()> {
        self.cmd_tx
            .send(CaptureCmd::Stop)
            .map_err(|_| Error::Audio("capture thread gone".to_string()))
    }

    /// Whether the input stream is currently open
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Take the samples captured since the last call, clearing the buffer
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Clear the sample buffer
    pub fn clear_buffer(&self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(CaptureCmd::Shutdown);
    }
}

/// The shared microphone stream the spotter and the speech engine read.
/// Abstracting the hardware handle keeps both consumers testable without
/// an input device.
pub trait CaptureSource: Send + Sync {
    /// Open the input stream. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be opened.
    fn start(&self) -> Result<()>;

    /// Close the input stream, releasing the hardware device. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be closed.
    fn stop(&self) -> Result<()>;

    /// Take the samples captured since the last call, clearing the buffer.
    fn take_buffer(&self) -> Vec<f32>;

    /// Drop any buffered samples.
    fn clear_buffer(&self);
}

impl CaptureSource for CaptureHandle {
    fn start(&self) -> Result<()> {
        Self::start(self)
    }

    fn stop(&self) -> Result<()> {
        Self::stop(self)
    }

    fn take_buffer(&self) -> Vec<f32> {
        Self::take_buffer(self)
    }

    fn clear_buffer(&self) {
        Self::clear_buffer(self);
    }
}

fn build_input_config() -> Result<(cpal::Device, StreamConfig)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::Audio("no suitable input config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    Ok((device, config))
}

fn capture_thread(
    cmd_rx: &std_mpsc::Receiver<CaptureCmd>,
    init_tx: &std_mpsc::Sender<Result<()>>,
    buffer: &Arc<Mutex<Vec<f32>>>,
    capturing: &Arc<AtomicBool>,
) {
    let (device, config) = match build_input_config() {
        Ok(pair) => {
            let _ = init_tx.send(Ok(()));
            pair
        }
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    // The stream lives only on this thread
    let mut stream: Option<cpal::Stream> = None;

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            CaptureCmd::Start => {
                if stream.is_some() {
                    continue;
                }
                let sink = Arc::clone(buffer);
                let built = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if let Ok(mut buf) = sink.lock() {
                            buf.extend_from_slice(data);
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio capture error");
                    },
                    None,
                );
                match built {
                    Ok(s) => {
                        if let Err(e) = s.play() {
                            tracing::error!(error = %e, "failed to start input stream");
                            continue;
                        }
                        stream = Some(s);
                        capturing.store(true, Ordering::SeqCst);
                        tracing::debug!("audio capture started");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to open input stream");
                    }
                }
            }
            CaptureCmd::Stop => {
                if stream.take().is_some() {
                    capturing.store(false, Ordering::SeqCst);
                    tracing::debug!("audio capture stopped");
                }
            }
            CaptureCmd::Shutdown => break,
        }
    }

    drop(stream);
    capturing.store(false, Ordering::SeqCst);
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
