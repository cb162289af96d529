//! Audio hardware adapters
//!
//! Capture and output both keep their cpal streams on dedicated threads
//! (streams are not `Send`), exposing thread-safe handles to the rest of
//! the crate.

mod capture;
mod output;

pub use capture::{CaptureHandle, CaptureSource, SAMPLE_RATE, samples_to_wav};
pub use output::CpalSink;
