// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Voice Activity Detection (VAD) subsystem.
//!
//! [`segmenter::UtteranceSegmenter`] turns the inbound 16 kHz frame stream
//! into discrete utterances; [`silero::SileroVad`] supplies the per-window
//! speech probability behind the [`SpeechDetector`] seam.

pub mod segmenter;
#[cfg(feature = "silero-vad")]
pub mod silero;

use serde::{Deserialize, Serialize};

/// Sample rate the VAD pipeline operates at.
pub const VAD_SAMPLE_RATE: u32 = 16000;

/// Samples per VAD inference window (32 ms at 16 kHz).
pub const VAD_WINDOW_SAMPLES: usize = 512;

/// Bytes per VAD inference window (PCM16).
pub const VAD_WINDOW_BYTES: usize = VAD_WINDOW_SAMPLES * 2;

/// Errors from VAD inference and segmentation.
#[derive(Debug, thiserror::Error)]
pub enum VadError {
    #[error("invalid sample rate: expected {VAD_SAMPLE_RATE} Hz, got {0}")]
    InvalidSampleRate(u32),
    #[error("VAD model unavailable: {0}")]
    Model(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[cfg(feature = "silero-vad")]
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
}

/// Per-window speech probability backend.
///
/// The production implementation is [`silero::SileroVad`]; tests substitute
/// scripted detectors. Implementations own their recurrent state - a
/// detector instance is never shared between segmenters.
pub trait SpeechDetector: Send {
    /// Speech probability in `[0.0, 1.0]` for exactly
    /// [`VAD_WINDOW_SAMPLES`] normalized f32 samples at 16 kHz.
    fn probability(&mut self, window: &[f32]) -> Result<f32, VadError>;

    /// Reset any recurrent model state.
    fn reset(&mut self);
}

/// Segmentation parameters. All durations are wall-clock audio durations;
/// frame-count thresholds are derived from the observed frame length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterParams {
    /// Speech probability at or above which a frame counts as speech.
    pub threshold: f32,
    /// Consecutive speech required to open an utterance.
    pub start_ms: u32,
    /// Consecutive non-speech (hangover) required to close an utterance.
    pub end_ms: u32,
    /// Pre-roll history kept for the utterance head.
    pub pre_speech_ms: u32,
    /// Hard cap on a single utterance.
    pub max_speech_ms: u32,
    /// Reset the detector's recurrent state when an utterance completes.
    /// The reference behavior carries state across the whole call.
    pub reset_model_state_on_completion: bool,
}

impl Default for SegmenterParams {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            start_ms: 500,
            end_ms: 550,
            pre_speech_ms: 1200,
            max_speech_ms: 7000,
            reset_model_state_on_completion: false,
        }
    }
}

/// Why an utterance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceEnd {
    /// The hangover threshold of consecutive non-speech frames was reached.
    SilenceHangover,
    /// The utterance hit the maximum speech length and was truncated.
    MaxLength,
}

/// Events emitted by the segmenter, at most one per pushed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmenterEvent {
    /// An utterance opened; emitted before any utterance byte is buffered
    /// beyond the pre-roll copy.
    SentenceBegin,
    /// An utterance closed with its full byte buffer
    /// (pre-roll + speech + trailing silence up to the hangover).
    SentenceCompleted { bytes: Vec<u8>, end: UtteranceEnd },
}
