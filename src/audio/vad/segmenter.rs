// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Frame-to-utterance segmentation state machine.
//!
//! [`UtteranceSegmenter`] consumes the inbound 16 kHz PCM16 frame stream and
//! emits [`SegmenterEvent`]s: `SentenceBegin` when sustained speech opens an
//! utterance, `SentenceCompleted` when sustained silence (or the maximum
//! utterance length) closes it. The completed buffer carries the pre-roll
//! audio captured before the start trigger, the speech itself, and the
//! trailing silence up to the hangover threshold.
//!
//! Events are returned synchronously from [`push_frame`]
//! (UtteranceSegmenter::push_frame); callers decide what to dispatch onto
//! other tasks.

use std::time::Instant;

use tracing::{debug, warn};

use crate::audio::codec::PCM16_BYTES_PER_MS_16K;
use crate::audio::ring::PreSpeechRing;
use crate::audio::trigger::ConsecutiveTrigger;
use crate::audio::vad::{
    SegmenterEvent, SegmenterParams, SpeechDetector, UtteranceEnd, VadError, VAD_SAMPLE_RATE,
    VAD_WINDOW_BYTES, VAD_WINDOW_SAMPLES,
};

/// Segmenter states.
///
/// `JustStarted` is a one-frame guard between the start trigger and the
/// append loop: the triggering frame already entered the buffer via the
/// pre-roll copy, so it must not be appended a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    JustStarted,
    InUtterance,
}

/// Converts a 16 kHz mono PCM16 frame stream into utterance events.
///
/// The speech-probability backend sits behind [`SpeechDetector`]; its
/// recurrent state is owned by this segmenter and never shared.
pub struct UtteranceSegmenter {
    params: SegmenterParams,
    detector: Box<dyn SpeechDetector>,
    state: State,
    ring: PreSpeechRing,
    buffer: Vec<u8>,
    utterance_started_at: Option<Instant>,
    start_trigger: ConsecutiveTrigger,
    end_trigger: ConsecutiveTrigger,
    /// Frame length the thresholds were derived from; 0 until the first push.
    frame_len_ms: u32,
}

impl UtteranceSegmenter {
    /// Create a segmenter over the given detector.
    ///
    /// Frame-count thresholds are derived from the first pushed frame's
    /// length (and re-derived if the caller changes it mid-stream).
    pub fn new(detector: Box<dyn SpeechDetector>, params: SegmenterParams) -> Self {
        Self {
            params,
            detector,
            state: State::Idle,
            ring: PreSpeechRing::new(1),
            buffer: Vec::new(),
            utterance_started_at: None,
            start_trigger: ConsecutiveTrigger::new(1),
            end_trigger: ConsecutiveTrigger::new(1),
            frame_len_ms: 0,
        }
    }

    /// Ingest one frame of 16 kHz mono PCM16 audio.
    ///
    /// Frames whose byte count does not match `frame_len_ms` are resized to
    /// the expected count with a warning; odd byte counts are trimmed. At
    /// most one event is returned per push.
    ///
    /// # Errors
    /// [`VadError::InvalidSampleRate`] when `sample_rate` is not 16000, and
    /// any error surfaced by the underlying detector.
    pub fn push_frame(
        &mut self,
        frame: &[u8],
        sample_rate: u32,
        frame_len_ms: u32,
    ) -> Result<Option<SegmenterEvent>, VadError> {
        if sample_rate != VAD_SAMPLE_RATE {
            return Err(VadError::InvalidSampleRate(sample_rate));
        }
        if frame_len_ms != self.frame_len_ms {
            self.reconfigure(frame_len_ms.max(1));
        }

        let frame = self.normalize_frame(frame);
        self.ring.push(frame.clone());

        let is_speech = self.infer_is_speech()?;

        match self.state {
            State::Idle => {
                if self.start_trigger.observe(is_speech) {
                    // Pre-roll (which already contains the triggering frame)
                    // seeds the utterance buffer.
                    self.buffer = self.ring.concat();
                    self.utterance_started_at = Some(Instant::now());
                    self.state = State::JustStarted;
                    self.start_trigger.reset();
                    self.end_trigger.reset();
                    debug!(
                        pre_roll_bytes = self.buffer.len(),
                        "segmenter: utterance opened"
                    );
                    return Ok(Some(SegmenterEvent::SentenceBegin));
                }
                Ok(None)
            }
            State::JustStarted => {
                self.state = State::InUtterance;
                Ok(self.append_and_check(&frame, is_speech))
            }
            State::InUtterance => Ok(self.append_and_check(&frame, is_speech)),
        }
    }

    /// Whether an utterance is currently open.
    pub fn in_utterance(&self) -> bool {
        self.state != State::Idle
    }

    /// Run the detector over the latest 32 ms window from the ring,
    /// zero-padded at the head when history is short.
    fn infer_is_speech(&mut self) -> Result<bool, VadError> {
        let window_bytes = self.ring.latest_bytes(VAD_WINDOW_BYTES);
        let mut samples = Vec::with_capacity(VAD_WINDOW_SAMPLES);
        for chunk in window_bytes.chunks_exact(2) {
            let s = i16::from_le_bytes([chunk[0], chunk[1]]);
            samples.push(s as f32 / 32768.0);
        }
        let probability = self.detector.probability(&samples)?;
        Ok(probability >= self.params.threshold)
    }

    /// Append a frame to the open utterance and evaluate both close
    /// conditions: hangover silence and maximum length.
    fn append_and_check(&mut self, frame: &[u8], is_speech: bool) -> Option<SegmenterEvent> {
        self.buffer.extend_from_slice(frame);

        if self.end_trigger.observe(!is_speech) {
            return Some(self.complete(UtteranceEnd::SilenceHangover));
        }

        let max_bytes = self.params.max_speech_ms as usize * PCM16_BYTES_PER_MS_16K;
        if self.buffer.len() >= max_bytes {
            return Some(self.complete(UtteranceEnd::MaxLength));
        }

        None
    }

    fn complete(&mut self, end: UtteranceEnd) -> SegmenterEvent {
        let bytes = std::mem::take(&mut self.buffer);
        if let Some(started) = self.utterance_started_at.take() {
            debug!(
                bytes = bytes.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                ?end,
                "segmenter: utterance completed"
            );
        }
        self.state = State::Idle;
        self.start_trigger.reset();
        self.end_trigger.reset();
        if self.params.reset_model_state_on_completion {
            self.detector.reset();
        }
        SegmenterEvent::SentenceCompleted { bytes, end }
    }

    /// Derive frame-count thresholds and ring capacity from the frame length.
    fn reconfigure(&mut self, frame_len_ms: u32) {
        if self.frame_len_ms != 0 {
            debug!(
                from_ms = self.frame_len_ms,
                to_ms = frame_len_ms,
                "segmenter: frame length changed, re-deriving thresholds"
            );
        }
        self.frame_len_ms = frame_len_ms;
        self.start_trigger = ConsecutiveTrigger::from_duration(self.params.start_ms, frame_len_ms);
        self.end_trigger = ConsecutiveTrigger::from_duration(self.params.end_ms, frame_len_ms);
        let ring_frames = self.params.pre_speech_ms.div_ceil(frame_len_ms).max(1);
        self.ring = PreSpeechRing::new(ring_frames as usize);
    }

    /// Trim odd byte counts and resize to the byte count the frame length
    /// implies (`frame_len_ms * 32` at 16 kHz PCM16).
    fn normalize_frame(&self, frame: &[u8]) -> Vec<u8> {
        let mut frame = frame.to_vec();
        if frame.len() % 2 != 0 {
            warn!(
                len = frame.len(),
                "segmenter: odd frame byte count, trimming trailing byte"
            );
            frame.pop();
        }

        let expected = self.frame_len_ms as usize * PCM16_BYTES_PER_MS_16K;
        if frame.len() != expected {
            warn!(
                len = frame.len(),
                expected, "segmenter: unexpected frame size, resizing"
            );
            frame.resize(expected, 0);
        }
        frame
    }
}
