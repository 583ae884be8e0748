// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Streaming speech-to-text aggregation.
//!
//! [`SttStreamer`] feeds utterance audio to a [`SpeechRecognizer`], filters
//! out non-speakable annotation segments, and aggregates the remainder into
//! a single settled transcript: after each recognition batch it waits a
//! short settling interval, then joins every segment processed within the
//! cutoff window and emits [`SttEvent::TranscriptionComplete`].
//!
//! Non-speakable segments are recognizer annotations rather than caller
//! speech: after trimming, text that is empty or entirely wrapped in
//! square brackets or parentheses (`[BLANK_AUDIO]`, `(coughs)`).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SttConfig;
use crate::services::models::{ModelError, ModelManager};

/// Errors from speech recognition.
#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("recognition failed: {0}")]
    Recognition(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// A raw recognizer segment with time offsets into the utterance.
#[derive(Debug, Clone)]
pub struct RawSegment {
    pub text: String,
    pub start_s: f32,
    pub end_s: f32,
}

/// Speech recognition backend seam.
///
/// The production implementation wraps the downloaded acoustic model; tests
/// substitute scripted recognizers. Implementations serialize their own
/// inference - the streamer never issues overlapping calls for one stream.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Recognize one utterance of 16 kHz mono PCM16 audio.
    async fn recognize(&self, pcm16_16k: &[u8]) -> Result<Vec<RawSegment>, SttError>;
}

/// Events emitted by the STT streamer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// A settled transcript, trimmed, with segments joined by single spaces.
    TranscriptionComplete(String),
}

/// A speakable segment queued for aggregation.
#[derive(Debug, Clone)]
struct QueuedSegment {
    text: String,
    start_s: f32,
    end_s: f32,
    processed_at: Instant,
}

/// Aggregates recognizer output into settled transcripts.
pub struct SttStreamer {
    recognizer: Arc<dyn SpeechRecognizer>,
    segments: Mutex<VecDeque<QueuedSegment>>,
    events_tx: mpsc::UnboundedSender<SttEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SttEvent>>>,
    /// Delay between enqueueing a batch and running the settling check.
    settle_delay: Duration,
    /// Only segments processed within this window join the transcript.
    settle_window: Duration,
    /// How long [`wait_for_transcription`](Self::wait_for_transcription)
    /// blocks for the next completion event.
    wait_timeout: Duration,
}

impl SttStreamer {
    /// Create a streamer over the given recognizer with the standard
    /// timing: 100 ms settling delay, 2 s settling window, 10 s wait.
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            recognizer,
            segments: Mutex::new(VecDeque::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            settle_delay: Duration::from_millis(100),
            settle_window: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(10),
        }
    }

    /// Override the aggregation timing. Intended for tests.
    pub fn with_timing(
        mut self,
        settle_delay: Duration,
        settle_window: Duration,
        wait_timeout: Duration,
    ) -> Self {
        self.settle_delay = settle_delay;
        self.settle_window = settle_window;
        self.wait_timeout = wait_timeout;
        self
    }

    /// Take the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SttEvent>> {
        self.events_rx.lock().expect("events_rx lock poisoned").take()
    }

    /// Resolve the acoustic model file for recognizer construction,
    /// downloading it to the configured path when absent.
    pub async fn ensure_model(config: &SttConfig) -> Result<std::path::PathBuf, ModelError> {
        ModelManager::ensure(&config.model_path, &config.model_url).await
    }

    /// Recognize one utterance and run the settling check.
    ///
    /// Every speakable segment is enqueued with a wall-clock processing
    /// stamp; after the settling delay, all segments inside the settling
    /// window are joined and emitted as one
    /// [`SttEvent::TranscriptionComplete`]. Older segments are discarded.
    pub async fn process_audio_chunk(&self, pcm16_16k: &[u8]) -> Result<(), SttError> {
        let raw = self.recognizer.recognize(pcm16_16k).await?;

        let mut enqueued = 0usize;
        {
            let mut segments = self.segments.lock().expect("segments lock poisoned");
            for segment in raw {
                let text = segment.text.trim();
                if !is_speakable(text) {
                    debug!(text = %segment.text, "stt: dropping non-speakable segment");
                    continue;
                }
                segments.push_back(QueuedSegment {
                    text: text.to_string(),
                    start_s: segment.start_s,
                    end_s: segment.end_s,
                    processed_at: Instant::now(),
                });
                enqueued += 1;
            }
        }
        debug!(enqueued, "stt: recognition batch enqueued");

        tokio::time::sleep(self.settle_delay).await;
        self.settle();
        Ok(())
    }

    /// Wait for the next settled transcript.
    ///
    /// On timeout, falls back to joining whatever segments were processed
    /// within the last `wait_timeout` window; returns `None` when even the
    /// fallback is empty.
    pub async fn wait_for_transcription(
        &self,
        events: &mut mpsc::UnboundedReceiver<SttEvent>,
    ) -> Option<String> {
        match tokio::time::timeout(self.wait_timeout, events.recv()).await {
            Ok(Some(SttEvent::TranscriptionComplete(text))) => Some(text),
            Ok(None) => None,
            Err(_) => {
                warn!("stt: timed out waiting for transcription, using recent segments");
                let cutoff = Instant::now().checked_sub(self.wait_timeout);
                let segments = self.segments.lock().expect("segments lock poisoned");
                let recent: Vec<&str> = segments
                    .iter()
                    .filter(|s| cutoff.is_none_or(|c| s.processed_at >= c))
                    .map(|s| s.text.as_str())
                    .collect();
                if recent.is_empty() {
                    None
                } else {
                    Some(recent.join(" "))
                }
            }
        }
    }

    /// Drain the queue; segments inside the settling window become the
    /// transcript, older ones are dropped.
    fn settle(&self) {
        let cutoff = Instant::now().checked_sub(self.settle_window);
        let mut kept: Vec<QueuedSegment> = Vec::new();
        let mut discarded = 0usize;
        {
            let mut segments = self.segments.lock().expect("segments lock poisoned");
            while let Some(segment) = segments.pop_front() {
                if cutoff.is_none_or(|c| segment.processed_at >= c) {
                    kept.push(segment);
                } else {
                    discarded += 1;
                }
            }
        }
        if discarded > 0 {
            debug!(discarded, "stt: discarded stale segments");
        }
        if kept.is_empty() {
            return;
        }

        let text = kept
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(
            segments = kept.len(),
            span_s = kept.last().map(|s| s.end_s - kept[0].start_s).unwrap_or(0.0),
            "stt: transcript settled"
        );
        let _ = self
            .events_tx
            .send(SttEvent::TranscriptionComplete(text));
    }
}

/// Whether a trimmed segment is caller speech rather than an annotation.
fn is_speakable(trimmed: &str) -> bool {
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        return false;
    }
    if trimmed.starts_with('(') && trimmed.ends_with(')') {
        return false;
    }
    true
}
