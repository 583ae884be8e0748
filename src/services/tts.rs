// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Streaming text-to-speech with first-sentence priority.
//!
//! [`TtsStreamer`] splits reply text into sentences, synthesizes the first
//! sentence synchronously so the caller hears audio as soon as possible,
//! and runs the remaining sentences through a bounded worker pool whose
//! outputs are yielded in original sentence order to preserve prosody.
//!
//! Each synthesized sentence (22050 Hz mono PCM16) is resampled to the
//! 8 kHz wire rate and mu-law encoded before it is handed to the sender.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::codec::{pcm_to_mulaw, resample_linear, strip_wav_header};

/// Sample rate produced by the synthesizer backend.
pub const SYNTH_SAMPLE_RATE: u32 = 22050;

/// Telephony wire sample rate.
pub const WIRE_SAMPLE_RATE: u32 = 8000;

/// Bounded concurrency for sentences after the first.
pub const SENTENCE_CONCURRENCY: usize = 3;

/// Errors from speech synthesis.
#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("synthesis failed: {0}")]
    Synthesis(String),
}

/// Neural synthesizer seam.
///
/// Returns mono PCM16 at [`SYNTH_SAMPLE_RATE`]; a WAV envelope around the
/// samples is tolerated and stripped. Tests substitute scripted
/// synthesizers.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError>;
}

/// Sentence-parallel TTS streamer.
pub struct TtsStreamer {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    concurrency: usize,
}

impl TtsStreamer {
    /// Create a streamer over the given synthesizer.
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            synthesizer,
            concurrency: SENTENCE_CONCURRENCY,
        }
    }

    /// The underlying synthesizer (used to render the welcome message).
    pub fn synthesizer(&self) -> Arc<dyn SpeechSynthesizer> {
        Arc::clone(&self.synthesizer)
    }

    /// Stream `text` as mu-law 8 kHz chunks, one chunk per sentence.
    ///
    /// The first sentence is synthesized before this method returns and its
    /// chunk is already buffered in the channel; the rest are synthesized
    /// on a pool of [`SENTENCE_CONCURRENCY`] workers but yielded in
    /// original order. A sentence that fails to synthesize is dropped and
    /// the stream continues. Empty input yields a closed, empty channel.
    ///
    /// Cancelling `cancel` stops the stream between sentences; chunks
    /// already yielded stay valid.
    pub async fn stream(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return rx;
        }
        debug!(sentences = sentences.len(), "tts: streaming reply");

        // First sentence ahead of any parallel work.
        if cancel.is_cancelled() {
            return rx;
        }
        match self.synthesizer.synthesize(&sentences[0]).await {
            Ok(pcm) => {
                if cancel.is_cancelled() {
                    return rx;
                }
                let chunk = encode_for_wire(&pcm);
                if !chunk.is_empty() {
                    let _ = tx.send(chunk);
                }
            }
            Err(e) => warn!("tts: first sentence synthesis failed ({e}), dropping sentence"),
        }

        let rest: Vec<String> = sentences[1..].to_vec();
        if rest.is_empty() {
            return rx;
        }

        let synthesizer = Arc::clone(&self.synthesizer);
        let concurrency = self.concurrency;
        tokio::spawn(async move {
            // `buffered` bounds concurrency while preserving input order.
            let mut results = stream::iter(rest.into_iter().map(|sentence| {
                let synthesizer = Arc::clone(&synthesizer);
                async move { synthesizer.synthesize(&sentence).await }
            }))
            .buffered(concurrency);

            while let Some(result) = results.next().await {
                if cancel.is_cancelled() {
                    debug!("tts: stream cancelled");
                    break;
                }
                match result {
                    Ok(pcm) => {
                        let chunk = encode_for_wire(&pcm);
                        if !chunk.is_empty() && tx.send(chunk).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("tts: sentence synthesis failed ({e}), dropping sentence");
                    }
                }
            }
        });

        rx
    }
}

/// Resample synthesized PCM to the wire rate and mu-law encode it.
fn encode_for_wire(pcm_22k: &[u8]) -> Vec<u8> {
    let pcm = strip_wav_header(pcm_22k);
    let resampled = resample_linear(pcm, SYNTH_SAMPLE_RATE, WIRE_SAMPLE_RATE);
    pcm_to_mulaw(&resampled)
}

/// Split text into sentences at `.`, `!`, `?` followed by whitespace.
///
/// A `.` does not end a sentence when the word before it is a single
/// letter - this keeps initials (`A. Smith`) and dotted abbreviations
/// (`e.g.`) inside one sentence. Trailing text without terminal
/// punctuation forms the final sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;

    for i in 0..chars.len() {
        let c = chars[i];
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let followed_by_whitespace = chars.get(i + 1).is_some_and(|n| n.is_whitespace());
        if !followed_by_whitespace {
            continue;
        }
        if c == '.' && preceded_by_single_letter(&chars, i) {
            continue;
        }

        let sentence: String = chars[start..=i].iter().collect();
        let trimmed = sentence.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
        start = i + 1;
    }

    let rest: String = chars[start..].iter().collect();
    let trimmed = rest.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Whether the alphanumeric run ending at `dot_index` is one alphabetic
/// character (an initial, or the last letter of a dotted abbreviation).
fn preceded_by_single_letter(chars: &[char], dot_index: usize) -> bool {
    let mut j = dot_index;
    let mut run = 0usize;
    while j > 0 && chars[j - 1].is_alphanumeric() {
        j -= 1;
        run += 1;
        if run > 1 {
            return false;
        }
    }
    run == 1 && chars[j].is_alphabetic()
}
