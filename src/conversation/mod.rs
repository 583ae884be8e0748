// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Conversation controller: turn-taking with barge-in.
//!
//! [`ConversationController`] wires the call pipeline together. Inbound RTP
//! frames are decoded, resampled, and pushed into the VAD segmenter; caller
//! speech ducks any in-progress bot playback; completed utterances flow to
//! STT; settled transcripts drive one LLM turn at a time whose reply is
//! streamed through TTS into the paced sender - fully interrupting the
//! previous reply. The controller subscribes to the STT event channel once
//! at answer time and owns a single cancellation token per turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::codec::{
    mulaw_silence, mulaw_to_pcm, pcm_to_mulaw, pcm_to_wav, resample_linear, scale_mulaw,
    strip_wav_header, MULAW_FRAME_BYTES,
};
use crate::audio::vad::segmenter::UtteranceSegmenter;
use crate::audio::vad::{SegmenterEvent, VadError, VAD_SAMPLE_RATE};
use crate::config::{ConfigError, Profile};
use crate::engine::TurnEngine;
use crate::sender::PacedSender;
use crate::services::stt::{SttEvent, SttStreamer};
use crate::services::tts::{TtsError, TtsStreamer, SYNTH_SAMPLE_RATE, WIRE_SAMPLE_RATE};

/// RTP payload type for PCMU; anything else is dropped.
const PCMU_PAYLOAD_TYPE: u8 = 0;

/// Inbound frame duration.
const FRAME_MS: u32 = 20;

/// Gain applied to bot playback while the caller is speaking.
const DUCK_GAIN: f32 = 0.35;

/// Silence prefixed to the welcome audio so PSTN path setup does not clip
/// the first syllable.
const WELCOME_SILENCE_MS: u32 = 2000;

/// Errors surfaced while answering or running a call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vad(#[from] VadError),
    #[error(transparent)]
    Tts(#[from] TtsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// RTP metadata accompanying each inbound frame.
#[derive(Debug, Clone, Copy)]
pub struct RtpFrameMeta {
    pub sequence: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload_type: u8,
}

/// Orchestrates VAD, STT, the turn engine, TTS, and the paced sender for
/// one call.
pub struct ConversationController {
    profile: Profile,
    segmenter: Mutex<UtteranceSegmenter>,
    stt: Arc<SttStreamer>,
    engine: Arc<tokio::sync::Mutex<TurnEngine>>,
    tts: Arc<TtsStreamer>,
    sender: Arc<PacedSender>,
    /// True while an LLM turn (and its TTS hand-off) is in flight;
    /// transcripts arriving meanwhile are dropped, not queued.
    is_processing_transcription: tokio::sync::Mutex<bool>,
    volume_filter_active: AtomicBool,
    /// Cancellation for the current turn's TTS stream; replaced per turn.
    turn_cancel: Mutex<CancellationToken>,
    shutdown_token: CancellationToken,
    shutdown_done: AtomicBool,
    stt_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationController {
    /// Assemble a controller over already-constructed components.
    pub fn new(
        profile: Profile,
        segmenter: UtteranceSegmenter,
        stt: Arc<SttStreamer>,
        engine: TurnEngine,
        tts: Arc<TtsStreamer>,
        sender: Arc<PacedSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            profile,
            segmenter: Mutex::new(segmenter),
            stt,
            engine: Arc::new(tokio::sync::Mutex::new(engine)),
            tts,
            sender,
            is_processing_transcription: tokio::sync::Mutex::new(false),
            volume_filter_active: AtomicBool::new(false),
            turn_cancel: Mutex::new(CancellationToken::new()),
            shutdown_token: CancellationToken::new(),
            shutdown_done: AtomicBool::new(false),
            stt_task: Mutex::new(None),
        })
    }

    /// Answer the call: seed the welcome turn, queue the welcome audio
    /// behind a silence lead-in, start the sender, and subscribe to STT
    /// events.
    pub async fn answer(self: &Arc<Self>) -> Result<(), CallError> {
        info!("answering call");
        self.engine
            .lock()
            .await
            .add_assistant_message(self.profile.welcome_message.clone());

        let welcome = self.ensure_welcome_audio().await?;
        self.sender.enqueue_chunk(&mulaw_silence(WELCOME_SILENCE_MS));
        self.sender.enqueue_chunk(&welcome);
        self.sender.start().await;

        if let Some(events) = self.stt.take_events() {
            let controller = Arc::clone(self);
            let handle = tokio::spawn(async move {
                controller.run_stt_events(events).await;
            });
            *self.stt_task.lock().expect("stt_task lock poisoned") = Some(handle);
        }
        Ok(())
    }

    /// Ingest one inbound RTP frame.
    ///
    /// Frames with a payload type other than PCMU or a length other than
    /// [`MULAW_FRAME_BYTES`] are dropped. Must be called from within the
    /// tokio runtime; VAD segmentation runs inline on the caller's task.
    pub fn on_rtp_frame(self: &Arc<Self>, meta: &RtpFrameMeta, payload: &[u8]) {
        if self.shutdown_done.load(Ordering::Acquire) {
            return;
        }
        if meta.payload_type != PCMU_PAYLOAD_TYPE {
            debug!(
                payload_type = meta.payload_type,
                sequence = meta.sequence,
                "dropping non-PCMU frame"
            );
            return;
        }
        if payload.len() != MULAW_FRAME_BYTES {
            warn!(
                len = payload.len(),
                sequence = meta.sequence,
                "dropping RTP frame with unexpected length"
            );
            return;
        }

        let pcm_8k = mulaw_to_pcm(payload);
        let pcm_16k = resample_linear(&pcm_8k, WIRE_SAMPLE_RATE, VAD_SAMPLE_RATE);

        let event = {
            let mut segmenter = self.segmenter.lock().expect("segmenter lock poisoned");
            match segmenter.push_frame(&pcm_16k, VAD_SAMPLE_RATE, FRAME_MS) {
                Ok(event) => event,
                Err(e) => {
                    warn!("VAD push failed: {e}");
                    return;
                }
            }
        };

        match event {
            Some(SegmenterEvent::SentenceBegin) => self.on_sentence_begin(),
            Some(SegmenterEvent::SentenceCompleted { bytes, .. }) => {
                self.on_sentence_completed(bytes)
            }
            None => {}
        }
    }

    /// Caller started speaking: duck the bot without interrupting it yet.
    fn on_sentence_begin(&self) {
        debug!("caller speech started");
        if self.sender.is_playing() && !self.volume_filter_active.swap(true, Ordering::AcqRel) {
            debug!("ducking bot playback");
            self.sender
                .apply_filter(Arc::new(|frame| Ok(scale_mulaw(frame, DUCK_GAIN))));
        }
    }

    /// Caller finished an utterance: undo ducking and hand the audio to STT.
    fn on_sentence_completed(self: &Arc<Self>, bytes: Vec<u8>) {
        debug!(bytes = bytes.len(), "caller utterance completed");
        if self.volume_filter_active.swap(false, Ordering::AcqRel) {
            self.sender.clear_filter();
        }

        let stt = Arc::clone(&self.stt);
        tokio::spawn(async move {
            if let Err(e) = stt.process_audio_chunk(&bytes).await {
                warn!("STT processing failed: {e}");
            }
        });
    }

    /// Consume STT events until shutdown. Each transcript is handled on its
    /// own task so that transcripts arriving during an in-flight turn hit
    /// the processing guard and are dropped rather than queued.
    async fn run_stt_events(
        self: Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<SttEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                event = events.recv() => match event {
                    Some(SttEvent::TranscriptionComplete(text)) => {
                        let controller = Arc::clone(&self);
                        tokio::spawn(async move {
                            controller.handle_transcription(text).await;
                        });
                    }
                    None => break,
                },
            }
        }
        debug!("STT event loop finished");
    }

    /// Run one full turn: LLM, interrupt playback, stream TTS.
    async fn handle_transcription(self: Arc<Self>, text: String) {
        {
            let mut processing = self.is_processing_transcription.lock().await;
            if *processing {
                warn!(text = %text, "turn already in flight, dropping transcript");
                return;
            }
            *processing = true;
        }

        info!(text = %text, "processing transcription");
        let response = self.engine.lock().await.process_message(&text).await;
        debug!(response = %response, "assistant reply ready");

        // The reply is ready: fully interrupt whatever is still playing.
        self.sender.reset_buffer();

        let cancel = {
            let mut slot = self.turn_cancel.lock().expect("turn_cancel lock poisoned");
            slot.cancel();
            let fresh = CancellationToken::new();
            *slot = fresh.clone();
            fresh
        };

        let mut chunks = self.tts.stream(&response, cancel).await;
        while let Some(chunk) = chunks.recv().await {
            self.sender.enqueue_chunk(&chunk);
        }

        *self.is_processing_transcription.lock().await = false;
    }

    /// Load the welcome audio, rendering and persisting it on first use.
    ///
    /// Returns the mu-law 8 kHz payload ready for the sender. The WAV on
    /// disk is mono PCM16 at the synthesizer rate.
    async fn ensure_welcome_audio(&self) -> Result<Vec<u8>, CallError> {
        let path = &self.profile.welcome_audio_path;
        let pcm = if path.exists() {
            let wav = tokio::fs::read(path).await?;
            strip_wav_header(&wav).to_vec()
        } else {
            info!(path = %path.display(), "rendering welcome audio");
            let pcm = self
                .tts
                .synthesizer()
                .synthesize(&self.profile.welcome_message)
                .await?;
            let pcm = strip_wav_header(&pcm).to_vec();
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            tokio::fs::write(path, pcm_to_wav(&pcm, SYNTH_SAMPLE_RATE)).await?;
            pcm
        };

        let resampled = resample_linear(&pcm, SYNTH_SAMPLE_RATE, WIRE_SAMPLE_RATE);
        Ok(pcm_to_mulaw(&resampled))
    }

    /// Tear the call down. Safe to call any number of times.
    pub async fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down conversation");
        self.turn_cancel
            .lock()
            .expect("turn_cancel lock poisoned")
            .cancel();
        self.shutdown_token.cancel();
        self.sender.stop().await;
        let stt_task = self.stt_task.lock().expect("stt_task lock poisoned").take();
        if let Some(handle) = stt_task {
            if let Err(e) = handle.await {
                warn!("STT event task join error: {e}");
            }
        }
    }
}
