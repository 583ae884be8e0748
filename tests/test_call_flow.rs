// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! End-to-end call scenarios over scripted collaborators.
//!
//! These tests drive the public pipeline the way a SIP host would: RTP
//! frames in through the controller, paced frames observed at the injected
//! send action, with the detector, recognizer, synthesizer, and chat
//! endpoint all replaced by scripted stubs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use std::sync::Arc;

use voiceline::audio::codec::{
    is_mulaw_silence, linear_to_mulaw, mulaw_to_linear, pcm_to_wav, MULAW_FRAME_BYTES,
};
use voiceline::audio::vad::segmenter::UtteranceSegmenter;
use voiceline::audio::vad::{SegmenterParams, SpeechDetector, VadError};
use voiceline::config::{ExtensionEntry, LlmConfig, Profile, SttConfig};
use voiceline::conversation::{ConversationController, RtpFrameMeta};
use voiceline::engine::tools::{EndConversationTool, HangupFn, ToolFunction};
use voiceline::engine::TurnEngine;
use voiceline::sender::{PacedSender, SendAction, SenderEvent};
use voiceline::services::llm::{
    ChatClient, ChatCompletionRequest, CompletionMessage, FunctionPayload, LlmError,
    ToolCallPayload,
};
use voiceline::services::stt::{RawSegment, SpeechRecognizer, SttError, SttStreamer};
use voiceline::services::tts::{SpeechSynthesizer, TtsError, TtsStreamer, SYNTH_SAMPLE_RATE};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

/// Speech detector driven by window energy: loud mu-law input reads as
/// speech, generated silence as quiet.
struct EnergyDetector;

impl SpeechDetector for EnergyDetector {
    fn probability(&mut self, window: &[f32]) -> Result<f32, VadError> {
        let mean_abs = window.iter().map(|s| s.abs()).sum::<f32>() / window.len().max(1) as f32;
        Ok(if mean_abs > 0.05 { 0.9 } else { 0.0 })
    }
    fn reset(&mut self) {}
}

/// Recognizer that always yields one fixed transcript segment.
struct FixedRecognizer {
    text: String,
}

#[async_trait]
impl SpeechRecognizer for FixedRecognizer {
    async fn recognize(&self, _pcm: &[u8]) -> Result<Vec<RawSegment>, SttError> {
        Ok(vec![RawSegment {
            text: self.text.clone(),
            start_s: 0.0,
            end_s: 1.0,
        }])
    }
}

/// Synthesizer producing `reply_ms` of constant-amplitude PCM per sentence.
struct SizedSynthesizer {
    reply_ms: u32,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl SpeechSynthesizer for SizedSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, TtsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let samples = (self.reply_ms as usize * SYNTH_SAMPLE_RATE as usize) / 1000;
        Ok((0..samples).flat_map(|_| 8000i16.to_le_bytes()).collect())
    }
}

/// Chat client scripted with a response queue and an optional per-call delay.
struct QueueClient {
    responses: StdMutex<VecDeque<CompletionMessage>>,
    requests: StdMutex<Vec<serde_json::Value>>,
    delay: Duration,
}

impl QueueClient {
    fn with_delay(responses: Vec<CompletionMessage>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: StdMutex::new(responses.into()),
            requests: StdMutex::new(Vec::new()),
            delay,
        })
    }

    fn text(content: &str) -> CompletionMessage {
        CompletionMessage {
            content: Some(content.to_string()),
            tool_calls: None,
        }
    }

    fn tool_call(name: &str, arguments: &str) -> CompletionMessage {
        CompletionMessage {
            content: None,
            tool_calls: Some(vec![ToolCallPayload {
                id: "call_1".into(),
                r#type: Some("function".into()),
                function: FunctionPayload {
                    name: name.into(),
                    arguments: arguments.into(),
                },
            }]),
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatClient for QueueClient {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<CompletionMessage, LlmError> {
        self.requests
            .lock()
            .unwrap()
            .push(serde_json::to_value(request).unwrap());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(LlmError::EmptyResponse)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    controller: Arc<ConversationController>,
    sent: Arc<StdMutex<Vec<Vec<u8>>>>,
    sender_events: tokio::sync::mpsc::UnboundedReceiver<SenderEvent>,
    client: Arc<QueueClient>,
    synth_calls: Arc<AtomicUsize>,
    _workdir: tempfile::TempDir,
}

fn fast_vad_params() -> SegmenterParams {
    SegmenterParams {
        threshold: 0.3,
        start_ms: 60,
        end_ms: 40,
        pre_speech_ms: 100,
        max_speech_ms: 7000,
        reset_model_state_on_completion: false,
    }
}

fn test_profile(workdir: &tempfile::TempDir) -> Profile {
    Profile {
        llm: LlmConfig {
            endpoint: "https://api.example.com/v1".into(),
            api_key: "sk-test".into(),
            model: "gpt-4o-mini".into(),
            max_tokens: 1024,
            temperature: 0.7,
        },
        stt: SttConfig {
            model_path: workdir.path().join("stt.bin"),
            model_url: "https://models.example.com/stt.bin".into(),
        },
        welcome_message: "Hello, how can I help?".into(),
        welcome_audio_path: workdir.path().join("welcome.wav"),
        instructions: "You answer the phone.".into(),
        instructions_addendum: String::new(),
        tool_guidance: String::new(),
        tools: vec!["end_conversation".into(), "transfer_conversation".into()],
        extensions: vec![ExtensionEntry {
            name: "personal".into(),
            number: "102".into(),
            description: "Caleb's line".into(),
            address: "102@slowcasting.com".into(),
        }],
        vad: fast_vad_params(),
    }
}

struct HarnessOptions {
    responses: Vec<CompletionMessage>,
    llm_delay: Duration,
    reply_ms: u32,
    prerender_welcome: bool,
    transcript: &'static str,
    tools: Vec<Arc<dyn ToolFunction>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            responses: Vec::new(),
            llm_delay: Duration::ZERO,
            reply_ms: 200,
            prerender_welcome: true,
            transcript: "What time is it",
            tools: Vec::new(),
        }
    }
}

fn build_harness(options: HarnessOptions) -> Harness {
    init_tracing();
    let workdir = tempfile::tempdir().unwrap();
    let profile = test_profile(&workdir);

    if options.prerender_welcome {
        // 20 ms of low-amplitude welcome audio at the synthesizer rate.
        let samples = SYNTH_SAMPLE_RATE as usize / 50;
        let pcm: Vec<u8> = (0..samples).flat_map(|_| 1000i16.to_le_bytes()).collect();
        std::fs::write(
            &profile.welcome_audio_path,
            pcm_to_wav(&pcm, SYNTH_SAMPLE_RATE),
        )
        .unwrap();
    }

    let sent: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&sent);
    let action: SendAction = Arc::new(move |units, frame| {
        assert_eq!(units, 160);
        assert_eq!(frame.len(), MULAW_FRAME_BYTES);
        sink.lock().unwrap().push(frame.to_vec());
    });
    let sender = Arc::new(PacedSender::new(action));
    let sender_events = sender.take_events().unwrap();

    let segmenter = UtteranceSegmenter::new(Box::new(EnergyDetector), profile.vad.clone());

    let stt = Arc::new(
        SttStreamer::new(Arc::new(FixedRecognizer {
            text: options.transcript.to_string(),
        }))
        .with_timing(
            Duration::from_millis(10),
            Duration::from_secs(2),
            Duration::from_secs(1),
        ),
    );

    let synth_calls = Arc::new(AtomicUsize::new(0));
    let tts = Arc::new(TtsStreamer::new(Arc::new(SizedSynthesizer {
        reply_ms: options.reply_ms,
        calls: Arc::clone(&synth_calls),
    })));

    let client = QueueClient::with_delay(options.responses, options.llm_delay);
    let engine = TurnEngine::new(
        Arc::clone(&client) as Arc<dyn ChatClient>,
        &profile,
        options.tools,
    );

    let controller = ConversationController::new(
        profile,
        segmenter,
        stt,
        engine,
        tts,
        sender,
    );

    Harness {
        controller,
        sent,
        sender_events,
        client,
        synth_calls,
        _workdir: workdir,
    }
}

fn meta(sequence: u16) -> RtpFrameMeta {
    RtpFrameMeta {
        sequence,
        timestamp: sequence as u32 * 160,
        marker: false,
        payload_type: 0,
    }
}

fn speech_frame() -> Vec<u8> {
    vec![linear_to_mulaw(8000); MULAW_FRAME_BYTES]
}

fn silence_frame() -> Vec<u8> {
    vec![linear_to_mulaw(0); MULAW_FRAME_BYTES]
}

/// Feed one spoken utterance: enough speech to trip the start threshold,
/// then enough silence to trip the hangover.
fn feed_utterance(harness: &Harness, seq_base: u16) {
    for i in 0..6 {
        harness
            .controller
            .on_rtp_frame(&meta(seq_base + i), &speech_frame());
    }
    for i in 6..12 {
        harness
            .controller
            .on_rtp_frame(&meta(seq_base + i), &silence_frame());
    }
}

async fn next_completion(harness: &mut Harness, within: Duration) -> Option<SenderEvent> {
    tokio::time::timeout(within, harness.sender_events.recv())
        .await
        .ok()
        .flatten()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Caller connects, stays silent, hangs up: welcome plays to completion
/// with no model call and no synthesis.
#[tokio::test(flavor = "multi_thread")]
async fn greeting_only() {
    let mut harness = build_harness(HarnessOptions::default());
    harness.controller.answer().await.unwrap();

    // 2 s of lead-in silence plus the welcome audio itself.
    let event = next_completion(&mut harness, Duration::from_secs(4)).await;
    assert_eq!(event, Some(SenderEvent::SendingComplete));

    assert_eq!(harness.client.calls(), 0, "no LLM turn without speech");
    assert_eq!(
        harness.synth_calls.load(Ordering::SeqCst),
        0,
        "pre-rendered welcome must not re-synthesize"
    );

    let sent = harness.sent.lock().unwrap();
    assert!(
        sent.iter().any(|f| !is_mulaw_silence(f)),
        "welcome audio reached the wire"
    );
    drop(sent);

    harness.controller.shutdown().await;
    harness.controller.shutdown().await; // idempotent
}

/// One spoken question produces exactly one LLM turn and a spoken reply.
#[tokio::test(flavor = "multi_thread")]
async fn simple_question_and_answer() {
    let mut harness = build_harness(HarnessOptions {
        responses: vec![QueueClient::text("It is noon.")],
        ..Default::default()
    });
    harness.controller.answer().await.unwrap();

    feed_utterance(&harness, 0);

    // First completion: the welcome (still pending) is cut by the reply's
    // buffer reset. Second: the reply finishing on the wire.
    let first = next_completion(&mut harness, Duration::from_secs(2)).await;
    assert_eq!(first, Some(SenderEvent::SendingComplete));
    let second = next_completion(&mut harness, Duration::from_secs(2)).await;
    assert_eq!(second, Some(SenderEvent::SendingComplete));

    assert_eq!(harness.client.calls(), 1);
    assert_eq!(harness.synth_calls.load(Ordering::SeqCst), 1);

    // The transcript reached the model verbatim.
    {
        let requests = harness.client.requests.lock().unwrap();
        let messages = requests[0]["messages"].as_array().unwrap();
        assert!(messages
            .iter()
            .any(|m| m["role"] == "user" && m["content"] == "What time is it"));
    }

    harness.controller.shutdown().await;
}

/// Caller interrupts the bot mid-reply: playback ducks on speech start,
/// then the reply is fully cut and a new turn begins.
#[tokio::test(flavor = "multi_thread")]
async fn barge_in_ducks_then_interrupts() {
    let mut harness = build_harness(HarnessOptions {
        responses: vec![
            QueueClient::text("This is a long answer that keeps playing."),
            QueueClient::text("Sure, go ahead."),
        ],
        reply_ms: 3000,
        ..Default::default()
    });
    harness.controller.answer().await.unwrap();

    // Turn 1.
    feed_utterance(&harness, 0);
    let reset = next_completion(&mut harness, Duration::from_secs(2)).await;
    assert_eq!(reset, Some(SenderEvent::SendingComplete));

    // Let some of the 3 s reply play out.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let frames_before_duck = harness.sent.lock().unwrap().len();

    // Caller starts speaking: ducking, not interruption.
    for i in 100..106 {
        harness.controller.on_rtp_frame(&meta(i), &speech_frame());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let ducked = {
        let sent = harness.sent.lock().unwrap();
        sent[frames_before_duck..]
            .iter()
            .filter(|f| !is_mulaw_silence(f))
            .any(|f| {
                let amplitude = mulaw_to_linear(f[0]).abs();
                (1500..5000).contains(&amplitude)
            })
    };
    assert!(ducked, "playback must be attenuated while the caller speaks");

    // Caller finishes: the transcript cuts the old reply and starts turn 2.
    for i in 106..112 {
        harness.controller.on_rtp_frame(&meta(i), &silence_frame());
    }
    let cut = next_completion(&mut harness, Duration::from_secs(2)).await;
    assert_eq!(cut, Some(SenderEvent::SendingComplete));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.client.calls(), 2, "barge-in starts a fresh turn");

    harness.controller.shutdown().await;
}

/// A transcript arriving while a turn is in flight is dropped, not queued.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_transcript_dropped() {
    let harness = build_harness(HarnessOptions {
        responses: vec![
            QueueClient::text("Slow answer."),
            QueueClient::text("Never spoken."),
        ],
        llm_delay: Duration::from_millis(400),
        ..Default::default()
    });
    harness.controller.answer().await.unwrap();

    feed_utterance(&harness, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Second utterance lands while the first turn is still in the model.
    feed_utterance(&harness, 50);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(
        harness.client.calls(),
        1,
        "transcript during an in-flight turn must be dropped"
    );

    harness.controller.shutdown().await;
}

/// "Goodbye" triggers the end_conversation tool; the injected hang-up
/// fires after the deferral while the farewell is already queued.
#[tokio::test(flavor = "multi_thread")]
async fn tool_invoked_hangup() {
    let hung_up = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&hung_up);
    let hangup: HangupFn = Arc::new(move || flag.store(true, Ordering::SeqCst));
    let end_tool: Arc<dyn ToolFunction> =
        Arc::new(EndConversationTool::new(hangup).with_delay(Duration::from_millis(300)));

    let harness = build_harness(HarnessOptions {
        responses: vec![
            QueueClient::tool_call("end_conversation", r#"{"reason": "user ended call"}"#),
            QueueClient::text("Goodbye!"),
        ],
        transcript: "Goodbye.",
        tools: vec![end_tool],
        ..Default::default()
    });
    harness.controller.answer().await.unwrap();

    feed_utterance(&harness, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !hung_up.load(Ordering::SeqCst),
        "hang-up must wait for the farewell window"
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(hung_up.load(Ordering::SeqCst), "deferred hang-up fired");
    assert_eq!(harness.client.calls(), 2, "tool result fed back to the model");

    harness.controller.shutdown().await;
}

/// A missing welcome file is rendered once and persisted as a WAV.
#[tokio::test(flavor = "multi_thread")]
async fn welcome_audio_rendered_and_persisted() {
    let harness = build_harness(HarnessOptions {
        prerender_welcome: false,
        ..Default::default()
    });
    let path = harness._workdir.path().join("welcome.wav");
    assert!(!path.exists());

    harness.controller.answer().await.unwrap();
    assert!(path.exists(), "welcome WAV persisted at answer");
    assert_eq!(harness.synth_calls.load(Ordering::SeqCst), 1);

    let wav = std::fs::read(&path).unwrap();
    assert_eq!(&wav[0..4], b"RIFF");
    assert_eq!(&wav[8..12], b"WAVE");

    harness.controller.shutdown().await;
}

/// Frames with the wrong payload type or length never reach the VAD.
#[tokio::test(flavor = "multi_thread")]
async fn malformed_rtp_frames_dropped() {
    let harness = build_harness(HarnessOptions::default());
    harness.controller.answer().await.unwrap();

    let bad_pt = RtpFrameMeta {
        payload_type: 8, // PCMA, not PCMU
        ..meta(0)
    };
    for i in 0..20u16 {
        harness.controller.on_rtp_frame(&bad_pt, &speech_frame());
        harness.controller.on_rtp_frame(&meta(i), &vec![0x7Fu8; 60]);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.client.calls(),
        0,
        "malformed frames must not open an utterance"
    );

    harness.controller.shutdown().await;
}
