// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Common re-exports for convenient use of the voiceline pipeline.
//!
//! ```
//! use voiceline::prelude::*;
//! ```

pub use std::sync::Arc;

pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

pub use crate::audio::vad::segmenter::UtteranceSegmenter;
pub use crate::audio::vad::{
    SegmenterEvent, SegmenterParams, SpeechDetector, UtteranceEnd, VadError,
};
pub use crate::config::{ConfigError, ExtensionEntry, Profile};
pub use crate::conversation::{CallError, ConversationController, RtpFrameMeta};
pub use crate::engine::tools::{
    EndConversationTool, HangupFn, ScheduleFollowupTool, SendNotificationTool, SmsFn,
    ToolFunction, ToolParam, TransferConversationTool, TransferFn,
};
pub use crate::engine::{ChatTurn, TurnEngine};
pub use crate::sender::{FrameFilter, PacedSender, SendAction, SenderEvent};
pub use crate::services::llm::{ChatClient, LlmError, OpenAiChatClient};
pub use crate::services::models::{ModelError, ModelManager};
pub use crate::services::stt::{RawSegment, SpeechRecognizer, SttError, SttEvent, SttStreamer};
pub use crate::services::tts::{SpeechSynthesizer, TtsError, TtsStreamer};

#[cfg(feature = "silero-vad")]
pub use crate::audio::vad::silero::SileroVad;
