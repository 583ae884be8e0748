// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Voiceline - Real-time voice-agent core for telephony assistants.
//!
//! Voiceline is the call-time pipeline of a telephony assistant: it turns an
//! unbounded stream of narrowband RTP audio frames into discrete caller
//! utterances, transcribes them, runs a tool-calling LLM turn, synthesizes a
//! spoken reply, and paces that reply back onto the call at a real 20 ms
//! cadence - while letting the caller interrupt the bot mid-reply.
//!
//! SIP signaling, RTP transport framing, the ONNX runtime internals, the
//! neural synthesizer, and configuration-file loading live outside this
//! crate; they plug in through the traits and callback types re-exported
//! from [`prelude`].

pub mod audio;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod prelude;
pub mod sender;
pub mod services;
