// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! External AI services behind trait seams: speech recognition, chat
//! completion, and speech synthesis, plus model artifact acquisition.

pub mod llm;
pub mod models;
pub mod stt;
pub mod tts;
