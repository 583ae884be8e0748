// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Immutable call-profile configuration.
//!
//! Loading (files, CLI) happens outside this crate; the loaded [`Profile`]
//! is passed by reference into each component's constructor and never read
//! from a process-wide slot after startup. [`Profile::validate`] is the
//! startup gate: a profile that fails validation must abort before any
//! call is answered.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::audio::vad::SegmenterParams;

/// Errors for invalid configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration field: {0}")]
    MissingField(&'static str),
}

/// LLM endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat-completion API.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_max_tokens() -> u64 {
    1024
}

fn default_temperature() -> f64 {
    0.7
}

/// STT model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Local path the model is opened from (and downloaded to).
    pub model_path: PathBuf,
    /// Download URL used when the model file is absent.
    pub model_url: String,
}

/// A transfer target the caller can be handed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionEntry {
    /// Alias the LLM refers to (e.g. "personal").
    pub name: String,
    /// Human-facing extension number.
    pub number: String,
    pub description: String,
    /// Full SIP address the transfer sink receives.
    pub address: String,
}

/// One bot profile: everything the conversation core needs for a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub llm: LlmConfig,
    pub stt: SttConfig,
    /// Spoken as-is when the call is answered, without a model call.
    pub welcome_message: String,
    /// WAV file the rendered welcome message is persisted to.
    pub welcome_audio_path: PathBuf,
    pub instructions: String,
    #[serde(default)]
    pub instructions_addendum: String,
    /// Tool usage guidance; the literal `{extensions}` token is replaced
    /// with the rendered extensions list.
    #[serde(default)]
    pub tool_guidance: String,
    /// Names of the tool functions enabled for this profile.
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<ExtensionEntry>,
    #[serde(default)]
    pub vad: SegmenterParams,
}

fn default_tools() -> Vec<String> {
    vec![
        "send_notification".to_string(),
        "transfer_conversation".to_string(),
        "end_conversation".to_string(),
        "schedule_followup".to_string(),
    ]
}

impl Profile {
    /// Check the fields without which a call cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.endpoint.is_empty() {
            return Err(ConfigError::MissingField("llm.endpoint"));
        }
        if self.llm.api_key.is_empty() {
            return Err(ConfigError::MissingField("llm.api_key"));
        }
        if self.llm.model.is_empty() {
            return Err(ConfigError::MissingField("llm.model"));
        }
        if self.stt.model_url.is_empty() && !self.stt.model_path.exists() {
            return Err(ConfigError::MissingField("stt.model_url"));
        }
        Ok(())
    }

    /// Whether a tool function is enabled for this profile.
    pub fn is_tool_enabled(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t == name)
    }

    /// Alias-to-address mapping for the transfer tool.
    pub fn extension_map(&self) -> std::collections::HashMap<String, String> {
        self.extensions
            .iter()
            .map(|e| (e.name.clone(), e.address.clone()))
            .collect()
    }
}

/// Resolve the active profile name: CLI value first, then the
/// `BOT_PROFILE` environment variable.
pub fn profile_name_from_env(cli: Option<String>) -> Option<String> {
    cli.or_else(|| std::env::var("BOT_PROFILE").ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_profile() -> Profile {
        Profile {
            llm: LlmConfig {
                endpoint: "https://api.example.com/v1".into(),
                api_key: "sk-test".into(),
                model: "gpt-4o-mini".into(),
                max_tokens: default_max_tokens(),
                temperature: default_temperature(),
            },
            stt: SttConfig {
                model_path: PathBuf::from("models/stt.bin"),
                model_url: "https://models.example.com/stt.bin".into(),
            },
            welcome_message: "Hello, how can I help?".into(),
            welcome_audio_path: PathBuf::from("welcome.wav"),
            instructions: "You are a helpful phone assistant.".into(),
            instructions_addendum: String::new(),
            tool_guidance: String::new(),
            tools: default_tools(),
            extensions: Vec::new(),
            vad: SegmenterParams::default(),
        }
    }

    #[test]
    fn test_valid_profile() {
        assert!(test_profile().validate().is_ok());
    }

    #[test]
    fn test_missing_api_key() {
        let mut profile = test_profile();
        profile.llm.api_key.clear();
        assert!(matches!(
            profile.validate(),
            Err(ConfigError::MissingField("llm.api_key"))
        ));
    }

    #[test]
    fn test_missing_stt_url_without_local_model() {
        let mut profile = test_profile();
        profile.stt.model_url.clear();
        profile.stt.model_path = PathBuf::from("/definitely/not/here.bin");
        assert!(matches!(
            profile.validate(),
            Err(ConfigError::MissingField("stt.model_url"))
        ));
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let json = r#"{
            "llm": {"endpoint": "https://x/v1", "api_key": "k", "model": "m"},
            "stt": {"model_path": "stt.bin", "model_url": "https://x/stt.bin"},
            "welcome_message": "Hi",
            "welcome_audio_path": "welcome.wav",
            "instructions": "Be brief."
        }"#;
        let profile: Profile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.llm.max_tokens, 1024);
        assert!((profile.llm.temperature - 0.7).abs() < f64::EPSILON);
        assert_eq!(profile.tools.len(), 4);
        assert!((profile.vad.threshold - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn test_extension_map() {
        let mut profile = test_profile();
        profile.extensions.push(ExtensionEntry {
            name: "personal".into(),
            number: "102".into(),
            description: "Caleb's line".into(),
            address: "102@slowcasting.com".into(),
        });
        let map = profile.extension_map();
        assert_eq!(map.get("personal").unwrap(), "102@slowcasting.com");
    }

    #[test]
    fn test_profile_name_from_env_prefers_cli() {
        assert_eq!(
            profile_name_from_env(Some("front-desk".into())),
            Some("front-desk".into())
        );
    }
}
