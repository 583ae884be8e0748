// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! LLM turn engine: chat history, system prompt, and tool auto-invocation.
//!
//! [`TurnEngine::process_message`] is the one-shot entry point for a
//! conversation turn: it appends the user turn, queries the chat endpoint,
//! executes any tool calls the model emits (feeding results back and
//! re-querying until the model answers in plain text), and returns a
//! speakable assistant string - also on failure, via the fallback path.
//!
//! The engine exclusively owns the [`ChatTurn`] history; the history always
//! begins with exactly one system turn.

pub mod tools;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::config::Profile;
use crate::engine::tools::ToolFunction;
use crate::services::llm::{ChatClient, ChatCompletionRequest};

/// Upper bound on model-tool round trips within one turn.
const MAX_TOOL_ROUNDS: usize = 8;

/// One turn of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTurn {
    System(String),
    User(String),
    Assistant(String),
    /// A tool call the model emitted; `arguments` is the raw JSON object.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// The locally produced result fed back to the model.
    ToolResult { id: String, content: String },
}

impl ChatTurn {
    /// Render as an OpenAI-format message object.
    fn to_message(&self) -> serde_json::Value {
        match self {
            ChatTurn::System(content) => json!({"role": "system", "content": content}),
            ChatTurn::User(content) => json!({"role": "user", "content": content}),
            ChatTurn::Assistant(content) => json!({"role": "assistant", "content": content}),
            ChatTurn::ToolCall {
                id,
                name,
                arguments,
            } => json!({
                "role": "assistant",
                "tool_calls": [{
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": arguments,
                    }
                }]
            }),
            ChatTurn::ToolResult { id, content } => json!({
                "role": "tool",
                "tool_call_id": id,
                "content": content,
            }),
        }
    }
}

/// Drives one LLM turn at a time, with tool auto-invocation.
pub struct TurnEngine {
    client: Arc<dyn ChatClient>,
    model: String,
    temperature: f64,
    max_tokens: u64,
    system_prompt: String,
    history: Vec<ChatTurn>,
    tools: Vec<Arc<dyn ToolFunction>>,
}

impl TurnEngine {
    /// Build an engine for `profile` with the given tool registry.
    ///
    /// The system prompt is composed once here: instructions, addendum, and
    /// tool guidance (with `{extensions}` substituted), plus an enumeration
    /// of the registered tools.
    pub fn new(
        client: Arc<dyn ChatClient>,
        profile: &Profile,
        tools: Vec<Arc<dyn ToolFunction>>,
    ) -> Self {
        warn_non_string_params(&tools);
        let system_prompt = compose_system_prompt(profile, &tools);
        Self {
            client,
            model: profile.llm.model.clone(),
            temperature: profile.llm.temperature,
            max_tokens: profile.llm.max_tokens,
            history: vec![ChatTurn::System(system_prompt.clone())],
            system_prompt,
            tools,
        }
    }

    /// The ordered conversation history.
    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    /// Empty the history back to just the system turn.
    pub fn clear_history(&mut self) {
        self.history = vec![ChatTurn::System(self.system_prompt.clone())];
    }

    /// Append an assistant turn without invoking the model. Used to seed
    /// the welcome line at call answer.
    pub fn add_assistant_message(&mut self, text: impl Into<String>) {
        self.history.push(ChatTurn::Assistant(text.into()));
    }

    /// Run one conversation turn and return a speakable assistant reply.
    ///
    /// Tool calls emitted by the model are executed synchronously, their
    /// results appended as tool turns, and the model re-queried until it
    /// answers in plain text (bounded by [`MAX_TOOL_ROUNDS`]). Any endpoint
    /// error is surfaced as a fallback string rather than an `Err`, so the
    /// caller always has something to synthesize.
    pub async fn process_message(&mut self, user_text: &str) -> String {
        self.history.push(ChatTurn::User(user_text.to_string()));

        for round in 0..MAX_TOOL_ROUNDS {
            let request = self.build_request();
            let message = match self.client.complete(&request).await {
                Ok(message) => message,
                Err(e) => {
                    warn!("turn engine: model call failed: {e}");
                    return self.fallback(format!(
                        "Error in processing: {e}. Falling back to basic chat."
                    ));
                }
            };

            let tool_calls = message.tool_calls.unwrap_or_default();
            if tool_calls.is_empty() {
                let content = message.content.unwrap_or_default();
                self.history.push(ChatTurn::Assistant(content.clone()));
                return content;
            }

            debug!(round, calls = tool_calls.len(), "turn engine: executing tool calls");
            for call in tool_calls {
                let args = parse_tool_arguments(&call.function.arguments);
                self.history.push(ChatTurn::ToolCall {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                });

                let result = match self
                    .tools
                    .iter()
                    .find(|t| t.name() == call.function.name)
                {
                    Some(tool) => tool.invoke(&args).await,
                    None => {
                        warn!(name = %call.function.name, "turn engine: unknown tool requested");
                        json!({
                            "error": "unknown tool",
                            "details": call.function.name,
                        })
                        .to_string()
                    }
                };
                self.history.push(ChatTurn::ToolResult {
                    id: call.id,
                    content: result,
                });
            }
        }

        warn!("turn engine: tool invocation did not converge");
        self.fallback(
            "Error in processing: tool invocation did not converge. Falling back to basic chat."
                .to_string(),
        )
    }

    fn fallback(&mut self, text: String) -> String {
        self.history.push(ChatTurn::Assistant(text.clone()));
        text
    }

    fn build_request(&self) -> ChatCompletionRequest {
        let messages = self.history.iter().map(ChatTurn::to_message).collect();
        let (tools, tool_choice) = if self.tools.is_empty() {
            (None, None)
        } else {
            (Some(self.tool_schema()), Some(json!("auto")))
        };
        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            tools,
            tool_choice,
        }
    }

    /// OpenAPI-style function declarations for the request's tools block.
    fn tool_schema(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|tool| {
                let mut properties = serde_json::Map::new();
                let mut required = Vec::new();
                for param in tool.parameters() {
                    let mut property = serde_json::Map::new();
                    property.insert("type".into(), json!(param.ty));
                    property.insert("description".into(), json!(param.description));
                    if let Some(default) = param.default {
                        property.insert("default".into(), json!(default));
                    }
                    properties.insert(param.name.to_string(), serde_json::Value::Object(property));
                    if param.required {
                        required.push(param.name);
                    }
                }
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": {
                            "type": "object",
                            "properties": properties,
                            "required": required,
                        }
                    }
                })
            })
            .collect()
    }
}

/// Parse a model-provided JSON argument object into string pairs.
///
/// Non-string values are stringified rather than rejected; the provider is
/// expected to send strings for every declared parameter.
fn parse_tool_arguments(arguments: &str) -> HashMap<String, String> {
    let Ok(map) = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(arguments)
    else {
        warn!("turn engine: unparseable tool arguments: {arguments}");
        return HashMap::new();
    };
    map.into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, value)
        })
        .collect()
}

/// Instructions + addendum + tool guidance (with `{extensions}` replaced),
/// plus the tool enumeration block when tools are registered.
fn compose_system_prompt(profile: &Profile, tools: &[Arc<dyn ToolFunction>]) -> String {
    let mut sections: Vec<String> = Vec::new();
    if !profile.instructions.is_empty() {
        sections.push(profile.instructions.clone());
    }
    if !profile.instructions_addendum.is_empty() {
        sections.push(profile.instructions_addendum.clone());
    }
    if !profile.tool_guidance.is_empty() {
        sections.push(
            profile
                .tool_guidance
                .replace("{extensions}", &render_extensions(profile)),
        );
    }

    if !tools.is_empty() {
        let mut block = String::from("The following tools are available:");
        for tool in tools {
            block.push_str(&format!("\n- {}: {}", tool.name(), tool.description()));
            let params: Vec<String> = tool
                .parameters()
                .iter()
                .map(|p| {
                    let mut rendered = format!("{} ({}", p.name, p.ty);
                    if p.required {
                        rendered.push_str(", required");
                    } else {
                        rendered.push_str(", optional");
                    }
                    if let Some(default) = p.default {
                        rendered.push_str(&format!(", default: {default}"));
                    }
                    rendered.push_str(&format!(") - {}", p.description));
                    rendered
                })
                .collect();
            if !params.is_empty() {
                block.push_str(&format!("\n  Parameters: {}", params.join("; ")));
            }
        }
        sections.push(block);
    }

    sections.join("\n\n")
}

/// `"Transfer extensions: <name> (<number>) - <description>, ..."`.
fn render_extensions(profile: &Profile) -> String {
    if profile.extensions.is_empty() {
        return "Transfer extensions: none".to_string();
    }
    let rendered: Vec<String> = profile
        .extensions
        .iter()
        .map(|e| format!("{} ({}) - {}", e.name, e.number, e.description))
        .collect();
    format!("Transfer extensions: {}", rendered.join(", "))
}

/// The provider rejects non-string required parameters; flag them once at
/// startup so the operator sees the misconfiguration before a call does.
fn warn_non_string_params(tools: &[Arc<dyn ToolFunction>]) {
    for tool in tools {
        for param in tool.parameters() {
            if param.ty != "string" {
                warn!(
                    tool = tool.name(),
                    param = param.name,
                    ty = param.ty,
                    "non-string tool parameter; the LLM provider rejects these when required"
                );
            }
        }
    }
}
