// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Tool functions the LLM can invoke mid-turn.
//!
//! Each tool is a value with a name, description, parameter schema, and an
//! async `invoke`; the turn engine owns the registry, serializes the schema
//! into the model request, and dispatches by name on response. Every invoke
//! returns a JSON string with at least `{status, message}` on success or
//! `{error, details}` on failure, so the result is always speakable or
//! loggable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

/// Transfer sink: hands the call to a full SIP address, returning whether
/// the transfer was accepted.
pub type TransferFn = Arc<dyn Fn(String) -> bool + Send + Sync>;

/// Hang-up sink.
pub type HangupFn = Arc<dyn Fn() + Send + Sync>;

/// Optional SMS dispatch sink; receives the rendered message body.
pub type SmsFn = Arc<dyn Fn(&str) + Send + Sync>;

/// One named parameter in a tool's schema.
///
/// The chat-completion provider only accepts `string`-typed required
/// parameters; the engine warns at startup about anything else.
#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: &'static str,
    pub ty: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub default: Option<&'static str>,
}

/// A callable tool exposed to the model.
#[async_trait]
pub trait ToolFunction: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> &[ToolParam];

    /// Execute with the model-provided named arguments. Never fails at the
    /// call site: failures are encoded in the returned JSON object.
    async fn invoke(&self, args: &HashMap<String, String>) -> String;
}

fn ok_result(status: &str, message: String) -> String {
    json!({"status": status, "message": message}).to_string()
}

fn err_result(error: &str, details: String) -> String {
    json!({"error": error, "details": details}).to_string()
}

// ---------------------------------------------------------------------------
// send_notification
// ---------------------------------------------------------------------------

/// Notify the operator about an issue the caller reported.
pub struct SendNotificationTool {
    sms: Option<SmsFn>,
}

impl SendNotificationTool {
    pub fn new(sms: Option<SmsFn>) -> Self {
        Self { sms }
    }
}

const SEND_NOTIFICATION_PARAMS: &[ToolParam] = &[
    ToolParam {
        name: "issue",
        ty: "string",
        description: "What the caller needs help with",
        required: true,
        default: None,
    },
    ToolParam {
        name: "location",
        ty: "string",
        description: "Where the issue is located",
        required: false,
        default: None,
    },
    ToolParam {
        name: "urgency",
        ty: "string",
        description: "One of low, medium, high",
        required: false,
        default: Some("medium"),
    },
    ToolParam {
        name: "caller_name",
        ty: "string",
        description: "Name the caller gave",
        required: false,
        default: None,
    },
];

#[async_trait]
impl ToolFunction for SendNotificationTool {
    fn name(&self) -> &'static str {
        "send_notification"
    }
    fn description(&self) -> &'static str {
        "Notify the operator about an issue the caller reported"
    }
    fn parameters(&self) -> &[ToolParam] {
        SEND_NOTIFICATION_PARAMS
    }

    async fn invoke(&self, args: &HashMap<String, String>) -> String {
        let Some(issue) = args.get("issue").filter(|s| !s.is_empty()) else {
            return err_result("missing required parameter", "issue".into());
        };
        let urgency = match args.get("urgency").map(String::as_str) {
            None | Some("") => "medium",
            Some(u @ ("low" | "medium" | "high")) => u,
            Some(other) => {
                warn!(urgency = other, "send_notification: unknown urgency, using medium");
                "medium"
            }
        };
        let location = args.get("location").cloned().unwrap_or_default();
        let caller = args.get("caller_name").cloned().unwrap_or_default();

        info!(
            issue = %issue,
            urgency,
            location = %location,
            caller = %caller,
            "notification raised"
        );
        if let Some(sms) = &self.sms {
            let body = format!("[{urgency}] {issue} {location} (caller: {caller})");
            sms(&body);
        }

        json!({
            "status": "sent",
            "message": format!("Notification sent for: {issue}"),
            "urgency": urgency,
        })
        .to_string()
    }
}

// ---------------------------------------------------------------------------
// transfer_conversation
// ---------------------------------------------------------------------------

/// Transfer the call to a configured extension.
pub struct TransferConversationTool {
    extensions: HashMap<String, String>,
    transfer: TransferFn,
}

impl TransferConversationTool {
    /// `extensions` maps the alias the LLM uses to the full SIP address.
    pub fn new(extensions: HashMap<String, String>, transfer: TransferFn) -> Self {
        Self {
            extensions,
            transfer,
        }
    }
}

const TRANSFER_PARAMS: &[ToolParam] = &[
    ToolParam {
        name: "extension",
        ty: "string",
        description: "Extension alias to transfer to",
        required: true,
        default: None,
    },
    ToolParam {
        name: "reason",
        ty: "string",
        description: "Why the caller is being transferred",
        required: false,
        default: None,
    },
];

#[async_trait]
impl ToolFunction for TransferConversationTool {
    fn name(&self) -> &'static str {
        "transfer_conversation"
    }
    fn description(&self) -> &'static str {
        "Transfer the caller to one of the configured extensions"
    }
    fn parameters(&self) -> &[ToolParam] {
        TRANSFER_PARAMS
    }

    async fn invoke(&self, args: &HashMap<String, String>) -> String {
        let Some(extension) = args.get("extension").filter(|s| !s.is_empty()) else {
            return err_result("missing required parameter", "extension".into());
        };
        let Some(address) = self.extensions.get(extension).cloned() else {
            return err_result(
                "unknown extension",
                format!("no extension named '{extension}' is configured"),
            );
        };
        let reason = args.get("reason").cloned().unwrap_or_default();
        info!(extension = %extension, address = %address, reason = %reason, "transferring call");

        // Fire-and-forget: the spoken confirmation must not wait on SIP.
        let transfer = Arc::clone(&self.transfer);
        let target = address.clone();
        tokio::spawn(async move {
            if !(transfer)(target.clone()) {
                warn!(address = %target, "transfer was rejected");
            }
        });

        ok_result(
            "transferring",
            format!("Transferring to extension {address}."),
        )
    }
}

// ---------------------------------------------------------------------------
// end_conversation
// ---------------------------------------------------------------------------

/// Hang up the call after a short delay so the farewell can play.
pub struct EndConversationTool {
    hangup: HangupFn,
    delay: Duration,
}

impl EndConversationTool {
    pub fn new(hangup: HangupFn) -> Self {
        Self {
            hangup,
            delay: Duration::from_secs(3),
        }
    }

    /// Override the hang-up deferral. Intended for tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

const END_PARAMS: &[ToolParam] = &[ToolParam {
    name: "reason",
    ty: "string",
    description: "Why the conversation is ending",
    required: false,
    default: None,
}];

#[async_trait]
impl ToolFunction for EndConversationTool {
    fn name(&self) -> &'static str {
        "end_conversation"
    }
    fn description(&self) -> &'static str {
        "End the call once the farewell has been spoken"
    }
    fn parameters(&self) -> &[ToolParam] {
        END_PARAMS
    }

    async fn invoke(&self, args: &HashMap<String, String>) -> String {
        let reason = args.get("reason").cloned().unwrap_or_default();
        info!(reason = %reason, delay_s = self.delay.as_secs_f32(), "scheduling hang-up");

        let hangup = Arc::clone(&self.hangup);
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            (hangup)();
        });

        ok_result("ending", "The call will end shortly.".to_string())
    }
}

// ---------------------------------------------------------------------------
// schedule_followup
// ---------------------------------------------------------------------------

/// Record a follow-up request for the operator.
pub struct ScheduleFollowupTool;

const SCHEDULE_PARAMS: &[ToolParam] = &[
    ToolParam {
        name: "service_type",
        ty: "string",
        description: "Kind of follow-up",
        required: false,
        default: Some("callback"),
    },
    ToolParam {
        name: "location",
        ty: "string",
        description: "Where the follow-up should happen",
        required: false,
        default: None,
    },
    ToolParam {
        name: "preferred_time",
        ty: "string",
        description: "When the caller prefers to be reached",
        required: false,
        default: None,
    },
];

#[async_trait]
impl ToolFunction for ScheduleFollowupTool {
    fn name(&self) -> &'static str {
        "schedule_followup"
    }
    fn description(&self) -> &'static str {
        "Schedule a follow-up callback or visit for the caller"
    }
    fn parameters(&self) -> &[ToolParam] {
        SCHEDULE_PARAMS
    }

    async fn invoke(&self, args: &HashMap<String, String>) -> String {
        let service_type = args
            .get("service_type")
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| "callback".to_string());
        let location = args.get("location").cloned().unwrap_or_default();
        let preferred_time = args.get("preferred_time").cloned().unwrap_or_default();

        info!(
            service_type = %service_type,
            location = %location,
            preferred_time = %preferred_time,
            "follow-up scheduled"
        );
        ok_result(
            "scheduled",
            format!("A {service_type} follow-up has been scheduled."),
        )
    }
}
