//! Human-confirmation gate over tool results.
//!
//! A tool result opts into confirmation by carrying `ask_confirmation: true`;
//! there is no static allowlist. The tool's own input validation decides, per
//! invocation, whether the action is safe to auto-apply or needs a human nod.
//! Only a literal `yes` (case and surrounding whitespace insensitive)
//! proceeds; every other answer cancels: ambiguity is resolved as "no",
//! never as "ask again".

use serde_json::Value;

use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::ToolCall;

/// Rendered in the question when no requested tool call can be located
pub const UNKNOWN_TASK: &str = "unknown_task";

/// Routing decision after a round of tool execution
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Hand the conversation back to the assistant turn
    Continue,
    /// Suspend and ask the human the given question
    Confirm { question: String },
}

/// How a resumption answer routes the suspended flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Proceed,
    Cancel,
}

/// Inspect the conversation after tool execution and decide the routing.
/// Anything other than a well-formed mapping with `ask_confirmation: true`
/// in the latest tool message routes back to the assistant.
pub fn inspect(messages: &[Message]) -> GateDecision {
    let Some(last) = messages.last() else {
        return GateDecision::Continue;
    };
    if last.role != Role::Tool {
        return GateDecision::Continue;
    }
    let Some(payload) = last.tool_payload() else {
        return GateDecision::Continue;
    };
    match payload.get("ask_confirmation").and_then(Value::as_bool) {
        Some(true) => {
            let rendered = last_tool_request(messages)
                .map(render_tool_call)
                .unwrap_or_else(|| UNKNOWN_TASK.to_string());
            GateDecision::Confirm {
                question: confirmation_question(&rendered),
            }
        }
        _ => GateDecision::Continue,
    }
}

/// The most recent requested tool call in the conversation: the first
/// request of the newest message that carries any
pub fn last_tool_request(messages: &[Message]) -> Option<&ToolCall> {
    messages.iter().rev().find_map(|message| {
        message
            .content
            .iter()
            .find_map(|content| content.as_tool_request())
            .and_then(|request| request.tool_call.as_ref().ok())
    })
}

/// Render a tool call as `name(key='string', key=value, ...)` for the human
pub fn render_tool_call(call: &ToolCall) -> String {
    let arguments = call
        .arguments
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(key, value)| match value {
                    Value::String(text) => format!("{}='{}'", key, text),
                    other => format!("{}={}", key, other),
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    format!("{}({})", call.name, arguments)
}

/// The question surfaced to the human when the flow suspends
pub fn confirmation_question(rendered_call: &str) -> String {
    format!(
        "Please confirm the following task: {}\n\
         Reply 'yes' to proceed or 'no' to cancel. Any other reply will cancel the task.",
        rendered_call
    )
}

/// Strict resolution of a resumption answer
pub fn resolve_answer(answer: &str) -> Resolution {
    if answer.trim().to_lowercase() == "yes" {
        Resolution::Proceed
    } else {
        Resolution::Cancel
    }
}
