use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::{json, Value};

use crate::errors::AgentError;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        match message.role {
            Role::System | Role::User => {
                messages_spec.push(json!({
                    "role": message.role,
                    "content": message.text(),
                }));
            }
            Role::Assistant => {
                let mut converted = json!({
                    "role": "assistant"
                });
                let mut trailing = Vec::new();

                for content in &message.content {
                    match content {
                        MessageContent::Text(text) => {
                            if !text.text.is_empty() {
                                converted["content"] = json!(text.text);
                            }
                        }
                        MessageContent::ToolRequest(request) => match &request.tool_call {
                            Ok(tool_call) => {
                                let sanitized_name = sanitize_function_name(&tool_call.name);
                                let tool_calls = converted
                                    .as_object_mut()
                                    .unwrap()
                                    .entry("tool_calls")
                                    .or_insert(json!([]));

                                tool_calls.as_array_mut().unwrap().push(json!({
                                    "id": request.id,
                                    "type": "function",
                                    "function": {
                                        "name": sanitized_name,
                                        "arguments": tool_call.arguments.to_string(),
                                    }
                                }));
                            }
                            Err(e) => {
                                // An invalid request still needs a tool entry so the
                                // model can interpret what went wrong
                                trailing.push(json!({
                                    "role": "tool",
                                    "content": format!("Error: {}", e),
                                    "tool_call_id": request.id
                                }));
                            }
                        },
                        MessageContent::ToolResponse(_) => {
                            // Tool responses ride in Role::Tool messages
                            continue;
                        }
                    }
                }

                if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
                    messages_spec.push(converted);
                }
                messages_spec.extend(trailing);
            }
            Role::Tool => {
                for content in &message.content {
                    let MessageContent::ToolResponse(response) = content else {
                        continue;
                    };
                    match &response.tool_result {
                        Ok(value) => {
                            messages_spec.push(json!({
                                "role": "tool",
                                "content": payload_text(value),
                                "tool_call_id": response.id
                            }));
                        }
                        Err(e) => {
                            // A tool result error is shown as output so the model
                            // can interpret the error message
                            messages_spec.push(json!({
                                "role": "tool",
                                "content": format!("The tool call returned the following error:\n{}", e),
                                "tool_call_id": response.id
                            }));
                        }
                    }
                }
            }
        }
    }

    messages_spec
}

/// Render a tool result payload as the string the wire format expects
fn payload_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// Convert OpenAI's API response to internal Message format
pub fn openai_response_to_message(response: Value) -> Result<Message> {
    let original = response["choices"][0]["message"].clone();
    let mut message = Message::assistant();

    if let Some(text) = original.get("content") {
        if let Some(text_str) = text.as_str() {
            message = message.with_text(text_str);
        }
    }

    if let Some(tool_calls) = original.get("tool_calls") {
        if let Some(tool_calls_array) = tool_calls.as_array() {
            for tool_call in tool_calls_array {
                let id = tool_call["id"].as_str().unwrap_or_default().to_string();
                let function_name = tool_call["function"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let arguments = tool_call["function"]["arguments"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();

                if !is_valid_function_name(&function_name) {
                    let error = AgentError::ToolNotFound(format!(
                        "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
                        function_name
                    ));
                    message = message.with_tool_request(id, Err(error));
                } else {
                    match serde_json::from_str::<Value>(&arguments) {
                        Ok(params) => {
                            message = message
                                .with_tool_request(id, Ok(ToolCall::new(&function_name, params)));
                        }
                        Err(e) => {
                            let error = AgentError::InvalidParameters(format!(
                                "Could not interpret tool use parameters for id {}: {}",
                                id, e
                            ));
                            message = message.with_tool_request(id, Err(error));
                        }
                    }
                }
            }
        }
    }

    Ok(message)
}

fn sanitize_function_name(name: &str) -> String {
    let re = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    re.replace_all(name, "_").to_string()
}

fn is_valid_function_name(name: &str) -> bool {
    let re = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
    re.is_match(name)
}

#[derive(Debug, thiserror::Error)]
#[error("Context length exceeded. Message: {0}")]
pub struct ContextLengthExceededError(String);

pub fn check_openai_context_length_error(error: &Value) -> Option<ContextLengthExceededError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ContextLengthExceededError(message))
    } else {
        None
    }
}
