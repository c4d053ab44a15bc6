//! Bounds the conversation history submitted to the model.
//!
//! The policy scans newest-to-oldest and keeps: every user message, the two
//! most recent successful tool results (a budget that shrinks as the user
//! moves the conversation forward), failing tool results only until the
//! first successful one has been seen, and no two consecutive assistant
//! messages. The decrement condition inspects a fixed offset into the
//! reverse-built list and the failing-keep flag is consumed by the first
//! successful result encountered, not the first one kept; both quirks are
//! load-bearing and deliberately preserved.

use serde_json::Value;

use crate::models::message::Message;
use crate::models::role::Role;

/// Number of successful tool results to keep before older ones are dropped
const MAX_SUCCESSFUL_TOOL_RESULTS: i32 = 2;

/// Reduce a full history (oldest-first) to the bounded subset submitted to
/// the model, preserving chronological order. The fresh system instruction
/// is built separately and prepended by the caller.
pub fn filter_messages(history: &[Message]) -> Vec<Message> {
    let mut successful_budget = MAX_SUCCESSFUL_TOOL_RESULTS;
    let mut keep_failing = true;
    let mut kept: Vec<&Message> = Vec::new();

    for message in history.iter().rev() {
        match message.role {
            Role::User => {
                if kept.len() > 2 && kept[kept.len() - 2].role == Role::Tool {
                    successful_budget -= 1;
                }
                kept.push(message);
            }
            Role::Tool => match message.tool_payload() {
                Some(payload) => {
                    let code = payload
                        .get("code")
                        .and_then(Value::as_str)
                        .unwrap_or("succeeded");
                    if code == "succeeded" {
                        if keep_failing {
                            keep_failing = false;
                        }
                        if successful_budget > 0 {
                            kept.push(message);
                        }
                    } else if keep_failing {
                        kept.push(message);
                    }
                }
                // Unparseable payloads are kept while failing results still are
                None => {
                    if keep_failing {
                        kept.push(message);
                    }
                }
            },
            Role::Assistant => {
                if kept.last().map_or(true, |last| last.role != Role::Assistant) {
                    kept.push(message);
                }
            }
            Role::System => {}
        }
    }

    kept.reverse();
    kept.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AgentError;
    use crate::models::tool::ToolCall;
    use serde_json::json;

    fn user(text: &str) -> Message {
        Message::user().with_text(text)
    }

    fn assistant(text: &str) -> Message {
        Message::assistant().with_text(text)
    }

    fn requesting(id: &str) -> Message {
        Message::assistant().with_tool_request(id, Ok(ToolCall::new("find_customer", json!({}))))
    }

    fn tool_result(id: &str, payload: Value) -> Message {
        Message::tool().with_tool_response(id, Ok(payload))
    }

    #[test]
    fn test_empty_history() {
        assert!(filter_messages(&[]).is_empty());
    }

    #[test]
    fn test_keeps_every_user_message() {
        let history = vec![
            user("hello"),
            assistant("hi"),
            user("find Thắng"),
            assistant("on it"),
        ];
        let filtered = filter_messages(&history);
        let users = filtered.iter().filter(|m| m.role == Role::User).count();
        assert_eq!(users, 2);
    }

    #[test]
    fn test_collapses_consecutive_assistant_messages() {
        let history = vec![
            user("hello"),
            assistant("first"),
            assistant("second"),
            assistant("third"),
        ];
        let filtered = filter_messages(&history);
        // Scanning backwards only the newest of the run survives
        let assistants: Vec<_> = filtered
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .collect();
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].text(), "third");
    }

    #[test]
    fn test_successful_results_age_out() {
        let history = vec![
            user("turn one"),
            requesting("1"),
            tool_result("1", json!({"code": "succeeded", "message": "first"})),
            assistant("done one"),
            user("turn two"),
            requesting("2"),
            tool_result("2", json!({"code": "succeeded", "message": "second"})),
            assistant("done two"),
            user("turn three"),
            requesting("3"),
            tool_result("3", json!({"code": "succeeded", "message": "third"})),
            assistant("done three"),
            user("thanks"),
        ];
        let filtered = filter_messages(&history);

        let payloads: Vec<String> = filtered
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_payload().unwrap()["message"].to_string())
            .collect();
        assert_eq!(payloads, vec!["\"second\"", "\"third\""]);
        // Every user turn survives regardless
        assert_eq!(filtered.iter().filter(|m| m.role == Role::User).count(), 4);
    }

    #[test]
    fn test_failing_result_dropped_after_newer_success() {
        let history = vec![
            user("find someone"),
            requesting("1"),
            tool_result("1", json!({"code": "failed", "message": "No customer found"})),
            assistant("nobody by that name"),
            user("try Hà"),
            requesting("2"),
            tool_result("2", json!({"code": "succeeded", "message": "found"})),
            assistant("found her"),
        ];
        let filtered = filter_messages(&history);
        let tool_messages: Vec<_> = filtered.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tool_messages.len(), 1);
        assert_eq!(
            tool_messages[0].tool_payload().unwrap()["code"],
            json!("succeeded")
        );
    }

    #[test]
    fn test_failing_results_kept_until_a_success_is_seen() {
        let history = vec![
            user("find a"),
            requesting("1"),
            tool_result("1", json!({"code": "failed"})),
            assistant("no luck"),
            user("find b"),
            requesting("2"),
            tool_result("2", json!({"code": "failed"})),
            assistant("still nothing"),
        ];
        let filtered = filter_messages(&history);
        // The one-shot flag is only consumed by successes, so both failures stay
        assert_eq!(filtered.iter().filter(|m| m.role == Role::Tool).count(), 2);
    }

    #[test]
    fn test_unparseable_result_treated_like_a_failure_keep() {
        let history = vec![
            user("do it"),
            requesting("1"),
            Message::tool().with_tool_response("1", Ok(json!("plain text result"))),
            assistant("hmm"),
        ];
        let filtered = filter_messages(&history);
        assert_eq!(filtered.iter().filter(|m| m.role == Role::Tool).count(), 1);
    }

    #[test]
    fn test_error_result_treated_like_a_failure_keep() {
        let history = vec![
            user("do it"),
            requesting("1"),
            Message::tool()
                .with_tool_response("1", Err(AgentError::ToolNotFound("gone".into()))),
            assistant("that tool is gone"),
        ];
        let filtered = filter_messages(&history);
        assert_eq!(filtered.iter().filter(|m| m.role == Role::Tool).count(), 1);
    }

    #[test]
    fn test_missing_code_defaults_to_succeeded() {
        let history = vec![
            user("look up the card"),
            requesting("1"),
            tool_result("1", json!({"product_info": {}, "message": "No card product found"})),
            assistant("nothing matched"),
        ];
        let filtered = filter_messages(&history);
        // No `code` field counts as a success for budgeting purposes
        assert_eq!(filtered.iter().filter(|m| m.role == Role::Tool).count(), 1);
    }

    #[test]
    fn test_refiltering_never_grows() {
        let history = vec![
            user("one"),
            requesting("1"),
            tool_result("1", json!({"code": "succeeded"})),
            assistant("a"),
            user("two"),
            requesting("2"),
            tool_result("2", json!({"code": "failed"})),
            assistant("b"),
            user("three"),
            requesting("3"),
            tool_result("3", json!({"code": "succeeded"})),
            assistant("c"),
            user("four"),
        ];
        let once = filter_messages(&history);
        let twice = filter_messages(&once);
        assert!(twice.len() <= once.len());

        let users = |messages: &[Message]| {
            messages
                .iter()
                .filter(|m| m.role == Role::User)
                .map(|m| m.text())
                .collect::<Vec<_>>()
        };
        assert_eq!(users(&once), users(&twice));
    }
}
