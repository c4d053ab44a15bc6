//! The per-conversation flow: filter, model invocation, tool execution,
//! approval gate, and the privileged execution path behind it.
//!
//! One `Agent` serves one conversation thread and carries that thread's
//! authenticated RM identity and capability bindings. The flow is an
//! explicit two-state machine: `Normal` is "no pending interrupt" and
//! `AwaitingConfirmation` is a recorded `PendingInterrupt` in the
//! conversation checkpoint, so a suspended approval survives restarts and
//! the next inbound message is interpreted as the answer rather than as a
//! fresh turn.

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::approval::{self, GateDecision, Resolution};
use crate::crm::{CREATE_TASK_TOOL, UPDATE_TASK_TOOL};
use crate::errors::{AgentError, AgentResult};
use crate::filter::filter_messages;
use crate::models::message::Message;
use crate::models::tool::{Tool, ToolCall};
use crate::prompt_template::{load_prompt_file, today_string};
use crate::providers::base::Provider;
use crate::session::{ConversationState, PendingInterrupt};
use crate::toolkit::Toolkit;

#[derive(Clone, Debug, Serialize)]
struct ToolkitInfo {
    name: String,
    instructions: String,
}

#[derive(Serialize)]
struct SystemContext {
    today: String,
    toolkits: Vec<ToolkitInfo>,
}

/// How a finished turn presents to the transport layer. Suspension is an
/// observable yield point, distinct from completion and from failure.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed { message: String },
    Interrupted { question: String },
}

/// Optional streaming sink; produced messages are emitted as they happen
pub type MessageSink = mpsc::Sender<Message>;

/// Agent integrates the model with the capability set it needs to operate
pub struct Agent {
    toolkits: Vec<Box<dyn Toolkit>>,
    provider: Box<dyn Provider>,
    rm_id: i64,
    privileged: HashMap<String, String>,
}

impl Agent {
    /// Create a new Agent for the given authenticated RM identity
    pub fn new(provider: Box<dyn Provider>, rm_id: i64) -> Self {
        Self {
            toolkits: Vec::new(),
            provider,
            rm_id,
            privileged: HashMap::new(),
        }
    }

    /// Add a toolkit, validating its privileged bindings. Every binding must
    /// reference a declared visible tool and a declared privileged tool;
    /// anything else is a deployment defect and fails here rather than at
    /// call time.
    pub fn add_toolkit(&mut self, toolkit: Box<dyn Toolkit>) -> AgentResult<()> {
        for (visible, privileged) in toolkit.privileged_bindings() {
            if !toolkit.tools().iter().any(|tool| tool.name == visible) {
                return Err(AgentError::PrivilegedToolMissing(format!(
                    "binding for unknown visible tool '{}' in toolkit '{}'",
                    visible,
                    toolkit.name()
                )));
            }
            if !toolkit
                .privileged_tools()
                .iter()
                .any(|tool| tool.name == privileged)
            {
                return Err(AgentError::PrivilegedToolMissing(format!(
                    "visible tool '{}' is bound to undeclared privileged tool '{}' in toolkit '{}'",
                    visible,
                    privileged,
                    toolkit.name()
                )));
            }
            self.privileged.insert(visible, privileged);
        }
        self.toolkits.push(toolkit);
        Ok(())
    }

    /// All assistant-visible tools across toolkits
    fn visible_tools(&self) -> Vec<Tool> {
        self.toolkits
            .iter()
            .flat_map(|toolkit| toolkit.tools().iter().cloned())
            .collect()
    }

    fn system_prompt(&self) -> AgentResult<String> {
        let context = SystemContext {
            today: today_string(),
            toolkits: self
                .toolkits
                .iter()
                .map(|toolkit| ToolkitInfo {
                    name: toolkit.name().to_string(),
                    instructions: toolkit.instructions().to_string(),
                })
                .collect(),
        };
        load_prompt_file("system.md", &context).map_err(|e| AgentError::Internal(e.to_string()))
    }

    /// Dispatch a single visible tool call to the toolkit exposing it
    async fn dispatch_tool_call(&self, tool_call: AgentResult<ToolCall>) -> AgentResult<Value> {
        let call = tool_call?;
        let toolkit = self
            .toolkits
            .iter()
            .find(|toolkit| toolkit.tools().iter().any(|tool| tool.name == call.name))
            .ok_or_else(|| AgentError::ToolNotFound(call.name.clone()))?;
        debug!(tool = %call.name, "dispatching tool call");
        toolkit.call(call).await
    }

    /// Dispatch a privileged tool call; these never come from the model
    async fn dispatch_privileged(&self, call: ToolCall) -> AgentResult<Value> {
        let toolkit = self
            .toolkits
            .iter()
            .find(|toolkit| {
                toolkit
                    .privileged_tools()
                    .iter()
                    .any(|tool| tool.name == call.name)
            })
            .ok_or_else(|| AgentError::PrivilegedToolMissing(call.name.clone()))?;
        info!(tool = %call.name, "executing privileged tool");
        toolkit.call(call).await
    }

    /// Process one inbound message for this conversation. A pending
    /// interrupt makes the message a resumption answer; otherwise it starts
    /// a fresh assistant turn.
    pub async fn reply(
        &self,
        conversation: &mut ConversationState,
        user_text: &str,
        sink: Option<&MessageSink>,
    ) -> Result<TurnOutcome> {
        if let Some(pending) = conversation.pending_interrupt.take() {
            return self.resume(conversation, pending, user_text, sink).await;
        }
        conversation
            .messages
            .push(Message::user().with_text(user_text));
        self.assistant_loop(conversation, sink).await
    }

    /// The model/tool loop: call the model over the filtered history, run any
    /// requested tools, and let the gate route the result until the model
    /// answers directly or the gate suspends.
    async fn assistant_loop(
        &self,
        conversation: &mut ConversationState,
        sink: Option<&MessageSink>,
    ) -> Result<TurnOutcome> {
        let system = self.system_prompt()?;
        let tools = self.visible_tools();

        loop {
            let context = filter_messages(&conversation.messages);
            let (response, _usage) = self.provider.complete(&system, &context, &tools).await?;

            if let Some(tx) = sink {
                let _ = tx.send(response.clone()).await;
            }
            conversation.messages.push(response.clone());

            let requests = response.tool_requests();
            if requests.is_empty() {
                return Ok(TurnOutcome::Completed {
                    message: response.text(),
                });
            }

            // One tool message per call, preserving call order
            for request in requests {
                let output = self.dispatch_tool_call(request.tool_call.clone()).await;
                let message = Message::tool().with_tool_response(request.id.clone(), output);
                if let Some(tx) = sink {
                    let _ = tx.send(message.clone()).await;
                }
                conversation.messages.push(message);
            }

            match approval::inspect(&conversation.messages) {
                GateDecision::Continue => continue,
                GateDecision::Confirm { question } => {
                    info!("suspending turn for confirmation");
                    conversation.pending_interrupt = Some(PendingInterrupt {
                        question: question.clone(),
                    });
                    return Ok(TurnOutcome::Interrupted { question });
                }
            }
        }
    }

    /// Resume a suspended turn with the human's raw answer. The question and
    /// the answer both become part of the conversation; only a literal "yes"
    /// reaches the privileged path, anything else cancels back to the
    /// assistant.
    async fn resume(
        &self,
        conversation: &mut ConversationState,
        pending: PendingInterrupt,
        answer: &str,
        sink: Option<&MessageSink>,
    ) -> Result<TurnOutcome> {
        conversation
            .messages
            .push(Message::assistant().with_text(&pending.question));
        conversation.messages.push(Message::user().with_text(answer));

        match approval::resolve_answer(answer) {
            Resolution::Proceed => self.proceed_confirmed(conversation, sink).await,
            Resolution::Cancel => {
                debug!("confirmation declined, returning to assistant");
                self.assistant_loop(conversation, sink).await
            }
        }
    }

    /// Execute the approved action through its privileged counterpart
    async fn proceed_confirmed(
        &self,
        conversation: &mut ConversationState,
        sink: Option<&MessageSink>,
    ) -> Result<TurnOutcome> {
        let Some(call) = approval::last_tool_request(&conversation.messages).cloned() else {
            let message = "Error: could not find a pending tool call to execute.".to_string();
            self.push_assistant_text(conversation, &message, sink).await;
            return Ok(TurnOutcome::Completed { message });
        };

        let privileged_name = self
            .privileged
            .get(&call.name)
            .ok_or_else(|| AgentError::PrivilegedToolMissing(call.name.clone()))?;
        let arguments = self.privileged_arguments(&call);

        let text = match self
            .dispatch_privileged(ToolCall::new(privileged_name, arguments))
            .await
        {
            Ok(result) => format!(
                "The task has been executed successfully. {}",
                result_detail(&result)
            ),
            // Never crash the flow here: report and complete
            Err(e) => {
                warn!(error = %e, "privileged execution failed");
                format!("Error while executing the task: {}", e)
            }
        };

        self.push_assistant_text(conversation, &text, sink).await;
        Ok(TurnOutcome::Completed { message: text })
    }

    /// Re-derive the arguments for a privileged call. Task creation injects
    /// the authenticated RM identity; a model-supplied id is never trusted.
    /// Task updates pass the four updatable fields through verbatim, nulls
    /// meaning "leave unchanged". Other bound mutations pass through as-is.
    fn privileged_arguments(&self, call: &ToolCall) -> Value {
        let args = call.arguments.as_object().cloned().unwrap_or_default();
        let field = |name: &str| args.get(name).cloned().unwrap_or(Value::Null);
        match call.name.as_str() {
            CREATE_TASK_TOOL => json!({
                "rmId": self.rm_id,
                "customerId": field("customerId"),
                "taskType": field("taskType"),
                "taskStatus": field("taskStatus"),
                "taskDueDate": field("taskDueDate"),
                "taskDetails": args.get("taskDetails").cloned().unwrap_or_else(|| json!("")),
            }),
            UPDATE_TASK_TOOL => json!({
                "rmTaskId": field("rmTaskId"),
                "updateTaskStatus": field("updateTaskStatus"),
                "updateTaskDueDate": field("updateTaskDueDate"),
                "updateTaskDetails": field("updateTaskDetails"),
            }),
            _ => call.arguments.clone(),
        }
    }

    async fn push_assistant_text(
        &self,
        conversation: &mut ConversationState,
        text: &str,
        sink: Option<&MessageSink>,
    ) {
        let message = Message::assistant().with_text(text);
        if let Some(tx) = sink {
            let _ = tx.send(message.clone()).await;
        }
        conversation.messages.push(message);
    }
}

/// Human-readable detail from a privileged tool result
fn result_detail(value: &Value) -> String {
    match value {
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::role::Role;
    use crate::providers::mock::MockProvider;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    struct EchoToolkit {
        tools: Vec<Tool>,
    }

    impl EchoToolkit {
        fn new() -> Self {
            Self {
                tools: vec![Tool::new(
                    "echo",
                    "Echoes back the input",
                    json!({"type": "object", "properties": {"message": {"type": "string"}}, "required": ["message"]}),
                )],
            }
        }
    }

    #[async_trait]
    impl Toolkit for EchoToolkit {
        fn name(&self) -> &str {
            "echo"
        }

        fn instructions(&self) -> &str {
            "Echo things back"
        }

        fn tools(&self) -> &[Tool] {
            &self.tools
        }

        async fn call(&self, tool_call: ToolCall) -> AgentResult<Value> {
            match tool_call.name.as_str() {
                "echo" => Ok(json!({
                    "code": "succeeded",
                    "message": tool_call.arguments["message"].as_str().unwrap_or(""),
                })),
                _ => Err(AgentError::ToolNotFound(tool_call.name)),
            }
        }
    }

    /// A mutating toolkit whose visible tool always asks for confirmation
    struct GatedToolkit {
        tools: Vec<Tool>,
        privileged: Vec<Tool>,
        bindings: Vec<(String, String)>,
        applied: Arc<Mutex<Vec<Value>>>,
    }

    impl GatedToolkit {
        fn new() -> Self {
            Self::with_bindings(vec![(
                CREATE_TASK_TOOL.to_string(),
                "apply_create_rm_task".to_string(),
            )])
        }

        fn with_bindings(bindings: Vec<(String, String)>) -> Self {
            Self {
                tools: vec![Tool::new(
                    CREATE_TASK_TOOL,
                    "Validates and schedules a new task",
                    json!({"type": "object"}),
                )],
                privileged: vec![Tool::new(
                    "apply_create_rm_task",
                    "Actually writes the task",
                    json!({"type": "object"}),
                )],
                bindings,
                applied: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Toolkit for GatedToolkit {
        fn name(&self) -> &str {
            "tasks"
        }

        fn instructions(&self) -> &str {
            "Create tasks"
        }

        fn tools(&self) -> &[Tool] {
            &self.tools
        }

        fn privileged_tools(&self) -> &[Tool] {
            &self.privileged
        }

        fn privileged_bindings(&self) -> Vec<(String, String)> {
            self.bindings.clone()
        }

        async fn call(&self, tool_call: ToolCall) -> AgentResult<Value> {
            match tool_call.name.as_str() {
                CREATE_TASK_TOOL => Ok(json!({
                    "message": "All input is now valid.",
                    "ask_confirmation": true,
                    "code": "succeeded"
                })),
                "apply_create_rm_task" => {
                    self.applied.lock().unwrap().push(tool_call.arguments);
                    Ok(json!({
                        "message": "Successfully created task in database. Task ID: TASK-TEST",
                        "code": "succeeded"
                    }))
                }
                _ => Err(AgentError::ToolNotFound(tool_call.name)),
            }
        }
    }

    fn agent_with(responses: Vec<Message>, toolkit: Box<dyn Toolkit>) -> Agent {
        let mut agent = Agent::new(Box::new(MockProvider::new(responses)), 42);
        agent.add_toolkit(toolkit).unwrap();
        agent
    }

    #[tokio::test]
    async fn test_simple_response() -> Result<()> {
        let agent = agent_with(
            vec![Message::assistant().with_text("Hello!")],
            Box::new(EchoToolkit::new()),
        );
        let mut conversation = ConversationState::default();

        let outcome = agent.reply(&mut conversation, "Hi", None).await?;
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                message: "Hello!".to_string()
            }
        );
        assert_eq!(conversation.messages.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_call_round_trip() -> Result<()> {
        let agent = agent_with(
            vec![
                Message::assistant()
                    .with_tool_request("1", Ok(ToolCall::new("echo", json!({"message": "test"})))),
                Message::assistant().with_text("Done!"),
            ],
            Box::new(EchoToolkit::new()),
        );
        let mut conversation = ConversationState::default();

        let outcome = agent.reply(&mut conversation, "Echo test", None).await?;
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                message: "Done!".to_string()
            }
        );
        // user, request, tool result, final answer
        assert_eq!(conversation.messages.len(), 4);
        assert_eq!(conversation.messages[2].role, Role::Tool);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_failed_result() -> Result<()> {
        let agent = agent_with(
            vec![
                Message::assistant()
                    .with_tool_request("1", Ok(ToolCall::new("missing_tool", json!({})))),
                Message::assistant().with_text("That tool does not exist."),
            ],
            Box::new(EchoToolkit::new()),
        );
        let mut conversation = ConversationState::default();

        let outcome = agent.reply(&mut conversation, "Use it", None).await?;
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                message: "That tool does not exist.".to_string()
            }
        );
        let tool_message = &conversation.messages[2];
        let response = tool_message.content[0].as_tool_response().unwrap();
        assert!(matches!(
            response.tool_result,
            Err(AgentError::ToolNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_dangling_binding_fails_fast() {
        let mut agent = Agent::new(Box::new(MockProvider::new(vec![])), 42);
        let toolkit = GatedToolkit::with_bindings(vec![(
            CREATE_TASK_TOOL.to_string(),
            "apply_missing".to_string(),
        )]);
        let result = agent.add_toolkit(Box::new(toolkit));
        assert!(matches!(
            result,
            Err(AgentError::PrivilegedToolMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_confirmation_suspends_the_turn() -> Result<()> {
        let agent = agent_with(
            vec![Message::assistant().with_tool_request(
                "1",
                Ok(ToolCall::new(
                    CREATE_TASK_TOOL,
                    json!({"customerId": 5, "taskType": "CALL"}),
                )),
            )],
            Box::new(GatedToolkit::new()),
        );
        let mut conversation = ConversationState::default();

        let outcome = agent
            .reply(&mut conversation, "Create a call task for customer 5", None)
            .await?;
        match outcome {
            TurnOutcome::Interrupted { question } => {
                assert!(question.contains("create_rm_task("));
                assert!(question.contains("customerId=5"));
            }
            other => panic!("Expected Interrupted, got {:?}", other),
        }
        assert!(conversation.pending_interrupt.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_yes_routes_to_privileged_with_rm_identity() -> Result<()> {
        let toolkit = GatedToolkit::new();
        let applied = toolkit.applied.clone();
        let agent = agent_with(
            vec![Message::assistant().with_tool_request(
                "1",
                Ok(ToolCall::new(
                    CREATE_TASK_TOOL,
                    json!({
                        "rmId": 999,
                        "customerId": 5,
                        "taskType": "CALL",
                        "taskStatus": "IN_PROGRESS",
                        "taskDueDate": "2026-08-20"
                    }),
                )),
            )],
            Box::new(toolkit),
        );
        let mut conversation = ConversationState::default();

        let first = agent
            .reply(&mut conversation, "Create a call task", None)
            .await?;
        assert!(matches!(first, TurnOutcome::Interrupted { .. }));

        let second = agent.reply(&mut conversation, "  YES ", None).await?;
        match second {
            TurnOutcome::Completed { message } => {
                assert!(message.contains("executed successfully"));
                assert!(message.contains("TASK-TEST"));
            }
            other => panic!("Expected Completed, got {:?}", other),
        }

        let calls = applied.lock().unwrap();
        assert_eq!(calls.len(), 1);
        // The authenticated identity wins over the model-supplied rmId
        assert_eq!(calls[0]["rmId"], json!(42));
        assert_eq!(calls[0]["customerId"], json!(5));
        assert!(conversation.pending_interrupt.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_anything_else_cancels() -> Result<()> {
        let toolkit = GatedToolkit::new();
        let applied = toolkit.applied.clone();
        let agent = agent_with(
            vec![
                Message::assistant().with_tool_request(
                    "1",
                    Ok(ToolCall::new(CREATE_TASK_TOOL, json!({"customerId": 5}))),
                ),
                Message::assistant().with_text("Okay, I won't create the task."),
            ],
            Box::new(toolkit),
        );
        let mut conversation = ConversationState::default();

        agent.reply(&mut conversation, "Create a task", None).await?;
        let outcome = agent.reply(&mut conversation, "nah", None).await?;

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                message: "Okay, I won't create the task.".to_string()
            }
        );
        assert!(applied.lock().unwrap().is_empty());
        // The question and the raw answer are part of the record
        let texts: Vec<String> = conversation.messages.iter().map(|m| m.text()).collect();
        assert!(texts.iter().any(|t| t.contains("Please confirm")));
        assert!(texts.iter().any(|t| t == "nah"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_privileged_counterpart_is_fatal() -> Result<()> {
        // No bindings declared, but the tool still asks for confirmation
        let toolkit = GatedToolkit::with_bindings(vec![]);
        let agent = agent_with(
            vec![Message::assistant().with_tool_request(
                "1",
                Ok(ToolCall::new(CREATE_TASK_TOOL, json!({"customerId": 5}))),
            )],
            Box::new(toolkit),
        );
        let mut conversation = ConversationState::default();

        agent.reply(&mut conversation, "Create a task", None).await?;
        let result = agent.reply(&mut conversation, "yes", None).await;
        let err = result.expect_err("missing counterpart must be fatal");
        assert!(err.to_string().contains("Privileged tool missing"));
        Ok(())
    }
}
