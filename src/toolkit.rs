use async_trait::async_trait;
use serde_json::Value;

use crate::errors::AgentResult;
use crate::models::tool::{Tool, ToolCall};

/// Core trait for a capability provider the agent can operate.
///
/// Tools come in two disjoint sets: `tools()` is bound to the model and may
/// be requested freely; `privileged_tools()` is never bound to the model and
/// is reachable only through the approval-gated execution path. A mutating
/// visible tool declares its privileged counterpart via
/// `privileged_bindings()`, which the agent validates when the toolkit is
/// added; a dangling binding is a deployment defect and fails fast.
#[async_trait]
pub trait Toolkit: Send + Sync {
    /// Get the name of the toolkit
    fn name(&self) -> &str;

    /// Guidance injected into the system instruction
    fn instructions(&self) -> &str;

    /// Tools bound to the model
    fn tools(&self) -> &[Tool];

    /// Tools reachable only after human approval
    fn privileged_tools(&self) -> &[Tool] {
        &[]
    }

    /// Mapping from each mutating visible tool to the privileged tool that
    /// commits it
    fn privileged_bindings(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Invoke a tool with the given arguments. Business-level failures are
    /// `Ok` payloads carrying a failure `code`; `Err` is reserved for
    /// infrastructure problems.
    async fn call(&self, tool_call: ToolCall) -> AgentResult<Value>;
}
