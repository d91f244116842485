//! Tool and command-engine seams.
//!
//! The actual diagnostic machinery lives outside this crate: the
//! embedding process registers [`AgentTool`] implementations and,
//! optionally, a [`CommandEngine`] that executes raw diagnostic
//! commands against the target process. The protocol handler bridges
//! inbound `tools/call` requests to these traits.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tether_protocol::ToolDescriptor;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A callable diagnostic operation advertised to the control plane.
///
/// Handlers run on the Tokio runtime and may perform async I/O. A
/// failing handler produces an error-flagged tool result on the wire,
/// never a transport-level failure.
#[async_trait::async_trait]
pub trait AgentTool: Send + Sync + 'static {
    /// Name, description, and input schema shown in `tools/list`.
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute the tool with the given JSON arguments.
    async fn call(&self, ctx: ToolContext, args: Value) -> Result<String, ToolError>;
}

/// Context handed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    /// Correlation id of the inbound `tools/call` request.
    pub request_id: String,
    pub tool_name: String,
    /// `_meta` entries from the request plus the client identity
    /// markers (`_mcp_client_mode`, `_mcp_client_name`).
    pub meta: HashMap<String, Value>,
    /// Present when a command engine is configured; tools use it to
    /// run raw diagnostic commands in the bound session.
    pub command: Option<CommandBinding>,
}

/// Errors a tool handler can return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("{0}")]
    Failed(String),
}

impl From<CommandError> for ToolError {
    fn from(e: CommandError) -> Self {
        ToolError::Failed(e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Executes diagnostic command strings against the target process.
///
/// One session is bound per connection; the protocol handler opens it
/// lazily on the first `tools/call` and closes it on reset, so a
/// reconnect always starts fresh.
#[async_trait::async_trait]
pub trait CommandEngine: Send + Sync + 'static {
    async fn open_session(&self) -> Result<CommandSession, CommandError>;

    async fn execute(
        &self,
        session: &CommandSession,
        command: &str,
    ) -> Result<String, CommandError>;

    async fn close_session(&self, session: CommandSession);
}

/// Handle to a command session inside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSession {
    pub id: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    #[error("command session: {0}")]
    Session(String),
    #[error("command failed: {0}")]
    Failed(String),
}

/// An engine plus the session bound to the current connection.
#[derive(Clone)]
pub struct CommandBinding {
    pub engine: Arc<dyn CommandEngine>,
    pub session: CommandSession,
}

impl CommandBinding {
    /// Run a command in the bound session.
    pub async fn run(&self, command: &str) -> Result<String, CommandError> {
        self.engine.execute(&self.session, command).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connectivity smoke-test tool: echoes the input message back.
pub struct EchoTool;

#[async_trait::async_trait]
impl AgentTool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "echo".into(),
            description: "Echo the input message back, for verifying the connection".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "Message to echo" }
                }
            }),
        }
    }

    async fn call(&self, _ctx: ToolContext, args: Value) -> Result<String, ToolError> {
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("Hello from tether agent!");
        Ok(format!("Echo: {message}"))
    }
}

/// Basic runtime information about the hosting process.
pub struct ProcessInfoTool;

#[async_trait::async_trait]
impl AgentTool for ProcessInfoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "process_info".into(),
            description: "Basic information about the process this agent is embedded in".into(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    async fn call(&self, _ctx: ToolContext, _args: Value) -> Result<String, ToolError> {
        let info = serde_json::json!({
            "pid": std::process::id(),
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "agentVersion": env!("CARGO_PKG_VERSION"),
        });
        serde_json::to_string_pretty(&info).map_err(|e| ToolError::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(name: &str) -> ToolContext {
        ToolContext {
            request_id: "req-1".into(),
            tool_name: name.into(),
            meta: HashMap::new(),
            command: None,
        }
    }

    #[tokio::test]
    async fn echo_returns_message() {
        let out = EchoTool
            .call(test_ctx("echo"), serde_json::json!({ "message": "hi" }))
            .await
            .unwrap();
        assert_eq!(out, "Echo: hi");
    }

    #[tokio::test]
    async fn echo_defaults_when_message_missing() {
        let out = EchoTool
            .call(test_ctx("echo"), serde_json::json!({}))
            .await
            .unwrap();
        assert!(out.contains("Hello from tether agent"));
    }

    #[tokio::test]
    async fn process_info_reports_pid() {
        let out = ProcessInfoTool
            .call(test_ctx("process_info"), serde_json::json!({}))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["pid"], std::process::id());
    }

    #[test]
    fn descriptors_have_description_and_schema() {
        for tool in [&EchoTool as &dyn AgentTool, &ProcessInfoTool] {
            let d = tool.descriptor();
            assert!(!d.description.is_empty());
            assert_eq!(d.input_schema["type"], "object");
        }
    }

    #[test]
    fn command_error_converts_to_tool_error() {
        let err: ToolError = CommandError::Failed("no pty".into()).into();
        assert!(err.to_string().contains("no pty"));
    }
}
