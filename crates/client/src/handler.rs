//! Protocol logic on top of the transport: the initialize handshake
//! and dispatch of requests the control plane pushes at us.
//!
//! Inbound requests are answered with JSON-RPC responses POSTed back
//! through the transport. Tool-level failures travel as error-flagged
//! `tools/call` results; JSON-RPC error responses are reserved for
//! protocol problems (unknown method, bad params, dispatch panic).

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Value};

use tether_protocol::{
    error_code, method, CallToolParams, CallToolResult, Implementation, InitializeParams,
    InitializeResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, PROTOCOL_VERSION,
};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::tool::{AgentTool, CommandBinding, CommandEngine, CommandSession, ToolContext};
use crate::transport::{HttpTransport, TransportError};

/// What the control plane told us about itself during `initialize`.
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    pub protocol_version: String,
    pub server_info: Implementation,
    pub capabilities: Value,
}

/// Handles the MCP handshake and serves pushed requests against the
/// registered tool set.
pub struct ProtocolHandler {
    transport: Arc<HttpTransport>,
    config: Arc<ClientConfig>,
    tools: HashMap<String, Arc<dyn AgentTool>>,
    command_engine: Option<Arc<dyn CommandEngine>>,
    negotiated: parking_lot::Mutex<Option<NegotiatedSession>>,
    // Tokio mutex: held across open_session().await on first use.
    command_session: tokio::sync::Mutex<Option<CommandSession>>,
}

impl ProtocolHandler {
    pub fn new(
        transport: Arc<HttpTransport>,
        config: Arc<ClientConfig>,
        tools: Vec<Arc<dyn AgentTool>>,
        command_engine: Option<Arc<dyn CommandEngine>>,
    ) -> Self {
        let mut by_name: HashMap<String, Arc<dyn AgentTool>> = HashMap::new();
        for tool in tools {
            let name = tool.descriptor().name;
            if by_name.insert(name.clone(), tool).is_some() {
                tracing::warn!(tool = %name, "duplicate tool registration, keeping the later one");
            }
        }
        tracing::debug!(count = by_name.len(), "tools registered");

        Self {
            transport,
            config,
            tools: by_name,
            command_engine,
            negotiated: parking_lot::Mutex::new(None),
            command_session: tokio::sync::Mutex::new(None),
        }
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// Perform the `initialize` exchange and record what the server
    /// negotiated. An error response from the control plane aborts the
    /// connection attempt.
    pub async fn initialize(&self) -> Result<InitializeResult, ClientError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: json!({}),
            client_info: Implementation {
                name: self.config.client_name.clone(),
                version: self.config.client_version.clone(),
            },
        };
        let params = serde_json::to_value(&params).map_err(TransportError::Json)?;

        let response = self
            .transport
            .send_request(method::INITIALIZE, Some(params))
            .await?;
        let value = response
            .into_result()
            .map_err(|e| ClientError::Handshake(format!("initialize rejected: {e}")))?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| ClientError::Handshake(format!("malformed initialize result: {e}")))?;

        if result.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                ours = PROTOCOL_VERSION,
                theirs = %result.protocol_version,
                "protocol version mismatch, continuing anyway"
            );
        }
        tracing::info!(
            server = %result.server_info.name,
            server_version = %result.server_info.version,
            protocol = %result.protocol_version,
            "initialized"
        );

        *self.negotiated.lock() = Some(NegotiatedSession {
            protocol_version: result.protocol_version.clone(),
            server_info: result.server_info.clone(),
            capabilities: result.capabilities.clone(),
        });
        Ok(result)
    }

    /// Complete the handshake by announcing readiness.
    pub async fn notify_initialized(&self) -> Result<(), ClientError> {
        self.transport
            .send_notification(JsonRpcNotification::new(method::NOTIFICATION_INITIALIZED))
            .await?;
        Ok(())
    }

    /// Liveness probe; fails when the control plane rejects the ping.
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        let response = self.transport.send_request(method::PING, None).await?;
        if let Err(e) = response.into_result() {
            return Err(ClientError::Transport(TransportError::Protocol(format!(
                "ping rejected: {e}"
            ))));
        }
        Ok(())
    }

    /// Drop per-connection state: the negotiated session and the
    /// command session, if one was opened. The next connection starts
    /// fresh.
    pub async fn reset(&self) {
        self.negotiated.lock().take();
        let session = self.command_session.lock().await.take();
        if let Some(session) = session {
            if let Some(engine) = &self.command_engine {
                tracing::debug!(session = %session.id, "closing command session");
                engine.close_session(session).await;
            }
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    /// Entry point for messages arriving on the event stream. Requests
    /// are served on their own task so a slow tool never blocks the
    /// stream reader.
    pub fn dispatch(self: &Arc<Self>, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Request(request) => {
                let handler = self.clone();
                tokio::spawn(async move {
                    handler.handle_request(request).await;
                });
            }
            JsonRpcMessage::Notification(notification) => self.handle_notification(notification),
            // The transport settles responses against the pending
            // table before they reach us.
            JsonRpcMessage::Response(response) => {
                tracing::debug!(id = %response.id, "stray response reached the handler");
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) {
        tracing::debug!(id = %request.id, method = %request.method, "handling pushed request");
        let response = self.respond_to(request).await;
        if let Err(e) = self.transport.send_response(response).await {
            tracing::warn!(error = %e, "failed to deliver response");
        }
    }

    /// Compute the response for a pushed request. Panics inside tool
    /// handlers are contained and reported as internal errors.
    async fn respond_to(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        match request.method.as_str() {
            method::PING => JsonRpcResponse::success(id, json!({})),
            method::TOOLS_LIST => {
                let tools = self
                    .tools
                    .values()
                    .map(|t| t.descriptor())
                    .collect::<Vec<_>>();
                match serde_json::to_value(ListToolsResult { tools }) {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => {
                        JsonRpcResponse::failure(id, error_code::INTERNAL_ERROR, e.to_string())
                    }
                }
            }
            method::TOOLS_CALL => {
                let params: CallToolParams = match request
                    .params
                    .ok_or_else(|| "missing params".to_string())
                    .and_then(|p| serde_json::from_value(p).map_err(|e| e.to_string()))
                {
                    Ok(params) => params,
                    Err(e) => {
                        return JsonRpcResponse::failure(id, error_code::INVALID_PARAMS, e);
                    }
                };

                let outcome = std::panic::AssertUnwindSafe(self.call_tool(&id.to_string(), params))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(result) => match serde_json::to_value(result) {
                        Ok(value) => JsonRpcResponse::success(id, value),
                        Err(e) => {
                            JsonRpcResponse::failure(id, error_code::INTERNAL_ERROR, e.to_string())
                        }
                    },
                    Err(_) => {
                        tracing::error!(id = %id, "tool handler panicked");
                        JsonRpcResponse::failure(
                            id,
                            error_code::INTERNAL_ERROR,
                            "tool handler panicked",
                        )
                    }
                }
            }
            other => {
                tracing::warn!(method = other, "unknown method");
                JsonRpcResponse::failure(
                    id,
                    error_code::METHOD_NOT_FOUND,
                    format!("method not found: {other}"),
                )
            }
        }
    }

    async fn call_tool(&self, request_id: &str, params: CallToolParams) -> CallToolResult {
        let Some(tool) = self.tools.get(&params.name) else {
            tracing::warn!(tool = %params.name, "tools/call for unknown tool");
            return CallToolResult::error(format!("tool not found: {}", params.name));
        };

        let mut meta = params.meta.unwrap_or_default();
        meta.insert("_mcp_client_mode".into(), json!("reverse"));
        meta.insert("_mcp_client_name".into(), json!(self.config.client_name));

        let ctx = ToolContext {
            request_id: request_id.to_string(),
            tool_name: params.name.clone(),
            meta,
            command: self.command_binding().await,
        };
        let args = params.arguments.unwrap_or_else(|| json!({}));

        tracing::info!(tool = %params.name, "invoking tool");
        match tool.call(ctx, args).await {
            Ok(text) => CallToolResult::text(text),
            Err(e) => {
                tracing::warn!(tool = %params.name, error = %e, "tool failed");
                CallToolResult::error(e.to_string())
            }
        }
    }

    /// Bind the per-connection command session, opening it lazily on
    /// first use. Open failures degrade the binding to absent rather
    /// than failing the call.
    async fn command_binding(&self) -> Option<CommandBinding> {
        let engine = self.command_engine.clone()?;
        let mut slot = self.command_session.lock().await;
        if slot.is_none() {
            match engine.open_session().await {
                Ok(session) => {
                    tracing::info!(session = %session.id, "command session opened");
                    *slot = Some(session);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open command session");
                    return None;
                }
            }
        }
        slot.clone().map(|session| CommandBinding { engine, session })
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            method::NOTIFICATION_CANCELLED => {
                let request_id = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let reason = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("reason"))
                    .and_then(|r| r.as_str())
                    .unwrap_or("")
                    .to_string();
                // Best effort only: an in-flight tool call runs to
                // completion and its late response is dropped upstream.
                tracing::info!(request_id = %request_id, reason = %reason, "request cancelled by control plane");
            }
            other => {
                tracing::debug!(method = other, "ignoring notification");
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn is_initialized(&self) -> bool {
        self.negotiated.lock().is_some()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.negotiated.lock().as_ref().map(|n| n.server_info.clone())
    }

    pub fn negotiated_protocol_version(&self) -> Option<String> {
        self.negotiated
            .lock()
            .as_ref()
            .map(|n| n.protocol_version.clone())
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{CommandError, EchoTool, ToolError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_protocol::RequestId;

    fn handler_with(
        tools: Vec<Arc<dyn AgentTool>>,
        engine: Option<Arc<dyn CommandEngine>>,
    ) -> ProtocolHandler {
        // Dead port: these tests never reach the network.
        let config = Arc::new(ClientConfig::new("http://localhost:9/mcp"));
        let transport = Arc::new(HttpTransport::new(config.clone()).unwrap());
        ProtocolHandler::new(transport, config, tools, engine)
    }

    fn request(method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest::new(RequestId::Num(1), method, params)
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let handler = handler_with(vec![], None);
        let response = handler.respond_to(request(method::PING, None)).await;
        assert_eq!(response.result, Some(json!({})));
    }

    #[tokio::test]
    async fn tools_list_returns_registered_descriptors() {
        let handler = handler_with(vec![Arc::new(EchoTool)], None);
        let response = handler.respond_to(request(method::TOOLS_LIST, None)).await;
        let listed: ListToolsResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(listed.tools.len(), 1);
        assert_eq!(listed.tools[0].name, "echo");
    }

    #[tokio::test]
    async fn tools_call_echo_round_trip() {
        let handler = handler_with(vec![Arc::new(EchoTool)], None);
        let params = json!({ "name": "echo", "arguments": { "message": "hi" } });
        let response = handler
            .respond_to(request(method::TOOLS_CALL, Some(params)))
            .await;
        let result: CallToolResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content[0].text, "Echo: hi");
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_flagged_result() {
        let handler = handler_with(vec![], None);
        let params = json!({ "name": "nope" });
        let response = handler
            .respond_to(request(method::TOOLS_CALL, Some(params)))
            .await;
        // Tool-level failure, not a JSON-RPC error.
        assert!(response.error.is_none());
        let result: CallToolResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(result.is_error);
        assert!(result.content[0].text.contains("tool not found: nope"));
    }

    #[tokio::test]
    async fn missing_params_is_invalid_params() {
        let handler = handler_with(vec![], None);
        let response = handler.respond_to(request(method::TOOLS_CALL, None)).await;
        assert_eq!(response.error.unwrap().code, error_code::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let handler = handler_with(vec![], None);
        let response = handler.respond_to(request("resources/list", None)).await;
        assert_eq!(response.error.unwrap().code, error_code::METHOD_NOT_FOUND);
    }

    struct MetaProbe;

    #[async_trait::async_trait]
    impl AgentTool for MetaProbe {
        fn descriptor(&self) -> tether_protocol::ToolDescriptor {
            tether_protocol::ToolDescriptor {
                name: "probe".into(),
                description: String::new(),
                input_schema: json!({}),
            }
        }

        async fn call(&self, ctx: ToolContext, _args: Value) -> Result<String, ToolError> {
            assert_eq!(ctx.meta.get("_mcp_client_mode"), Some(&json!("reverse")));
            assert!(ctx.meta.contains_key("_mcp_client_name"));
            assert_eq!(ctx.meta.get("traceId"), Some(&json!("t-1")));
            Ok("ok".into())
        }
    }

    #[tokio::test]
    async fn call_meta_carries_reverse_mode_markers() {
        let handler = handler_with(vec![Arc::new(MetaProbe)], None);
        let params = json!({ "name": "probe", "_meta": { "traceId": "t-1" } });
        let response = handler
            .respond_to(request(method::TOOLS_CALL, Some(params)))
            .await;
        let result: CallToolResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(!result.is_error, "{:?}", result.content);
    }

    #[derive(Default)]
    struct CountingEngine {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CommandEngine for CountingEngine {
        async fn open_session(&self) -> Result<CommandSession, CommandError> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(CommandSession {
                id: format!("s-{n}"),
            })
        }

        async fn execute(
            &self,
            _session: &CommandSession,
            command: &str,
        ) -> Result<String, CommandError> {
            Ok(format!("ran: {command}"))
        }

        async fn close_session(&self, _session: CommandSession) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn command_session_opens_lazily_and_once() {
        let engine = Arc::new(CountingEngine::default());
        let handler = handler_with(vec![], Some(engine.clone()));

        assert_eq!(engine.opened.load(Ordering::SeqCst), 0);
        let first = handler.command_binding().await.unwrap();
        let second = handler.command_binding().await.unwrap();
        assert_eq!(engine.opened.load(Ordering::SeqCst), 1);
        assert_eq!(first.session, second.session);
    }

    #[tokio::test]
    async fn reset_closes_command_session_and_clears_negotiation() {
        let engine = Arc::new(CountingEngine::default());
        let handler = handler_with(vec![], Some(engine.clone()));
        handler.command_binding().await.unwrap();

        *handler.negotiated.lock() = Some(NegotiatedSession {
            protocol_version: PROTOCOL_VERSION.into(),
            server_info: Implementation {
                name: "cp".into(),
                version: "1".into(),
            },
            capabilities: json!({}),
        });

        handler.reset().await;
        assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
        assert!(!handler.is_initialized());

        // A second reset finds nothing to close.
        handler.reset().await;
        assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
    }
}
