//! Fluent construction of an [`AgentClient`].

use std::sync::Arc;

use crate::client::AgentClient;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::tool::{AgentTool, CommandEngine, EchoTool, ProcessInfoTool};

/// Builder for [`AgentClient`].
///
/// ```no_run
/// use tether_client::builder::AgentClientBuilder;
/// use tether_client::tool::EchoTool;
///
/// # async fn demo() -> Result<(), tether_client::error::ClientError> {
/// let client = AgentClientBuilder::new("https://cp.example.com/mcp")
///     .auth_token("secret")
///     .tool(EchoTool)
///     .build()?;
/// client.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct AgentClientBuilder {
    config: ClientConfig,
    tools: Vec<Arc<dyn AgentTool>>,
    command_engine: Option<Arc<dyn CommandEngine>>,
}

impl AgentClientBuilder {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::new(server_url),
            tools: Vec::new(),
            command_engine: None,
        }
    }

    /// Start from a pre-assembled config (e.g. `ClientConfig::from_env()`).
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            tools: Vec::new(),
            command_engine: None,
        }
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn reconnect_enabled(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    pub fn reconnect_initial_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect.initial_delay_ms = ms;
        self
    }

    pub fn reconnect_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect.max_delay_ms = ms;
        self
    }

    pub fn reconnect_multiplier(mut self, multiplier: f64) -> Self {
        self.config.reconnect.multiplier = multiplier;
        self
    }

    pub fn heartbeat_enabled(mut self, enabled: bool) -> Self {
        self.config.heartbeat.enabled = enabled;
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.heartbeat.interval_ms = ms;
        self
    }

    pub fn heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.config.heartbeat.timeout_ms = ms;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn stream_reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.stream_reconnect_delay_ms = ms;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.config.client_version = version.into();
        self
    }

    /// Register a tool to serve over `tools/call`.
    pub fn tool(mut self, tool: impl AgentTool) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Register an already-shared tool.
    pub fn tool_arc(mut self, tool: Arc<dyn AgentTool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Register the built-in diagnostics tools (`echo`, `process_info`).
    pub fn builtin_tools(self) -> Self {
        self.tool(EchoTool).tool(ProcessInfoTool)
    }

    /// Plug in the engine that executes raw diagnostic commands.
    pub fn command_engine(mut self, engine: Arc<dyn CommandEngine>) -> Self {
        self.command_engine = Some(engine);
        self
    }

    /// Validate the config and assemble the client.
    pub fn build(self) -> Result<Arc<AgentClient>, ClientError> {
        AgentClient::new(self.config, self.tools, self.command_engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_settings() {
        let client = AgentClientBuilder::new("http://localhost:8080/mcp")
            .auth_token("t")
            .heartbeat_interval_ms(5_000)
            .reconnect_initial_delay_ms(100)
            .client_name("test-agent")
            .builtin_tools()
            .build()
            .unwrap();

        let config = client.config();
        assert_eq!(config.auth_token.as_deref(), Some("t"));
        assert_eq!(config.heartbeat.interval_ms, 5_000);
        assert_eq!(config.reconnect.initial_delay_ms, 100);
        assert_eq!(config.client_name, "test-agent");
        assert_eq!(client.tool_count(), 2);
    }

    #[test]
    fn build_rejects_bad_url() {
        assert!(AgentClientBuilder::new("not-a-url").build().is_err());
    }

    #[test]
    fn build_rejects_bad_multiplier() {
        let err = AgentClientBuilder::new("http://localhost:8080/mcp")
            .reconnect_multiplier(0.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
