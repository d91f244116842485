//! `tether-client` — Reverse-connection MCP agent client.
//!
//! Embeds a diagnostic agent in a target process that dials *out* to a
//! control plane over HTTP. The control plane pushes JSON-RPC requests
//! down a server-sent-event stream; the agent answers each one with a
//! correlated POST. No inbound port is ever opened on the target.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Your process (service / sidecar / debug harness)         │
//! │                                                           │
//! │   let client = AgentClientBuilder::new(url)               │
//! │       .auth_token("secret")                               │
//! │       .builtin_tools()                                    │
//! │       .tool(MyDiagnosticTool)                             │
//! │       .build()?;                                          │
//! │   client.start().await?;                                  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow (hard-coded by the client)
//!
//! 1. GET the endpoint with `Accept: text/event-stream` (push channel)
//! 2. POST `initialize`, await the server's capabilities
//! 3. POST `notifications/initialized`
//! 4. Main loop:
//!    - Pushed `tools/list` / `tools/call` / `ping` requests are served
//!      and answered with correlated POSTs
//!    - Periodic outbound `ping` keeps a liveness clock fresh
//! 5. On stream loss or liveness timeout: reconnect with exponential
//!    back-off, re-running the full handshake

pub mod backoff;
pub mod builder;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod sse;
pub mod tool;
pub mod transport;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use backoff::ReconnectStrategy;
pub use builder::AgentClientBuilder;
pub use client::{AgentClient, ConnectionState};
pub use config::ClientConfig;
pub use error::ClientError;
pub use tool::{
    AgentTool, CommandBinding, CommandEngine, CommandError, CommandSession, EchoTool,
    ProcessInfoTool, ToolContext, ToolError,
};
pub use transport::TransportError;

// Re-export the wire types so embedders never need to import
// tether-protocol directly.
pub use tether_protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeResult, ListToolsResult,
    ToolContent, ToolDescriptor,
};
