//! Connection controller: owns the lifecycle state machine and drives
//! transport, handshake, heartbeat, and the reconnect loop.
//!
//! State transitions happen only through compare-and-set on a single
//! atomic cell, so simultaneous failure signals (stream loss and
//! liveness timeout firing together) collapse into one recovery
//! sequence. `Stopped` is absorbing.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tether_protocol::Implementation;

use crate::backoff::ReconnectStrategy;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::handler::ProtocolHandler;
use crate::heartbeat::HeartbeatMonitor;
use crate::tool::{AgentTool, CommandEngine};
use crate::transport::{ConnectionLostHandler, HttpTransport, MessageHandler};

/// Lifecycle of the connection to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Stopped,
        }
    }
}

/// Atomic holder for [`ConnectionState`], mutated via CAS only.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn compare_exchange(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn swap(&self, to: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(to as u8, Ordering::SeqCst))
    }
}

/// The reverse-connection agent client.
///
/// Dials out to the control plane, keeps the session alive, and serves
/// whatever requests arrive over the push stream. Construct one via
/// [`AgentClientBuilder`](crate::builder::AgentClientBuilder), then
/// `start()` it; `stop()` tears everything down.
pub struct AgentClient {
    config: Arc<ClientConfig>,
    transport: Arc<HttpTransport>,
    handler: Arc<ProtocolHandler>,
    state: StateCell,
    backoff: ReconnectStrategy,
    heartbeat: HeartbeatMonitor,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient").finish_non_exhaustive()
    }
}

impl AgentClient {
    pub(crate) fn new(
        config: ClientConfig,
        tools: Vec<Arc<dyn AgentTool>>,
        command_engine: Option<Arc<dyn CommandEngine>>,
    ) -> Result<Arc<Self>, ClientError> {
        config.validate()?;
        let config = Arc::new(config);

        let transport = Arc::new(HttpTransport::new(config.clone())?);
        let handler = Arc::new(ProtocolHandler::new(
            transport.clone(),
            config.clone(),
            tools,
            command_engine,
        ));
        let backoff = ReconnectStrategy::new(
            std::time::Duration::from_millis(config.reconnect.initial_delay_ms),
            std::time::Duration::from_millis(config.reconnect.max_delay_ms),
            config.reconnect.multiplier,
        );
        let heartbeat =
            HeartbeatMonitor::new(config.heartbeat_interval(), config.heartbeat_timeout());

        Ok(Arc::new(Self {
            config,
            transport,
            handler,
            state: StateCell::new(ConnectionState::Disconnected),
            backoff,
            heartbeat,
            shutdown: CancellationToken::new(),
        }))
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect to the control plane and complete the handshake.
    ///
    /// Idempotent for an already-connected client. Only the first
    /// connection failure surfaces here; once connected, later
    /// failures are recovered by the reconnect loop and show up only
    /// as state transitions and logs.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        match self.state.load() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Stopped => return Err(ClientError::Stopped),
            _ => {}
        }
        if !self
            .state
            .compare_exchange(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(ClientError::InvalidState(self.state.load()));
        }

        tracing::info!(url = %self.config.server_url, "starting agent client");
        match self.connect().await {
            Ok(()) => match self.settle_connected(ConnectionState::Connecting) {
                ConnectionState::Connected => Ok(()),
                // The stream died right after the handshake; the
                // reconnect loop already owns recovery.
                ConnectionState::Reconnecting => Ok(()),
                _ => Err(ClientError::Stopped),
            },
            Err(e) => {
                self.state
                    .compare_exchange(ConnectionState::Connecting, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Move into Connected after a successful connect sequence and
    /// return the state actually observed. When stop() landed
    /// mid-connect its teardown has already run, so whatever the
    /// sequence started since then is released here.
    fn settle_connected(&self, from: ConnectionState) -> ConnectionState {
        if self.state.compare_exchange(from, ConnectionState::Connected) {
            return ConnectionState::Connected;
        }
        let observed = self.state.load();
        if observed != ConnectionState::Reconnecting {
            self.heartbeat.stop();
            self.transport.close();
        }
        observed
    }

    /// Disconnect and release everything. Idempotent; the client
    /// cannot be restarted afterwards.
    pub async fn stop(&self) {
        if self.state.swap(ConnectionState::Stopped) == ConnectionState::Stopped {
            return;
        }
        tracing::info!("stopping agent client");
        self.shutdown.cancel();
        self.heartbeat.stop();
        self.handler.reset().await;
        self.transport.close();
    }

    /// The full connect sequence: stream, handshake, heartbeat.
    async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let handler = self.handler.clone();
        let on_message: MessageHandler = Arc::new(move |msg| handler.dispatch(msg));

        let weak = Arc::downgrade(self);
        let on_lost: ConnectionLostHandler = Arc::new(move || {
            if let Some(client) = weak.upgrade() {
                client.on_connection_lost();
            }
        });

        self.transport.connect_stream(on_message, on_lost).await?;
        self.handler.initialize().await?;
        self.handler.notify_initialized().await?;

        if self.config.heartbeat.enabled {
            self.start_heartbeat();
        }
        self.backoff.reset();

        tracing::info!(
            server = ?self.handler.server_info().map(|s| s.name),
            session_id = ?self.transport.session_id(),
            "connected"
        );
        Ok(())
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let ping_target = Arc::downgrade(self);
        let timeout_target = Arc::downgrade(self);
        self.heartbeat.start(
            move || {
                let target = ping_target.clone();
                async move {
                    let Some(client) = target.upgrade() else {
                        return;
                    };
                    match client.handler.send_ping().await {
                        // Only an acknowledged ping resets the clock;
                        // a failed one leaves the timeout running.
                        Ok(()) => client.heartbeat.on_pong(),
                        Err(e) => tracing::warn!(error = %e, "heartbeat ping failed"),
                    }
                }
            },
            move || {
                if let Some(client) = timeout_target.upgrade() {
                    tracing::warn!("heartbeat timeout, treating connection as dead");
                    client.on_connection_lost();
                }
            },
        );
    }

    /// Failure entry point, reachable from stream loss and liveness
    /// timeout. Safe to hit from both at once.
    fn on_connection_lost(self: &Arc<Self>) {
        match self.state.load() {
            ConnectionState::Stopped | ConnectionState::Reconnecting => return,
            _ => {}
        }

        if !self.config.reconnect.enabled {
            tracing::warn!("connection lost, reconnect disabled, settling disconnected");
            self.heartbeat.stop();
            // CAS keeps Stopped absorbing against a concurrent stop().
            let _ = self
                .state
                .compare_exchange(ConnectionState::Connected, ConnectionState::Disconnected)
                || self
                    .state
                    .compare_exchange(ConnectionState::Connecting, ConnectionState::Disconnected);
            return;
        }

        let claimed = self
            .state
            .compare_exchange(ConnectionState::Connected, ConnectionState::Reconnecting)
            || self
                .state
                .compare_exchange(ConnectionState::Connecting, ConnectionState::Reconnecting);
        if !claimed {
            // Someone else already began recovery or shutdown.
            return;
        }

        tracing::warn!("connection lost, scheduling reconnect");
        self.heartbeat.stop();

        let client = self.clone();
        tokio::spawn(async move {
            client.reconnect_loop().await;
        });
    }

    /// Retry with exponential backoff until connected, stopped, or the
    /// state otherwise leaves Reconnecting.
    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            if self.state.load() != ConnectionState::Reconnecting {
                return;
            }

            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt_count();
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.state.load() != ConnectionState::Reconnecting {
                return;
            }

            self.heartbeat.stop();
            self.handler.reset().await;

            match self.connect().await {
                Ok(()) => {
                    if self.settle_connected(ConnectionState::Reconnecting)
                        == ConnectionState::Connected
                    {
                        tracing::info!(attempt, "reconnected");
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Connected at the state machine level *and* the push stream is
    /// actually open.
    pub fn is_connected(&self) -> bool {
        self.state.load() == ConnectionState::Connected && self.transport.is_stream_connected()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.handler.server_info()
    }

    pub fn negotiated_protocol_version(&self) -> Option<String> {
        self.handler.negotiated_protocol_version()
    }

    pub fn session_id(&self) -> Option<String> {
        self.transport.session_id()
    }

    pub fn tool_count(&self) -> usize {
        self.handler.tool_count()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
