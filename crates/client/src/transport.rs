//! HTTP transport: ad hoc POST exchanges plus a long-lived SSE stream.
//!
//! Two request shapes share one endpoint:
//! - POST carries a single outbound JSON-RPC envelope (request,
//!   notification, or response); the reply body may itself contain a
//!   JSON-RPC response, either as plain JSON or as SSE frames.
//! - GET with `Accept: text/event-stream` opens the push channel the
//!   control plane uses to send us requests.
//!
//! Every outbound request is registered in the pending table before it
//! is sent. A response (from either the POST reply or the stream) and
//! the timeout task race for the entry; whoever `remove`s it first
//! wins, the other finds the key absent and no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::header;
use serde_json::Value;
use tokio::sync::oneshot;

use tether_protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

use crate::config::ClientConfig;
use crate::sse::{self, SseDecoder};

pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timeout waiting for response to {0}")]
    Timeout(String),

    #[error("transport closed")]
    Closed,

    #[error("event stream not connected")]
    NotConnected,

    #[error("protocol: {0}")]
    Protocol(String),
}

/// Receives inbound requests and notifications pushed over the stream.
pub type MessageHandler = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;

/// Fired when the event stream dies (peer close, read error, or idle
/// timeout). Never fired after `close()`.
pub type ConnectionLostHandler = Arc<dyn Fn() + Send + Sync>;

/// The physical connection owner: one shared `reqwest::Client`, the
/// pending-request table, and at most one live event stream.
pub struct HttpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    next_id: AtomicU64,
    closed: AtomicBool,
    session_id: Mutex<Option<String>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
    stream: Mutex<StreamHandle>,
}

#[derive(Default)]
struct StreamHandle {
    task: Option<tokio::task::JoinHandle<()>>,
    connected: Option<Arc<AtomicBool>>,
}

impl HttpTransport {
    pub fn new(config: Arc<ClientConfig>) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;

        tracing::debug!(url = %config.server_url, "transport initialized");

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                config,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                session_id: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                stream: Mutex::new(StreamHandle::default()),
            }),
        })
    }

    // ── Outbound exchanges ───────────────────────────────────────────

    /// Send a JSON-RPC request and wait for the correlated response.
    ///
    /// Completes at most once: by a correlated response (from the POST
    /// reply or the event stream) or by the request timeout, whichever
    /// takes the pending entry first.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = RequestId::Num(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let request = JsonRpcRequest::new(id.clone(), method, params);

        let (tx, mut rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);

        tracing::debug!(id = %id, method, "sending request");

        if let Err(e) = self.inner.post_envelope(&JsonRpcMessage::Request(request)).await {
            // Nothing else will ever complete this entry.
            self.inner.take_pending(&id);
            return Err(e);
        }

        tokio::select! {
            result = &mut rx => result.map_err(|_| TransportError::Closed),
            _ = tokio::time::sleep(self.inner.config.request_timeout()) => {
                match self.inner.take_pending(&id) {
                    Some(_) => Err(TransportError::Timeout(method.to_string())),
                    // The response won the race; the completion is
                    // already in flight on the channel.
                    None => rx.await.map_err(|_| TransportError::Closed),
                }
            }
        }
    }

    /// Send a fire-and-forget notification.
    pub async fn send_notification(
        &self,
        notification: JsonRpcNotification,
    ) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        tracing::debug!(method = %notification.method, "sending notification");
        self.inner
            .post_envelope(&JsonRpcMessage::Notification(notification))
            .await
    }

    /// Send a response to a request the control plane pushed at us.
    pub async fn send_response(&self, response: JsonRpcResponse) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        tracing::debug!(id = %response.id, "sending response");
        self.inner
            .post_envelope(&JsonRpcMessage::Response(response))
            .await
    }

    // ── Event stream ─────────────────────────────────────────────────

    /// Open the push channel. At most one stream may exist; an already
    /// open one is force-closed first. Resolves once the stream
    /// headers are accepted; inbound messages are then delivered to
    /// `on_message` from a background task until the stream dies, at
    /// which point `on_connection_lost` fires (unless we closed).
    pub async fn connect_stream(
        &self,
        on_message: MessageHandler,
        on_connection_lost: ConnectionLostHandler,
    ) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.inner.abort_stream(true);

        let mut req = self
            .inner
            .http
            .get(&self.inner.config.server_url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");
        req = self.inner.apply_session_headers(req);

        let response = req.send().await?;
        let status = response.status();
        if status.as_u16() != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = content_type_of(response.headers());
        if !content_type.contains("text/event-stream") {
            return Err(TransportError::Protocol(format!(
                "expected text/event-stream, got: {content_type}"
            )));
        }

        self.inner.capture_session_id(response.headers());
        if self.inner.session_id.lock().is_none() {
            tracing::warn!("no {SESSION_ID_HEADER} header on the event stream");
        }

        let connected = Arc::new(AtomicBool::new(true));
        let idle_timeout = self.inner.config.stream_idle_timeout();
        let inner = self.inner.clone();
        let connected_flag = connected.clone();

        let task = tokio::spawn(async move {
            let mut response = response;
            let mut decoder = SseDecoder::new();

            let reason = loop {
                match tokio::time::timeout(idle_timeout, response.chunk()).await {
                    Err(_) => break "idle timeout",
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "event stream read error");
                        break "read error";
                    }
                    Ok(Ok(None)) => break "closed by peer",
                    Ok(Ok(Some(bytes))) => {
                        let chunk = String::from_utf8_lossy(&bytes);
                        for event in decoder.feed(&chunk) {
                            if !event.is_message() {
                                tracing::trace!(event_type = %event.event_type, "skipping non-message event");
                                continue;
                            }
                            inner.dispatch_stream_payload(&event.data, &on_message);
                        }
                    }
                }
            };

            connected_flag.store(false, Ordering::SeqCst);
            tracing::info!(reason, "event stream ended");
            if !inner.closed.load(Ordering::SeqCst) {
                on_connection_lost();
            }
        });

        self.inner.register_stream(task, connected)?;

        tracing::info!(url = %self.inner.config.server_url, "event stream established");
        Ok(())
    }

    /// Whether the push channel is currently open.
    pub fn is_stream_connected(&self) -> bool {
        self.inner
            .stream
            .lock()
            .connected
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// The server-issued session token, once one has been seen.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().clone()
    }

    /// Close the transport: fail all pending requests, tear down the
    /// event stream, release network resources. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("closing transport");

        // Dropping the senders fails every waiting request with Closed.
        let cancelled = {
            let mut pending = self.inner.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled pending requests");
        }

        self.inner.abort_stream(false);
    }
}

impl Inner {
    fn take_pending(&self, id: &RequestId) -> Option<oneshot::Sender<JsonRpcResponse>> {
        self.pending.lock().remove(id)
    }

    /// Resolve a pending request. A no-op for ids that were already
    /// completed or timed out.
    fn complete_pending(&self, response: JsonRpcResponse) {
        match self.take_pending(&response.id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(id = %response.id, "response for unknown or already-settled request");
            }
        }
    }

    fn apply_session_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = self.config.auth_token.as_deref().filter(|t| !t.is_empty()) {
            req = req.bearer_auth(token);
        }
        if let Some(session_id) = self.session_id.lock().as_deref() {
            req = req.header(SESSION_ID_HEADER, session_id);
        }
        req
    }

    fn capture_session_id(&self, headers: &header::HeaderMap) {
        let Some(new_id) = headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut session_id = self.session_id.lock();
        if session_id.as_deref() != Some(new_id) {
            tracing::info!(session_id = new_id, "session id received");
            *session_id = Some(new_id.to_string());
        }
    }

    /// POST one envelope and digest the reply: session header, error
    /// statuses, and any JSON-RPC response hiding in the body (plain
    /// JSON or SSE frames). 202/empty replies are fine.
    async fn post_envelope(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let mut req = self
            .http
            .post(&self.config.server_url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json, text/event-stream")
            .json(message);
        req = self.apply_session_headers(req);

        let response = req.send().await?;
        self.capture_session_id(response.headers());

        let status = response.status().as_u16();
        let content_type = content_type_of(response.headers());
        let body = response.text().await?;

        if status >= 400 {
            return Err(TransportError::Status { status, body });
        }

        if content_type.contains("text/event-stream") {
            // The first frame containing a JSON-RPC response is the
            // reply; anything else in the body is ignored.
            for event in sse::decode_body(&body) {
                if !event.is_message() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                    Ok(JsonRpcMessage::Response(resp)) => {
                        self.complete_pending(resp);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "unparseable SSE frame in POST reply");
                    }
                }
            }
        } else if content_type.contains("application/json") && !body.trim().is_empty() {
            match serde_json::from_str::<JsonRpcMessage>(&body)? {
                JsonRpcMessage::Response(resp) => self.complete_pending(resp),
                _ => tracing::debug!("ignoring non-response POST reply body"),
            }
        }

        Ok(())
    }

    fn dispatch_stream_payload(&self, data: &str, on_message: &MessageHandler) {
        match serde_json::from_str::<JsonRpcMessage>(data) {
            Ok(JsonRpcMessage::Response(resp)) => self.complete_pending(resp),
            Ok(msg) => on_message(msg),
            Err(e) => {
                tracing::warn!(error = %e, payload = data, "failed to decode stream payload");
            }
        }
    }

    /// Register the reader task as the live stream. Re-checks `closed`
    /// under the stream lock: a `close()` that ran between spawn and
    /// registration found nothing to abort, so the task is reaped here
    /// instead of lingering on an open socket.
    fn register_stream(
        &self,
        task: tokio::task::JoinHandle<()>,
        connected: Arc<AtomicBool>,
    ) -> Result<(), TransportError> {
        let mut stream = self.stream.lock();
        if self.closed.load(Ordering::SeqCst) {
            task.abort();
            connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }
        stream.task = Some(task);
        stream.connected = Some(connected);
        Ok(())
    }

    /// Tear down the current stream task, if any.
    fn abort_stream(&self, replacing: bool) {
        let mut stream = self.stream.lock();
        if let Some(task) = stream.task.take() {
            if replacing {
                tracing::warn!("closing existing event stream before opening a new one");
            }
            task.abort();
        }
        if let Some(flag) = stream.connected.take() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

fn content_type_of(headers: &header::HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_transport() -> HttpTransport {
        let config = Arc::new(ClientConfig::new("http://localhost:9/mcp"));
        HttpTransport::new(config).unwrap()
    }

    #[tokio::test]
    async fn request_ids_are_monotonic() {
        let transport = test_transport();
        let a = transport.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let b = transport.inner.next_id.fetch_add(1, Ordering::Relaxed);
        assert!(b > a);
    }

    #[tokio::test]
    async fn completion_is_exactly_once() {
        let transport = test_transport();
        let id = RequestId::Num(7);
        let (tx, mut rx) = oneshot::channel();
        transport.inner.pending.lock().insert(id.clone(), tx);

        let resp = JsonRpcResponse::success(id.clone(), serde_json::json!({ "ok": true }));
        transport.inner.complete_pending(resp.clone());
        // Second arrival of the same response must be a no-op.
        transport.inner.complete_pending(resp);

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.id, id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timeout_and_response_race_single_winner() {
        // Two contenders take the same pending entry concurrently;
        // exactly one must win, across many iterations.
        let transport = Arc::new(test_transport());
        for i in 0..200u64 {
            let id = RequestId::Num(i);
            let (tx, _rx) = oneshot::channel();
            transport.inner.pending.lock().insert(id.clone(), tx);

            let t1 = {
                let transport = transport.clone();
                let id = id.clone();
                tokio::spawn(async move { transport.inner.take_pending(&id).is_some() })
            };
            let t2 = {
                let transport = transport.clone();
                let id = id.clone();
                tokio::spawn(async move { transport.inner.take_pending(&id).is_some() })
            };

            let (w1, w2) = (t1.await.unwrap(), t2.await.unwrap());
            assert!(w1 ^ w2, "exactly one taker must win (iteration {i})");
        }
    }

    #[tokio::test]
    async fn close_fails_pending_and_is_idempotent() {
        let transport = test_transport();
        let id = RequestId::Num(1);
        let (tx, rx) = oneshot::channel();
        transport.inner.pending.lock().insert(id, tx);

        transport.close();
        transport.close();

        // The waiting side observes the dropped sender as Closed.
        assert!(rx.await.is_err());
        assert!(transport.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn send_request_after_close_fails_fast() {
        let transport = test_transport();
        transport.close();
        let err = transport.send_request("ping", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn session_id_captured_once_per_value() {
        let transport = test_transport();
        let mut headers = header::HeaderMap::new();
        headers.insert(SESSION_ID_HEADER, "sess-1".parse().unwrap());

        transport.inner.capture_session_id(&headers);
        assert_eq!(transport.session_id().as_deref(), Some("sess-1"));

        headers.insert(SESSION_ID_HEADER, "sess-2".parse().unwrap());
        transport.inner.capture_session_id(&headers);
        assert_eq!(transport.session_id().as_deref(), Some("sess-2"));
    }

    #[tokio::test]
    async fn stream_registered_after_close_is_reaped() {
        // close() racing into the spawn-to-registration gap finds no
        // handle to abort; registration must notice and reap the
        // reader itself.
        let transport = test_transport();
        transport.close();

        let (guard_tx, guard_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _guard = guard_tx;
            std::future::pending::<()>().await;
        });
        let connected = Arc::new(AtomicBool::new(true));

        let err = transport
            .inner
            .register_stream(task, connected.clone())
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(!connected.load(Ordering::SeqCst));
        assert!(!transport.is_stream_connected());
        // The aborted task dropped its guard without completing.
        assert!(guard_rx.await.is_err());
    }

    #[test]
    fn stream_starts_disconnected() {
        let transport = test_transport();
        assert!(!transport.is_stream_connected());
    }

    #[test]
    fn dispatch_routes_response_to_pending_table() {
        let transport = test_transport();
        let id = RequestId::Num(3);
        let (tx, mut rx) = oneshot::channel();
        transport.inner.pending.lock().insert(id, tx);

        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        let on_message: MessageHandler = Arc::new(move |_| {
            seen_clone.store(true, Ordering::SeqCst);
        });

        transport
            .inner
            .dispatch_stream_payload(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#, &on_message);

        assert!(rx.try_recv().is_ok());
        // Responses never reach the inbound message handler.
        assert!(!seen.load(Ordering::SeqCst));
    }

    #[test]
    fn dispatch_routes_request_to_handler() {
        let transport = test_transport();
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        let on_message: MessageHandler = Arc::new(move |msg| {
            assert!(matches!(msg, JsonRpcMessage::Request(_)));
            seen_clone.store(true, Ordering::SeqCst);
        });

        transport
            .inner
            .dispatch_stream_payload(r#"{"jsonrpc":"2.0","id":9,"method":"tools/list"}"#, &on_message);

        assert!(seen.load(Ordering::SeqCst));
    }
}
