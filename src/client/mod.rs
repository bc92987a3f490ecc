//! MP session client.
//!
//! One WebSocket per tenant. All request/response traffic is multiplexed
//! over the single connection by sequence number; server-initiated
//! notifications are classified and forwarded to the event sink, except for
//! upload-completion pushes which resolve waiters registered by the upload
//! helper.
//!
//! The client never recovers a transport failure on its own: the receive
//! loop flips the connected flag and exits, and the supervising session
//! manager drives the reconnect.

pub mod auth;
pub mod chats;
pub mod error;
pub mod events;
pub mod messages;
pub mod upload;
pub mod users;

pub use error::ClientError;
pub use events::{classify, Event, EventKind};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::frame::Frame;
use crate::protocol::types::{Me, User};
use crate::protocol::{opcode, DEFAULT_ENDPOINT, DEFAULT_ORIGIN, PROTOCOL_VERSION};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Receiver half of an upload-completion waiter.
pub type UploadWaiter = oneshot::Receiver<Value>;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive ping cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

/// Connection settings for a session client.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    pub origin: String,
    pub protocol_version: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// The per-tenant protocol engine.
pub struct SessionClient {
    config: SessionConfig,
    device_id: String,

    seq: AtomicU32,
    connected: AtomicBool,

    write: tokio::sync::Mutex<Option<WsWrite>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Frame>>>,
    upload_waiters: Mutex<HashMap<i64, oneshot::Sender<Value>>>,

    users: RwLock<HashMap<i64, User>>,
    me: RwLock<Option<Me>>,
    user_id: AtomicI64,
    auth_token: RwLock<String>,

    cancel: Mutex<CancellationToken>,
    events: Mutex<Option<mpsc::UnboundedSender<Event>>>,

    http: reqwest::Client,
}

impl SessionClient {
    pub fn new(config: SessionConfig, device_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            config,
            device_id: device_id.into(),
            seq: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            write: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            upload_waiters: Mutex::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            me: RwLock::new(None),
            user_id: AtomicI64::new(0),
            auth_token: RwLock::new(String::new()),
            cancel: Mutex::new(CancellationToken::new()),
            events: Mutex::new(None),
            http: reqwest::Client::new(),
        })
    }

    /// Route classified notifications into `tx`. Events are emitted in the
    /// order the server sent them; the consumer owns downstream ordering.
    pub fn set_event_sink(&self, tx: mpsc::UnboundedSender<Event>) {
        *self.events.lock() = Some(tx);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// MP user id of the authenticated account (0 before login).
    pub fn user_id(&self) -> i64 {
        self.user_id.load(Ordering::SeqCst)
    }

    pub fn me(&self) -> Option<Me> {
        self.me.read().clone()
    }

    pub fn auth_token(&self) -> String {
        self.auth_token.read().clone()
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Open the transport. Idempotent if already connected; after a
    /// `close()` this creates a fresh cancellation token.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_connected() {
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        info!(endpoint = %self.config.endpoint, "connecting to MP");

        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Transport(format!("bad endpoint: {e}")))?;
        request.headers_mut().insert(
            "Origin",
            HeaderValue::from_str(&self.config.origin)
                .map_err(|e| ClientError::Transport(format!("bad origin: {e}")))?,
        );
        request
            .headers_mut()
            .insert("User-Agent", HeaderValue::from_static(BROWSER_USER_AGENT));

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ClientError::Transport(format!("dial failed: {e}")))?;

        let (sink, read) = stream.split();
        *self.write.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);

        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.receive_loop(read, token).await;
        });

        info!("MP transport connected");
        Ok(())
    }

    /// Tear down the transport and complete every pending waiter.
    ///
    /// Safe to call concurrently; a later `connect()` is permitted.
    pub async fn close(&self) {
        info!("closing session client");
        self.cancel.lock().cancel();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut sink) = self.write.lock().await.take() {
            let _ = sink.close().await;
        }

        self.drain();
    }

    /// Like `close()`, but keeps the persistent credential for a later
    /// reconnect.
    pub async fn disconnect(&self) {
        self.close().await;
    }

    /// Issue a request and block for its response, up to `timeout`.
    pub async fn request(
        &self,
        op: i32,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);

        let frame = Frame::request(self.config.protocol_version, seq, op, payload);
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                self.pending.lock().remove(&seq);
                return Err(ClientError::Transport(e.to_string()));
            }
        };

        debug!(seq, opcode = op, "sending frame");

        let send_result = {
            let mut guard = self.write.lock().await;
            match guard.as_mut() {
                None => Err(ClientError::NotConnected),
                Some(sink) => sink
                    .send(Message::Text(text.into()))
                    .await
                    .map_err(|e| ClientError::Transport(format!("write failed: {e}"))),
            }
        };
        if let Err(e) = send_result {
            self.pending.lock().remove(&seq);
            warn!(seq, error = %e, "failed to send frame");
            return Err(e);
        }

        let cancel = self.cancel.lock().clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::NotConnected),
            outcome = tokio::time::timeout(timeout, rx) => match outcome {
                Err(_) => Err(ClientError::Timeout),
                // Sender dropped: the pending table was drained on close or
                // transport death.
                Ok(Err(_)) => Err(ClientError::NotConnected),
                Ok(Ok(frame)) => match error::response_error(&frame.payload) {
                    Some(err) => {
                        warn!(seq, opcode = frame.opcode, error = %err, "server returned error");
                        Err(err)
                    }
                    None => Ok(frame.payload),
                },
            },
        };

        self.pending.lock().remove(&seq);
        result
    }

    /// `request` with the default timeout.
    pub async fn call(&self, op: i32, payload: Value) -> Result<Value, ClientError> {
        self.request(op, payload, DEFAULT_TIMEOUT).await
    }

    /// Reserve a completion slot for a server-assigned asset id.
    ///
    /// The returned waiter resolves when a NOTIF_ATTACH push carrying that
    /// id arrives. Re-registering the same id replaces the previous waiter.
    pub fn register_upload_waiter(&self, asset_id: i64) -> UploadWaiter {
        let (tx, rx) = oneshot::channel();
        self.upload_waiters.lock().insert(asset_id, tx);
        rx
    }

    pub fn remove_upload_waiter(&self, asset_id: i64) {
        self.upload_waiters.lock().remove(&asset_id);
    }

    /// Block on an upload waiter up to `timeout`. `None` on timeout or if
    /// the session died first.
    pub async fn await_upload(&self, waiter: UploadWaiter, timeout: Duration) -> Option<Value> {
        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(payload)) => Some(payload),
            _ => None,
        }
    }

    /// Start the keepalive loop. Called after a successful login; ping
    /// failures are logged but never tear the session down themselves.
    pub fn start_ping_loop(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let cancel = self.cancel.lock().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            // Skip the immediate tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if !client.is_connected() {
                            return;
                        }
                        match client.call(opcode::PING, json!({"interactive": true})).await {
                            Ok(_) => debug!("ping ok"),
                            Err(e) => warn!(error = %e, "ping failed"),
                        }
                    }
                }
            }
        });
    }

    pub fn cached_user(&self, user_id: i64) -> Option<User> {
        self.users.read().get(&user_id).cloned()
    }

    pub(crate) fn cache_user(&self, user: User) {
        if user.id != 0 {
            self.users.write().insert(user.id, user);
        }
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Complete every live waiter; their receivers observe `NotConnected`.
    fn drain(&self) {
        let drained = self.pending.lock().drain().count();
        if drained > 0 {
            debug!(count = drained, "drained pending requests");
        }
        self.upload_waiters.lock().clear();
    }

    async fn receive_loop(self: Arc<Self>, mut read: WsRead, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!(error = %e, "transport read failed");
                            break;
                        }
                        None => {
                            info!("transport closed by server");
                            break;
                        }
                    };
                    match msg {
                        Message::Text(text) => self.route_frame(&text),
                        Message::Close(_) => {
                            info!("received close frame");
                            break;
                        }
                        _ => continue,
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        // Stop the ping loop and fail any in-flight request awaits; the
        // supervisor owns recovery from here.
        cancel.cancel();
        self.drain();
    }

    fn route_frame(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to parse frame");
                return;
            }
        };

        debug!(seq = frame.seq, opcode = frame.opcode, "received frame");

        // Seq lookup first: a live pending entry means this is a response.
        let waiter = self.pending.lock().remove(&frame.seq);
        if let Some(tx) = waiter {
            // Slot has capacity 1; a dropped receiver is not an error.
            let _ = tx.send(frame);
            return;
        }

        self.handle_notification(frame);
    }

    fn handle_notification(&self, frame: Frame) {
        // Upload completions resolve waiters and never reach the dispatcher.
        if frame.opcode == opcode::NOTIF_ATTACH {
            self.complete_upload_waiters(&frame.payload);
            return;
        }

        let kind = classify(frame.opcode, &frame.payload);
        if kind == EventKind::Unknown {
            debug!(opcode = frame.opcode, "unmapped notification opcode");
        }

        let sink = self.events.lock().clone();
        if let Some(tx) = sink {
            let _ = tx.send(Event {
                kind,
                opcode: frame.opcode,
                payload: frame.payload,
            });
        }
    }

    fn complete_upload_waiters(&self, payload: &Value) {
        for key in ["fileId", "videoId"] {
            if let Some(id) = payload.get(key).and_then(Value::as_i64) {
                let waiter = self.upload_waiters.lock().remove(&id);
                if let Some(tx) = waiter {
                    let _ = tx.send(payload.clone());
                    debug!(asset_id = id, "upload completed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> Arc<SessionClient> {
        SessionClient::new(SessionConfig::default(), "dev-1")
    }

    #[tokio::test]
    async fn test_request_when_not_connected() {
        let client = test_client();
        let err = client
            .request(opcode::PING, json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::NotConnected);
    }

    #[tokio::test]
    async fn test_route_frame_delivers_to_pending() {
        let client = test_client();
        let (tx, rx) = oneshot::channel();
        client.pending.lock().insert(5, tx);

        client.route_frame(r#"{"ver":11,"cmd":1,"seq":5,"opcode":64,"payload":{"ok":true}}"#);

        let frame = rx.await.unwrap();
        assert_eq!(frame.payload["ok"], true);
        assert!(client.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_attach_notification_completes_waiter() {
        let client = test_client();
        let waiter = client.register_upload_waiter(42);

        client.route_frame(r#"{"ver":11,"cmd":0,"seq":0,"opcode":136,"payload":{"fileId":42}}"#);

        let payload = client
            .await_upload(waiter, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(payload["fileId"], 42);
    }

    #[tokio::test]
    async fn test_attach_notification_without_waiter_is_dropped() {
        let client = test_client();
        // No waiter registered: must not panic or forward to the event sink.
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.set_event_sink(tx);

        client.route_frame(r#"{"ver":11,"cmd":0,"seq":0,"opcode":136,"payload":{"fileId":7}}"#);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notification_forwarded_to_sink() {
        let client = test_client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.set_event_sink(tx);

        client.route_frame(
            r#"{"ver":11,"cmd":0,"seq":0,"opcode":129,"payload":{"chatId":1,"userId":2}}"#,
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Typing);
        assert_eq!(event.payload["chatId"], 1);
    }

    #[tokio::test]
    async fn test_drain_completes_pending_with_not_connected() {
        let client = test_client();
        let (tx, rx) = oneshot::channel::<Frame>();
        client.pending.lock().insert(9, tx);

        client.drain();

        assert!(rx.await.is_err());
    }

    #[test]
    fn test_seq_is_strictly_increasing() {
        let client = test_client();
        let first = client.next_seq();
        let second = client.next_seq();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
