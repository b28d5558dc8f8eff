//! Parlance Transport - Real-Time Chat Socket Client
//!
//! This crate owns the single WebSocket connection to the chat backend and
//! exposes a typed publish/subscribe surface on top of it. Upper layers never
//! see raw frames; every notification is translated into a [`TransportEvent`]
//! before dispatch.
//!
//! # Protocol
//!
//! JSON text frames, tagged by `type`, camelCase on the wire.
//!
//! ## Outbound
//! ```json
//! {
//!     "type": "sendMessage",
//!     "chatId": "c42",
//!     "message": "Hi",
//!     "agentId": "a1",
//!     "messageId": "0e7a…",
//!     "timestamp": "2024-05-01T12:30:00Z"
//! }
//! ```
//!
//! ## Inbound
//! ```json
//! {
//!     "type": "message",
//!     "id": "m9",
//!     "chat_id": "c42",
//!     "sender": "assistant",
//!     "message": "Hello!",
//!     "timestamp": "2024-05-01T12:30:02Z"
//! }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use parlance_transport::{SocketClient, SocketConfig, EventKind};
//!
//! let socket = SocketClient::new(SocketConfig::default());
//! socket.on(EventKind::Message, "view", |event| {
//!     println!("got {:?}", event);
//! });
//! socket.connect(&agent_id).await?;
//! socket.join_chat(&chat_id)?;
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

pub use parlance_types::ConnectionState;
use parlance_types::{AgentId, AgentStatus, ChatId, ChatMessage, DeliveryStatus, Lead, MessageId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket client configuration
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// WebSocket endpoint; the agent id is appended as a query parameter
    pub endpoint: String,
    /// Bound on the connect handshake; the attempt fails once it elapses
    pub handshake_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            endpoint: std::env::var("PARLANCE_WS_URL")
                .unwrap_or_else(|_| "ws://localhost:8000/ws".to_string()),
            handshake_timeout: Duration::from_secs(20),
        }
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Socket not connected")]
    NotConnected,

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

// ============================================================================
// Wire Protocol
// ============================================================================

/// Frames this client sends to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Deliver a user message into a chat room
    #[serde(rename_all = "camelCase")]
    SendMessage {
        chat_id: ChatId,
        message: String,
        agent_id: AgentId,
        /// Client-generated id, echoed back by the backend so the optimistic
        /// insert and the delivered message reconcile to one entry
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },
    /// Enter a chat room
    #[serde(rename_all = "camelCase")]
    JoinChat { chat_id: ChatId },
    /// Leave a chat room
    #[serde(rename_all = "camelCase")]
    LeaveChat { chat_id: ChatId },
    /// Local user started typing
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: ChatId },
    /// Local user went idle
    #[serde(rename_all = "camelCase")]
    StopTyping { chat_id: ChatId },
}

/// Frames the backend pushes to this client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// A message landed in a room this client joined
    Message(ChatMessage),
    /// Remote party started typing
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: ChatId },
    /// Remote party went idle
    #[serde(rename_all = "camelCase")]
    StopTyping { chat_id: ChatId },
    /// Delivery status for a previously sent message
    #[serde(rename_all = "camelCase")]
    MessageStatus {
        message_id: MessageId,
        status: DeliveryStatus,
    },
    /// Backend-side failure
    Error { message: String },
    /// Agent availability changed
    #[serde(rename_all = "camelCase")]
    AgentStatus {
        agent_id: AgentId,
        status: AgentStatus,
    },
    /// A lead was captured
    NewLead(Lead),
    /// A lead changed
    LeadUpdated(Lead),
}

// ============================================================================
// Public Events
// ============================================================================

/// Everything upper layers can observe from the transport
///
/// Closed set; dispatch is matched exhaustively, so adding a variant forces
/// every consumer to decide what to do with it.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Fired on every transition into connected, and into disconnected when
    /// involuntary (with a reason)
    ConnectionStatus {
        connected: bool,
        reason: Option<String>,
    },
    Message(ChatMessage),
    Typing { chat_id: ChatId },
    StopTyping { chat_id: ChatId },
    MessageStatus {
        message_id: MessageId,
        status: DeliveryStatus,
    },
    AgentStatus {
        agent_id: AgentId,
        status: AgentStatus,
    },
    NewLead(Lead),
    LeadUpdated(Lead),
    Error { message: String },
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::ConnectionStatus { .. } => EventKind::ConnectionStatus,
            TransportEvent::Message(_) => EventKind::Message,
            TransportEvent::Typing { .. } => EventKind::Typing,
            TransportEvent::StopTyping { .. } => EventKind::StopTyping,
            TransportEvent::MessageStatus { .. } => EventKind::MessageStatus,
            TransportEvent::AgentStatus { .. } => EventKind::AgentStatus,
            TransportEvent::NewLead(_) => EventKind::NewLead,
            TransportEvent::LeadUpdated(_) => EventKind::LeadUpdated,
            TransportEvent::Error { .. } => EventKind::Error,
        }
    }
}

impl From<ServerFrame> for TransportEvent {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::Message(message) => TransportEvent::Message(message),
            ServerFrame::Typing { chat_id } => TransportEvent::Typing { chat_id },
            ServerFrame::StopTyping { chat_id } => TransportEvent::StopTyping { chat_id },
            ServerFrame::MessageStatus { message_id, status } => {
                TransportEvent::MessageStatus { message_id, status }
            }
            ServerFrame::Error { message } => TransportEvent::Error { message },
            ServerFrame::AgentStatus { agent_id, status } => {
                TransportEvent::AgentStatus { agent_id, status }
            }
            ServerFrame::NewLead(lead) => TransportEvent::NewLead(lead),
            ServerFrame::LeadUpdated(lead) => TransportEvent::LeadUpdated(lead),
        }
    }
}

/// Discriminant used for handler registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionStatus,
    Message,
    Typing,
    StopTyping,
    MessageStatus,
    AgentStatus,
    NewLead,
    LeadUpdated,
    Error,
}

// ============================================================================
// Handler Registry
// ============================================================================

/// Callback signature accepted by [`SocketClient::on`]
pub type EventHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Keyed handler set per event kind
///
/// Registering the same `(kind, key)` twice replaces the previous handler, so
/// repeated registration never causes duplicate delivery.
#[derive(Default)]
struct HandlerRegistry {
    handlers: RwLock<HashMap<EventKind, HashMap<String, EventHandler>>>,
}

impl HandlerRegistry {
    fn insert(&self, kind: EventKind, key: String, handler: EventHandler) {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .insert(key, handler);
    }

    fn remove(&self, kind: EventKind, key: &str) {
        if let Some(map) = self.handlers.write().get_mut(&kind) {
            map.remove(key);
        }
    }

    fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Invoke every handler registered for the event's kind
    ///
    /// A panicking handler is caught and logged; siblings still run.
    fn dispatch(&self, event: &TransportEvent) {
        let targets: Vec<(String, EventHandler)> = {
            let handlers = self.handlers.read();
            match handlers.get(&event.kind()) {
                Some(map) => map
                    .iter()
                    .map(|(key, handler)| (key.clone(), handler.clone()))
                    .collect(),
                None => return,
            }
        };

        for (key, handler) in targets {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(kind = ?event.kind(), key = %key, "event handler panicked");
            }
        }
    }
}

// ============================================================================
// Socket Client
// ============================================================================

struct ConnState {
    lifecycle: ConnectionState,
    agent_id: Option<AgentId>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Connection epoch. Bumped on every connect, disconnect and involuntary
    /// close; tasks belonging to an older epoch must not touch shared state.
    generation: u64,
}

struct Inner {
    state: Mutex<ConnState>,
    handlers: HandlerRegistry,
}

impl Inner {
    fn dispatch(&self, event: &TransportEvent) {
        self.handlers.dispatch(event);
    }

    /// Dispatch only if the originating connection is still the current one
    fn dispatch_if_current(&self, generation: u64, event: &TransportEvent) {
        {
            let state = self.state.lock();
            if state.generation != generation {
                return;
            }
        }
        self.dispatch(event);
    }

    /// Reader task observed the socket closing underneath us
    fn connection_lost(&self, generation: u64, reason: String) {
        {
            let mut state = self.state.lock();
            if state.generation != generation
                || state.lifecycle != ConnectionState::Connected
            {
                return;
            }
            state.generation += 1;
            state.lifecycle = ConnectionState::Disconnected;
            state.outbound = None;
            state.agent_id = None;
        }
        warn!(reason = %reason, "socket connection lost");
        self.dispatch(&TransportEvent::ConnectionStatus {
            connected: false,
            reason: Some(reason),
        });
    }
}

/// Client for the real-time chat socket
///
/// Owns at most one underlying WebSocket connection. Cheap to clone; clones
/// share the connection and the handler registry.
#[derive(Clone)]
pub struct SocketClient {
    config: Arc<SocketConfig>,
    inner: Arc<Inner>,
}

impl SocketClient {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Inner {
                state: Mutex::new(ConnState {
                    lifecycle: ConnectionState::Disconnected,
                    agent_id: None,
                    outbound: None,
                    generation: 0,
                }),
                handlers: HandlerRegistry::default(),
            }),
        }
    }

    /// Current lifecycle state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().lifecycle
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Agent the current (or in-flight) connection is keyed to
    pub fn current_agent(&self) -> Option<AgentId> {
        self.inner.state.lock().agent_id.clone()
    }

    /// Open the connection for an agent
    ///
    /// Idempotent: while a connection is open or a handshake is in flight,
    /// further calls return without opening a second socket. The handshake is
    /// bounded by `handshake_timeout`; on failure the state returns to
    /// disconnected and a `ConnectionStatus { connected: false }` event fires.
    pub async fn connect(&self, agent_id: &AgentId) -> TransportResult<()> {
        let generation = {
            let mut state = self.inner.state.lock();
            match state.lifecycle {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnected => {}
            }
            state.generation += 1;
            state.lifecycle = ConnectionState::Connecting;
            state.agent_id = Some(agent_id.clone());
            state.generation
        };

        let url = handshake_url(&self.config.endpoint, agent_id);
        debug!(agent = %agent_id, "connecting socket");

        let ws = match tokio::time::timeout(self.config.handshake_timeout, connect_async(&url))
            .await
        {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(err)) => {
                self.fail_connect(generation, err.to_string());
                return Err(TransportError::ConnectionFailed(err.to_string()));
            }
            Err(_) => {
                let timeout = self.config.handshake_timeout;
                self.fail_connect(generation, format!("handshake timed out after {timeout:?}"));
                return Err(TransportError::HandshakeTimeout(timeout));
            }
        };

        let outbound_rx = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                // disconnect() won the race during the handshake
                None
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                state.lifecycle = ConnectionState::Connected;
                state.outbound = Some(tx);
                Some(rx)
            }
        };

        let outbound_rx = match outbound_rx {
            Some(rx) => rx,
            None => {
                debug!("connection superseded during handshake, dropping socket");
                let mut ws = ws;
                let _ = ws.close(None).await;
                return Ok(());
            }
        };

        let (write, read) = ws.split();
        tokio::spawn(writer_task(write, outbound_rx));
        tokio::spawn(reader_task(self.inner.clone(), read, generation));

        debug!(agent = %agent_id, "socket connected");
        // Fenced: if the reader already lost the socket, its disconnected
        // event must not be followed by a stale connected one.
        self.inner.dispatch_if_current(
            generation,
            &TransportEvent::ConnectionStatus {
                connected: true,
                reason: None,
            },
        );
        Ok(())
    }

    /// Tear down the connection and clear every registered listener
    ///
    /// Safe no-op when never connected. Voluntary teardown dispatches no
    /// event; there is nobody left registered to hear it.
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle == ConnectionState::Disconnected {
                return;
            }
            state.generation += 1;
            state.lifecycle = ConnectionState::Disconnected;
            state.outbound = None;
            state.agent_id = None;
        }
        self.inner.handlers.clear();
        debug!("socket disconnected");
    }

    /// Tear down and reconnect for an agent
    pub async fn reconnect(&self, agent_id: &AgentId) -> TransportResult<()> {
        self.disconnect();
        self.connect(agent_id).await
    }

    /// Enter a chat room; errors if not connected
    pub fn join_chat(&self, chat_id: &ChatId) -> TransportResult<()> {
        self.send_frame(ClientFrame::JoinChat {
            chat_id: chat_id.clone(),
        })
    }

    /// Leave a chat room; silent no-op if not connected
    pub fn leave_chat(&self, chat_id: &ChatId) {
        if self
            .send_frame(ClientFrame::LeaveChat {
                chat_id: chat_id.clone(),
            })
            .is_err()
        {
            debug!(chat = %chat_id, "leave_chat skipped, not connected");
        }
    }

    /// Queue a message for delivery; errors if not connected
    pub fn send_message(
        &self,
        chat_id: &ChatId,
        message: &str,
        agent_id: &AgentId,
        message_id: &MessageId,
    ) -> TransportResult<()> {
        self.send_frame(ClientFrame::SendMessage {
            chat_id: chat_id.clone(),
            message: message.to_string(),
            agent_id: agent_id.clone(),
            message_id: message_id.clone(),
            timestamp: Utc::now(),
        })
    }

    /// Signal the local user is typing; silent no-op if not connected
    pub fn start_typing(&self, chat_id: &ChatId) {
        let _ = self.send_frame(ClientFrame::Typing {
            chat_id: chat_id.clone(),
        });
    }

    /// Signal the local user went idle; silent no-op if not connected
    pub fn stop_typing(&self, chat_id: &ChatId) {
        let _ = self.send_frame(ClientFrame::StopTyping {
            chat_id: chat_id.clone(),
        });
    }

    /// Register a handler for an event kind under a caller-chosen key
    ///
    /// Re-registering the same `(kind, key)` replaces the old handler.
    pub fn on<F>(&self, kind: EventKind, key: impl Into<String>, handler: F)
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.handlers.insert(kind, key.into(), Arc::new(handler));
    }

    /// Remove the handler registered under `(kind, key)`, if any
    pub fn off(&self, kind: EventKind, key: &str) {
        self.inner.handlers.remove(kind, key);
    }

    fn send_frame(&self, frame: ClientFrame) -> TransportResult<()> {
        let outbound = {
            let state = self.inner.state.lock();
            match (&state.lifecycle, &state.outbound) {
                (ConnectionState::Connected, Some(tx)) => tx.clone(),
                _ => return Err(TransportError::NotConnected),
            }
        };
        let text = serde_json::to_string(&frame)?;
        outbound
            .send(text)
            .map_err(|_| TransportError::SendFailed("writer task stopped".to_string()))
    }

    fn fail_connect(&self, generation: u64, reason: String) {
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.lifecycle = ConnectionState::Disconnected;
            state.outbound = None;
            state.agent_id = None;
        }
        warn!(reason = %reason, "socket connect failed");
        self.inner.dispatch(&TransportEvent::ConnectionStatus {
            connected: false,
            reason: Some(reason),
        });
    }
}

impl Default for SocketClient {
    fn default() -> Self {
        Self::new(SocketConfig::default())
    }
}

/// Handshake request URL for an agent
///
/// An authority-only endpoint (`ws://host:port`) would yield an empty request
/// path, which servers reject; pin the path to `/` in that case.
fn handshake_url(endpoint: &str, agent_id: &AgentId) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    let after_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    if after_scheme.contains('/') {
        format!("{endpoint}?agentId={agent_id}")
    } else {
        format!("{endpoint}/?agentId={agent_id}")
    }
}

// ============================================================================
// Connection Tasks
// ============================================================================

/// Drains queued frames onto the socket until the queue closes
async fn writer_task(
    mut write: SplitSink<WsStream, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = outbound.recv().await {
        if write.send(WsMessage::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = write.close().await;
}

/// Translates incoming frames into events until the socket closes
async fn reader_task(inner: Arc<Inner>, mut read: SplitStream<WsStream>, generation: u64) {
    loop {
        match read.next().await {
            Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(frame) => inner.dispatch_if_current(generation, &TransportEvent::from(frame)),
                Err(err) => warn!(error = %err, "discarding unparseable frame"),
            },
            Some(Ok(WsMessage::Close(_))) | None => {
                inner.connection_lost(generation, "connection closed".to_string());
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                inner.connection_lost(generation, err.to_string());
                break;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
