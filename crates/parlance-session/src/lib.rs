//! Parlance Session - Chat Session Controller
//!
//! Owns the conversation state for one agent: message history, the active
//! chat room, connection status, the remote typing indicator and the send
//! lifecycle. Three message sources are reconciled into one ordered,
//! de-duplicated list:
//!
//! 1. Optimistic inserts made locally the moment the user sends
//! 2. Messages pushed over the real-time transport
//! 3. Replies returned by the request/response fallback
//!
//! Messages keep the order in which they were observed locally. Timestamps
//! are display metadata; they never reorder the list, so clock skew between
//! client-issued and server-issued times is harmless.
//!
//! Each send routes through exactly one path: the transport when the
//! connection is up and a chat room is known, the HTTP fallback otherwise.
//! A failed send removes the optimistic insert again, leaving the visible
//! history exactly as the backend has it.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use parlance_client::Parlance;
//! use parlance_session::{ChatSession, SessionConfig};
//! use parlance_transport::SocketClient;
//! use parlance_types::AgentId;
//!
//! let backend = Arc::new(Parlance::local()?);
//! let transport = Arc::new(SocketClient::default());
//! let session = ChatSession::open(
//!     backend,
//!     transport,
//!     AgentId::new("agent-1"),
//!     SessionConfig::default(),
//! )
//! .await?;
//!
//! let updates = session.updates();
//! session.send("Hello there").await?;
//! session.close();
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parlance_client::{ClientError, ClientResult, Parlance, SendMessageReply};
use parlance_transport::{
    EventHandler, EventKind, SocketClient, TransportError, TransportEvent, TransportResult,
};
use parlance_types::{
    AgentId, AgentProfile, ChatId, ChatMessage, ConnectionState, MessageId, TypingState,
};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to load agent: {0}")]
    AgentLoad(#[source] ClientError),

    #[error("Message is empty")]
    EmptyMessage,

    #[error("A send is already in flight")]
    SendInFlight,

    #[error("Fallback send failed: {0}")]
    SendFailed(#[from] ClientError),

    #[error("Transport send failed: {0}")]
    TransportSend(#[from] TransportError),

    #[error("Session is closed")]
    Closed,
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Session controller configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How many historical messages to load on open
    pub history_limit: u32,
    /// Idle window after the last keystroke before the stop-typing signal
    pub typing_idle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            typing_idle: Duration::from_secs(2),
        }
    }
}

// ============================================================================
// Send Phase
// ============================================================================

/// Where the controller is in the send lifecycle
///
/// At most one send is in flight at a time; while the phase is not `Idle`,
/// further send attempts are rejected rather than queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPhase {
    #[default]
    Idle,
    /// An optimistic message is inserted and the send is being routed
    Sending,
    /// The transport accepted the message; the reply will arrive as a push
    AwaitingReply,
}

/// Inputs to the send lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    SendRequested,
    /// The transport queued the message for delivery
    TransportAccepted,
    /// The fallback request completed and its reply was applied
    FallbackResolved,
    /// An assistant message arrived over the transport
    ReplyArrived,
    SendFailed,
    /// The transport connection dropped; no reply can arrive over it
    ConnectionLost,
}

impl SendPhase {
    /// Pure transition function; undefined combinations leave the phase alone
    ///
    /// `ConnectionLost` releases only `AwaitingReply`: a fallback send in
    /// `Sending` does not need the socket and keeps running.
    pub fn apply(self, event: PhaseEvent) -> SendPhase {
        match (self, event) {
            (SendPhase::Idle, PhaseEvent::SendRequested) => SendPhase::Sending,
            (SendPhase::Sending, PhaseEvent::TransportAccepted) => SendPhase::AwaitingReply,
            (SendPhase::Sending, PhaseEvent::FallbackResolved) => SendPhase::Idle,
            (SendPhase::Sending, PhaseEvent::SendFailed) => SendPhase::Idle,
            (SendPhase::AwaitingReply, PhaseEvent::ReplyArrived) => SendPhase::Idle,
            (SendPhase::AwaitingReply, PhaseEvent::SendFailed) => SendPhase::Idle,
            (SendPhase::AwaitingReply, PhaseEvent::ConnectionLost) => SendPhase::Idle,
            (phase, _) => phase,
        }
    }
}

// ============================================================================
// Session Updates
// ============================================================================

/// State changes streamed to the owning view
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Connection(ConnectionState),
    MessageAppended(ChatMessage),
    /// An optimistic message was rolled back after a failed send
    MessageRemoved(MessageId),
    /// The backend issued a chat id for this conversation
    ChatAssigned(ChatId),
    RemoteTyping(TypingState),
    Phase(SendPhase),
    /// Transient, user-visible notification text
    Notice(String),
}

/// Point-in-time copy of the session state
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub agent_id: AgentId,
    pub chat_id: Option<ChatId>,
    pub messages: Vec<ChatMessage>,
    pub connection: ConnectionState,
    pub typing: TypingState,
    pub phase: SendPhase,
}

// ============================================================================
// Service Seams
// ============================================================================

/// Request/response chat operations the controller needs
///
/// Implemented by [`Parlance`]; tests substitute hand mocks.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn get_agent(&self, agent_id: &AgentId) -> ClientResult<AgentProfile>;

    async fn get_history(
        &self,
        agent_id: &AgentId,
        limit: Option<u32>,
    ) -> ClientResult<Vec<ChatMessage>>;

    async fn send_message(
        &self,
        agent_id: &AgentId,
        text: &str,
        chat_id: Option<&ChatId>,
    ) -> ClientResult<SendMessageReply>;
}

#[async_trait]
impl ChatBackend for Parlance {
    async fn get_agent(&self, agent_id: &AgentId) -> ClientResult<AgentProfile> {
        Parlance::get_agent(self, agent_id).await
    }

    async fn get_history(
        &self,
        agent_id: &AgentId,
        limit: Option<u32>,
    ) -> ClientResult<Vec<ChatMessage>> {
        Parlance::get_history(self, agent_id, limit).await
    }

    async fn send_message(
        &self,
        agent_id: &AgentId,
        text: &str,
        chat_id: Option<&ChatId>,
    ) -> ClientResult<SendMessageReply> {
        Parlance::send_message(self, agent_id, text, chat_id).await
    }
}

/// Real-time connection the controller drives
///
/// The controller owns the instance it is given: it connects on open and
/// disconnects on close. Implemented by [`SocketClient`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, agent_id: &AgentId) -> TransportResult<()>;
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn join_chat(&self, chat_id: &ChatId) -> TransportResult<()>;
    fn leave_chat(&self, chat_id: &ChatId);
    fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        agent_id: &AgentId,
        message_id: &MessageId,
    ) -> TransportResult<()>;
    fn start_typing(&self, chat_id: &ChatId);
    fn stop_typing(&self, chat_id: &ChatId);
    fn on(&self, kind: EventKind, key: &str, handler: EventHandler);
    fn off(&self, kind: EventKind, key: &str);
}

#[async_trait]
impl Transport for SocketClient {
    async fn connect(&self, agent_id: &AgentId) -> TransportResult<()> {
        SocketClient::connect(self, agent_id).await
    }

    fn disconnect(&self) {
        SocketClient::disconnect(self)
    }

    fn is_connected(&self) -> bool {
        SocketClient::is_connected(self)
    }

    fn join_chat(&self, chat_id: &ChatId) -> TransportResult<()> {
        SocketClient::join_chat(self, chat_id)
    }

    fn leave_chat(&self, chat_id: &ChatId) {
        SocketClient::leave_chat(self, chat_id)
    }

    fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        agent_id: &AgentId,
        message_id: &MessageId,
    ) -> TransportResult<()> {
        SocketClient::send_message(self, chat_id, text, agent_id, message_id)
    }

    fn start_typing(&self, chat_id: &ChatId) {
        SocketClient::start_typing(self, chat_id)
    }

    fn stop_typing(&self, chat_id: &ChatId) {
        SocketClient::stop_typing(self, chat_id)
    }

    fn on(&self, kind: EventKind, key: &str, handler: EventHandler) {
        SocketClient::on(self, kind, key, move |event| handler(event))
    }

    fn off(&self, kind: EventKind, key: &str) {
        SocketClient::off(self, kind, key)
    }
}

// ============================================================================
// Chat Session
// ============================================================================

/// Event kinds the controller subscribes to
const SESSION_EVENTS: [EventKind; 5] = [
    EventKind::ConnectionStatus,
    EventKind::Message,
    EventKind::Typing,
    EventKind::StopTyping,
    EventKind::Error,
];

struct SessionState {
    chat_id: Option<ChatId>,
    messages: Vec<ChatMessage>,
    connection: ConnectionState,
    typing: TypingState,
    phase: SendPhase,
    /// Set once on close; asynchronous completions that observe it must not
    /// touch the session again
    closed: bool,
}

/// Which path a send takes, decided at send time
enum SendRoute {
    Transport(ChatId),
    Fallback(Option<ChatId>),
}

/// Conversation controller bound to one agent
///
/// Opened with [`ChatSession::open`] and torn down with
/// [`ChatSession::close`]. Switching agents means closing this session and
/// opening a new one; the agent binding never changes in place.
pub struct ChatSession {
    agent_id: AgentId,
    agent: AgentProfile,
    handler_key: String,
    config: SessionConfig,
    backend: Arc<dyn ChatBackend>,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<SessionState>>,
    updates_tx: flume::Sender<SessionUpdate>,
    updates_rx: flume::Receiver<SessionUpdate>,
    typing_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Open a session for an agent
    ///
    /// Loads the agent profile (failure is fatal) and a bounded window of
    /// history (failure is not: the session opens empty with a notice). If
    /// history exists, the chat id of the most recent message is adopted and
    /// its room joined once the transport connects. A transport connect
    /// failure leaves the session usable on the fallback path.
    pub async fn open(
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn Transport>,
        agent_id: AgentId,
        config: SessionConfig,
    ) -> SessionResult<ChatSession> {
        let agent = backend
            .get_agent(&agent_id)
            .await
            .map_err(SessionError::AgentLoad)?;

        let (updates_tx, updates_rx) = flume::unbounded();

        let history = match backend
            .get_history(&agent_id, Some(config.history_limit))
            .await
        {
            Ok(history) => history,
            Err(err) => {
                warn!(agent = %agent_id, error = %err, "failed to load chat history");
                let _ = updates_tx.send(SessionUpdate::Notice(format!(
                    "Failed to load chat history: {err}"
                )));
                Vec::new()
            }
        };
        let chat_id = history.last().and_then(|message| message.chat_id.clone());
        if let Some(chat_id) = &chat_id {
            debug!(agent = %agent_id, chat = %chat_id, "resuming existing chat");
        }

        let session = ChatSession {
            handler_key: format!("chat-session-{agent_id}"),
            agent_id: agent_id.clone(),
            agent,
            config,
            backend,
            transport,
            state: Arc::new(Mutex::new(SessionState {
                chat_id,
                messages: history,
                connection: ConnectionState::Disconnected,
                typing: TypingState::Idle,
                phase: SendPhase::Idle,
                closed: false,
            })),
            updates_tx,
            updates_rx,
            typing_timer: Mutex::new(None),
        };
        session.attach_handlers();

        if let Err(err) = session.transport.connect(&agent_id).await {
            warn!(agent = %agent_id, error = %err, "transport connect failed, staying on fallback path");
        }

        Ok(session)
    }

    /// Profile of the agent this session talks to
    pub fn agent(&self) -> &AgentProfile {
        &self.agent
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        self.state.lock().chat_id.clone()
    }

    pub fn connection(&self) -> ConnectionState {
        self.state.lock().connection
    }

    pub fn typing(&self) -> TypingState {
        self.state.lock().typing
    }

    pub fn phase(&self) -> SendPhase {
        self.state.lock().phase
    }

    /// Current message list, in local observation order
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().messages.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Stream of state changes, in the order they were applied
    ///
    /// Every receiver returned here pulls from the same queue, so each
    /// update is delivered to exactly one consumer. Hand the receiver to
    /// the single owning view; this is not a broadcast.
    pub fn updates(&self) -> flume::Receiver<SessionUpdate> {
        self.updates_rx.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            agent_id: self.agent_id.clone(),
            chat_id: state.chat_id.clone(),
            messages: state.messages.clone(),
            connection: state.connection,
            typing: state.typing,
            phase: state.phase,
        }
    }

    /// Send a message
    ///
    /// The trimmed text is inserted optimistically, then routed over the
    /// transport when connected with a known chat room, over the HTTP
    /// fallback otherwise. While a send is in flight further attempts are
    /// rejected with [`SessionError::SendInFlight`], not queued.
    pub async fn send(&self, text: &str) -> SessionResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let (message, route) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SessionError::Closed);
            }
            if state.phase != SendPhase::Idle {
                return Err(SessionError::SendInFlight);
            }
            let mut message = ChatMessage::user(text);
            if let Some(chat_id) = &state.chat_id {
                message = message.in_chat(chat_id.clone());
            }
            state.phase = state.phase.apply(PhaseEvent::SendRequested);
            state.messages.push(message.clone());
            let route = match (state.chat_id.clone(), self.transport.is_connected()) {
                (Some(chat_id), true) => {
                    // Committed before the lock drops: a reply pushed back
                    // while the send is still on the wire must observe
                    // AwaitingReply, not Sending.
                    state.phase = state.phase.apply(PhaseEvent::TransportAccepted);
                    SendRoute::Transport(chat_id)
                }
                (chat_id, _) => SendRoute::Fallback(chat_id),
            };
            (message, route)
        };
        self.emit(SessionUpdate::Phase(SendPhase::Sending));
        self.emit(SessionUpdate::MessageAppended(message.clone()));

        match route {
            SendRoute::Transport(chat_id) => {
                self.emit(SessionUpdate::Phase(SendPhase::AwaitingReply));
                self.send_via_transport(&chat_id, text, &message)
            }
            SendRoute::Fallback(chat_id) => self.send_via_fallback(chat_id, text, &message).await,
        }
    }

    /// Forward a local keystroke
    ///
    /// Signals typing on every call while connected with a known chat room,
    /// and arms the trailing-edge stop signal: exactly one stop fires once
    /// the idle window passes without another keystroke.
    pub fn input_changed(&self) {
        let chat_id = {
            let state = self.state.lock();
            if state.closed {
                return;
            }
            match (&state.chat_id, self.transport.is_connected()) {
                (Some(chat_id), true) => chat_id.clone(),
                _ => return,
            }
        };
        self.transport.start_typing(&chat_id);

        let mut timer = self.typing_timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        // Window anchored at the keystroke, not at the task's first poll
        let deadline = tokio::time::Instant::now() + self.config.typing_idle;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if state.lock().closed {
                return;
            }
            transport.stop_typing(&chat_id);
        }));
    }

    /// Tear the session down
    ///
    /// Leaves the chat room, detaches every transport handler this session
    /// registered, disconnects the transport and fences out any in-flight
    /// completions. Idempotent.
    pub fn close(&self) {
        let chat_id = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.chat_id.clone()
        };

        if let Some(handle) = self.typing_timer.lock().take() {
            handle.abort();
        }
        if let Some(chat_id) = &chat_id {
            self.transport.leave_chat(chat_id);
        }
        for kind in SESSION_EVENTS {
            self.transport.off(kind, &self.handler_key);
        }
        self.transport.disconnect();
        debug!(agent = %self.agent_id, "chat session closed");
    }

    fn send_via_transport(
        &self,
        chat_id: &ChatId,
        text: &str,
        message: &ChatMessage,
    ) -> SessionResult<()> {
        match self
            .transport
            .send_message(chat_id, text, &self.agent_id, &message.id)
        {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "transport send failed, rolling back optimistic message");
                self.roll_back(&message.id);
                self.emit(SessionUpdate::Notice(format!("Failed to send message: {err}")));
                Err(SessionError::TransportSend(err))
            }
        }
    }

    async fn send_via_fallback(
        &self,
        chat_id: Option<ChatId>,
        text: &str,
        message: &ChatMessage,
    ) -> SessionResult<()> {
        match self
            .backend
            .send_message(&self.agent_id, text, chat_id.as_ref())
            .await
        {
            Ok(reply) => {
                let (adopted, appended) = {
                    let mut state = self.state.lock();
                    if state.closed {
                        return Ok(());
                    }
                    let adopted = match (&state.chat_id, reply.chat_id) {
                        (None, Some(new_chat)) => {
                            state.chat_id = Some(new_chat.clone());
                            Some(new_chat)
                        }
                        _ => None,
                    };
                    let appended = reply
                        .reply
                        .as_deref()
                        .filter(|reply| !reply.is_empty())
                        .map(|reply| {
                            let mut reply_message = ChatMessage::assistant(reply);
                            if let Some(chat_id) = &state.chat_id {
                                reply_message = reply_message.in_chat(chat_id.clone());
                            }
                            state.messages.push(reply_message.clone());
                            reply_message
                        });
                    state.phase = state.phase.apply(PhaseEvent::FallbackResolved);
                    (adopted, appended)
                };

                if let Some(new_chat) = &adopted {
                    self.emit(SessionUpdate::ChatAssigned(new_chat.clone()));
                    if self.transport.is_connected() {
                        if let Err(err) = self.transport.join_chat(new_chat) {
                            warn!(chat = %new_chat, error = %err, "failed to join newly assigned chat");
                        }
                    }
                }
                if let Some(reply_message) = appended {
                    self.emit(SessionUpdate::MessageAppended(reply_message));
                }
                self.emit(SessionUpdate::Phase(SendPhase::Idle));
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "fallback send failed, rolling back optimistic message");
                self.roll_back(&message.id);
                self.emit(SessionUpdate::Notice(format!("Failed to send message: {err}")));
                Err(SessionError::SendFailed(err))
            }
        }
    }

    /// Remove an optimistic message after its send failed
    fn roll_back(&self, message_id: &MessageId) {
        let removed = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let before = state.messages.len();
            state.messages.retain(|message| &message.id != message_id);
            state.phase = state.phase.apply(PhaseEvent::SendFailed);
            state.messages.len() != before
        };
        if removed {
            self.emit(SessionUpdate::MessageRemoved(message_id.clone()));
        }
        self.emit(SessionUpdate::Phase(SendPhase::Idle));
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates_tx.send(update);
    }

    fn attach_handlers(&self) {
        let key = self.handler_key.as_str();

        {
            let state = Arc::clone(&self.state);
            let updates = self.updates_tx.clone();
            let transport = Arc::clone(&self.transport);
            self.transport.on(
                EventKind::ConnectionStatus,
                key,
                Arc::new(move |event| {
                    let (connected, reason) = match event {
                        TransportEvent::ConnectionStatus { connected, reason } => {
                            (*connected, reason.clone())
                        }
                        _ => return,
                    };
                    let join_target = {
                        let mut state = state.lock();
                        if state.closed {
                            return;
                        }
                        let next = if connected {
                            ConnectionState::Connected
                        } else {
                            ConnectionState::Disconnected
                        };
                        if state.connection != next {
                            state.connection = next;
                            let _ = updates.send(SessionUpdate::Connection(next));
                        }
                        if let Some(reason) = reason {
                            let _ = updates
                                .send(SessionUpdate::Notice(format!("Connection error: {reason}")));
                        }
                        if connected {
                            state.chat_id.clone()
                        } else {
                            // No reply can arrive over a dead socket; release
                            // the send lifecycle so the next send falls back.
                            // The optimistic message stays, delivery is
                            // uncertain.
                            let released = state.phase.apply(PhaseEvent::ConnectionLost);
                            if released != state.phase {
                                state.phase = released;
                                let _ = updates.send(SessionUpdate::Phase(released));
                            }
                            None
                        }
                    };
                    if let Some(chat_id) = join_target {
                        if let Err(err) = transport.join_chat(&chat_id) {
                            warn!(chat = %chat_id, error = %err, "failed to join chat room");
                        }
                    }
                }),
            );
        }

        {
            let state = Arc::clone(&self.state);
            let updates = self.updates_tx.clone();
            self.transport.on(
                EventKind::Message,
                key,
                Arc::new(move |event| {
                    let message = match event {
                        TransportEvent::Message(message) => message.clone(),
                        _ => return,
                    };
                    let mut state = state.lock();
                    if state.closed {
                        return;
                    }
                    // The echo of an optimistic insert carries the same id
                    let duplicate = state.messages.iter().any(|m| m.id == message.id);
                    if !duplicate {
                        state.messages.push(message.clone());
                        let _ = updates.send(SessionUpdate::MessageAppended(message.clone()));
                    }
                    if state.typing != TypingState::Idle {
                        state.typing = TypingState::Idle;
                        let _ = updates.send(SessionUpdate::RemoteTyping(TypingState::Idle));
                    }
                    if !message.is_from_user() {
                        let next = state.phase.apply(PhaseEvent::ReplyArrived);
                        if next != state.phase {
                            state.phase = next;
                            let _ = updates.send(SessionUpdate::Phase(next));
                        }
                    }
                }),
            );
        }

        {
            let state = Arc::clone(&self.state);
            let updates = self.updates_tx.clone();
            self.transport.on(
                EventKind::Typing,
                key,
                Arc::new(move |event| {
                    if !matches!(event, TransportEvent::Typing { .. }) {
                        return;
                    }
                    let mut state = state.lock();
                    if state.closed || state.typing == TypingState::RemoteTyping {
                        return;
                    }
                    state.typing = TypingState::RemoteTyping;
                    let _ = updates.send(SessionUpdate::RemoteTyping(TypingState::RemoteTyping));
                }),
            );
        }

        {
            let state = Arc::clone(&self.state);
            let updates = self.updates_tx.clone();
            self.transport.on(
                EventKind::StopTyping,
                key,
                Arc::new(move |event| {
                    if !matches!(event, TransportEvent::StopTyping { .. }) {
                        return;
                    }
                    let mut state = state.lock();
                    if state.closed || state.typing == TypingState::Idle {
                        return;
                    }
                    state.typing = TypingState::Idle;
                    let _ = updates.send(SessionUpdate::RemoteTyping(TypingState::Idle));
                }),
            );
        }

        {
            let state = Arc::clone(&self.state);
            let updates = self.updates_tx.clone();
            self.transport.on(
                EventKind::Error,
                key,
                Arc::new(move |event| {
                    if let TransportEvent::Error { message } = event {
                        if state.lock().closed {
                            return;
                        }
                        let _ = updates.send(SessionUpdate::Notice(format!("Chat error: {message}")));
                    }
                }),
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parlance_types::{AgentStatus, Sender};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MockBackend {
        missing_agent: bool,
        history_unavailable: bool,
        history: Vec<ChatMessage>,
        /// `None` makes sends fail
        reply: Option<(Option<ChatId>, Option<String>)>,
        sends: Mutex<Vec<(String, Option<ChatId>)>>,
    }

    impl MockBackend {
        fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
            self.history = history;
            self
        }

        fn without_agent(mut self) -> Self {
            self.missing_agent = true;
            self
        }

        fn broken_history(mut self) -> Self {
            self.history_unavailable = true;
            self
        }

        fn replying(mut self, chat_id: &str, reply: &str) -> Self {
            self.reply = Some((Some(ChatId::new(chat_id)), Some(reply.to_string())));
            self
        }
    }

    #[async_trait]
    impl ChatBackend for MockBackend {
        async fn get_agent(&self, agent_id: &AgentId) -> ClientResult<AgentProfile> {
            if self.missing_agent {
                return Err(ClientError::ApiError {
                    status: 404,
                    message: "Agent not found".to_string(),
                });
            }
            Ok(AgentProfile {
                id: agent_id.clone(),
                name: "Support Bot".to_string(),
                description: None,
                status: AgentStatus::Active,
                model: None,
                system_prompt: None,
                temperature: None,
                total_chats: 0,
                total_leads: 0,
                document_count: 0,
                total_cost: 0.0,
                created_at: None,
                updated_at: None,
            })
        }

        async fn get_history(
            &self,
            _agent_id: &AgentId,
            _limit: Option<u32>,
        ) -> ClientResult<Vec<ChatMessage>> {
            if self.history_unavailable {
                return Err(ClientError::ApiError {
                    status: 500,
                    message: "history store offline".to_string(),
                });
            }
            Ok(self.history.clone())
        }

        async fn send_message(
            &self,
            _agent_id: &AgentId,
            text: &str,
            chat_id: Option<&ChatId>,
        ) -> ClientResult<SendMessageReply> {
            self.sends.lock().push((text.to_string(), chat_id.cloned()));
            match &self.reply {
                Some((chat_id, reply)) => Ok(SendMessageReply {
                    chat_id: chat_id.clone(),
                    reply: reply.clone(),
                }),
                None => Err(ClientError::ApiError {
                    status: 502,
                    message: "backend unavailable".to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct MockTransport {
        accept_connect: bool,
        fail_send: AtomicBool,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        connected: AtomicBool,
        joins: Mutex<Vec<ChatId>>,
        leaves: Mutex<Vec<ChatId>>,
        sends: Mutex<Vec<(ChatId, String, MessageId)>>,
        /// Pushed to handlers from inside `send_message`, before it returns
        reply_on_send: Mutex<Option<ChatMessage>>,
        typing_starts: AtomicUsize,
        typing_stops: AtomicUsize,
        handlers: Mutex<HashMap<(EventKind, String), EventHandler>>,
    }

    impl MockTransport {
        fn online() -> Arc<Self> {
            Arc::new(Self {
                accept_connect: true,
                ..Self::default()
            })
        }

        fn offline() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Simulate a server push
        fn fire(&self, event: TransportEvent) {
            let targets: Vec<EventHandler> = self
                .handlers
                .lock()
                .iter()
                .filter(|((kind, _), _)| *kind == event.kind())
                .map(|(_, handler)| handler.clone())
                .collect();
            for handler in targets {
                handler(&event);
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, _agent_id: &AgentId) -> TransportResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.accept_connect {
                self.connected.store(true, Ordering::SeqCst);
                self.fire(TransportEvent::ConnectionStatus {
                    connected: true,
                    reason: None,
                });
                Ok(())
            } else {
                Err(TransportError::ConnectionFailed(
                    "no socket in test".to_string(),
                ))
            }
        }

        fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
            self.handlers.lock().clear();
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn join_chat(&self, chat_id: &ChatId) -> TransportResult<()> {
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            self.joins.lock().push(chat_id.clone());
            Ok(())
        }

        fn leave_chat(&self, chat_id: &ChatId) {
            self.leaves.lock().push(chat_id.clone());
        }

        fn send_message(
            &self,
            chat_id: &ChatId,
            text: &str,
            _agent_id: &AgentId,
            message_id: &MessageId,
        ) -> TransportResult<()> {
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(TransportError::SendFailed("wire down in test".to_string()));
            }
            self.sends
                .lock()
                .push((chat_id.clone(), text.to_string(), message_id.clone()));
            let racing_reply = self.reply_on_send.lock().take();
            if let Some(reply) = racing_reply {
                self.fire(TransportEvent::Message(reply));
            }
            Ok(())
        }

        fn start_typing(&self, _chat_id: &ChatId) {
            self.typing_starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop_typing(&self, _chat_id: &ChatId) {
            self.typing_stops.fetch_add(1, Ordering::SeqCst);
        }

        fn on(&self, kind: EventKind, key: &str, handler: EventHandler) {
            self.handlers.lock().insert((kind, key.to_string()), handler);
        }

        fn off(&self, kind: EventKind, key: &str) {
            self.handlers.lock().remove(&(kind, key.to_string()));
        }
    }

    fn history_message(chat: &str, text: &str) -> ChatMessage {
        ChatMessage::assistant(text).in_chat(ChatId::new(chat))
    }

    async fn open_session(backend: Arc<MockBackend>, transport: Arc<MockTransport>) -> ChatSession {
        ChatSession::open(
            backend,
            transport,
            AgentId::new("a1"),
            SessionConfig::default(),
        )
        .await
        .unwrap()
    }

    /// Let spawned timer tasks run after the clock moves
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    // ------------------------------------------------------------------
    // Send phase machine
    // ------------------------------------------------------------------

    #[test]
    fn test_send_phase_transitions() {
        assert_eq!(
            SendPhase::Idle.apply(PhaseEvent::SendRequested),
            SendPhase::Sending
        );
        assert_eq!(
            SendPhase::Sending.apply(PhaseEvent::TransportAccepted),
            SendPhase::AwaitingReply
        );
        assert_eq!(
            SendPhase::Sending.apply(PhaseEvent::FallbackResolved),
            SendPhase::Idle
        );
        assert_eq!(
            SendPhase::Sending.apply(PhaseEvent::SendFailed),
            SendPhase::Idle
        );
        assert_eq!(
            SendPhase::AwaitingReply.apply(PhaseEvent::ReplyArrived),
            SendPhase::Idle
        );
        assert_eq!(
            SendPhase::AwaitingReply.apply(PhaseEvent::SendFailed),
            SendPhase::Idle
        );
        assert_eq!(
            SendPhase::AwaitingReply.apply(PhaseEvent::ConnectionLost),
            SendPhase::Idle
        );
    }

    #[test]
    fn test_send_phase_ignores_unrelated_events() {
        assert_eq!(
            SendPhase::Idle.apply(PhaseEvent::ReplyArrived),
            SendPhase::Idle
        );
        assert_eq!(
            SendPhase::Sending.apply(PhaseEvent::SendRequested),
            SendPhase::Sending
        );
        assert_eq!(
            SendPhase::AwaitingReply.apply(PhaseEvent::SendRequested),
            SendPhase::AwaitingReply
        );
        assert_eq!(
            SendPhase::AwaitingReply.apply(PhaseEvent::FallbackResolved),
            SendPhase::AwaitingReply
        );
        // A dropped socket must not abort an in-flight fallback send
        assert_eq!(
            SendPhase::Sending.apply(PhaseEvent::ConnectionLost),
            SendPhase::Sending
        );
        assert_eq!(
            SendPhase::Idle.apply(PhaseEvent::ConnectionLost),
            SendPhase::Idle
        );
    }

    // ------------------------------------------------------------------
    // Opening
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_open_adopts_chat_from_history_and_joins_it() {
        let backend = Arc::new(MockBackend::default().with_history(vec![
            history_message("s1", "Welcome back"),
            history_message("s1", "Anything else?"),
        ]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        assert_eq!(session.chat_id(), Some(ChatId::new("s1")));
        assert_eq!(session.connection(), ConnectionState::Connected);
        assert_eq!(session.messages().len(), 2);
        assert_eq!(*transport.joins.lock(), vec![ChatId::new("s1")]);
    }

    #[tokio::test]
    async fn test_open_without_history_joins_nothing() {
        let transport = MockTransport::online();
        let session = open_session(Arc::new(MockBackend::default()), transport.clone()).await;

        assert_eq!(session.chat_id(), None);
        assert!(session.messages().is_empty());
        assert!(transport.joins.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_agent_is_fatal() {
        let result = ChatSession::open(
            Arc::new(MockBackend::default().without_agent()),
            MockTransport::online(),
            AgentId::new("ghost"),
            SessionConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(SessionError::AgentLoad(_))));
    }

    #[tokio::test]
    async fn test_history_failure_opens_empty_with_notice() {
        let transport = MockTransport::online();
        let session =
            open_session(Arc::new(MockBackend::default().broken_history()), transport).await;

        assert!(session.messages().is_empty());
        let notices: Vec<SessionUpdate> = session
            .updates()
            .try_iter()
            .filter(|update| matches!(update, SessionUpdate::Notice(_)))
            .collect();
        assert_eq!(notices.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_session_usable() {
        let backend = Arc::new(MockBackend::default().replying("c1", "still here"));
        let transport = MockTransport::offline();
        let session = open_session(backend, transport.clone()).await;

        assert_eq!(session.connection(), ConnectionState::Disconnected);
        session.send("are you there?").await.unwrap();
        assert_eq!(session.messages().len(), 2);
    }

    // ------------------------------------------------------------------
    // Send routing
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_uses_transport_when_connected_and_chat_known() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend.clone(), transport.clone()).await;

        session.send("Hello").await.unwrap();

        let sends = transport.sends.lock();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, ChatId::new("s1"));
        assert_eq!(sends[0].1, "Hello");
        // No fallback request went out
        assert!(backend.sends.lock().is_empty());
        assert_eq!(session.phase(), SendPhase::AwaitingReply);
    }

    #[tokio::test]
    async fn test_send_falls_back_when_disconnected() {
        let backend = Arc::new(
            MockBackend::default()
                .with_history(vec![history_message("s1", "hi")])
                .replying("s1", "fallback reply"),
        );
        let transport = MockTransport::offline();
        let session = open_session(backend.clone(), transport.clone()).await;

        session.send("Hello").await.unwrap();

        assert!(transport.sends.lock().is_empty());
        let backend_sends = backend.sends.lock();
        assert_eq!(backend_sends.len(), 1);
        assert_eq!(backend_sends[0].0, "Hello");
        assert_eq!(backend_sends[0].1, Some(ChatId::new("s1")));
        assert_eq!(session.phase(), SendPhase::Idle);
    }

    #[tokio::test]
    async fn test_send_falls_back_without_chat_even_when_connected() {
        let backend = Arc::new(MockBackend::default().replying("c42", "Hello!"));
        let transport = MockTransport::online();
        let session = open_session(backend.clone(), transport.clone()).await;

        session.send("Hi").await.unwrap();

        assert!(transport.sends.lock().is_empty());
        assert_eq!(backend.sends.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fallback_rolls_back_optimistic_message() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::offline();
        let session = open_session(backend, transport).await;
        let before = session.messages();

        let result = session.send("Hello").await;

        assert!(matches!(result, Err(SessionError::SendFailed(_))));
        assert_eq!(session.messages(), before);
        assert_eq!(session.phase(), SendPhase::Idle);
    }

    #[tokio::test]
    async fn test_transport_send_failure_rolls_back() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        transport.fail_send.store(true, Ordering::SeqCst);
        let session = open_session(backend, transport).await;
        let before = session.messages();

        let result = session.send("Hello").await;

        assert!(matches!(result, Err(SessionError::TransportSend(_))));
        assert_eq!(session.messages(), before);
        assert_eq!(session.phase(), SendPhase::Idle);
    }

    #[tokio::test]
    async fn test_fallback_adopts_new_chat_and_joins_exactly_once() {
        let backend = Arc::new(MockBackend::default().replying("c42", "Hello!"));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        session.send("Hi").await.unwrap();

        assert_eq!(session.chat_id(), Some(ChatId::new("c42")));
        assert_eq!(*transport.joins.lock(), vec![ChatId::new("c42")]);
    }

    #[tokio::test]
    async fn test_first_exchange_scenario() {
        let backend = Arc::new(MockBackend::default().replying("c42", "Hello!"));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;
        let updates = session.updates();
        // Drop the connect-time update
        let _: Vec<SessionUpdate> = updates.try_iter().collect();

        session.send("Hi").await.unwrap();

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[0].content, "Hi");
        assert_eq!(messages[1].sender, Sender::Assistant);
        assert_eq!(messages[1].content, "Hello!");
        assert_eq!(session.chat_id(), Some(ChatId::new("c42")));
        assert_eq!(*transport.joins.lock(), vec![ChatId::new("c42")]);

        let seen: Vec<SessionUpdate> = updates.try_iter().collect();
        assert!(matches!(seen[0], SessionUpdate::Phase(SendPhase::Sending)));
        assert!(
            matches!(&seen[1], SessionUpdate::MessageAppended(m) if m.sender == Sender::User)
        );
        assert!(matches!(&seen[2], SessionUpdate::ChatAssigned(c) if *c == ChatId::new("c42")));
        assert!(
            matches!(&seen[3], SessionUpdate::MessageAppended(m) if m.sender == Sender::Assistant)
        );
        assert!(matches!(seen[4], SessionUpdate::Phase(SendPhase::Idle)));
    }

    #[tokio::test]
    async fn test_updates_feed_a_single_consumer() {
        let backend = Arc::new(MockBackend::default().replying("c42", "Hello!"));
        let session = open_session(backend, MockTransport::online()).await;

        let first = session.updates();
        let second = session.updates();

        session.send("Hi").await.unwrap();

        // Handles share one queue: whoever drains first gets the items
        assert!(first.try_iter().count() > 0);
        assert_eq!(second.try_iter().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_send_rejected() {
        let transport = MockTransport::online();
        let session = open_session(Arc::new(MockBackend::default()), transport.clone()).await;

        assert!(matches!(
            session.send("   ").await,
            Err(SessionError::EmptyMessage)
        ));
        assert!(session.messages().is_empty());
        assert!(transport.sends.lock().is_empty());
    }

    #[tokio::test]
    async fn test_second_send_rejected_until_reply_arrives() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        session.send("first").await.unwrap();
        assert!(matches!(
            session.send("second").await,
            Err(SessionError::SendInFlight)
        ));
        assert_eq!(transport.sends.lock().len(), 1);

        transport.fire(TransportEvent::Message(
            ChatMessage::assistant("reply").in_chat(ChatId::new("s1")),
        ));
        assert_eq!(session.phase(), SendPhase::Idle);

        session.send("third").await.unwrap();
        assert_eq!(transport.sends.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_reply_racing_the_send_leaves_phase_idle() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        // The reply lands while send() is still on the wire
        *transport.reply_on_send.lock() =
            Some(ChatMessage::assistant("Hello!").in_chat(ChatId::new("s1")));

        session.send("Hi").await.unwrap();

        let messages = session.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].content, "Hello!");
        assert_eq!(session.phase(), SendPhase::Idle);

        // The lifecycle is free again for the next send
        session.send("And another thing").await.unwrap();
        assert_eq!(transport.sends.lock().len(), 2);
    }

    // ------------------------------------------------------------------
    // Pushed messages
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_pushed_echo_of_optimistic_message_not_duplicated() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        session.send("Hello").await.unwrap();
        let sent_id = transport.sends.lock()[0].2.clone();

        // Server echoes the user message with the client id, then replies
        let mut echo = ChatMessage::user("Hello").in_chat(ChatId::new("s1"));
        echo.id = sent_id;
        transport.fire(TransportEvent::Message(echo));
        transport.fire(TransportEvent::Message(
            ChatMessage::assistant("Hi there").in_chat(ChatId::new("s1")),
        ));

        let messages = session.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "Hello");
        assert_eq!(messages[2].content, "Hi there");
        assert_eq!(session.phase(), SendPhase::Idle);
    }

    #[tokio::test]
    async fn test_pushed_message_clears_remote_typing() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        transport.fire(TransportEvent::Typing {
            chat_id: ChatId::new("s1"),
        });
        assert_eq!(session.typing(), TypingState::RemoteTyping);

        transport.fire(TransportEvent::Message(
            ChatMessage::assistant("done thinking").in_chat(ChatId::new("s1")),
        ));
        assert_eq!(session.typing(), TypingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_typing_has_no_local_timeout() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        transport.fire(TransportEvent::Typing {
            chat_id: ChatId::new("s1"),
        });
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        // Indicator persists until an explicit signal overrides it
        assert_eq!(session.typing(), TypingState::RemoteTyping);

        transport.fire(TransportEvent::StopTyping {
            chat_id: ChatId::new("s1"),
        });
        assert_eq!(session.typing(), TypingState::Idle);
    }

    // ------------------------------------------------------------------
    // Local typing signals
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_typing_debounce_fires_single_trailing_stop() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        session.input_changed();
        session.input_changed();
        session.input_changed();
        assert_eq!(transport.typing_starts.load(Ordering::SeqCst), 3);
        assert_eq!(transport.typing_stops.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1999)).await;
        settle().await;
        assert_eq!(transport.typing_stops.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(transport.typing_stops.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(transport.typing_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystroke_restarts_idle_window() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        session.input_changed();
        tokio::time::advance(Duration::from_millis(1500)).await;
        settle().await;
        session.input_changed();
        tokio::time::advance(Duration::from_millis(1500)).await;
        settle().await;
        // 3s after the first keystroke, 1.5s after the second
        assert_eq!(transport.typing_stops.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(transport.typing_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_window_is_anchored_at_the_keystroke() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        session.input_changed();
        // The full window passes before the timer task is first polled; the
        // stop must still fire, measured from the keystroke.
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(transport.typing_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_typing_signal_without_chat_or_connection() {
        let connected_no_chat = MockTransport::online();
        let session =
            open_session(Arc::new(MockBackend::default()), connected_no_chat.clone()).await;
        session.input_changed();
        assert_eq!(connected_no_chat.typing_starts.load(Ordering::SeqCst), 0);

        let disconnected = MockTransport::offline();
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let session = open_session(backend, disconnected.clone()).await;
        session.input_changed();
        assert_eq!(disconnected.typing_starts.load(Ordering::SeqCst), 0);
    }

    // ------------------------------------------------------------------
    // Connection changes
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_involuntary_disconnect_notifies_and_falls_back() {
        let backend = Arc::new(
            MockBackend::default()
                .with_history(vec![history_message("s1", "hi")])
                .replying("s1", "still here"),
        );
        let transport = MockTransport::online();
        let session = open_session(backend.clone(), transport.clone()).await;
        let updates = session.updates();
        let _: Vec<SessionUpdate> = updates.try_iter().collect();

        transport.connected.store(false, Ordering::SeqCst);
        transport.fire(TransportEvent::ConnectionStatus {
            connected: false,
            reason: Some("connection closed".to_string()),
        });

        assert_eq!(session.connection(), ConnectionState::Disconnected);
        let seen: Vec<SessionUpdate> = updates.try_iter().collect();
        assert!(matches!(
            seen[0],
            SessionUpdate::Connection(ConnectionState::Disconnected)
        ));
        assert!(matches!(&seen[1], SessionUpdate::Notice(n) if n.contains("connection closed")));

        // Messages survive the disconnect and the next send takes the fallback
        assert_eq!(session.messages().len(), 1);
        session.send("are you there?").await.unwrap();
        assert!(transport.sends.lock().is_empty());
        assert_eq!(backend.sends.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_while_awaiting_reply_releases_the_send() {
        let backend = Arc::new(
            MockBackend::default()
                .with_history(vec![history_message("s1", "hi")])
                .replying("s1", "recovered"),
        );
        let transport = MockTransport::online();
        let session = open_session(backend.clone(), transport.clone()).await;

        session.send("Hello").await.unwrap();
        assert_eq!(session.phase(), SendPhase::AwaitingReply);

        transport.connected.store(false, Ordering::SeqCst);
        transport.fire(TransportEvent::ConnectionStatus {
            connected: false,
            reason: Some("connection closed".to_string()),
        });

        // The awaited reply can never arrive; the lifecycle is released and
        // the optimistic message kept.
        assert_eq!(session.phase(), SendPhase::Idle);
        assert_eq!(session.messages().len(), 2);

        session.send("are you there?").await.unwrap();
        assert_eq!(backend.sends.lock().len(), 1);
        assert_eq!(transport.sends.lock().len(), 1);
        assert_eq!(session.messages().len(), 4);
    }

    #[tokio::test]
    async fn test_reconnect_rejoins_known_chat() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;
        assert_eq!(transport.joins.lock().len(), 1);

        transport.connected.store(false, Ordering::SeqCst);
        transport.fire(TransportEvent::ConnectionStatus {
            connected: false,
            reason: Some("connection closed".to_string()),
        });
        transport.connected.store(true, Ordering::SeqCst);
        transport.fire(TransportEvent::ConnectionStatus {
            connected: true,
            reason: None,
        });

        assert_eq!(session.connection(), ConnectionState::Connected);
        assert_eq!(*transport.joins.lock(), vec![ChatId::new("s1"), ChatId::new("s1")]);
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_close_leaves_room_detaches_and_disconnects() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        session.close();

        assert!(session.is_closed());
        assert_eq!(*transport.leaves.lock(), vec![ChatId::new("s1")]);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert!(transport.handlers.lock().is_empty());

        // Idempotent
        session.close();
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_after_close_rejected() {
        let backend = Arc::new(MockBackend::default().replying("c1", "hello"));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        session.close();

        assert!(matches!(
            session.send("anyone?").await,
            Err(SessionError::Closed)
        ));
        assert!(session.messages().is_empty());
        assert!(transport.sends.lock().is_empty());
    }

    #[tokio::test]
    async fn test_events_after_close_ignored() {
        let backend =
            Arc::new(MockBackend::default().with_history(vec![history_message("s1", "hi")]));
        let transport = MockTransport::online();
        let session = open_session(backend, transport.clone()).await;

        // Keep a handler alive past close to model a stale dispatch
        let stale: Vec<EventHandler> = transport.handlers.lock().values().cloned().collect();
        session.close();

        let push = TransportEvent::Message(ChatMessage::assistant("late").in_chat(ChatId::new("s1")));
        for handler in &stale {
            handler(&push);
        }

        assert_eq!(session.messages().len(), 1);
    }
}
