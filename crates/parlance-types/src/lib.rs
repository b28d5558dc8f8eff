//! Parlance Types - Domain Types for the Agent Chat Platform
//!
//! This crate defines the core types shared across the Parlance client:
//! - Identifiers for agents, chats, messages, leads and files
//! - Chat messages and session state
//! - Agent profiles and leads
//! - Analytics and health read models
//!
//! # Example
//!
//! ```ignore
//! use parlance_types::{ChatId, ChatMessage, Sender};
//!
//! let msg = ChatMessage::user("Hi there").in_chat(ChatId::new("c42"));
//! assert_eq!(msg.sender, Sender::User);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Agent identifier (backend-assigned, opaque)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chat (conversation/room) identifier, assigned by the backend on the
/// first successful exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier
///
/// Server-assigned for delivered messages; client-generated (UUID v4) for
/// optimistic inserts so the two ranges never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh client-side id for an optimistic message
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lead identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadId(pub String);

impl LeadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uploaded file identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Chat Types
// ============================================================================

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::User => write!(f, "user"),
            Sender::Assistant => write!(f, "assistant"),
        }
    }
}

/// One chat turn
///
/// Created either optimistically (user send) or on receipt (assistant reply,
/// transport push); never mutated afterwards. The text field is named
/// `message` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique within a chat
    pub id: MessageId,
    /// Conversation this message belongs to; `None` until a chat exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    pub sender: Sender,
    /// Message text; assistant content may carry inline/fenced code markup
    #[serde(rename = "message")]
    pub content: String,
    /// Creation time, used for display only, never for ordering
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a user-authored message with a fresh client-generated id
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            chat_id: None,
            sender: Sender::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant-authored message with a fresh client-generated id
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            chat_id: None,
            sender: Sender::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a chat id
    pub fn in_chat(mut self, chat_id: ChatId) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn is_from_user(&self) -> bool {
        self.sender == Sender::User
    }
}

/// Real-time connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Remote party's typing indicator, driven purely by transport signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypingState {
    Idle,
    RemoteTyping,
}

impl Default for TypingState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Delivery status reported by the backend for a sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

// ============================================================================
// Agent Types
// ============================================================================

/// Agent availability as reported by the directory service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// A configured conversational agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub total_chats: u64,
    #[serde(default)]
    pub total_leads: u64,
    #[serde(default)]
    pub document_count: u64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Lead Types
// ============================================================================

/// Lead pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Converted,
    Lost,
}

impl Default for LeadStatus {
    fn default() -> Self {
        Self::New
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeadStatus::New => write!(f, "new"),
            LeadStatus::Contacted => write!(f, "contacted"),
            LeadStatus::Qualified => write!(f, "qualified"),
            LeadStatus::Converted => write!(f, "converted"),
            LeadStatus::Lost => write!(f, "lost"),
        }
    }
}

/// A lead captured from a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default)]
    pub status: LeadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Per-agent lead counts bucketed by status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadStats {
    pub total: u64,
    #[serde(default)]
    pub new: u64,
    #[serde(default)]
    pub contacted: u64,
    #[serde(default)]
    pub qualified: u64,
    #[serde(default)]
    pub converted: u64,
    #[serde(default)]
    pub lost: u64,
}

// ============================================================================
// Analytics Read Models
// ============================================================================

/// Platform-wide dashboard aggregates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_agents: u64,
    #[serde(default)]
    pub new_agents_this_month: u64,
    pub total_chats: u64,
    #[serde(default)]
    pub monthly_chats: u64,
    pub total_leads: u64,
    #[serde(default)]
    pub monthly_leads: u64,
    pub total_cost: f64,
    #[serde(default)]
    pub monthly_cost: f64,
}

/// Per-agent usage aggregates for one reporting period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAnalytics {
    pub agent_id: AgentId,
    pub period: String,
    pub total_chats: u64,
    pub total_messages: u64,
    pub total_leads: u64,
    pub total_cost: f64,
}

/// Cost breakdown by model for one agent and period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub agent_id: AgentId,
    pub period: String,
    pub total_cost: f64,
    #[serde(default)]
    pub by_model: Vec<ModelCost>,
}

/// One model's share of an agent's cost
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCost {
    pub model: String,
    pub cost: f64,
    pub tokens: u64,
}

/// User engagement aggregates for one agent and period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementMetrics {
    pub agent_id: AgentId,
    pub period: String,
    pub unique_users: u64,
    pub returning_users: u64,
    pub avg_messages_per_chat: f64,
}

/// Latency/quality aggregates for one agent and period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub agent_id: AgentId,
    pub period: String,
    pub avg_response_ms: f64,
    pub error_rate: f64,
}

// ============================================================================
// Health
// ============================================================================

/// Service health probe result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceHealth>,
}

/// One dependency's health within a detailed probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ============================================================================
// API Envelope
// ============================================================================

/// Response wrapper used by every platform HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
