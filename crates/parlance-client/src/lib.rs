//! Parlance Client - Typed HTTP client for the platform API
//!
//! Covers the full REST surface of the Parlance backend: agents, chat
//! history and send, leads, file uploads, analytics and health. The chat
//! session layer uses this client for history loads and as the fallback
//! send path when no real-time connection is available.
//!
//! # Quick Start
//!
//! ```ignore
//! use parlance_client::Parlance;
//! use parlance_types::AgentId;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api = Parlance::local()?;
//!
//!     let agent = api.get_agent(&AgentId::new("a1")).await?;
//!     let history = api.get_history(&agent.id, Some(50)).await?;
//!     println!("{} has {} prior messages", agent.name, history.len());
//!
//!     let reply = api.send_message(&agent.id, "Hello", None).await?;
//!     println!("assistant said: {:?}", reply.reply);
//!
//!     Ok(())
//! }
//! ```
//!
//! Every endpoint returns the platform's `{success, data, error}` envelope;
//! non-2xx statuses and `success: false` bodies both surface as
//! [`ClientError::ApiError`] with the server's message preserved.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use chrono::{DateTime, Utc};
use parlance_types::{
    AgentAnalytics, AgentId, AgentProfile, ApiEnvelope, ChatId, ChatMessage, CostBreakdown,
    DashboardStats, EngagementMetrics, FileId, HealthStatus, Lead, LeadId, LeadStats, LeadStatus,
    PerformanceMetrics, Sender,
};

// ============================================================================
// Error Types
// ============================================================================

/// Client-specific errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

/// Client Result type
pub type ClientResult<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Configuration
// ============================================================================

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API base URL, including the `/api` prefix
    pub api_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Bearer token attached to every request when set
    pub api_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: std::env::var("PARLANCE_API_URL")
                .unwrap_or_else(|_| "http://localhost:8000/api".to_string()),
            timeout: Duration::from_secs(30),
            api_key: std::env::var("PARLANCE_API_KEY").ok(),
        }
    }
}

// ============================================================================
// API Types
// ============================================================================

/// Outbound body for the fallback send path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
}

/// Fallback send result: the chat the message landed in plus the assistant
/// reply, when the backend answered synchronously
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(default, rename = "response", skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

/// One full conversation as returned by the chat service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDetail {
    pub id: ChatId,
    pub agent_id: AgentId,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Conversation lifecycle as shown on the admin dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Active,
    Waiting,
    Resolved,
}

impl Default for ChatStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Dashboard summary of one recent conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentChat {
    pub id: ChatId,
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub status: ChatStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_email: Option<String>,
    #[serde(default)]
    pub lead_generated: bool,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Trailing message preview inside a [`RecentChat`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub sender: Sender,
    pub content: String,
}

/// A document stored for an agent's knowledge base
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: FileId,
    pub agent_id: AgentId,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// One file to ship in a multipart upload
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Agent creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Agent update request; unset fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAgentRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Lead creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateLeadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LeadStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
}

/// Lead update request; unset fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateLeadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LeadStatus>,
}

/// Paging and status filter for the cross-agent lead listing
#[derive(Debug, Clone)]
pub struct LeadFilter {
    pub status: Option<LeadStatus>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for LeadFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

// ============================================================================
// Main Client
// ============================================================================

/// Main Parlance API client
///
/// Cheap to clone; all clones share the same connection pool.
#[derive(Clone)]
pub struct Parlance {
    config: Arc<ClientConfig>,
    client: Client,
}

impl Parlance {
    /// Connect to a local backend using default configuration
    pub fn local() -> ClientResult<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// Connect to a specific API base URL
    pub fn connect(api_url: &str) -> ClientResult<Self> {
        let config = ClientConfig {
            api_url: api_url.trim_end_matches('/').to_string(),
            ..Default::default()
        };
        Self::with_config(config)
    }

    /// Create with custom configuration
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    /// Get the configured API base URL
    pub fn api_url(&self) -> &str {
        &self.config.api_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Unwrap the platform envelope, mapping HTTP failures and
    /// `success: false` bodies to [`ClientError::ApiError`]
    async fn expect_data<T: DeserializeOwned>(resp: reqwest::Response) -> ClientResult<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|env| env.error)
                .unwrap_or(body);
            return Err(ClientError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: ApiEnvelope<T> = resp.json().await?;
        if !envelope.success {
            return Err(ClientError::ApiError {
                status: status.as_u16(),
                message: envelope
                    .error
                    .unwrap_or_else(|| "Unknown error".to_string()),
            });
        }
        envelope.data.ok_or_else(|| ClientError::ApiError {
            status: status.as_u16(),
            message: "Missing response data".to_string(),
        })
    }

    /// Like [`Self::expect_data`] for endpoints whose success payload is empty
    async fn expect_ok(resp: reqwest::Response) -> ClientResult<()> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|env| env.error)
                .unwrap_or(body);
            return Err(ClientError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: ApiEnvelope<serde_json::Value> = resp.json().await?;
        if !envelope.success {
            return Err(ClientError::ApiError {
                status: status.as_u16(),
                message: envelope
                    .error
                    .unwrap_or_else(|| "Unknown error".to_string()),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Agents
    // ========================================================================

    /// List all agents
    pub async fn list_agents(&self) -> ClientResult<Vec<AgentProfile>> {
        let resp = self
            .authorize(self.client.get(self.url("/agents")))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Get one agent by id
    pub async fn get_agent(&self, id: &AgentId) -> ClientResult<AgentProfile> {
        let resp = self
            .authorize(self.client.get(self.url(&format!("/agents/{}", id))))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Create a new agent
    pub async fn create_agent(&self, req: &CreateAgentRequest) -> ClientResult<AgentProfile> {
        let resp = self
            .authorize(self.client.post(self.url("/agents")).json(req))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Update an existing agent
    pub async fn update_agent(
        &self,
        id: &AgentId,
        req: &UpdateAgentRequest,
    ) -> ClientResult<AgentProfile> {
        let resp = self
            .authorize(self.client.put(self.url(&format!("/agents/{}", id))).json(req))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Delete an agent
    pub async fn delete_agent(&self, id: &AgentId) -> ClientResult<()> {
        let resp = self
            .authorize(self.client.delete(self.url(&format!("/agents/{}", id))))
            .send()
            .await?;
        Self::expect_ok(resp).await
    }

    // ========================================================================
    // Chat
    // ========================================================================

    /// Fetch prior history for an agent, most recent last
    pub async fn get_history(
        &self,
        agent_id: &AgentId,
        limit: Option<u32>,
    ) -> ClientResult<Vec<ChatMessage>> {
        let mut req = self.client.get(self.url(&format!("/chat/{}", agent_id)));
        if let Some(limit) = limit {
            req = req.query(&[("limit", limit)]);
        }
        let resp = self.authorize(req).send().await?;
        Self::expect_data(resp).await
    }

    /// Send a message over the request/response path
    ///
    /// Passing `chat_id: None` asks the backend to open a fresh conversation;
    /// the reply then carries the newly issued id.
    pub async fn send_message(
        &self,
        agent_id: &AgentId,
        message: &str,
        chat_id: Option<&ChatId>,
    ) -> ClientResult<SendMessageReply> {
        debug!(agent = %agent_id, chat = ?chat_id, "sending message via http");
        let body = SendMessageRequest {
            message: message.to_string(),
            chat_id: chat_id.cloned(),
        };
        let resp = self
            .authorize(
                self.client
                    .post(self.url(&format!("/chat/{}/message", agent_id)))
                    .json(&body),
            )
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Get one full conversation by chat id
    pub async fn get_chat(&self, chat_id: &ChatId) -> ClientResult<ChatDetail> {
        let resp = self
            .authorize(self.client.get(self.url(&format!("/chat/session/{}", chat_id))))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Delete a conversation
    pub async fn delete_chat(&self, chat_id: &ChatId) -> ClientResult<()> {
        let resp = self
            .authorize(self.client.delete(self.url(&format!("/chat/session/{}", chat_id))))
            .send()
            .await?;
        Self::expect_ok(resp).await
    }

    /// Recent conversations across all agents, newest first
    pub async fn recent_chats(&self, limit: u32) -> ClientResult<Vec<RecentChat>> {
        let resp = self
            .authorize(
                self.client
                    .get(self.url("/chat/recent"))
                    .query(&[("limit", limit)]),
            )
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    // ========================================================================
    // Leads
    // ========================================================================

    /// List leads across all agents
    pub async fn list_leads(&self, filter: &LeadFilter) -> ClientResult<Vec<Lead>> {
        let mut query: Vec<(&str, String)> = vec![
            ("limit", filter.limit.to_string()),
            ("offset", filter.offset.to_string()),
        ];
        if let Some(status) = filter.status {
            query.push(("status", status.to_string()));
        }
        let resp = self
            .authorize(self.client.get(self.url("/leads/all")).query(&query))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// List one agent's leads, optionally filtered by status
    pub async fn agent_leads(
        &self,
        agent_id: &AgentId,
        status: Option<LeadStatus>,
    ) -> ClientResult<Vec<Lead>> {
        let mut req = self.client.get(self.url(&format!("/leads/{}", agent_id)));
        if let Some(status) = status {
            req = req.query(&[("status", status.to_string())]);
        }
        let resp = self.authorize(req).send().await?;
        Self::expect_data(resp).await
    }

    /// Get one lead by id
    pub async fn get_lead(&self, id: &LeadId) -> ClientResult<Lead> {
        let resp = self
            .authorize(self.client.get(self.url(&format!("/leads/id/{}", id))))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Create a lead under an agent
    pub async fn create_lead(
        &self,
        agent_id: &AgentId,
        req: &CreateLeadRequest,
    ) -> ClientResult<Lead> {
        let resp = self
            .authorize(self.client.post(self.url(&format!("/leads/{}", agent_id))).json(req))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Update a lead
    pub async fn update_lead(&self, id: &LeadId, req: &UpdateLeadRequest) -> ClientResult<Lead> {
        let resp = self
            .authorize(self.client.put(self.url(&format!("/leads/{}", id))).json(req))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Delete a lead
    pub async fn delete_lead(&self, id: &LeadId) -> ClientResult<()> {
        let resp = self
            .authorize(self.client.delete(self.url(&format!("/leads/{}", id))))
            .send()
            .await?;
        Self::expect_ok(resp).await
    }

    /// Per-status lead counts for one agent
    pub async fn lead_stats(&self, agent_id: &AgentId) -> ClientResult<LeadStats> {
        let resp = self
            .authorize(self.client.get(self.url(&format!("/leads/{}/stats", agent_id))))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// List the documents stored for an agent
    pub async fn agent_files(&self, agent_id: &AgentId) -> ClientResult<Vec<StoredFile>> {
        let resp = self
            .authorize(self.client.get(self.url(&format!("/files/{}", agent_id))))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Upload documents for an agent as a multipart form
    pub async fn upload_files(
        &self,
        agent_id: &AgentId,
        files: Vec<FileUpload>,
    ) -> ClientResult<Vec<StoredFile>> {
        debug!(agent = %agent_id, count = files.len(), "uploading files");
        let mut form = reqwest::multipart::Form::new();
        for file in files {
            let mut part =
                reqwest::multipart::Part::bytes(file.bytes).file_name(file.file_name);
            if let Some(content_type) = &file.content_type {
                part = part.mime_str(content_type)?;
            }
            form = form.part("files", part);
        }
        let resp = self
            .authorize(
                self.client
                    .post(self.url(&format!("/files/{}/upload", agent_id)))
                    .multipart(form),
            )
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Delete a stored document
    pub async fn delete_file(&self, file_id: &FileId) -> ClientResult<()> {
        let resp = self
            .authorize(self.client.delete(self.url(&format!("/files/{}", file_id))))
            .send()
            .await?;
        Self::expect_ok(resp).await
    }

    // ========================================================================
    // Analytics
    // ========================================================================

    /// Platform-wide dashboard aggregates; `period` defaults to `30d`
    pub async fn dashboard_stats(&self, period: Option<&str>) -> ClientResult<DashboardStats> {
        let resp = self
            .authorize(
                self.client
                    .get(self.url("/analytics/dashboard"))
                    .query(&[("period", period.unwrap_or("30d"))]),
            )
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Per-agent usage aggregates
    pub async fn agent_analytics(
        &self,
        agent_id: &AgentId,
        period: Option<&str>,
    ) -> ClientResult<AgentAnalytics> {
        let resp = self
            .authorize(
                self.client
                    .get(self.url(&format!("/analytics/{}", agent_id)))
                    .query(&[("period", period.unwrap_or("30d"))]),
            )
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Cost breakdown by model for one agent
    pub async fn cost_breakdown(
        &self,
        agent_id: &AgentId,
        period: Option<&str>,
    ) -> ClientResult<CostBreakdown> {
        let resp = self
            .authorize(
                self.client
                    .get(self.url(&format!("/analytics/{}/costs", agent_id)))
                    .query(&[("period", period.unwrap_or("30d"))]),
            )
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// User engagement aggregates for one agent
    pub async fn engagement(
        &self,
        agent_id: &AgentId,
        period: Option<&str>,
    ) -> ClientResult<EngagementMetrics> {
        let resp = self
            .authorize(
                self.client
                    .get(self.url(&format!("/analytics/{}/engagement", agent_id)))
                    .query(&[("period", period.unwrap_or("30d"))]),
            )
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Latency and error aggregates for one agent
    pub async fn performance(
        &self,
        agent_id: &AgentId,
        period: Option<&str>,
    ) -> ClientResult<PerformanceMetrics> {
        let resp = self
            .authorize(
                self.client
                    .get(self.url(&format!("/analytics/{}/performance", agent_id)))
                    .query(&[("period", period.unwrap_or("30d"))]),
            )
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Shallow health probe
    pub async fn health(&self) -> ClientResult<HealthStatus> {
        let resp = self
            .authorize(self.client.get(self.url("/health")))
            .send()
            .await?;
        Self::expect_data(resp).await
    }

    /// Per-dependency health probe
    pub async fn health_detailed(&self) -> ClientResult<HealthStatus> {
        let resp = self
            .authorize(self.client.get(self.url("/health/detailed")))
            .send()
            .await?;
        Self::expect_data(resp).await
    }
}

// ============================================================================
// Tests
// ============================================================================
