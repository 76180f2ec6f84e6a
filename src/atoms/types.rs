// ── Gisma Atoms: Pure Data Types ──────────────────────────────────────────────
// Conversation model and wire payloads.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

use serde::{Deserialize, Serialize};

// ── Conversation model ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message { role: Role::Assistant, content: content.into() }
    }
}

/// How the server should shape the assistant reply.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseFormat {
    /// Friendly markdown prose.
    #[default]
    Simple,
    /// Free-form JSON.
    Json,
    /// JSON conforming to the caller-supplied `schemaJson`.
    Schema,
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseFormat::Simple => "SIMPLE",
            ResponseFormat::Json => "JSON",
            ResponseFormat::Schema => "SCHEMA",
        }
    }
}

impl std::str::FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SIMPLE" => Ok(ResponseFormat::Simple),
            "JSON" => Ok(ResponseFormat::Json),
            "SCHEMA" => Ok(ResponseFormat::Schema),
            other => Err(format!("Unknown response format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub response_format: ResponseFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_json: Option<String>,
    /// Server-assigned id; absent until the first exchange of a new chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Conversation { id: id.into(), name: name.into(), ..Default::default() }
    }

    /// Content of the trailing assistant message, if the last message is one.
    pub fn last_assistant_content(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}

// ── Wire payloads ─────────────────────────────────────────────────────────────

/// Body published to the start-chat and continue-chat destinations.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub query: String,
    pub response_format: ResponseFormat,
    /// Always serialized, as `null` when absent.
    pub schema_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>, response_format: ResponseFormat) -> Self {
        ChatRequest {
            query: query.into(),
            response_format,
            schema_json: None,
            chat_id: None,
        }
    }

    pub fn with_schema(mut self, schema_json: Option<String>) -> Self {
        self.schema_json = schema_json;
        self
    }
}

/// Server-assigned identity of a freshly started chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMetadata {
    pub chat_id: String,
    pub description: String,
}

/// One decoded frame on a per-chat reply channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyFrame {
    /// Incremental text fragment.
    Chunk(String),
    /// Completion sentinel.
    Complete,
}

// ── REST payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserRole {
    User,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub role: Option<UserRole>,
}

impl UserInfo {
    pub fn is_admin(&self) -> bool {
        self.role == Some(UserRole::Admin)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum StoredMessageType {
    User,
    Assistant,
}

/// A message as persisted in the server's chat memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: StoredMessageType,
}

impl From<StoredMessage> for Message {
    fn from(m: StoredMessage) -> Self {
        let role = match m.kind {
            StoredMessageType::User => Role::User,
            StoredMessageType::Assistant => Role::Assistant,
        };
        Message { role, content: m.content }
    }
}
