use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TICKET_CHANNEL: &str = "whatsapp";
pub const DEFAULT_PRIORITY: &str = "medium";
pub const AUTO_CREATED_TAG: &str = "auto-created";
pub const DELETED_MESSAGE_PLACEHOLDER: &str = "[Message deleted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    /// Statuses that count as "still being handled" for routing.
    pub const OPEN: [TicketStatus; 2] = [TicketStatus::Pending, TicketStatus::InProgress];

    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TicketStatus::Pending),
            "in_progress" => Some(TicketStatus::InProgress),
            "resolved" => Some(TicketStatus::Resolved),
            "closed" => Some(TicketStatus::Closed),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        Self::OPEN.contains(&self)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Client,
    Agent,
}

impl SenderRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SenderRole::Client => "client",
            SenderRole::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
    Contact,
    LiveLocation,
    Poll,
    List,
    Buttons,
    Template,
    Reaction,
    Unsupported,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::Document => "document",
            MessageType::Sticker => "sticker",
            MessageType::Location => "location",
            MessageType::Contact => "contact",
            MessageType::LiveLocation => "live_location",
            MessageType::Poll => "poll",
            MessageType::List => "list",
            MessageType::Buttons => "buttons",
            MessageType::Template => "template",
            MessageType::Reaction => "reaction",
            MessageType::Unsupported => "unsupported",
        }
    }
}

/// Top-level webhook body posted by the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub server_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotedMessage {
    pub stanza_id: Option<String>,
    pub participant: Option<String>,
    pub preview: Option<String>,
}

/// Inbound message after extraction, before routing. The phone is still raw;
/// normalization happens when the ticket is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub raw_phone: String,
    pub remote_jid: String,
    pub sender_name: String,
    pub content: String,
    pub message_type: MessageType,
    pub media_url: Option<String>,
    pub media_caption: Option<String>,
    pub media_mimetype: Option<String>,
    pub file_name: Option<String>,
    pub quoted: Option<QuotedMessage>,
    pub instance: String,
    pub gateway_message_id: String,
    pub timestamp: DateTime<Utc>,
    pub from_me: bool,
    pub raw: Value,
}

impl NormalizedMessage {
    pub fn sender_role(&self) -> SenderRole {
        if self.from_me {
            SenderRole::Agent
        } else {
            SenderRole::Client
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub subject: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: String,
    pub channel: String,
    pub metadata: Value,
    pub unread: bool,
    pub tags: Vec<String>,
    pub is_internal: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn client_phone(&self) -> Option<&str> {
        self.metadata.get("client_phone").and_then(Value::as_str)
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.metadata.get("instance_name").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTicket {
    pub title: String,
    pub subject: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: String,
    pub channel: String,
    pub metadata: Value,
    pub unread: bool,
    pub tags: Vec<String>,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub ticket_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub sender_name: String,
    pub sender_id: Option<String>,
    pub is_internal: bool,
    pub is_read: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub ticket_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub sender_name: String,
    pub sender_id: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Row written by the side-channel handlers, keyed by instance name.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatus {
    pub instance_name: String,
    pub connection_state: Option<String>,
    pub qrcode: Option<String>,
    pub last_event: String,
    pub last_event_at: DateTime<Utc>,
    pub payload: Value,
}

/// Result of one dispatch, rendered into the webhook response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub processed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_created: Option<bool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl DispatchOutcome {
    pub fn processed(message: impl Into<String>) -> Self {
        Self {
            processed: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            processed: false,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            processed: false,
            message: message.into(),
            degraded: true,
            ..Self::default()
        }
    }
}

/// Body of every webhook response; the status code is always 200.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub timestamp: String,
    pub event: String,
    pub instance: String,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyBody {
    /// Message text, or the caption when media is attached.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media_url: Option<String>,
    /// `image`, `video`, `audio` or `document`; inferred from the mimetype
    /// when absent.
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceBody {
    pub instance_name: String,
    #[serde(default)]
    pub number: Option<String>,
}
