use std::{
    collections::HashMap,
    fmt,
    sync::{atomic::AtomicUsize, Arc},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock};

use crate::{
    config::Config,
    handoff::{DetectorState, HandoffClassifier},
    messages::RateWindows,
    realtime::RealtimeState,
    registry::LockTable,
};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    InProgress,
    Closed,
    Transferred,
}

impl ConversationStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "closed" => Some(Self::Closed),
            "transferred" => Some(Self::Transferred),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
            Self::Transferred => "transferred",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Support,
    AiHandoff,
}

impl ConversationKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "support" => Some(Self::Support),
            "ai_handoff" => Some(Self::AiHandoff),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Support => "support",
            Self::AiHandoff => "ai_handoff",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Admin,
    System,
}

impl SenderType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    System,
    Handoff,
    File,
}

impl MessageType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "system" => Some(Self::System),
            "handoff" => Some(Self::Handoff),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
            Self::Handoff => "handoff",
            Self::File => "file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Participant,
    Admin,
    Observer,
}

impl ParticipantRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "participant" => Some(Self::Participant),
            "admin" => Some(Self::Admin),
            "observer" => Some(Self::Observer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Participant => "participant",
            Self::Admin => "admin",
            Self::Observer => "observer",
        }
    }
}

/// Authenticated caller, attached by the fronting auth layer. The
/// components trust the identity and apply their own role checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: PrincipalRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalRole {
    User,
    Admin,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == PrincipalRole::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptTurn {
    pub role: String,
    pub text: String,
    pub timestamp: String,
}

/// Provenance snapshot attached to an `ai_handoff` conversation at
/// creation. Written once, never revised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffContext {
    pub reason: String,
    pub intent: String,
    pub category: String,
    pub summary: String,
    pub ai_transcript: Vec<TranscriptTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub owner_user_id: String,
    pub assigned_admin_id: Option<String>,
    pub status: ConversationStatus,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub priority: Priority,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<HandoffContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transferred_from_conversation_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_type: SenderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub read_at: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub seq: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub conversation_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    #[serde(default)]
    pub last_read_at: Option<String>,
}

/// What the triage list renders per conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub last_message: Option<ChatMessage>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub kind: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub read_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPrefs {
    pub browser_enabled: bool,
    pub sound_enabled: bool,
    pub toast_enabled: bool,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        // Browser stays off until a client session reports granted
        // permission.
        Self {
            browser_enabled: false,
            sound_enabled: true,
            toast_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffReason {
    ExplicitRequest,
    Frustration,
    AiEscalation,
}

impl HandoffReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitRequest => "explicit_request",
            Self::Frustration => "frustration",
            Self::AiEscalation => "ai_escalation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffOffer {
    pub id: String,
    pub reason: HandoffReason,
    pub intent: String,
    pub category: String,
    pub summary: String,
    pub priority: Priority,
}

pub struct AppState {
    pub config: Config,
    pub conversations: RwLock<HashMap<String, Conversation>>,
    pub messages: RwLock<HashMap<String, Vec<ChatMessage>>>,
    pub message_index: RwLock<HashMap<String, String>>,
    pub participants: RwLock<HashMap<String, Vec<Participant>>>,
    pub notifications: RwLock<Vec<NotificationRecord>>,
    pub prefs: RwLock<HashMap<String, NotificationPrefs>>,
    pub detector: Mutex<DetectorState>,
    pub rate_windows: Mutex<RateWindows>,
    pub locks: LockTable,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub db: Option<PgPool>,
    pub classifier: Arc<dyn HandoffClassifier>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: Option<PgPool>,
        classifier: Arc<dyn HandoffClassifier>,
    ) -> Self {
        Self {
            config,
            conversations: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            message_index: RwLock::new(HashMap::new()),
            participants: RwLock::new(HashMap::new()),
            notifications: RwLock::new(Vec::new()),
            prefs: RwLock::new(HashMap::new()),
            detector: Mutex::new(DetectorState::default()),
            rate_windows: Mutex::new(RateWindows::default()),
            locks: LockTable::default(),
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
            db,
            classifier,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    pub subject: String,
    #[serde(default)]
    pub initial_message: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub conversation_id: String,
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssigneeBody {
    pub admin_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetaBody {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateBody {
    pub action: String,
    pub conversation_ids: Vec<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateTurnBody {
    pub chat_session_id: String,
    #[serde(default)]
    pub transcript: Vec<TranscriptTurn>,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptHandoffBody {
    pub chat_session_id: String,
    pub offer: HandoffOffer,
    #[serde(default)]
    pub transcript: Vec<TranscriptTurn>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclineHandoffBody {
    pub chat_session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPrefsBody {
    #[serde(default)]
    pub browser_enabled: Option<bool>,
    #[serde(default)]
    pub sound_enabled: Option<bool>,
    #[serde(default)]
    pub toast_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
