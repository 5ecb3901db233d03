use serde::Serialize;
use wa_gateway_transport::wa_jid::Jid;

/// Message category the network uses for its own device-to-device traffic.
pub const PEER_CATEGORY: &str = "peer";
pub const TEXT_MESSAGE_TYPE: &str = "text";

/// Everything the External Client reports about its session, in emission order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    AppStateSyncComplete { name: String },
    Connected,
    PushNameSetting { name: String },
    StreamReplaced,
    Message(Box<IncomingMessage>),
    Receipt(ReceiptEvent),
    Presence(PresenceEvent),
    HistorySync(HistorySyncData),
    AppState { index: Vec<String> },
    KeepAliveTimeout { error_count: u32 },
    KeepAliveRestored,
    PairSuccess {
        id: Jid,
        platform: String,
        business_name: String,
    },
    LoggedOut { on_connect: bool },
}

impl ClientEvent {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AppStateSyncComplete { .. } => "app_state_sync_complete",
            Self::Connected => "connected",
            Self::PushNameSetting { .. } => "push_name_setting",
            Self::StreamReplaced => "stream_replaced",
            Self::Message(_) => "message",
            Self::Receipt(_) => "receipt",
            Self::Presence(_) => "presence",
            Self::HistorySync(_) => "history_sync",
            Self::AppState { .. } => "app_state",
            Self::KeepAliveTimeout { .. } => "keepalive_timeout",
            Self::KeepAliveRestored => "keepalive_restored",
            Self::PairSuccess { .. } => "pair_success",
            Self::LoggedOut { .. } => "logged_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageInfo {
    pub id: String,
    pub chat: Jid,
    pub sender: Jid,
    pub is_from_me: bool,
    pub is_group: bool,
    pub push_name: String,
    pub timestamp: i64,
    pub message_type: String,
    pub category: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageAttachment {
    pub mimetype: String,
    pub direct_path: String,
    pub file_length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_update: Option<EncryptedPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enc_reaction: Option<EncryptedPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub info: MessageInfo,
    pub content: MessageContent,
}

impl IncomingMessage {
    /// Plain text that is not part of the network's own peer channel.
    #[must_use]
    pub fn is_user_text(&self) -> bool {
        self.info.message_type == TEXT_MESSAGE_TYPE && self.info.category != PEER_CATEGORY
    }

    #[must_use]
    pub fn text(&self) -> &str {
        self.content.conversation.as_deref().unwrap_or_default()
    }

    /// One-line metadata summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("id: {}", self.info.id)];
        if !self.info.push_name.is_empty() {
            parts.push(format!("pushname: {}", self.info.push_name));
        }
        parts.push(format!("timestamp: {}", self.info.timestamp));
        if !self.info.message_type.is_empty() {
            parts.push(format!("type: {}", self.info.message_type));
        }
        if !self.info.category.is_empty() {
            parts.push(format!("category: {}", self.info.category));
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
    ReadSelf,
    Played,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptEvent {
    pub kind: ReceiptKind,
    pub chat: Jid,
    pub message_ids: Vec<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub from: Jid,
    pub unavailable: bool,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryMessage {
    pub message_id: String,
    pub timestamp: i64,
    pub status: Option<i32>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryConversation {
    pub id: String,
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySyncData {
    pub sync_type: String,
    pub conversations: Vec<HistoryConversation>,
}

impl HistorySyncData {
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.conversations
            .iter()
            .map(|conversation| conversation.messages.len())
            .sum()
    }
}
