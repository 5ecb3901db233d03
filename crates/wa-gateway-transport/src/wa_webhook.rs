use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const WEBHOOK_TYPE_NEW_MESSAGE: &str = "newMessage";
pub const WEBHOOK_TYPE_STATUS_MESSAGE: &str = "statusMessage";
pub const TYPE_MESSAGE_TEXT: &str = "textMessage";

/// Delivery state of a stored message. Codes follow the network's own message
/// status numbering so synced history can be stored verbatim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Unknown,
    Pending,
    Sent,
    Delivered,
    Read,
    Played,
}

impl MessageStatus {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Pending => 1,
            Self::Sent => 2,
            Self::Delivered => 3,
            Self::Read => 4,
            Self::Played => 5,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Pending,
            2 => Self::Sent,
            3 => Self::Delivered,
            4 => Self::Read,
            5 => Self::Played,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Played => "played",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdentity {
    pub id_instance: u64,
    pub wid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatData {
    pub chat_id: String,
    pub from_me: bool,
    pub id_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub type_message: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub chat: ChatData,
    pub message: MessageData,
    pub message_timestamp: i64,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub id_message: String,
    pub timestamp_status: i64,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum WebhookPayload {
    #[serde(rename = "newMessage")]
    NewMessage {
        #[serde(rename = "newMessage")]
        new_message: NewMessage,
    },
    #[serde(rename = "statusMessage")]
    StatusMessage {
        #[serde(rename = "statusMessage")]
        status_message: StatusMessage,
    },
}

/// One outbound webhook body.
///
/// `count_try_sending` is carried for schema compatibility only: it is never
/// serialized and nothing increments it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    #[serde(flatten)]
    pub payload: WebhookPayload,
    pub instance_whatsapp: InstanceIdentity,
    pub timestamp: i64,
    #[serde(skip)]
    pub count_try_sending: u32,
}

impl WebhookEnvelope {
    #[must_use]
    pub fn new(payload: WebhookPayload, instance: InstanceIdentity, timestamp: i64) -> Self {
        Self {
            payload,
            instance_whatsapp: instance,
            timestamp,
            count_try_sending: 0,
        }
    }

    #[must_use]
    pub const fn type_webhook(&self) -> &'static str {
        match self.payload {
            WebhookPayload::NewMessage { .. } => WEBHOOK_TYPE_NEW_MESSAGE,
            WebhookPayload::StatusMessage { .. } => WEBHOOK_TYPE_STATUS_MESSAGE,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookUrlError {
    #[error("webhook url must not be empty")]
    Empty,

    #[error("webhook url is invalid: {0}")]
    Invalid(String),

    #[error("webhook url must use http:// or https://; got '{0}'")]
    Scheme(String),

    #[error("webhook url must include a host")]
    MissingHost,
}

pub fn validate_webhook_url(raw: &str) -> Result<Url, WebhookUrlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(WebhookUrlError::Empty);
    }

    let url = Url::parse(trimmed).map_err(|error| WebhookUrlError::Invalid(error.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(WebhookUrlError::Scheme(other.to_string())),
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(WebhookUrlError::MissingHost);
    }

    Ok(url)
}
