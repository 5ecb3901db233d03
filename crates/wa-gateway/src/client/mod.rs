//! Boundary to the messaging-network client library.
//!
//! The gateway never speaks the wire protocol itself. A [`ClientFactory`] builds one
//! [`MessagingClient`] per session; the client reports everything it observes as
//! [`ClientEvent`]s on the queue handed to it in [`ClientWiring`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use wa_gateway_transport::wa_jid::Jid;

use crate::events::{ClientEvent, ImageAttachment, IncomingMessage};
use crate::proxy::ProxyConfig;
use crate::store::DeviceIdentity;

pub mod loopback;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("qr channel can only be opened before the device is paired")]
    QrStoreContainsId,

    #[error("websocket is not connected")]
    NotConnected,

    #[error("the store doesn't contain a device JID")]
    NotLoggedIn,

    #[error("already connected")]
    AlreadyConnected,

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Protocol(String),
}

/// Progress of the rotating pairing-code stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrEvent {
    Code(String),
    Timeout,
    Success,
    Error(String),
}

impl QrEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Code(_) => "code",
            Self::Timeout => "timeout",
            Self::Success => "success",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResponse {
    pub id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnWhatsAppResult {
    pub query: String,
    pub jid: Jid,
    pub is_in: bool,
    pub verified_business_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub status: String,
    pub status_set_at: u64,
    pub picture_id: Option<String>,
    pub verified_business_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilePicture {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub jid: Jid,
    pub push_name: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrePairRequest {
    pub jid: Jid,
    pub platform: String,
    pub business_name: String,
}

/// Gate consulted right before a pairing offer is confirmed to the counterpart device.
#[async_trait]
pub trait PrePairHook: Send + Sync {
    async fn approve(&self, request: PrePairRequest) -> bool;
}

pub struct ClientWiring {
    pub events: mpsc::Sender<ClientEvent>,
    pub pre_pair: Arc<dyn PrePairHook>,
}

#[async_trait]
pub trait MessagingClient: Send + Sync {
    fn is_connected(&self) -> bool;

    fn is_logged_in(&self) -> bool;

    fn own_id(&self) -> Option<Jid>;

    fn push_name(&self) -> Option<String>;

    fn set_proxy(&self, proxy: &ProxyConfig);

    /// Must be called before [`MessagingClient::connect`] on an unpaired device.
    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, ClientError>;

    async fn connect(&self) -> Result<(), ClientError>;

    async fn disconnect(&self);

    async fn logout(&self) -> Result<(), ClientError>;

    async fn send_text(&self, to: &Jid, text: &str) -> Result<SendResponse, ClientError>;

    async fn send_presence(&self, presence: Presence) -> Result<(), ClientError>;

    async fn subscribe_presence(&self, jid: &Jid) -> Result<(), ClientError>;

    async fn is_on_whatsapp(&self, phones: &[String])
    -> Result<Vec<OnWhatsAppResult>, ClientError>;

    async fn user_info(&self, jids: &[Jid]) -> Result<HashMap<Jid, UserInfo>, ClientError>;

    async fn profile_picture(&self, jid: &Jid) -> Result<Option<ProfilePicture>, ClientError>;

    async fn contacts(&self) -> Result<Vec<Contact>, ClientError>;

    async fn decrypt_poll_vote(&self, message: &IncomingMessage)
    -> Result<Vec<String>, ClientError>;

    async fn decrypt_reaction(&self, message: &IncomingMessage) -> Result<String, ClientError>;

    async fn download_image(&self, image: &ImageAttachment) -> Result<Vec<u8>, ClientError>;
}

pub trait ClientFactory: Send + Sync {
    fn build(&self, device: Option<DeviceIdentity>, wiring: ClientWiring)
    -> Arc<dyn MessagingClient>;
}
