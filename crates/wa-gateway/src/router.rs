use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wa_gateway_transport::wa_pairing::AuthMessage;
use wa_gateway_transport::wa_webhook::MessageStatus;

use crate::client::{MessagingClient, Presence};
use crate::context::GatewayContext;
use crate::events::{
    ClientEvent, HistorySyncData, ImageAttachment, IncomingMessage, ReceiptEvent, ReceiptKind,
};
use crate::store::{DataMessage, DeviceIdentity};
use crate::supervisor::InstanceSupervisor;
use crate::webhook::{self, text_message};

/// App-state patch whose completion means contacts and push name are usable.
pub const CRITICAL_BLOCK_PATCH: &str = "critical_block";

/// Consumes one connection's event queue in order.
pub struct EventRouter {
    ctx: Arc<GatewayContext>,
    client: Weak<dyn MessagingClient>,
    supervisor: Weak<InstanceSupervisor>,
    keepalive_failures: u32,
}

impl EventRouter {
    #[must_use]
    pub fn new(
        ctx: Arc<GatewayContext>,
        client: &Arc<dyn MessagingClient>,
        supervisor: Weak<InstanceSupervisor>,
    ) -> Self {
        Self {
            ctx,
            client: Arc::downgrade(client),
            supervisor,
            keepalive_failures: 0,
        }
    }

    pub fn spawn(self, events: mpsc::Receiver<ClientEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!("client event queue closed");
    }

    fn client(&self) -> Option<Arc<dyn MessagingClient>> {
        self.client.upgrade()
    }

    fn own_wid(&self) -> String {
        self.client()
            .and_then(|client| client.own_id())
            .map(|jid| jid.legacy_chat_id())
            .unwrap_or_default()
    }

    pub async fn handle(&mut self, event: ClientEvent) {
        debug!(kind = event.kind(), "client event");

        match event {
            ClientEvent::AppStateSyncComplete { name } => {
                if name == CRITICAL_BLOCK_PATCH {
                    self.announce_available().await;
                }
            }
            ClientEvent::Connected | ClientEvent::PushNameSetting { .. } => {
                self.announce_available().await;
            }
            ClientEvent::StreamReplaced => {
                warn!("stream replaced by another session; shutting down");
                self.ctx.request_shutdown();
            }
            ClientEvent::Message(message) => self.on_message(&message).await,
            ClientEvent::Receipt(receipt) => self.on_receipt(&receipt),
            ClientEvent::Presence(presence) => {
                self.ctx.rendezvous.complete(&presence);
            }
            ClientEvent::HistorySync(data) => self.on_history_sync(&data),
            ClientEvent::AppState { index } => {
                debug!(?index, "app state event");
            }
            ClientEvent::KeepAliveTimeout { error_count } => self.on_keepalive_timeout(error_count),
            ClientEvent::KeepAliveRestored => {
                debug!(after = self.keepalive_failures, "keepalive restored");
                self.keepalive_failures = 0;
            }
            ClientEvent::PairSuccess {
                id,
                platform,
                business_name,
            } => {
                info!(%id, %platform, %business_name, "pairing succeeded");

                let device = DeviceIdentity {
                    jid: id.clone(),
                    push_name: self.client().and_then(|client| client.push_name()),
                    platform: Some(platform).filter(|platform| !platform.is_empty()),
                    paired_at_ms: crate::now_ms(),
                };
                if let Err(error) = self.ctx.store.save_device(&device) {
                    error!("failed to persist paired device: {error:#}");
                }

                self.ctx
                    .pairing
                    .finish(AuthMessage::Account {
                        wid: id.legacy_chat_id(),
                    })
                    .await;
            }
            ClientEvent::LoggedOut { on_connect } => {
                warn!(on_connect, "device logged out");
                if let Err(error) = self.ctx.store.clear_device() {
                    error!("failed to clear device identity: {error:#}");
                }
            }
        }
    }

    async fn announce_available(&self) {
        let Some(client) = self.client() else {
            return;
        };
        if client.push_name().is_none_or(|name| name.is_empty()) {
            return;
        }

        match client.send_presence(Presence::Available).await {
            Ok(()) => info!("marked self as available"),
            Err(error) => warn!("failed to send available presence: {error}"),
        }
    }

    async fn on_message(&self, message: &IncomingMessage) {
        info!(chat = %message.info.chat, "received message: {}", message.summary());

        if message.is_user_text() {
            self.record_incoming_text(message);
        }

        let Some(client) = self.client() else {
            return;
        };

        if message.content.poll_update.is_some() {
            match client.decrypt_poll_vote(message).await {
                Ok(options) => info!(message_id = %message.info.id, ?options, "poll vote"),
                Err(error) => warn!("failed to decrypt poll vote: {error}"),
            }
        }

        if message.content.enc_reaction.is_some() {
            match client.decrypt_reaction(message).await {
                Ok(reaction) => info!(message_id = %message.info.id, %reaction, "reaction"),
                Err(error) => warn!("failed to decrypt encrypted reaction: {error}"),
            }
        }

        if let Some(image) = &message.content.image {
            self.store_image(client.as_ref(), &message.info.id, image)
                .await;
        }
    }

    fn record_incoming_text(&self, message: &IncomingMessage) {
        let info = &message.info;
        let content = serde_json::to_string(&message.content).unwrap_or_default();

        let record = DataMessage {
            chat_id: info.chat.to_string(),
            message_id: info.id.clone(),
            message_timestamp: info.timestamp,
            json_data: content,
            status: MessageStatus::Delivered,
            status_timestamp: crate::now_secs(),
        };
        if let Err(error) = self.ctx.store.save_message(&record) {
            error!(message_id = %info.id, "failed to save incoming message: {error:#}");
        }

        let envelope = self.ctx.webhooks.new_message_envelope(
            self.own_wid(),
            text_message(
                info.chat.legacy_chat_id(),
                info.is_from_me,
                info.id.clone(),
                message.text().to_string(),
                info.timestamp,
                MessageStatus::Delivered,
            ),
        );
        webhook::dispatch(&self.ctx.webhooks, envelope);
    }

    async fn store_image(&self, client: &dyn MessagingClient, id: &str, image: &ImageAttachment) {
        let Some(path) = image_path(&self.ctx.config.media_dir, id, &image.mimetype) else {
            warn!(message_id = %id, "message id is not a plain file name; image not saved");
            return;
        };

        let bytes = match client.download_image(image).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(message_id = %id, "failed to download image: {error}");
                return;
            }
        };

        if let Err(error) = tokio::fs::create_dir_all(&self.ctx.config.media_dir).await {
            warn!(dir = %self.ctx.config.media_dir.display(), "failed to create media dir: {error}");
            return;
        }
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => info!(path = %path.display(), "saved image"),
            Err(error) => warn!(path = %path.display(), "failed to save image: {error}"),
        }
    }

    fn on_receipt(&self, receipt: &ReceiptEvent) {
        let status = match &receipt.kind {
            ReceiptKind::Read | ReceiptKind::ReadSelf => MessageStatus::Read,
            ReceiptKind::Delivered => MessageStatus::Delivered,
            ReceiptKind::Played | ReceiptKind::Other(_) => {
                debug!(kind = ?receipt.kind, chat = %receipt.chat, "receipt ignored");
                return;
            }
        };

        info!(
            chat = %receipt.chat,
            ids = ?receipt.message_ids,
            status = status.as_str(),
            "receipt"
        );

        let wid = self.own_wid();
        for message_id in &receipt.message_ids {
            match self
                .ctx
                .store
                .update_status(message_id, status, receipt.timestamp)
            {
                Ok(true) => {}
                Ok(false) => debug!(%message_id, "receipt for a message that is not stored"),
                Err(error) => error!(%message_id, "failed to update message status: {error:#}"),
            }

            let envelope = self.ctx.webhooks.status_envelope(
                wid.clone(),
                message_id,
                status,
                receipt.timestamp,
            );
            webhook::dispatch(&self.ctx.webhooks, envelope);
        }
    }

    fn on_history_sync(&self, data: &HistorySyncData) {
        let seq = self.ctx.next_history_seq();
        let records = history_records(data);

        match self.ctx.store.save_messages(&records) {
            Ok(saved) => info!(
                seq,
                sync_type = %data.sync_type,
                conversations = data.conversations.len(),
                messages = data.message_count(),
                saved,
                "history sync stored"
            ),
            Err(error) => error!(seq, "failed to store history sync: {error:#}"),
        }
    }

    fn on_keepalive_timeout(&mut self, error_count: u32) {
        let previous = std::mem::replace(&mut self.keepalive_failures, error_count);
        debug!(error_count, "keepalive timeout");

        let threshold = self.ctx.config.keepalive_reconnect_threshold;
        if error_count <= threshold || previous > threshold {
            return;
        }

        let (Some(client), Some(supervisor)) = (self.client(), self.supervisor.upgrade()) else {
            debug!(error_count, "keepalive failing but the instance is gone");
            return;
        };
        warn!(error_count, "keepalive failing; forcing reconnect");
        tokio::spawn(async move {
            match supervisor.reconnect(&client).await {
                Ok(true) => info!("reconnected after keepalive failures"),
                Ok(false) => {}
                Err(error) => error!("failed to reconnect: {error}"),
            }
        });
    }
}

/// Flattens a history batch into one record per synced message.
#[must_use]
pub fn history_records(data: &HistorySyncData) -> Vec<DataMessage> {
    data.conversations
        .iter()
        .flat_map(|conversation| {
            conversation.messages.iter().map(|message| DataMessage {
                chat_id: conversation.id.clone(),
                message_id: message.message_id.clone(),
                message_timestamp: message.timestamp,
                json_data: message.payload.to_string(),
                status: message
                    .status
                    .map_or(MessageStatus::Unknown, MessageStatus::from_code),
                status_timestamp: message.timestamp,
            })
        })
        .collect()
}

/// Where an image attached to `message_id` is stored. Ids that are not plain
/// `[A-Za-z0-9_-]` names yield `None`.
#[must_use]
pub fn image_path(
    media_dir: &std::path::Path,
    message_id: &str,
    mimetype: &str,
) -> Option<PathBuf> {
    let plain = !message_id.is_empty()
        && message_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    plain.then(|| media_dir.join(format!("{message_id}{}", image_extension(mimetype))))
}

fn image_extension(mimetype: &str) -> &'static str {
    let essence = mimetype.split(';').next().unwrap_or_default().trim();
    match essence {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        _ => ".bin",
    }
}
