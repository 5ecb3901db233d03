use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use wa_gateway_transport::wa_webhook::{
    ChatData, InstanceIdentity, MessageData, MessageStatus, NewMessage, StatusMessage,
    TYPE_MESSAGE_TEXT, WebhookEnvelope, WebhookPayload,
};

/// Outcome of one webhook POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// No webhook URL was configured; nothing was sent.
    Skipped,
    Delivered { status: u16 },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub type_webhook: &'static str,
    pub envelope: WebhookEnvelope,
    pub outcome: DeliveryOutcome,
}

/// Single-attempt JSON POSTer for outbound notifications.
pub struct WebhookDispatcher {
    http: reqwest::Client,
    target: RwLock<Option<Url>>,
    instance_id: u64,
    observer: Option<mpsc::UnboundedSender<DeliveryReport>>,
}

impl WebhookDispatcher {
    pub fn new(instance_id: u64, target: Option<Url>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook http client")?;

        Ok(Self {
            http,
            target: RwLock::new(target),
            instance_id,
            observer: None,
        })
    }

    /// Every delivery outcome is also pushed to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<DeliveryReport>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn set_target(&self, target: Option<Url>) {
        *self.target.write().await = target;
    }

    pub async fn target(&self) -> Option<Url> {
        self.target.read().await.clone()
    }

    #[must_use]
    pub fn identity(&self, wid: String) -> InstanceIdentity {
        InstanceIdentity {
            id_instance: self.instance_id,
            wid,
        }
    }

    #[must_use]
    pub fn new_message_envelope(
        &self,
        wid: String,
        new_message: NewMessage,
    ) -> WebhookEnvelope {
        WebhookEnvelope::new(
            WebhookPayload::NewMessage { new_message },
            self.identity(wid),
            crate::now_secs(),
        )
    }

    #[must_use]
    pub fn status_envelope(
        &self,
        wid: String,
        id_message: &str,
        status: MessageStatus,
        timestamp_status: i64,
    ) -> WebhookEnvelope {
        WebhookEnvelope::new(
            WebhookPayload::StatusMessage {
                status_message: StatusMessage {
                    id_message: id_message.to_string(),
                    timestamp_status,
                    status,
                },
            },
            self.identity(wid),
            crate::now_secs(),
        )
    }

    /// One POST, no retry. Failures are logged and reported, never returned.
    pub async fn send(&self, envelope: WebhookEnvelope) -> DeliveryOutcome {
        let type_webhook = envelope.type_webhook();
        let Some(target) = self.target().await else {
            debug!(type_webhook, "webhook url not set; skipping delivery");
            return self.report(envelope, DeliveryOutcome::Skipped);
        };

        let outcome = match self.http.post(target.clone()).json(&envelope).send().await {
            Ok(response) => {
                let status = response.status();
                info!(type_webhook, %target, status = status.as_u16(), "webhook delivered");
                DeliveryOutcome::Delivered {
                    status: status.as_u16(),
                }
            }
            Err(error) => {
                warn!(type_webhook, %target, "webhook delivery failed: {error}");
                DeliveryOutcome::Failed {
                    error: error.to_string(),
                }
            }
        };

        self.report(envelope, outcome)
    }

    fn report(&self, envelope: WebhookEnvelope, outcome: DeliveryOutcome) -> DeliveryOutcome {
        if let Some(observer) = &self.observer {
            let _ = observer.send(DeliveryReport {
                type_webhook: envelope.type_webhook(),
                envelope,
                outcome: outcome.clone(),
            });
        }
        outcome
    }
}

/// Runs [`WebhookDispatcher::send`] as its own task.
pub fn dispatch(
    dispatcher: &std::sync::Arc<WebhookDispatcher>,
    envelope: WebhookEnvelope,
) -> JoinHandle<DeliveryOutcome> {
    let dispatcher = std::sync::Arc::clone(dispatcher);
    tokio::spawn(async move { dispatcher.send(envelope).await })
}

#[must_use]
pub fn text_message(
    chat_id: String,
    from_me: bool,
    id_message: String,
    text: String,
    message_timestamp: i64,
    status: MessageStatus,
) -> NewMessage {
    NewMessage {
        chat: ChatData {
            chat_id,
            from_me,
            id_message,
        },
        message: MessageData {
            type_message: TYPE_MESSAGE_TEXT.to_string(),
            text,
        },
        message_timestamp,
        status,
    }
}
