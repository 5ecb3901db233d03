use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use wa_gateway_transport::wa_jid::Jid;
use wa_gateway_transport::wa_webhook::MessageStatus;

use crate::client::{ClientError, ClientFactory, ClientWiring, MessagingClient, PrePairHook};
use crate::context::GatewayContext;
use crate::proxy::{ProxyConfig, ProxyError};
use crate::router::EventRouter;
use crate::store::DataMessage;
use crate::webhook;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Instance already connected")]
    AlreadyConnected,

    #[error("Instance not connected or not authorized")]
    NotAuthorized,

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("failed to load device identity")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { paired: bool },
    /// `require_existing_auth` was set and no device identity is stored.
    NoExistingAuth,
}

/// Result of one recipient of a multi-recipient send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub phone: String,
    pub outcome: Result<String, String>,
}

struct Connection {
    client: Arc<dyn MessagingClient>,
    router: JoinHandle<()>,
    qr_stream: Option<JoinHandle<()>>,
}

impl Connection {
    async fn shutdown(self) {
        self.client.disconnect().await;
        self.router.abort();
        if let Some(qr_stream) = self.qr_stream {
            qr_stream.abort();
        }
    }
}

/// Owns the single client connection. Start, stop and logout are serialized by
/// the connection lock.
pub struct InstanceSupervisor {
    ctx: Arc<GatewayContext>,
    factory: Arc<dyn ClientFactory>,
    connection: Mutex<Option<Connection>>,
}

impl InstanceSupervisor {
    #[must_use]
    pub fn new(ctx: Arc<GatewayContext>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            ctx,
            factory,
            connection: Mutex::new(None),
        }
    }

    pub async fn start(
        self: &Arc<Self>,
        raw_proxy: &str,
        require_existing_auth: bool,
    ) -> Result<StartOutcome, SupervisorError> {
        let mut slot = self.connection.lock().await;
        if slot
            .as_ref()
            .is_some_and(|connection| connection.client.is_connected())
        {
            return Err(SupervisorError::AlreadyConnected);
        }

        let proxy = ProxyConfig::parse(raw_proxy)?;

        let device = self.ctx.store.load_device().map_err(|error| {
            error!("failed to load device identity: {error:#}");
            SupervisorError::Store(error)
        })?;

        if require_existing_auth && device.is_none() {
            info!("no stored device identity; not starting a new pairing");
            return Ok(StartOutcome::NoExistingAuth);
        }

        if let Some(previous) = slot.take() {
            info!("replacing disconnected client");
            previous.shutdown().await;
        }
        self.ctx.pairing.reset().await;

        let (events_tx, events_rx) = mpsc::channel(self.ctx.config.event_queue_capacity);
        let pre_pair: Arc<dyn PrePairHook> = self.ctx.pairing.clone();
        let client = self.factory.build(
            device,
            ClientWiring {
                events: events_tx,
                pre_pair,
            },
        );
        let router =
            EventRouter::new(Arc::clone(&self.ctx), &client, Arc::downgrade(self)).spawn(events_rx);

        let paired = client.is_logged_in();
        let qr_stream = if paired {
            None
        } else {
            match client.qr_channel().await {
                Ok(stream) => {
                    let pairing = Arc::clone(&self.ctx.pairing);
                    Some(tokio::spawn(
                        async move { pairing.run_qr_stream(stream).await },
                    ))
                }
                Err(error) => {
                    self.ctx.pairing.on_qr_channel_error(&error).await;
                    None
                }
            }
        };

        client.set_proxy(&proxy);
        info!(proxy = %proxy.endpoint(), paired, "connecting client");

        let connection = Connection {
            client,
            router,
            qr_stream,
        };
        let connected = connection.client.connect().await;
        if let Err(error) = connected {
            error!("failed to connect: {error}");
            connection.shutdown().await;
            return Err(error.into());
        }

        *slot = Some(connection);
        Ok(StartOutcome::Started { paired })
    }

    /// Cycles the connection of `client` if it is still the live handle. Returns
    /// `false` when it was stopped or replaced in the meantime.
    pub async fn reconnect(
        &self,
        client: &Arc<dyn MessagingClient>,
    ) -> Result<bool, SupervisorError> {
        let slot = self.connection.lock().await;
        let Some(connection) = slot
            .as_ref()
            .filter(|connection| Arc::ptr_eq(&connection.client, client))
        else {
            info!("skipping reconnect of a client that is no longer current");
            return Ok(false);
        };

        connection.client.disconnect().await;
        connection.client.connect().await?;
        Ok(true)
    }

    /// Disconnects and drops the client. Returns `false` if none was running.
    pub async fn stop(&self) -> bool {
        let Some(connection) = self.connection.lock().await.take() else {
            return false;
        };
        info!("stopping instance");
        connection.shutdown().await;
        true
    }

    pub async fn is_connected_and_authenticated(&self) -> bool {
        self.connection.lock().await.as_ref().is_some_and(|connection| {
            connection.client.is_connected() && connection.client.is_logged_in()
        })
    }

    pub async fn client(&self) -> Option<Arc<dyn MessagingClient>> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|connection| Arc::clone(&connection.client))
    }

    pub async fn authorized_client(&self) -> Result<Arc<dyn MessagingClient>, SupervisorError> {
        match self.client().await {
            Some(client) if client.is_connected() && client.is_logged_in() => Ok(client),
            _ => Err(SupervisorError::NotAuthorized),
        }
    }

    /// Unlinks the device, forgets its identity and drops the connection.
    pub async fn logout(&self) -> Result<(), SupervisorError> {
        let mut slot = self.connection.lock().await;
        let Some(connection) = slot.as_ref() else {
            return Err(SupervisorError::NotAuthorized);
        };

        connection.client.logout().await?;
        if let Err(error) = self.ctx.store.clear_device() {
            error!("failed to clear device identity after logout: {error:#}");
        }
        if let Some(connection) = slot.take() {
            connection.shutdown().await;
        }
        info!("logged out");
        Ok(())
    }

    /// Sends `text`, records it as `sent` and announces it with a status webhook.
    pub async fn send_text(&self, to: &Jid, text: &str) -> Result<String, SupervisorError> {
        let client = self.authorized_client().await?;
        let response = client.send_text(to, text).await.map_err(|error| {
            warn!(%to, "failed to send message: {error}");
            SupervisorError::Client(error)
        })?;
        info!(%to, message_id = %response.id, "message sent");

        let record = DataMessage {
            chat_id: to.to_string(),
            message_id: response.id.clone(),
            message_timestamp: response.timestamp,
            json_data: json!({ "conversation": text }).to_string(),
            status: MessageStatus::Sent,
            status_timestamp: response.timestamp,
        };
        if let Err(error) = self.ctx.store.save_message(&record) {
            error!(message_id = %response.id, "failed to save sent message: {error:#}");
        }

        let wid = client
            .own_id()
            .map(|jid| jid.legacy_chat_id())
            .unwrap_or_default();
        let envelope = self.ctx.webhooks.status_envelope(
            wid,
            &response.id,
            MessageStatus::Sent,
            response.timestamp,
        );
        webhook::dispatch(&self.ctx.webhooks, envelope);

        Ok(response.id)
    }

    /// Sends `text` to every recipient on its own task.
    pub fn fan_out(
        self: &Arc<Self>,
        recipients: Vec<(String, Jid)>,
        text: &str,
    ) -> Vec<JoinHandle<SendReport>> {
        recipients
            .into_iter()
            .map(|(phone, jid)| {
                let supervisor = Arc::clone(self);
                let text = text.to_string();
                tokio::spawn(async move {
                    let outcome = supervisor
                        .send_text(&jid, &text)
                        .await
                        .map_err(|error| error.to_string());
                    SendReport { phone, outcome }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::client::loopback::{LoopbackControl, LoopbackFactory};
    use crate::config::tests::base_config;
    use crate::events::ClientEvent;
    use crate::store::{DeviceIdentity, SqliteStore};

    const PROXY: &str = "127.0.0.1:1080:user:pass";

    fn supervisor() -> (Arc<InstanceSupervisor>, LoopbackControl, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::new(dir.path().join("sup.sqlite3")).expect("store"));
        let ctx = Arc::new(GatewayContext::new(base_config(), store).expect("ctx"));
        let factory = LoopbackFactory::new();
        let control = factory.control();
        (
            Arc::new(InstanceSupervisor::new(ctx, Arc::new(factory))),
            control,
            dir,
        )
    }

    fn store_device(supervisor: &InstanceSupervisor) {
        supervisor
            .ctx
            .store
            .save_device(&DeviceIdentity {
                jid: Jid::user("15555550100"),
                push_name: Some("Support".to_string()),
                platform: None,
                paired_at_ms: 1,
            })
            .expect("save device");
    }

    #[tokio::test]
    async fn second_start_is_rejected_without_new_client() {
        let (supervisor, control, _dir) = supervisor();

        let outcome = supervisor.start(PROXY, false).await.expect("start");
        assert_eq!(outcome, StartOutcome::Started { paired: false });
        assert_eq!(control.build_count(), 1);

        for _ in 0..2 {
            assert!(matches!(
                supervisor.start(PROXY, false).await,
                Err(SupervisorError::AlreadyConnected)
            ));
        }
        assert_eq!(control.build_count(), 1);
        assert_eq!(
            control.current_proxy().map(|proxy| proxy.endpoint()),
            Some("127.0.0.1:1080".to_string())
        );
    }

    #[tokio::test]
    async fn bad_proxy_is_rejected_before_building() {
        let (supervisor, control, _dir) = supervisor();

        assert!(matches!(
            supervisor.start("", false).await,
            Err(SupervisorError::Proxy(ProxyError::Empty))
        ));
        assert!(matches!(
            supervisor.start("host:1080", false).await,
            Err(SupervisorError::Proxy(ProxyError::Malformed))
        ));
        assert_eq!(control.build_count(), 0);
    }

    #[tokio::test]
    async fn restore_without_identity_does_not_connect() {
        let (supervisor, control, _dir) = supervisor();

        let outcome = supervisor.start(PROXY, true).await.expect("start");
        assert_eq!(outcome, StartOutcome::NoExistingAuth);
        assert_eq!(control.build_count(), 0);
        assert!(!supervisor.is_connected_and_authenticated().await);
    }

    #[tokio::test]
    async fn restore_with_identity_connects_authenticated() {
        let (supervisor, control, _dir) = supervisor();
        store_device(&supervisor);

        let outcome = supervisor.start(PROXY, true).await.expect("start");
        assert_eq!(outcome, StartOutcome::Started { paired: true });
        assert!(supervisor.is_connected_and_authenticated().await);
        assert!(control.is_connected());
    }

    #[tokio::test]
    async fn stop_is_a_noop_without_client_and_allows_restart() {
        let (supervisor, control, _dir) = supervisor();
        assert!(!supervisor.stop().await);

        supervisor.start(PROXY, false).await.expect("start");
        assert!(supervisor.stop().await);
        assert!(!control.is_connected());

        supervisor.start(PROXY, false).await.expect("restart");
        assert_eq!(control.build_count(), 2);
    }

    #[tokio::test]
    async fn keepalive_failures_reconnect_the_live_client() {
        let (supervisor, control, _dir) = supervisor();
        store_device(&supervisor);
        supervisor.start(PROXY, false).await.expect("start");
        assert_eq!(control.connect_count(), 1);

        for error_count in 1..=5 {
            assert!(control.emit(ClientEvent::KeepAliveTimeout { error_count }).await);
        }
        for _ in 0..100 {
            if control.connect_count() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(control.connect_count(), 2);
        assert!(supervisor.is_connected_and_authenticated().await);
    }

    #[tokio::test]
    async fn stopped_instance_stays_disconnected_after_keepalive_threshold() {
        let (supervisor, control, _dir) = supervisor();
        store_device(&supervisor);
        supervisor.start(PROXY, false).await.expect("start");
        let client = supervisor.client().await.expect("client");

        assert!(supervisor.stop().await);
        assert!(!supervisor.reconnect(&client).await.expect("reconnect"));
        assert!(!control.is_connected());
        assert_eq!(control.connect_count(), 1);
    }

    #[tokio::test]
    async fn replaced_client_is_not_reconnected() {
        let (supervisor, control, _dir) = supervisor();
        supervisor.start(PROXY, false).await.expect("start");
        let stale = supervisor.client().await.expect("client");
        assert!(supervisor.stop().await);
        supervisor.start(PROXY, false).await.expect("restart");

        assert!(!supervisor.reconnect(&stale).await.expect("reconnect"));
        assert!(!stale.is_connected());
        assert_eq!(control.connect_count(), 2);
        assert!(control.is_connected());
    }

    #[tokio::test]
    async fn send_requires_authorized_session() {
        let (supervisor, control, _dir) = supervisor();
        supervisor.start(PROXY, false).await.expect("start");

        assert!(matches!(
            supervisor.send_text(&Jid::user("15555550111"), "hi").await,
            Err(SupervisorError::NotAuthorized)
        ));
        assert!(control.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn fan_out_collects_per_recipient_results() {
        let (supervisor, control, _dir) = supervisor();
        store_device(&supervisor);
        supervisor.start(PROXY, false).await.expect("start");

        let handles = supervisor.fan_out(
            vec![
                ("111".to_string(), Jid::user("111")),
                ("222".to_string(), Jid::user("222")),
            ],
            "hello",
        );
        let mut reports = Vec::new();
        for handle in handles {
            reports.push(handle.await.expect("join"));
        }

        assert!(reports.iter().all(|report| report.outcome.is_ok()));
        assert_eq!(control.sent_messages().len(), 2);
        assert_eq!(supervisor.ctx.store.count_messages().expect("count"), 2);
    }

    #[tokio::test]
    async fn logout_clears_identity_and_connection() {
        let (supervisor, _control, _dir) = supervisor();
        store_device(&supervisor);
        supervisor.start(PROXY, false).await.expect("start");

        supervisor.logout().await.expect("logout");
        assert!(supervisor.ctx.store.load_device().expect("load").is_none());
        assert!(supervisor.client().await.is_none());
        assert!(matches!(
            supervisor.logout().await,
            Err(SupervisorError::NotAuthorized)
        ));
    }
}
