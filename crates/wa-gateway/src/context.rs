use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::warn;
use wa_gateway_transport::wa_webhook::validate_webhook_url;

use crate::config::GatewayConfig;
use crate::crypto::SecretGuard;
use crate::pairing::PairingBridge;
use crate::rendezvous::StatusRendezvous;
use crate::store::SqliteStore;
use crate::webhook::WebhookDispatcher;

/// Process-wide state shared by every component serving the one account.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub store: Arc<SqliteStore>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub pairing: Arc<PairingBridge>,
    pub rendezvous: Arc<StatusRendezvous>,
    pub secret: Option<SecretGuard>,
    pub started_at: i64,
    history_seq: AtomicU32,
    shutdown: watch::Sender<bool>,
}

impl GatewayContext {
    pub fn new(config: GatewayConfig, store: Arc<SqliteStore>) -> Result<Self> {
        let target = config
            .webhook_url
            .as_deref()
            .map(validate_webhook_url)
            .transpose()
            .context("invalid webhook url")?;
        let webhooks = WebhookDispatcher::new(
            config.instance_id,
            target,
            Duration::from_millis(config.webhook_timeout_ms),
        )?;

        Ok(Self::with_dispatcher(config, store, webhooks))
    }

    #[must_use]
    pub fn with_dispatcher(
        config: GatewayConfig,
        store: Arc<SqliteStore>,
        webhooks: WebhookDispatcher,
    ) -> Self {
        let pairing = PairingBridge::new(Duration::from_millis(config.pair_decision_timeout_ms));
        let secret = config.app_secret.as_deref().map(SecretGuard::new);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store,
            webhooks: Arc::new(webhooks),
            pairing: Arc::new(pairing),
            rendezvous: Arc::new(StatusRendezvous::new()),
            secret,
            started_at: crate::now_secs(),
            history_seq: AtomicU32::new(0),
            shutdown,
        }
    }

    /// Sequence number for the next history-sync batch, starting at 1.
    pub fn next_history_seq(&self) -> u32 {
        self.history_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn request_shutdown(&self) {
        warn!("shutdown requested");
        self.shutdown.send_replace(true);
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`GatewayContext::request_shutdown`] has been called.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Presence settle delay and overall deadline of a status lookup.
    #[must_use]
    pub fn presence_status_timings(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.config.presence_settle_ms),
            Duration::from_millis(self.config.status_probe_timeout_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::tests::base_config;

    #[tokio::test]
    async fn shutdown_signal_reaches_waiters() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::new(dir.path().join("ctx.sqlite3")).expect("store"));
        let ctx = Arc::new(GatewayContext::new(base_config(), store).expect("ctx"));
        assert!(!ctx.shutdown_requested());

        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.wait_for_shutdown().await })
        };
        ctx.request_shutdown();

        waiter.await.expect("join");
        assert!(ctx.shutdown_requested());
    }

    #[test]
    fn history_sequence_is_monotonic() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::new(dir.path().join("ctx.sqlite3")).expect("store"));
        let ctx = GatewayContext::new(base_config(), store).expect("ctx");

        assert_eq!(ctx.next_history_seq(), 1);
        assert_eq!(ctx.next_history_seq(), 2);
    }

    #[test]
    fn presence_status_timings_follow_config() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::new(dir.path().join("ctx.sqlite3")).expect("store"));
        let mut config = base_config();
        config.presence_settle_ms = 250;
        config.status_probe_timeout_ms = 4_000;
        let ctx = GatewayContext::new(config, store).expect("ctx");

        assert_eq!(
            ctx.presence_status_timings(),
            (Duration::from_millis(250), Duration::from_millis(4_000))
        );
        assert!(ctx.started_at <= crate::now_secs());
    }
}
