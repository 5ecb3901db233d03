use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use wa_gateway_transport::wa_webhook::validate_webhook_url;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:10001";
const DEFAULT_DB_PATH: &str = ".cache/wa-gateway/gateway.sqlite3";
const DEFAULT_MEDIA_DIR: &str = ".cache/wa-gateway/media";

pub const DEFAULT_PAIR_DECISION_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_PRESENCE_SETTLE_MS: u64 = 300;
pub const DEFAULT_QR_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub media_dir: PathBuf,
    pub app_secret: Option<String>,
    pub webhook_url: Option<String>,
    pub instance_id: u64,
    pub restore_proxy: Option<String>,
    pub pair_decision_timeout_ms: u64,
    pub presence_settle_ms: u64,
    pub status_probe_timeout_ms: u64,
    pub qr_poll_interval_ms: u64,
    pub qr_poll_timeout_ms: u64,
    pub event_queue_capacity: usize,
    pub keepalive_reconnect_threshold: u32,
    pub webhook_timeout_ms: u64,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env_var_or_default("WA_GATEWAY_BIND_ADDR", DEFAULT_BIND_ADDR)
            .parse::<SocketAddr>()
            .with_context(|| "WA_GATEWAY_BIND_ADDR must be a valid host:port socket address")?;

        let database_path = PathBuf::from(env_var_or_default(
            "WA_GATEWAY_DB_PATH",
            DEFAULT_DB_PATH,
        ));
        let media_dir = PathBuf::from(env_var_or_default(
            "WA_GATEWAY_MEDIA_DIR",
            DEFAULT_MEDIA_DIR,
        ));

        let event_queue_capacity = usize::try_from(parse_u64_env(
            "WA_GATEWAY_EVENT_QUEUE_CAPACITY",
            256,
        )?)
        .context("WA_GATEWAY_EVENT_QUEUE_CAPACITY does not fit into usize")?;

        let keepalive_reconnect_threshold = u32::try_from(parse_u64_env(
            "WA_GATEWAY_KEEPALIVE_RECONNECT_THRESHOLD",
            3,
        )?)
        .context("WA_GATEWAY_KEEPALIVE_RECONNECT_THRESHOLD does not fit into u32")?;

        Ok(Self {
            bind_addr,
            database_path,
            media_dir,
            app_secret: optional_env("WA_GATEWAY_APP_SECRET"),
            webhook_url: optional_env("WA_GATEWAY_WEBHOOK_URL"),
            instance_id: parse_u64_env("WA_GATEWAY_INSTANCE_ID", 0)?,
            restore_proxy: optional_env("WA_GATEWAY_RESTORE_PROXY"),
            pair_decision_timeout_ms: parse_u64_env(
                "WA_GATEWAY_PAIR_DECISION_TIMEOUT_MS",
                DEFAULT_PAIR_DECISION_TIMEOUT_MS,
            )?,
            presence_settle_ms: parse_u64_env(
                "WA_GATEWAY_PRESENCE_SETTLE_MS",
                DEFAULT_PRESENCE_SETTLE_MS,
            )?,
            status_probe_timeout_ms: parse_u64_env("WA_GATEWAY_STATUS_PROBE_TIMEOUT_MS", 15_000)?,
            qr_poll_interval_ms: parse_u64_env(
                "WA_GATEWAY_QR_POLL_INTERVAL_MS",
                DEFAULT_QR_POLL_INTERVAL_MS,
            )?,
            qr_poll_timeout_ms: parse_u64_env("WA_GATEWAY_QR_POLL_TIMEOUT_MS", 60_000)?,
            event_queue_capacity,
            keepalive_reconnect_threshold,
            webhook_timeout_ms: parse_u64_env("WA_GATEWAY_WEBHOOK_TIMEOUT_MS", 10_000)?,
            tls_cert_path: optional_env("WA_GATEWAY_TLS_CERT_PATH").map(PathBuf::from),
            tls_key_path: optional_env("WA_GATEWAY_TLS_KEY_PATH").map(PathBuf::from),
        })
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("WA_GATEWAY_PAIR_DECISION_TIMEOUT_MS", self.pair_decision_timeout_ms),
            ("WA_GATEWAY_PRESENCE_SETTLE_MS", self.presence_settle_ms),
            ("WA_GATEWAY_STATUS_PROBE_TIMEOUT_MS", self.status_probe_timeout_ms),
            ("WA_GATEWAY_QR_POLL_INTERVAL_MS", self.qr_poll_interval_ms),
            ("WA_GATEWAY_QR_POLL_TIMEOUT_MS", self.qr_poll_timeout_ms),
            ("WA_GATEWAY_WEBHOOK_TIMEOUT_MS", self.webhook_timeout_ms),
        ] {
            if value == 0 {
                bail!("{name} must be > 0");
            }
        }

        if self.event_queue_capacity == 0 {
            bail!("WA_GATEWAY_EVENT_QUEUE_CAPACITY must be > 0");
        }

        if self.qr_poll_interval_ms > self.qr_poll_timeout_ms {
            bail!("WA_GATEWAY_QR_POLL_INTERVAL_MS must not exceed WA_GATEWAY_QR_POLL_TIMEOUT_MS");
        }

        if let Some(url) = &self.webhook_url {
            validate_webhook_url(url).with_context(|| "WA_GATEWAY_WEBHOOK_URL is invalid")?;
        }

        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    bail!("TLS cert path '{}' does not exist", cert.display());
                }
                if !key.exists() {
                    bail!("TLS key path '{}' does not exist", key.display());
                }
            }
            (None, None) => {}
            _ => {
                bail!(
                    "WA_GATEWAY_TLS_CERT_PATH and WA_GATEWAY_TLS_KEY_PATH must be set together"
                );
            }
        }

        Ok(())
    }

    #[must_use]
    pub const fn uses_tls(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }

    #[must_use]
    pub const fn secret_check_enabled(&self) -> bool {
        self.app_secret.is_some()
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_var_or_default(key: &str, default_value: &str) -> String {
    optional_env(key).unwrap_or_else(|| default_value.to_string())
}

fn parse_u64_env(key: &str, default_value: u64) -> Result<u64> {
    let raw = env_var_or_default(key, &default_value.to_string());
    u64::from_str(raw.trim()).with_context(|| format!("{key} must be a valid u64 integer"))
}
