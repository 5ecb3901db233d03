use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod client;
pub mod config;
pub mod context;
pub mod crypto;
pub mod events;
pub mod http;
pub mod pairing;
pub mod proxy;
pub mod qr;
pub mod rendezvous;
pub mod router;
pub mod store;
pub mod supervisor;
pub mod webhook;
pub mod ws;

use context::GatewayContext;
use supervisor::InstanceSupervisor;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<GatewayContext>,
    pub supervisor: Arc<InstanceSupervisor>,
}

impl AppState {
    #[must_use]
    pub fn new(ctx: Arc<GatewayContext>, supervisor: Arc<InstanceSupervisor>) -> Self {
        Self { ctx, supervisor }
    }
}

#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[must_use]
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs().try_into().unwrap_or(i64::MAX))
        .unwrap_or_default()
}
