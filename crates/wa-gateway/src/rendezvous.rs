use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;
use wa_gateway_transport::wa_jid::Jid;

use crate::client::{ClientError, MessagingClient, Presence};
use crate::events::PresenceEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResult {
    pub online: bool,
    pub last_seen: Option<i64>,
}

impl From<&PresenceEvent> for StatusResult {
    fn from(event: &PresenceEvent) -> Self {
        Self {
            online: !event.unavailable,
            last_seen: if event.unavailable {
                event.last_seen
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("status request timed out")]
    Timeout,

    #[error("status probe was abandoned")]
    Abandoned,
}

struct Waiter {
    target: Jid,
    order: u64,
    reply: oneshot::Sender<StatusResult>,
}

/// Pairs status probes with the presence events that answer them.
///
/// Each probe owns a token; a presence event goes to the oldest probe waiting on the
/// same target, so overlapping probes never receive each other's answers.
#[derive(Default)]
pub struct StatusRendezvous {
    waiters: Mutex<HashMap<Uuid, Waiter>>,
    next_order: AtomicU64,
}

/// Drops the waiter registration however the probe ends.
struct Registration<'a> {
    rendezvous: &'a StatusRendezvous,
    token: Uuid,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.rendezvous.waiters().remove(&self.token);
    }
}

impl StatusRendezvous {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<Uuid, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, target: Jid) -> (Registration<'_>, oneshot::Receiver<StatusResult>) {
        let token = Uuid::new_v4();
        let (reply, result) = oneshot::channel();
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        self.waiters().insert(
            token,
            Waiter {
                target,
                order,
                reply,
            },
        );

        (
            Registration {
                rendezvous: self,
                token,
            },
            result,
        )
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiters().len()
    }

    /// Cycles own presence, subscribes to `target` and waits for its presence event.
    pub async fn probe(
        &self,
        client: &dyn MessagingClient,
        target: &Jid,
        settle: Duration,
        timeout: Duration,
    ) -> Result<StatusResult, ProbeError> {
        let (registration, result) = self.register(target.clone());
        debug!(token = %registration.token, %target, "status probe registered");

        client.send_presence(Presence::Unavailable).await?;
        tokio::time::sleep(settle).await;
        client.send_presence(Presence::Available).await?;
        client.subscribe_presence(target).await?;

        let outcome = match tokio::time::timeout(timeout, result).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(ProbeError::Abandoned),
            Err(_) => Err(ProbeError::Timeout),
        };
        drop(registration);
        outcome
    }

    /// Routes one presence event. Returns `false` when no probe waits on its sender.
    pub fn complete(&self, event: &PresenceEvent) -> bool {
        let waiter = {
            let mut waiters = self.waiters();
            let token = waiters
                .iter()
                .filter(|(_, waiter)| waiter.target == event.from)
                .min_by_key(|(_, waiter)| waiter.order)
                .map(|(token, _)| *token);
            token.and_then(|token| waiters.remove(&token))
        };

        let Some(waiter) = waiter else {
            info!(from = %event.from, unavailable = event.unavailable, "presence without a waiting probe");
            return false;
        };

        waiter.reply.send(StatusResult::from(event)).is_ok()
    }
}
