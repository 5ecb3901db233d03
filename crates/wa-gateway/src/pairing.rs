use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};
use wa_gateway_transport::wa_pairing::{
    AuthMessage, REASON_ALREADY_AUTHORIZED, REASON_QR_NOT_SCANNED,
};

use crate::client::{ClientError, PrePairHook, PrePairRequest, QrEvent};
use crate::qr;

/// What the socket writer task is asked to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Auth(AuthMessage),
    Close,
}

pub type SocketSender = mpsc::UnboundedSender<OutboundFrame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairDecision {
    Accept,
    Reject,
}

struct PendingDecision {
    generation: u64,
    reply: oneshot::Sender<PairDecision>,
}

/// Relays the pairing handshake between the client's QR stream and the attached
/// browser socket, and carries the human accept/reject decision back.
pub struct PairingBridge {
    socket: RwLock<Option<(u64, SocketSender)>>,
    next_socket_id: AtomicU64,
    last_auth: Mutex<Option<AuthMessage>>,
    pending: Mutex<Option<PendingDecision>>,
    next_generation: AtomicU64,
    decision_timeout: Duration,
}

impl PairingBridge {
    #[must_use]
    pub fn new(decision_timeout: Duration) -> Self {
        Self {
            socket: RwLock::new(None),
            next_socket_id: AtomicU64::new(1),
            last_auth: Mutex::new(None),
            pending: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            decision_timeout,
        }
    }

    /// Makes `sender` the socket pairing frames go to, replacing any earlier one.
    pub async fn attach(&self, sender: SocketSender) -> u64 {
        let id = self.next_socket_id.fetch_add(1, Ordering::SeqCst);
        let previous = self.socket.write().await.replace((id, sender));
        if let Some((previous_id, _)) = previous {
            debug!(previous_id, socket_id = id, "pairing socket replaced");
        }
        id
    }

    pub async fn detach(&self, socket_id: u64) {
        let mut socket = self.socket.write().await;
        if socket.as_ref().is_some_and(|(id, _)| *id == socket_id) {
            socket.take();
        }
    }

    pub async fn has_socket(&self) -> bool {
        self.socket.read().await.is_some()
    }

    /// Forgets the pairing result of an earlier session.
    pub async fn reset(&self) {
        self.last_auth.lock().await.take();
    }

    /// Records `message` for pollers and pushes it to the attached socket.
    /// Returns whether a socket accepted the frame.
    pub async fn publish(&self, message: AuthMessage) -> bool {
        *self.last_auth.lock().await = Some(message.clone());

        let sender = self.socket.read().await.as_ref().map(|(_, tx)| tx.clone());
        let Some(sender) = sender else {
            debug!("no pairing socket attached; frame kept for polling");
            return false;
        };

        if sender.send(OutboundFrame::Auth(message)).is_err() {
            warn!("failed to push pairing frame to socket");
            return false;
        }
        true
    }

    /// Publishes a terminal frame, then closes the socket.
    pub async fn finish(&self, message: AuthMessage) {
        self.publish(message).await;
        self.close_socket().await;
    }

    pub async fn close_socket(&self) {
        if let Some((socket_id, sender)) = self.socket.write().await.take() {
            debug!(socket_id, "closing pairing socket");
            let _ = sender.send(OutboundFrame::Close);
        }
    }

    /// Returns the latest pairing frame. Terminal frames are handed out once.
    pub async fn take_auth_message(&self) -> Option<AuthMessage> {
        let mut last = self.last_auth.lock().await;
        match last.as_ref() {
            Some(message) if message.is_terminal() => last.take(),
            Some(message) => Some(message.clone()),
            None => None,
        }
    }

    pub async fn awaiting_decision(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    /// Delivers a human decision to the pending pre-pair wait, if there is one.
    pub async fn submit_decision(&self, decision: PairDecision) -> bool {
        let Some(pending) = self.pending.lock().await.take() else {
            debug!(?decision, "pairing decision ignored; nothing awaits one");
            return false;
        };
        pending.reply.send(decision).is_ok()
    }

    /// Consumes the client's QR stream until it ends.
    pub async fn run_qr_stream(&self, mut events: mpsc::Receiver<QrEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                QrEvent::Code(code) => match qr::pairing_qr_message(&code) {
                    Ok(message) => {
                        if !self.publish(message).await {
                            info!("pairing code rendered but no socket took it");
                        }
                    }
                    Err(error) => warn!("failed to render pairing code: {error}"),
                },
                QrEvent::Timeout => {
                    info!("pairing code was not scanned in time");
                    self.finish(AuthMessage::error(REASON_QR_NOT_SCANNED)).await;
                }
                other => info!(event = other.name(), "login event"),
            }
        }
        debug!("qr stream ended");
    }

    /// Handles a failure to open the QR stream.
    pub async fn on_qr_channel_error(&self, error: &ClientError) {
        if matches!(error, ClientError::QrStoreContainsId) {
            self.finish(AuthMessage::error(REASON_ALREADY_AUTHORIZED))
                .await;
        } else {
            info!("qr channel not opened, assuming device is already logged in: {error}");
        }
    }
}

#[async_trait]
impl PrePairHook for PairingBridge {
    async fn approve(&self, request: PrePairRequest) -> bool {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (reply, decision) = oneshot::channel();
        *self.pending.lock().await = Some(PendingDecision { generation, reply });

        info!(
            jid = %request.jid,
            platform = %request.platform,
            business_name = %request.business_name,
            timeout_ms = self.decision_timeout.as_millis(),
            "pairing offered; awaiting reject"
        );

        let outcome = tokio::time::timeout(self.decision_timeout, decision).await;

        {
            let mut pending = self.pending.lock().await;
            if pending
                .as_ref()
                .is_some_and(|pending| pending.generation == generation)
            {
                pending.take();
            }
        }

        match outcome {
            Ok(Ok(PairDecision::Reject)) => {
                info!(jid = %request.jid, "pairing rejected");
                false
            }
            Ok(Ok(PairDecision::Accept)) => {
                info!(jid = %request.jid, "pairing accepted");
                true
            }
            Ok(Err(_)) | Err(_) => {
                info!(jid = %request.jid, "pairing accepted without a decision");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use wa_gateway_transport::wa_jid::Jid;

    use super::*;

    fn request() -> PrePairRequest {
        PrePairRequest {
            jid: Jid::user("15555550100"),
            platform: "android".to_string(),
            business_name: String::new(),
        }
    }

    #[tokio::test]
    async fn code_is_pushed_to_attached_socket() {
        let bridge = PairingBridge::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.attach(tx).await;

        let (qr_tx, qr_rx) = mpsc::channel(4);
        qr_tx.send(QrEvent::Code("ABC".to_string())).await.expect("send");
        drop(qr_tx);
        bridge.run_qr_stream(qr_rx).await;

        let Some(OutboundFrame::Auth(AuthMessage::Qr { image_qr_code })) = rx.recv().await else {
            panic!("expected qr frame");
        };
        assert!(image_qr_code.starts_with("data:image/png;base64,"));

        // A qr frame stays readable for pollers.
        assert!(bridge.take_auth_message().await.is_some());
        assert!(bridge.take_auth_message().await.is_some());
    }

    #[tokio::test]
    async fn timeout_pushes_error_then_closes() {
        let bridge = PairingBridge::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.attach(tx).await;

        let (qr_tx, qr_rx) = mpsc::channel(4);
        qr_tx.send(QrEvent::Timeout).await.expect("send");
        drop(qr_tx);
        bridge.run_qr_stream(qr_rx).await;

        assert_eq!(
            rx.recv().await,
            Some(OutboundFrame::Auth(AuthMessage::error(REASON_QR_NOT_SCANNED)))
        );
        assert_eq!(rx.recv().await, Some(OutboundFrame::Close));
        assert!(!bridge.has_socket().await);

        assert_eq!(
            bridge.take_auth_message().await,
            Some(AuthMessage::error(REASON_QR_NOT_SCANNED))
        );
        assert_eq!(bridge.take_auth_message().await, None);
    }

    #[tokio::test]
    async fn already_paired_device_reports_authorized() {
        let bridge = PairingBridge::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.attach(tx).await;

        bridge
            .on_qr_channel_error(&ClientError::QrStoreContainsId)
            .await;
        assert_eq!(
            rx.recv().await,
            Some(OutboundFrame::Auth(AuthMessage::error(
                REASON_ALREADY_AUTHORIZED
            )))
        );

        // Other open errors are not reported to the socket.
        bridge.on_qr_channel_error(&ClientError::NotConnected).await;
        assert_eq!(rx.recv().await, Some(OutboundFrame::Close));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reject_within_window_blocks_pairing() {
        let bridge = Arc::new(PairingBridge::new(Duration::from_secs(3)));

        let approving = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.approve(request()).await })
        };

        while !bridge.awaiting_decision().await {
            tokio::task::yield_now().await;
        }
        assert!(bridge.submit_decision(PairDecision::Reject).await);
        assert!(!approving.await.expect("join"));
        assert!(!bridge.awaiting_decision().await);
    }

    #[tokio::test]
    async fn silence_approves_after_timeout() {
        let bridge = PairingBridge::new(Duration::from_millis(30));
        assert!(bridge.approve(request()).await);
        assert!(!bridge.submit_decision(PairDecision::Reject).await);
    }

    #[tokio::test]
    async fn stale_socket_detach_keeps_newer_socket() {
        let bridge = PairingBridge::new(Duration::from_millis(30));
        let (first_tx, _first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        let first = bridge.attach(first_tx).await;
        bridge.attach(second_tx).await;
        bridge.detach(first).await;

        assert!(bridge.publish(AuthMessage::error("x")).await);
        assert!(second_rx.recv().await.is_some());
    }
}
