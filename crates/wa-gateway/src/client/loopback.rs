//! In-process backend for the client boundary.
//!
//! Nothing leaves the process: sends are recorded, directory lookups are answered from
//! data registered through [`LoopbackControl`], and the control handle plays the part of
//! the network (pushing pairing codes, confirming a scan, emitting protocol events).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;
use wa_gateway_transport::wa_jid::{Jid, parse_phone};

use super::{
    ClientError, ClientFactory, ClientWiring, Contact, MessagingClient, OnWhatsAppResult,
    PrePairHook, PrePairRequest, Presence, ProfilePicture, QrEvent, SendResponse, UserInfo,
};
use crate::events::{ClientEvent, ImageAttachment, IncomingMessage, PresenceEvent};
use crate::proxy::ProxyConfig;
use crate::store::DeviceIdentity;

const QR_CHANNEL_CAPACITY: usize = 8;
const PRESENCE_ANSWER_DELAY: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: Jid,
    pub text: String,
    pub id: String,
}

#[derive(Debug, Clone)]
struct DirectoryUser {
    info: UserInfo,
    picture: Option<ProfilePicture>,
}

/// Network-side data shared by every client the factory builds.
#[derive(Default)]
struct Network {
    users: Mutex<HashMap<String, DirectoryUser>>,
    contacts: Mutex<Vec<Contact>>,
    media: Mutex<HashMap<String, Vec<u8>>>,
    presence_answers: Mutex<HashMap<Jid, PresenceEvent>>,
    sent: Mutex<Vec<SentMessage>>,
    presence_log: Mutex<Vec<Presence>>,
    fail_sends: AtomicBool,
    builds: AtomicUsize,
    connects: AtomicUsize,
}

pub struct LoopbackClient {
    network: Arc<Network>,
    events: mpsc::Sender<ClientEvent>,
    pre_pair: Arc<dyn PrePairHook>,
    connected: AtomicBool,
    logged_in: AtomicBool,
    own_id: Mutex<Option<Jid>>,
    push_name: Mutex<Option<String>>,
    proxy: Mutex<Option<ProxyConfig>>,
    qr_tx: Mutex<Option<mpsc::Sender<QrEvent>>>,
}

impl LoopbackClient {
    fn new(network: Arc<Network>, device: Option<DeviceIdentity>, wiring: ClientWiring) -> Self {
        let (own_id, push_name) = device
            .map(|device| (Some(device.jid), device.push_name))
            .unwrap_or_default();

        Self {
            network,
            events: wiring.events,
            pre_pair: wiring.pre_pair,
            connected: AtomicBool::new(false),
            logged_in: AtomicBool::new(own_id.is_some()),
            own_id: Mutex::new(own_id),
            push_name: Mutex::new(push_name),
            proxy: Mutex::new(None),
            qr_tx: Mutex::new(None),
        }
    }

    fn ensure_session(&self) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if !self.is_logged_in() {
            return Err(ClientError::NotLoggedIn);
        }
        Ok(())
    }

    fn qr_sender(&self) -> Option<mpsc::Sender<QrEvent>> {
        lock(&self.qr_tx).clone()
    }

    #[must_use]
    pub fn proxy(&self) -> Option<ProxyConfig> {
        lock(&self.proxy).clone()
    }
}

#[async_trait]
impl MessagingClient for LoopbackClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn own_id(&self) -> Option<Jid> {
        lock(&self.own_id).clone()
    }

    fn push_name(&self) -> Option<String> {
        lock(&self.push_name).clone()
    }

    fn set_proxy(&self, proxy: &ProxyConfig) {
        *lock(&self.proxy) = Some(proxy.clone());
    }

    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, ClientError> {
        if self.is_logged_in() {
            return Err(ClientError::QrStoreContainsId);
        }
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }

        let (tx, rx) = mpsc::channel(QR_CHANNEL_CAPACITY);
        *lock(&self.qr_tx) = Some(tx);
        Ok(rx)
    }

    async fn connect(&self) -> Result<(), ClientError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }
        self.network.connects.fetch_add(1, Ordering::SeqCst);
        debug!(proxy = ?self.proxy(), "loopback client connected");

        if self.is_logged_in() {
            let _ = self.events.send(ClientEvent::Connected).await;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.qr_tx).take();
    }

    async fn logout(&self) -> Result<(), ClientError> {
        if !self.is_logged_in() {
            return Err(ClientError::NotLoggedIn);
        }

        self.logged_in.store(false, Ordering::SeqCst);
        lock(&self.own_id).take();
        self.disconnect().await;
        Ok(())
    }

    async fn send_text(&self, to: &Jid, text: &str) -> Result<SendResponse, ClientError> {
        self.ensure_session()?;
        if self.network.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::Protocol("server returned error 479".to_string()));
        }

        let id = format!("3EB0{}", Uuid::new_v4().simple()).to_uppercase();
        lock(&self.network.sent).push(SentMessage {
            to: to.clone(),
            text: text.to_string(),
            id: id.clone(),
        });

        Ok(SendResponse {
            id,
            timestamp: crate::now_secs(),
        })
    }

    async fn send_presence(&self, presence: Presence) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        lock(&self.network.presence_log).push(presence);
        Ok(())
    }

    async fn subscribe_presence(&self, jid: &Jid) -> Result<(), ClientError> {
        self.ensure_session()?;

        let answer = lock(&self.network.presence_answers).get(jid).cloned();
        if let Some(answer) = answer {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(PRESENCE_ANSWER_DELAY).await;
                let _ = events.send(ClientEvent::Presence(answer)).await;
            });
        }
        Ok(())
    }

    async fn is_on_whatsapp(
        &self,
        phones: &[String],
    ) -> Result<Vec<OnWhatsAppResult>, ClientError> {
        self.ensure_session()?;

        let users = lock(&self.network.users);
        phones
            .iter()
            .map(|phone| {
                let jid =
                    parse_phone(phone).map_err(|error| ClientError::Protocol(error.to_string()))?;
                let user = users.get(&jid.user);
                Ok(OnWhatsAppResult {
                    query: phone.clone(),
                    is_in: user.is_some(),
                    verified_business_name: user
                        .and_then(|user| user.info.verified_business_name.clone()),
                    jid,
                })
            })
            .collect()
    }

    async fn user_info(&self, jids: &[Jid]) -> Result<HashMap<Jid, UserInfo>, ClientError> {
        self.ensure_session()?;

        let users = lock(&self.network.users);
        Ok(jids
            .iter()
            .filter_map(|jid| {
                users
                    .get(&jid.user)
                    .map(|user| (jid.clone(), user.info.clone()))
            })
            .collect())
    }

    async fn profile_picture(&self, jid: &Jid) -> Result<Option<ProfilePicture>, ClientError> {
        self.ensure_session()?;

        Ok(lock(&self.network.users)
            .get(&jid.user)
            .and_then(|user| user.picture.clone()))
    }

    async fn contacts(&self) -> Result<Vec<Contact>, ClientError> {
        self.ensure_session()?;
        Ok(lock(&self.network.contacts).clone())
    }

    async fn decrypt_poll_vote(
        &self,
        message: &IncomingMessage,
    ) -> Result<Vec<String>, ClientError> {
        let payload = message
            .content
            .poll_update
            .as_ref()
            .ok_or_else(|| ClientError::Protocol("message is not a poll update".to_string()))?;
        let plain = String::from_utf8(payload.ciphertext.clone())
            .map_err(|_| ClientError::Protocol("failed to decrypt poll vote".to_string()))?;

        Ok(plain
            .split(',')
            .filter(|option| !option.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn decrypt_reaction(&self, message: &IncomingMessage) -> Result<String, ClientError> {
        let payload = message
            .content
            .enc_reaction
            .as_ref()
            .ok_or_else(|| ClientError::Protocol("message is not a reaction".to_string()))?;

        String::from_utf8(payload.ciphertext.clone())
            .map_err(|_| ClientError::Protocol("failed to decrypt reaction".to_string()))
    }

    async fn download_image(&self, image: &ImageAttachment) -> Result<Vec<u8>, ClientError> {
        lock(&self.network.media)
            .get(&image.direct_path)
            .cloned()
            .ok_or_else(|| ClientError::Protocol(format!("media '{}' not found", image.direct_path)))
    }
}

/// Factory for [`LoopbackClient`]s; every build replaces the one the control handle drives.
#[derive(Default)]
pub struct LoopbackFactory {
    network: Arc<Network>,
    current: Arc<Mutex<Option<Arc<LoopbackClient>>>>,
}

impl LoopbackFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn control(&self) -> LoopbackControl {
        LoopbackControl {
            network: Arc::clone(&self.network),
            current: Arc::clone(&self.current),
        }
    }
}

impl ClientFactory for LoopbackFactory {
    fn build(
        &self,
        device: Option<DeviceIdentity>,
        wiring: ClientWiring,
    ) -> Arc<dyn MessagingClient> {
        self.network.builds.fetch_add(1, Ordering::SeqCst);
        let client = Arc::new(LoopbackClient::new(
            Arc::clone(&self.network),
            device,
            wiring,
        ));
        *lock(&self.current) = Some(Arc::clone(&client));
        client
    }
}

/// Drives the network side of the most recently built [`LoopbackClient`].
#[derive(Clone)]
pub struct LoopbackControl {
    network: Arc<Network>,
    current: Arc<Mutex<Option<Arc<LoopbackClient>>>>,
}

impl LoopbackControl {
    fn client(&self) -> Option<Arc<LoopbackClient>> {
        lock(&self.current).clone()
    }

    #[must_use]
    pub fn build_count(&self) -> usize {
        self.network.builds.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.network.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn current_proxy(&self) -> Option<ProxyConfig> {
        self.client().and_then(|client| client.proxy())
    }

    /// Offers a new pairing code on the open QR stream.
    pub async fn push_qr(&self, code: &str) -> bool {
        let Some(tx) = self.client().and_then(|client| client.qr_sender()) else {
            return false;
        };
        tx.send(QrEvent::Code(code.to_string())).await.is_ok()
    }

    /// Ends the QR stream without a scan.
    pub async fn expire_qr(&self) -> bool {
        let Some(client) = self.client() else {
            return false;
        };
        let Some(tx) = lock(&client.qr_tx).take() else {
            return false;
        };
        tx.send(QrEvent::Timeout).await.is_ok()
    }

    /// Simulates the phone scanning the code. The pre-pair hook decides the outcome.
    pub async fn complete_pairing(&self, jid: Jid, push_name: &str, business_name: &str) -> bool {
        let Some(client) = self.client() else {
            return false;
        };

        let request = PrePairRequest {
            jid: jid.clone(),
            platform: "loopback".to_string(),
            business_name: business_name.to_string(),
        };
        if !client.pre_pair.approve(request).await {
            info!(%jid, "loopback pairing rejected");
            return false;
        }

        client.logged_in.store(true, Ordering::SeqCst);
        *lock(&client.own_id) = Some(jid.clone());
        *lock(&client.push_name) = Some(push_name.to_string());

        if let Some(tx) = lock(&client.qr_tx).take() {
            let _ = tx.try_send(QrEvent::Success);
        }

        client
            .events
            .send(ClientEvent::PairSuccess {
                id: jid,
                platform: "loopback".to_string(),
                business_name: business_name.to_string(),
            })
            .await
            .is_ok()
    }

    pub async fn emit(&self, event: ClientEvent) -> bool {
        let Some(client) = self.client() else {
            return false;
        };
        client.events.send(event).await.is_ok()
    }

    pub fn register_user(&self, phone: &str, info: UserInfo, picture: Option<ProfilePicture>) {
        lock(&self.network.users).insert(
            phone.trim_start_matches('+').to_string(),
            DirectoryUser { info, picture },
        );
    }

    pub fn add_contact(&self, contact: Contact) {
        lock(&self.network.contacts).push(contact);
    }

    pub fn register_media(&self, direct_path: &str, bytes: Vec<u8>) {
        lock(&self.network.media).insert(direct_path.to_string(), bytes);
    }

    /// Presence event emitted shortly after someone subscribes to `target`.
    pub fn answer_presence(&self, target: Jid, answer: PresenceEvent) {
        lock(&self.network.presence_answers).insert(target, answer);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.network.fail_sends.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        lock(&self.network.sent).clone()
    }

    #[must_use]
    pub fn presence_log(&self) -> Vec<Presence> {
        lock(&self.network.presence_log).clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client().is_some_and(|client| client.is_connected())
    }
}
