use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use wa_gateway::client::UserInfo;
use wa_gateway::client::loopback::{LoopbackControl, LoopbackFactory};
use wa_gateway::config::GatewayConfig;
use wa_gateway::context::GatewayContext;
use wa_gateway::events::PresenceEvent;
use wa_gateway::store::SqliteStore;
use wa_gateway::supervisor::InstanceSupervisor;
use wa_gateway::webhook::{DeliveryOutcome, DeliveryReport, WebhookDispatcher};
use wa_gateway::{AppState, http};
use wa_gateway_transport::wa_jid::Jid;
use wa_gateway_transport::wa_pairing::{AuthMessage, REASON_ALREADY_AUTHORIZED};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const PROXY: &str = "127.0.0.1:1080:user:pass";
const OWN_PHONE: &str = "15555550100";
const PEER_PHONE: &str = "15555550123";

struct TestGateway {
    base_url: String,
    ws_url: String,
    ctx: Arc<GatewayContext>,
    control: LoopbackControl,
    reports: mpsc::UnboundedReceiver<DeliveryReport>,
    http: Client,
    _server: JoinHandle<()>,
}

fn test_config(root: &std::path::Path, addr: std::net::SocketAddr) -> GatewayConfig {
    GatewayConfig {
        bind_addr: addr,
        database_path: root.join("gateway.sqlite3"),
        media_dir: root.join("media"),
        app_secret: None,
        webhook_url: None,
        instance_id: 7,
        restore_proxy: None,
        pair_decision_timeout_ms: 200,
        presence_settle_ms: 10,
        status_probe_timeout_ms: 300,
        qr_poll_interval_ms: 20,
        qr_poll_timeout_ms: 300,
        event_queue_capacity: 64,
        keepalive_reconnect_threshold: 3,
        webhook_timeout_ms: 2_000,
        tls_cert_path: None,
        tls_key_path: None,
    }
}

async fn spawn_gateway(app_secret: Option<&str>) -> TestGateway {
    let dir = tempdir().expect("tempdir");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");

    let mut config = test_config(dir.path(), addr);
    config.app_secret = app_secret.map(str::to_string);
    config.validate().expect("config validate");

    let (reports_tx, reports) = mpsc::unbounded_channel();
    let webhooks = WebhookDispatcher::new(config.instance_id, None, Duration::from_secs(2))
        .expect("dispatcher")
        .with_observer(reports_tx);
    let store = Arc::new(SqliteStore::new(&config.database_path).expect("store"));
    let ctx = Arc::new(GatewayContext::with_dispatcher(config, store, webhooks));

    let factory = LoopbackFactory::new();
    let control = factory.control();
    let supervisor = Arc::new(InstanceSupervisor::new(Arc::clone(&ctx), Arc::new(factory)));
    let app = http::router(AppState::new(Arc::clone(&ctx), supervisor));

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    // Keep tempdir alive for the lifetime of the test process.
    std::mem::forget(dir);

    TestGateway {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        ctx,
        control,
        reports,
        http: Client::new(),
        _server: server,
    }
}

impl TestGateway {
    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .expect("post");
        let status = response.status();
        (status, response.json().await.expect("json body"))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .expect("get");
        let status = response.status();
        (status, response.json().await.expect("json body"))
    }

    /// Starts the instance and lets the phone scan without a human decision.
    async fn pair(&self) {
        let (status, body) = self.post("/startInstance", json!({ "proxy": PROXY })).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(
            self.control
                .complete_pairing(Jid::user(OWN_PHONE), "Tester", "")
                .await,
            "pairing should be accepted after the decision window"
        );
    }

    async fn next_report(&mut self) -> DeliveryReport {
        tokio::time::timeout(Duration::from_secs(2), self.reports.recv())
            .await
            .expect("report timeout")
            .expect("report channel open")
    }

    async fn wait_for_decision(&self) {
        for _ in 0..100 {
            if self.ctx.pairing.awaiting_decision().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pairing never asked for a decision");
    }

    async fn wait_for_socket(&self) {
        for _ in 0..100 {
            if self.ctx.pairing.has_socket().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pairing socket never attached");
    }
}

async fn read_text(ws: &mut WsStream) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("ws read timeout")
            .expect("websocket closed unexpectedly")
            .expect("ws read");
        if let Message::Text(text) = message {
            return text.to_string();
        }
    }
}

async fn read_auth(ws: &mut WsStream) -> AuthMessage {
    serde_json::from_str(&read_text(ws).await).expect("auth frame")
}

async fn spawn_webhook_receiver() -> (String, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/hook",
        post(move |Json(body): Json<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body);
                "ok"
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind webhook listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve webhook receiver");
    });

    (format!("http://{addr}/hook"), rx)
}

#[tokio::test]
async fn healthz_and_websocket_ping() {
    let gateway = spawn_gateway(None).await;

    let (status, body) = gateway.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));

    let (mut ws, _) = connect_async(gateway.ws_url.as_str())
        .await
        .expect("ws connect");
    ws.send(Message::Text("__ping__".into())).await.expect("ping");
    assert_eq!(read_text(&mut ws).await, "__pong__");

    ws.send(Message::Text("hello".into())).await.expect("noise");
    ws.send(Message::Text("__ping__".into())).await.expect("ping");
    assert_eq!(read_text(&mut ws).await, "__pong__");
}

#[tokio::test]
async fn qr_code_reaches_socket_and_pairing_finishes_with_account() {
    let gateway = spawn_gateway(None).await;
    let (mut ws, _) = connect_async(gateway.ws_url.as_str())
        .await
        .expect("ws connect");
    gateway.wait_for_socket().await;

    let (status, _) = gateway.post("/startInstance", json!({ "proxy": PROXY })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        gateway.control.current_proxy().expect("proxy").endpoint(),
        "127.0.0.1:1080"
    );

    assert!(gateway.control.push_qr("ABC").await);
    match read_auth(&mut ws).await {
        AuthMessage::Qr { image_qr_code } => {
            assert!(image_qr_code.starts_with("data:image/png;base64,"));
        }
        other => panic!("expected qr frame, got {other:?}"),
    }

    let pairing = {
        let control = gateway.control.clone();
        tokio::spawn(async move {
            control
                .complete_pairing(Jid::user(OWN_PHONE), "Tester", "")
                .await
        })
    };
    gateway.wait_for_decision().await;
    ws.send(Message::Text("__accept__".into()))
        .await
        .expect("accept");
    assert!(pairing.await.expect("join"));

    assert_eq!(
        read_auth(&mut ws).await,
        AuthMessage::Account {
            wid: format!("{OWN_PHONE}@c.us")
        }
    );

    // Reused sessions must be treated as already paired.
    let (status, body) = gateway.post("/getQrCode", json!({ "proxy": PROXY })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_value::<AuthMessage>(body).expect("auth body"),
        AuthMessage::error(REASON_ALREADY_AUTHORIZED)
    );
}

#[tokio::test]
async fn rejected_pairing_leaves_instance_unauthorized() {
    let gateway = spawn_gateway(None).await;
    let (mut ws, _) = connect_async(gateway.ws_url.as_str())
        .await
        .expect("ws connect");
    gateway.wait_for_socket().await;

    let (status, _) = gateway.post("/startInstance", json!({ "proxy": PROXY })).await;
    assert_eq!(status, StatusCode::OK);

    let pairing = {
        let control = gateway.control.clone();
        tokio::spawn(async move {
            control
                .complete_pairing(Jid::user(OWN_PHONE), "Tester", "")
                .await
        })
    };
    gateway.wait_for_decision().await;
    ws.send(Message::Text("__reject__".into()))
        .await
        .expect("reject");
    assert!(!pairing.await.expect("join"));

    let (status, body) = gateway
        .post(
            "/sendMessage",
            json!({ "phone": PEER_PHONE, "message": "hi" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "Instance not connected or not authorized");
    assert!(gateway.control.sent_messages().is_empty());
}

#[tokio::test]
async fn get_qr_code_polls_until_a_code_is_rendered() {
    let gateway = spawn_gateway(None).await;

    let poll = {
        let http = gateway.http.clone();
        let url = format!("{}/getQrCode", gateway.base_url);
        tokio::spawn(async move {
            let response = http
                .post(url)
                .json(&json!({ "proxy": PROXY }))
                .send()
                .await
                .expect("post");
            (response.status(), response.json::<Value>().await.expect("json"))
        })
    };

    for _ in 0..100 {
        if gateway.control.push_qr("XYZ").await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (status, body) = poll.await.expect("join");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "qr");
    assert!(
        body["imageQrCode"]
            .as_str()
            .is_some_and(|image| image.starts_with("data:image/png;base64,"))
    );
}

#[tokio::test]
async fn get_qr_code_times_out_without_a_code() {
    let gateway = spawn_gateway(None).await;

    let (status, body) = gateway.post("/getQrCode", json!({ "proxy": PROXY })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "QR code is not available");
}

#[tokio::test]
async fn second_start_is_rejected_and_builds_one_client() {
    let gateway = spawn_gateway(None).await;

    let (status, _) = gateway.post("/startInstance", json!({ "proxy": PROXY })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = gateway.post("/startInstance", json!({ "proxy": PROXY })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "Instance already connected");
    assert_eq!(gateway.control.build_count(), 1);
}

#[tokio::test]
async fn malformed_proxy_is_rejected() {
    let gateway = spawn_gateway(None).await;

    let (status, body) = gateway
        .post("/startInstance", json!({ "proxy": "127.0.0.1:1080" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "bad proxy data");
    assert_eq!(gateway.control.build_count(), 0);
}

#[tokio::test]
async fn send_message_returns_id_and_reports_sent_status() {
    let mut gateway = spawn_gateway(None).await;
    gateway.pair().await;

    let (status, body) = gateway
        .post(
            "/sendMessage",
            json!({ "phone": PEER_PHONE.parse::<u64>().expect("digits"), "message": "hello" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let id = body["id"].as_str().expect("id").to_string();
    assert!(id.starts_with("3EB0"));

    let sent = gateway.control.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, Jid::user(PEER_PHONE));
    assert_eq!(sent[0].text, "hello");

    let report = loop {
        let report = gateway.next_report().await;
        if report.type_webhook == "statusMessage" {
            break report;
        }
    };
    let envelope = serde_json::to_value(&report.envelope).expect("envelope json");
    assert_eq!(envelope["statusMessage"]["idMessage"], id.as_str());
    assert_eq!(envelope["statusMessage"]["status"], "sent");
    assert_eq!(envelope["instanceWhatsapp"]["wid"], format!("{OWN_PHONE}@c.us"));
    assert_eq!(report.outcome, DeliveryOutcome::Skipped);

    let stored = gateway
        .ctx
        .store
        .get_message(&id)
        .expect("load")
        .expect("stored message");
    assert_eq!(stored.chat_id, format!("{PEER_PHONE}@s.whatsapp.net"));
}

#[tokio::test]
async fn send_message_falls_back_to_chat_id() {
    let gateway = spawn_gateway(None).await;
    gateway.pair().await;

    let (status, _) = gateway
        .post(
            "/sendMessage",
            json!({ "chatId": format!("{PEER_PHONE}@c.us"), "phone": "", "message": "via chat" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gateway.control.sent_messages()[0].to, Jid::user(PEER_PHONE));
}

#[tokio::test]
async fn empty_phone_is_bad_request_without_webhook() {
    let mut gateway = spawn_gateway(None).await;
    gateway.pair().await;

    let (status, body) = gateway
        .post("/sendMessage", json!({ "phone": "", "message": "hi" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "Bad request data");

    let (status, body) = gateway
        .post(
            "/sendMessage",
            json!({ "phone": "@s.whatsapp.net", "message": "hi" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "Bad request data");

    let (status, body) = gateway.post("/sendMessage", json!({ "phone": [1] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "Bad request data");

    assert!(gateway.control.sent_messages().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(report) = gateway.reports.try_recv() {
        assert_ne!(report.type_webhook, "statusMessage");
    }
}

#[tokio::test]
async fn failed_send_is_server_error() {
    let gateway = spawn_gateway(None).await;
    gateway.pair().await;
    gateway.control.fail_sends(true);

    let (status, body) = gateway
        .post("/sendMessage", json!({ "phone": PEER_PHONE, "message": "hi" }))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["reason"], "Error sending message");
}

#[tokio::test]
async fn send_messages_reports_each_recipient() {
    let gateway = spawn_gateway(None).await;
    gateway.pair().await;

    let (status, body) = gateway
        .post(
            "/sendMessages",
            json!({ "phones": [PEER_PHONE, "", 15_555_550_124_u64], "message": "broadcast" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let results = body["results"].as_array().expect("results");
    assert_eq!(results.len(), 3);
    let sent: Vec<_> = results.iter().filter(|result| result.get("id").is_some()).collect();
    assert_eq!(sent.len(), 2);
    let rejected: Vec<_> = results
        .iter()
        .filter(|result| result.get("reason").is_some())
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["phone"], "");
    assert_eq!(gateway.control.sent_messages().len(), 2);

    let (status, _) = gateway
        .post("/sendMessages", json!({ "phones": [], "message": "x" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn secret_guard_rejects_missing_or_wrong_header() {
    let gateway = spawn_gateway(Some("s3cret")).await;

    let (status, body) = gateway.post("/startInstance", json!({ "proxy": PROXY })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["reason"], "Unauthorized");

    let response = gateway
        .http
        .post(format!("{}/startInstance", gateway.base_url))
        .header("x-app-secret", "wrong")
        .json(&json!({ "proxy": PROXY }))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(gateway.control.build_count(), 0);

    let response = gateway
        .http
        .post(format!("{}/startInstance", gateway.base_url))
        .header("x-app-secret", "s3cret")
        .json(&json!({ "proxy": PROXY }))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(gateway.control.build_count(), 1);

    let (status, _) = gateway.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn status_account_reports_last_seen_and_about() {
    let gateway = spawn_gateway(None).await;
    gateway.pair().await;

    gateway.control.answer_presence(
        Jid::user(PEER_PHONE),
        PresenceEvent {
            from: Jid::user(PEER_PHONE),
            unavailable: true,
            last_seen: Some(1_700_000_000),
        },
    );
    gateway.control.register_user(
        PEER_PHONE,
        UserInfo {
            status: "Busy".to_string(),
            status_set_at: 1_690_000_000,
            ..UserInfo::default()
        },
        None,
    );

    let (status, body) = gateway
        .post("/getStatusAccount", json!({ "phone": PEER_PHONE }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(
        body,
        json!({
            "statusAvailable": "offline",
            "lastVisit": 1_700_000_000_u64,
            "statusAccount": "Busy",
            "timeStatusSet": 1_690_000_000_u64,
        })
    );
    assert_eq!(gateway.ctx.rendezvous.pending(), 0);
}

#[tokio::test]
async fn status_account_times_out_without_presence() {
    let gateway = spawn_gateway(None).await;
    gateway.pair().await;

    let (status, body) = gateway
        .post("/getStatusAccount", json!({ "phone": PEER_PHONE }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "Status request timed out");
    assert_eq!(gateway.ctx.rendezvous.pending(), 0);
}

#[tokio::test]
async fn directory_lookups_use_the_session() {
    let gateway = spawn_gateway(None).await;

    let (status, _) = gateway.get("/getContacts").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    gateway.pair().await;
    gateway.control.register_user(
        PEER_PHONE,
        UserInfo {
            verified_business_name: Some("Acme".to_string()),
            ..UserInfo::default()
        },
        Some(wa_gateway::client::ProfilePicture {
            id: "1".to_string(),
            url: "https://pps.example/avatar.jpg".to_string(),
        }),
    );
    gateway.control.add_contact(wa_gateway::client::Contact {
        jid: Jid::user(PEER_PHONE),
        push_name: "Peer".to_string(),
        full_name: "Peer Person".to_string(),
    });

    let (status, body) = gateway
        .post("/checkWhatsapp", json!({ "phone": PEER_PHONE }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "whatsappOnPhone": true, "isBusiness": true }));

    let (_, body) = gateway
        .post("/checkWhatsapp", json!({ "phone": "15555550999" }))
        .await;
    assert_eq!(body, json!({ "whatsappOnPhone": false, "isBusiness": false }));

    let (_, body) = gateway
        .post("/getProfilePicture", json!({ "phone": PEER_PHONE }))
        .await;
    assert_eq!(body["urlAvatar"], "https://pps.example/avatar.jpg");

    let (_, body) = gateway.get("/getContacts").await;
    assert_eq!(
        body["contacts"],
        json!([{ "wid": format!("{PEER_PHONE}@c.us"), "pushName": "Peer", "fullName": "Peer Person" }])
    );
}

#[tokio::test]
async fn logout_forgets_device() {
    let gateway = spawn_gateway(None).await;
    gateway.pair().await;

    for _ in 0..100 {
        if gateway.ctx.store.load_device().expect("load").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(gateway.ctx.store.load_device().expect("load").is_some());

    let (status, body) = gateway.get("/logoutInstance").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));
    assert!(gateway.ctx.store.load_device().expect("load").is_none());

    let (status, _) = gateway.get("/logoutInstance").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_url_from_start_receives_sent_status() {
    let gateway = spawn_gateway(None).await;
    let (hook_url, mut hooks) = spawn_webhook_receiver().await;

    let (status, _) = gateway
        .post(
            "/startInstance",
            json!({ "proxy": PROXY, "webhookUrl": "ftp://example.com/hook" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(gateway.control.build_count(), 0);

    let (status, _) = gateway
        .post(
            "/startInstance",
            json!({ "proxy": PROXY, "webhookUrl": hook_url }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        gateway
            .control
            .complete_pairing(Jid::user(OWN_PHONE), "Tester", "")
            .await
    );

    let (_, body) = gateway
        .post("/sendMessage", json!({ "phone": PEER_PHONE, "message": "hooked" }))
        .await;
    let id = body["id"].as_str().expect("id").to_string();

    let delivered = tokio::time::timeout(Duration::from_secs(2), hooks.recv())
        .await
        .expect("webhook timeout")
        .expect("webhook body");
    assert_eq!(delivered["type"], "statusMessage");
    assert_eq!(delivered["statusMessage"]["idMessage"], id.as_str());
    assert_eq!(delivered["instanceWhatsapp"]["idInstance"], 7);

    let (status, _) = gateway
        .post("/setWebhookUrl", json!({ "webhookUrl": "" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(gateway.ctx.webhooks.target().await.is_none());
}

#[tokio::test]
async fn stop_allows_a_fresh_start() {
    let gateway = spawn_gateway(None).await;

    let (status, _) = gateway.post("/startInstance", json!({ "proxy": PROXY })).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = gateway.get("/stopInstance").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));
    assert!(!gateway.control.is_connected());

    let (status, _) = gateway.post("/startInstance", json!({ "proxy": PROXY })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gateway.control.build_count(), 2);
}
