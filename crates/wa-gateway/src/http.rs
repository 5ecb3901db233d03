use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, error, info, warn};
use wa_gateway_transport::wa_jid::{Jid, parse_phone};
use wa_gateway_transport::wa_pairing::{AuthMessage, REASON_ALREADY_AUTHORIZED};
use wa_gateway_transport::wa_webhook::validate_webhook_url;

use crate::client::UserInfo;
use crate::crypto::APP_SECRET_HEADER;
use crate::rendezvous::ProbeError;
use crate::supervisor::SupervisorError;
use crate::{AppState, ws};

const BAD_REQUEST_DATA: &str = "Bad request data";
const ERROR_SENDING_MESSAGE: &str = "Error sending message";
const STATUS_REQUEST_TIMED_OUT: &str = "Status request timed out";
const QR_NOT_AVAILABLE: &str = "QR code is not available";
const UNAUTHORIZED: &str = "Unauthorized";

pub fn router(state: AppState) -> Router {
    let guarded = Router::new()
        .route("/startInstance", post(start_instance))
        .route("/stopInstance", get(stop_instance))
        .route("/sendMessage", post(send_message))
        .route("/sendMessages", post(send_messages))
        .route("/getContacts", get(get_contacts))
        .route("/checkWhatsapp", post(check_whatsapp))
        .route("/logoutInstance", get(logout_instance))
        .route("/getProfilePicture", post(get_profile_picture))
        .route("/getStatusAccount", post(get_status_account))
        .route("/setWebhookUrl", post(set_webhook_url))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_app_secret,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws::ws_handler))
        .route("/getQrCode", post(get_qr_code))
        .merge(guarded)
        .with_state(state)
}

/// Phone numbers arrive either as JSON strings or as bare numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PhoneValue {
    Text(String),
    Number(u64),
}

impl PhoneValue {
    fn is_blank(&self) -> bool {
        matches!(self, Self::Text(text) if text.trim().is_empty())
    }

    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(number) => number.to_string(),
        }
    }
}

fn phone_jid(phone: Option<PhoneValue>) -> Result<(String, Jid), ApiError> {
    let raw = phone.map(PhoneValue::into_string).unwrap_or_default();
    let jid = parse_phone(&raw).map_err(|error| {
        debug!(phone = %raw, "rejecting phone: {error}");
        ApiError::bad_request(BAD_REQUEST_DATA)
    })?;
    Ok((raw, jid))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartInstanceRequest {
    #[serde(default)]
    proxy: String,
    #[serde(default)]
    webhook_url: String,
}

#[derive(Debug, Deserialize)]
struct QrCodeRequest {
    #[serde(default)]
    proxy: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    phone: Option<PhoneValue>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    quoted_message_id: Option<String>,
    #[serde(default)]
    is_forwarded: bool,
}

#[derive(Debug, Deserialize)]
struct SendMessagesRequest {
    phones: Vec<PhoneValue>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct PhoneRequest {
    #[serde(default)]
    phone: Option<PhoneValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetWebhookUrlRequest {
    #[serde(default)]
    webhook_url: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct RecipientResult {
    phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessagesResponse {
    results: Vec<RecipientResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContactEntry {
    wid: String,
    push_name: String,
    full_name: String,
}

#[derive(Debug, Serialize)]
struct ContactsResponse {
    contacts: Vec<ContactEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckWhatsappResponse {
    whatsapp_on_phone: bool,
    is_business: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfilePictureResponse {
    url_avatar: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusAccountResponse {
    status_available: String,
    last_visit: u64,
    status_account: String,
    time_status_set: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    reason: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    reason: String,
}

impl ApiError {
    fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            reason: reason.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            reason: UNAUTHORIZED.to_string(),
        }
    }

    fn internal(reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            reason: reason.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                reason: self.reason,
            }),
        )
            .into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!("rejecting request body: {rejection}");
        Self::bad_request(BAD_REQUEST_DATA)
    }
}

impl From<SupervisorError> for ApiError {
    fn from(error: SupervisorError) -> Self {
        match error {
            SupervisorError::Store(_) => Self::internal(error.to_string()),
            SupervisorError::AlreadyConnected
            | SupervisorError::NotAuthorized
            | SupervisorError::Proxy(_)
            | SupervisorError::Client(_) => Self::bad_request(error.to_string()),
        }
    }
}

/// JSON body whose rejection renders as `400 {"reason":"Bad request data"}`.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

async fn require_app_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(guard) = &state.ctx.secret {
        let provided = request
            .headers()
            .get(APP_SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !guard.verify(provided) {
            warn!(path = %request.uri().path(), "rejecting request with missing or wrong secret");
            return Err(ApiError::unauthorized());
        }
    }

    Ok(next.run(request).await)
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn start_instance(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<StartInstanceRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let webhook = if payload.webhook_url.trim().is_empty() {
        None
    } else {
        Some(
            validate_webhook_url(&payload.webhook_url)
                .map_err(|error| ApiError::bad_request(error.to_string()))?,
        )
    };

    state.supervisor.start(&payload.proxy, false).await?;

    if let Some(webhook) = webhook {
        info!(%webhook, "webhook url set");
        state.ctx.webhooks.set_target(Some(webhook)).await;
    }

    Ok(Json(SuccessResponse { success: true }))
}

async fn stop_instance(State(state): State<AppState>) -> Json<SuccessResponse> {
    state.supervisor.stop().await;
    Json(SuccessResponse { success: true })
}

async fn get_qr_code(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<QrCodeRequest>,
) -> Result<Json<AuthMessage>, ApiError> {
    if state.supervisor.is_connected_and_authenticated().await {
        return Ok(Json(AuthMessage::error(REASON_ALREADY_AUTHORIZED)));
    }

    match state.supervisor.start(&payload.proxy, false).await {
        Ok(_) | Err(SupervisorError::AlreadyConnected) => {}
        Err(error) => return Err(error.into()),
    }

    let interval = Duration::from_millis(state.ctx.config.qr_poll_interval_ms);
    let deadline = Instant::now() + Duration::from_millis(state.ctx.config.qr_poll_timeout_ms);
    loop {
        if let Some(message) = state.ctx.pairing.take_auth_message().await {
            return Ok(Json(message));
        }
        if Instant::now() >= deadline {
            return Err(ApiError::bad_request(QR_NOT_AVAILABLE));
        }
        sleep(interval).await;
    }
}

async fn send_message(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    debug!(
        request_id = ?payload.id,
        chat_id = %payload.chat_id,
        quoted = ?payload.quoted_message_id,
        forwarded = payload.is_forwarded,
        "send message request"
    );

    let phone = payload.phone.filter(|phone| !phone.is_blank()).or_else(|| {
        let chat_user = payload.chat_id.split('@').next().unwrap_or_default();
        (!chat_user.is_empty()).then(|| PhoneValue::Text(chat_user.to_string()))
    });
    let (_, jid) = phone_jid(phone)?;

    let id = state
        .supervisor
        .send_text(&jid, &payload.message)
        .await
        .map_err(|error| match error {
            SupervisorError::Client(_) => ApiError::internal(ERROR_SENDING_MESSAGE),
            other => other.into(),
        })?;

    Ok(Json(SendMessageResponse { id }))
}

async fn send_messages(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<SendMessagesRequest>,
) -> Result<Json<SendMessagesResponse>, ApiError> {
    if payload.phones.is_empty() {
        return Err(ApiError::bad_request(BAD_REQUEST_DATA));
    }
    state.supervisor.authorized_client().await?;

    let mut results = Vec::with_capacity(payload.phones.len());
    let mut recipients = Vec::new();
    for phone in payload.phones {
        match phone_jid(Some(phone.clone())) {
            Ok(recipient) => recipients.push(recipient),
            Err(error) => results.push(RecipientResult {
                phone: phone.into_string(),
                id: None,
                reason: Some(error.reason),
            }),
        }
    }

    for handle in state.supervisor.fan_out(recipients, &payload.message) {
        match handle.await {
            Ok(report) => results.push(match report.outcome {
                Ok(id) => RecipientResult {
                    phone: report.phone,
                    id: Some(id),
                    reason: None,
                },
                Err(reason) => RecipientResult {
                    phone: report.phone,
                    id: None,
                    reason: Some(reason),
                },
            }),
            Err(join_error) => error!("send task failed: {join_error}"),
        }
    }

    Ok(Json(SendMessagesResponse { results }))
}

async fn get_contacts(State(state): State<AppState>) -> Result<Json<ContactsResponse>, ApiError> {
    let client = state.supervisor.authorized_client().await?;
    let contacts = client
        .contacts()
        .await
        .map_err(|error| ApiError::bad_request(error.to_string()))?;

    Ok(Json(ContactsResponse {
        contacts: contacts
            .into_iter()
            .map(|contact| ContactEntry {
                wid: contact.jid.legacy_chat_id(),
                push_name: contact.push_name,
                full_name: contact.full_name,
            })
            .collect(),
    }))
}

async fn check_whatsapp(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<PhoneRequest>,
) -> Result<Json<CheckWhatsappResponse>, ApiError> {
    let (_, jid) = phone_jid(payload.phone)?;
    let client = state.supervisor.authorized_client().await?;

    let results = client
        .is_on_whatsapp(&[format!("+{}", jid.user)])
        .await
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    let found = results.into_iter().next();

    Ok(Json(CheckWhatsappResponse {
        whatsapp_on_phone: found.as_ref().is_some_and(|result| result.is_in),
        is_business: found.is_some_and(|result| result.verified_business_name.is_some()),
    }))
}

async fn logout_instance(State(state): State<AppState>) -> Result<Json<SuccessResponse>, ApiError> {
    state.supervisor.logout().await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn get_profile_picture(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<PhoneRequest>,
) -> Result<Json<ProfilePictureResponse>, ApiError> {
    let (_, jid) = phone_jid(payload.phone)?;
    let client = state.supervisor.authorized_client().await?;

    let picture = client
        .profile_picture(&jid)
        .await
        .map_err(|error| ApiError::bad_request(error.to_string()))?;

    Ok(Json(ProfilePictureResponse {
        url_avatar: picture.map(|picture| picture.url).unwrap_or_default(),
    }))
}

async fn get_status_account(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<PhoneRequest>,
) -> Result<Json<StatusAccountResponse>, ApiError> {
    let (_, jid) = phone_jid(payload.phone)?;
    let client = state.supervisor.authorized_client().await?;

    let (settle, timeout) = state.ctx.presence_status_timings();
    let status = state
        .ctx
        .rendezvous
        .probe(client.as_ref(), &jid, settle, timeout)
        .await
        .map_err(|error| match error {
            ProbeError::Timeout => ApiError::bad_request(STATUS_REQUEST_TIMED_OUT),
            other => ApiError::bad_request(other.to_string()),
        })?;

    let info = match client.user_info(std::slice::from_ref(&jid)).await {
        Ok(mut infos) => infos.remove(&jid).unwrap_or_default(),
        Err(error) => {
            debug!(%jid, "user info lookup failed: {error}");
            UserInfo::default()
        }
    };

    Ok(Json(StatusAccountResponse {
        status_available: if status.online { "online" } else { "offline" }.to_string(),
        last_visit: status
            .last_seen
            .and_then(|seen| u64::try_from(seen).ok())
            .unwrap_or_default(),
        status_account: info.status,
        time_status_set: info.status_set_at,
    }))
}

async fn set_webhook_url(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<SetWebhookUrlRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    if payload.webhook_url.trim().is_empty() {
        info!("webhook url cleared");
        state.ctx.webhooks.set_target(None).await;
        return Ok(Json(SuccessResponse { success: true }));
    }

    let webhook = validate_webhook_url(&payload.webhook_url)
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    info!(%webhook, "webhook url set");
    state.ctx.webhooks.set_target(Some(webhook)).await;

    Ok(Json(SuccessResponse { success: true }))
}
