use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wa_gateway_transport::wa_pairing::{ClientControlFrame, WS_PONG};

use crate::AppState;
use crate::pairing::{OutboundFrame, PairDecision, SocketSender};

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutboundFrame>();

    let sender_task = tokio::spawn(async move {
        if let Err(error) = write_outgoing_frames(&mut sink, out_rx).await {
            warn!("websocket sender loop ended with error: {error}");
        }
    });

    let socket_id = state.ctx.pairing.attach(out_tx.clone()).await;
    info!(socket_id, "pairing socket attached");

    read_incoming_frames(&state, &out_tx, &mut stream).await;

    state.ctx.pairing.detach(socket_id).await;
    debug!(socket_id, "pairing socket detached");

    drop(out_tx);
    let _ = sender_task.await;
}

async fn write_outgoing_frames(
    sink: &mut SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>,
) -> anyhow::Result<()> {
    while let Some(frame) = out_rx.recv().await {
        match frame {
            OutboundFrame::Text(text) => sink.send(Message::Text(text.into())).await?,
            OutboundFrame::Auth(message) => {
                let serialized = serde_json::to_string(&message)?;
                sink.send(Message::Text(serialized.into())).await?;
            }
            OutboundFrame::Close => {
                sink.send(Message::Close(None)).await?;
                break;
            }
        }
    }

    Ok(())
}

async fn read_incoming_frames(
    state: &AppState,
    out_tx: &SocketSender,
    stream: &mut SplitStream<WebSocket>,
) {
    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(error) => {
                warn!("websocket receive error: {error}");
                break;
            }
        };

        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };

        match ClientControlFrame::parse(text.as_str()) {
            Some(ClientControlFrame::Ping) => {
                let _ = out_tx.send(OutboundFrame::Text(WS_PONG.to_string()));
            }
            Some(ClientControlFrame::RejectPair) => {
                state.ctx.pairing.submit_decision(PairDecision::Reject).await;
            }
            Some(ClientControlFrame::AcceptPair) => {
                state.ctx.pairing.submit_decision(PairDecision::Accept).await;
            }
            None => {
                debug!(len = text.as_str().len(), "ignoring unknown websocket text frame");
            }
        }
    }
}
