//! The HTTP/WebSocket surface: health, the operator escrow-capture
//! endpoint, and the two per-user sockets (binary audio, JSON panels).

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::audio::AudioFramer;
use crate::domain::ids::{RoomId, UserId};
use crate::domain::money::Amount;
use crate::panel::{ClientPanelMessage, PanelEmitter, PanelFrame, ServerPanelMessage};
use crate::payment::PaymentExecutor;
use crate::profile::ProfileStore;
use crate::room::{RoomDirectory, RoomEvent, RoomHandle};

/// WebSocket close codes on the two socket endpoints.
pub const CLOSE_BAD_PARAMS: u16 = 4000;
pub const CLOSE_UNKNOWN_PATH: u16 = 4001;
pub const CLOSE_REPLACED: u16 = 4002;
pub const CLOSE_NOT_IN_ROOM: u16 = 4004;

#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<RoomDirectory>,
    pub profiles: Arc<ProfileStore>,
    pub panels: Arc<PanelEmitter>,
    pub payments: Arc<PaymentExecutor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/release-escrow", post(release_escrow))
        .route("/ws/audio", any(ws_audio))
        .route("/ws/panels", any(ws_panels))
        .route("/ws/{*rest}", any(ws_unknown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, router(state)).await
}

// ================================================================================================
// HTTP
// ================================================================================================

async fn health() -> impl IntoResponse {
    axum::Json(json!({"status": "ok"}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseEscrowBody {
    payment_intent_id: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
}

async fn release_escrow(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<ReleaseEscrowBody>,
) -> Response {
    let Some(intent_id) = body.payment_intent_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"error": "paymentIntentId is required"})),
        )
            .into_response();
    };

    match state
        .payments
        .capture_by_intent(&intent_id, body.amount.map(Amount))
        .await
    {
        Ok(captured) => {
            axum::Json(json!({"success": true, "capturedAmount": captured})).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

// ================================================================================================
// WebSocket plumbing
// ================================================================================================

fn parse_ws_params(params: &HashMap<String, String>) -> Option<(RoomId, UserId)> {
    let room = RoomId::parse(params.get("room")?).ok()?;
    let user = UserId::parse(params.get("user")?).ok()?;
    Some((room, user))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn ws_unknown(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| close_with(socket, CLOSE_UNKNOWN_PATH, "unknown path"))
}

// ================================================================================================
// Audio socket
// ================================================================================================

async fn ws_audio(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let Some((room_id, user)) = parse_ws_params(&params) else {
            close_with(socket, CLOSE_BAD_PARAMS, "bad params").await;
            return;
        };

        // The panel socket joins rooms; audio attaches to an existing
        // membership only.
        let Some(room) = state.directory.get(&room_id) else {
            close_with(socket, CLOSE_NOT_IN_ROOM, "not in room").await;
            return;
        };
        let attachment = match room.attach_audio(user.clone()).await {
            Ok(attachment) => attachment,
            Err(err) => {
                debug!(%user, %err, "audio attach refused");
                close_with(socket, CLOSE_NOT_IN_ROOM, "not in room").await;
                return;
            }
        };

        run_audio_socket(socket, room, user, attachment).await;
    })
}

async fn run_audio_socket(
    socket: WebSocket,
    room: RoomHandle,
    user: UserId,
    attachment: crate::room::event::AudioAttachment,
) {
    let (mut sink, mut stream) = socket.split();
    let crate::room::event::AudioAttachment {
        stt_tx,
        mut speaker_rx,
        relay,
    } = attachment;

    // Writer: the peer's microphone to this user's speakers.
    let writer = tokio::spawn(async move {
        while let Some(frame) = speaker_rx.recv().await {
            if sink.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    // Reader: this user's microphone to the peer and the recognizer.
    let mut framer = AudioFramer::new();
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Binary(frame) => {
                let frame = Bytes::from(frame);
                relay.forward(&user, frame.clone());
                for chunk in framer.push(&frame) {
                    // A stalled recognizer sheds chunks; the framer's own
                    // bound caps what we ever queue.
                    let _ = stt_tx.try_send(chunk);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(tail) = framer.flush() {
        let _ = stt_tx.try_send(tail);
    }
    room.post(RoomEvent::DetachAudio { user: user.clone() });
    writer.abort();
    debug!(%user, "audio socket closed");
}

// ================================================================================================
// Panel socket
// ================================================================================================

async fn ws_panels(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let Some((room_id, user)) = parse_ws_params(&params) else {
            close_with(socket, CLOSE_BAD_PARAMS, "bad params").await;
            return;
        };
        run_panel_socket(socket, state, room_id, user).await;
    })
}

async fn run_panel_socket(socket: WebSocket, state: AppState, room_id: RoomId, user: UserId) {
    let (mut sink, mut stream) = socket.split();

    let frames = state.panels.register(user.clone());
    let registered_tx = state
        .panels
        .sender_of(&user)
        .expect("sink registered just above");

    // Writer: serialized panel frames to the socket.
    let writer = tokio::spawn(async move {
        let mut frames = frames;
        while let Some(frame) = frames.recv().await {
            match frame {
                PanelFrame::Message(message) => {
                    let Ok(text) = serde_json::to_string(&*message) else {
                        continue;
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                PanelFrame::Close { reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_REPLACED,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Reader: client messages, dispatched pre-join here and post-join to
    // the room supervisor.
    let mut joined: Option<RoomHandle> = None;
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let parsed: Result<ClientPanelMessage, _> = serde_json::from_str(text.as_str());
        let message = match parsed {
            Ok(message) => message,
            Err(err) => {
                debug!(%user, %err, "malformed panel message ignored");
                state.panels.send(
                    &user,
                    ServerPanelMessage::Error {
                        message: "Unknown or malformed message.".to_string(),
                    },
                );
                continue;
            }
        };

        match message {
            ClientPanelMessage::SetProfile { profile } => {
                match serde_json::from_value::<crate::domain::profile::UserProfile>(profile) {
                    Ok(mut profile) => {
                        // The connection's identity wins over whatever the
                        // payload claims.
                        profile.user_id = user.clone();
                        state.profiles.set(profile);
                    }
                    Err(err) => {
                        state.panels.send(
                            &user,
                            ServerPanelMessage::Error {
                                message: format!("Invalid profile: {err}"),
                            },
                        );
                    }
                }
            }
            ClientPanelMessage::JoinRoom { room_id: requested } => {
                // The socket's room parameter is the only room this panel
                // may join.
                if requested != room_id.as_str() {
                    state.panels.send(
                        &user,
                        ServerPanelMessage::Error {
                            message: "roomId does not match this connection.".to_string(),
                        },
                    );
                    continue;
                }
                let handle = state.directory.get_or_create(&room_id);
                let profile = state.profiles.get_or_default(&user);
                match handle.join(user.clone(), profile).await {
                    Ok(()) => joined = Some(handle),
                    Err(err) => {
                        warn!(%user, room = %room_id, %err, "join refused");
                        state.panels.send(
                            &user,
                            ServerPanelMessage::Error {
                                message: err.to_string(),
                            },
                        );
                    }
                }
            }
            other => match &joined {
                Some(room) => room.post(RoomEvent::Panel {
                    user: user.clone(),
                    message: other,
                }),
                None => state.panels.send(
                    &user,
                    ServerPanelMessage::Error {
                        message: "Join a room first.".to_string(),
                    },
                ),
            },
        }
    }

    // Symmetric teardown: leaving the panel leaves the room.
    if let Some(room) = joined {
        room.post(RoomEvent::Leave { user: user.clone() });
    }
    state.panels.unregister(&user, &registered_tx);
    writer.abort();
    debug!(%user, "panel socket closed");
}
