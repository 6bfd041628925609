use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hub_common::core::ServerFrame;
use hub_common::ingestors::DEFAULT_GROUP;
use hub_common::DeviceError;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::controlhub_logic::model::{ClientMessage, ErrorResponse, HealthResponse, SignalingRequest};
use crate::controlhub_logic::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/state", get(state_handler))
        .route("/control/{device_id}", post(control_handler))
        .route("/ws/state", get(state_ws_handler))
        .route("/ws/signaling", get(signaling_ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Serves until the shared shutdown token fires.
pub async fn run(port: u16, state: AppState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Downstream server listening");
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        time_utc: Utc::now(),
    })
}

async fn state_handler(State(state): State<AppState>) -> Response {
    match state.aggregator.snapshot().projection() {
        Ok(value) => Json(value).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn control_handler(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
    payload: String,
) -> Response {
    // Non UTF-8 bodies are refused by the extractor with 400 and never reach the device.
    match state.source.write_state(&device_id, &payload).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e @ DeviceError::WriteRejected { .. }) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e) => {
            tracing::warn!(device_id = %device_id, error = %e, "Control command failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

async fn state_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_state_socket(socket, state))
}

async fn signaling_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_signaling_socket(socket, state))
}

fn frame_message(frame: &ServerFrame) -> Option<Message> {
    match frame.to_text() {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!(event = %frame.event, error = %e, "Failed to serialize frame");
            None
        }
    }
}

/// # State Subscriber Session
///
/// Joins the default group, then forwards group frames to the socket and
/// applies `join`/`leave` requests until either side goes away.
async fn handle_state_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    let mut rx = state.dispatcher.add_client(&client_id);
    state.dispatcher.join_group(&client_id, DEFAULT_GROUP);
    tracing::info!(connection_id = %client_id, "State subscriber connected");

    let (mut sink, mut stream) = socket.split();

    // Late joiners get the current state right away.
    if let Ok(value) = state.aggregator.snapshot().projection() {
        let frame = ServerFrame {
            event: hub_common::ingestors::STATE_EVENT.to_string(),
            payload: value,
        };
        if let Some(msg) = frame_message(&frame) {
            if sink.send(msg).await.is_err() {
                state.dispatcher.remove_client(&client_id);
                return;
            }
        }
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(msg) => {
                            if let Some(group) = msg.join {
                                state.dispatcher.join_group(&client_id, &group);
                            }
                            if let Some(group) = msg.leave {
                                state.dispatcher.leave_group(&client_id, &group);
                            }
                        }
                        Err(e) => tracing::debug!(connection_id = %client_id, error = %e, "Ignoring malformed state message"),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Some(msg) = frame_message(&frame) {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                None => break,
            },
        }
    }

    state.dispatcher.remove_client(&client_id);
    tracing::info!(connection_id = %client_id, "State subscriber disconnected");
}

/// # Signaling Session
///
/// Maps inbound calls onto the room registry and forwards pushes addressed
/// to this connection. Closing the socket runs the disconnect cleanup.
async fn handle_signaling_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    let mut rx = state.dispatcher.add_client(&client_id);
    tracing::info!(connection_id = %client_id, "Signaling peer connected");

    let (mut sink, mut stream) = socket.split();
    let rooms = Arc::clone(&state.rooms);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<SignalingRequest>(text.as_str()) {
                        Ok(request) => dispatch_signaling(&rooms, &client_id, request),
                        Err(e) => tracing::debug!(connection_id = %client_id, error = %e, "Ignoring malformed signaling message"),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Some(msg) = frame_message(&frame) {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                None => break,
            },
        }
    }

    rooms.on_disconnected(&client_id);
    state.dispatcher.remove_client(&client_id);
    tracing::info!(connection_id = %client_id, "Signaling peer disconnected");
}

fn dispatch_signaling(rooms: &hub_common::SignalingRoomRegistry, caller: &str, request: SignalingRequest) {
    match request {
        SignalingRequest::JoinViewers { room_id } => rooms.join_viewers(&room_id, caller),
        SignalingRequest::LeaveViewers => rooms.leave_viewers(caller),
        SignalingRequest::RegisterBroadcaster { room_id } => rooms.register_broadcaster(&room_id, caller),
        SignalingRequest::Relay {
            room_id,
            kind,
            payload,
            target_id,
        } => {
            let delivered = rooms.relay(&room_id, caller, kind, &payload, target_id.as_deref());
            tracing::trace!(room_id = %room_id, kind = %kind, delivered, "Relayed signal");
        }
        SignalingRequest::CheckBroadcaster { room_id } => rooms.check_broadcaster(&room_id, caller),
    }
}
