//! Client-facing surface: the WebSocket relay endpoint plus the small HTTP
//! query/admin API, served by one axum router.

use super::model::{ClientEvent, ServerEvent};
use super::relay::RelayError;
use super::state::AppState;
use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use futures_util::StreamExt;
use lib_common::{MessageFilter, StoreError};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub async fn run(port: u16, state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/messages", get(messages_handler))
        .route("/api/messages/{id}", delete(delete_message_handler))
        .route("/api/reports", get(reports_handler))
        .route("/health", get(health_handler))
        // Open to any origin, like the original deployment.
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    log::info!("Chat relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await
        .unwrap();
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    // Subscribe before announcing the join so this socket sees its own
    // active_users broadcast.
    let mut events_rx = state.subscribe();

    let (count, history) = {
        let mut st = state.lock().await;
        (st.registry.join(), st.cache.snapshot())
    };
    state.broadcast(ServerEvent::ActiveUsers { count });
    log::info!("Client {} connected (total: {})", conn_id, count);

    if send_event(&mut socket, &ServerEvent::MessageHistory { messages: history })
        .await
        .is_err()
    {
        disconnect(&state, conn_id).await;
        return;
    }

    loop {
        tokio::select! {
            // Inbound commands from this client
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                if let Err(rejection) = dispatch(&state, conn_id, event).await {
                                    // Rejections go to the originating
                                    // connection only.
                                    let _ = send_event(&mut socket, &ServerEvent::Error {
                                        message: rejection.to_string(),
                                    }).await;
                                }
                            }
                            Err(e) => {
                                log::debug!("Client {} sent malformed event: {}", conn_id, e);
                                let _ = send_event(&mut socket, &ServerEvent::Error {
                                    message: "Malformed event".to_string(),
                                }).await;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            // Broadcasts fanned out to every client
            received = events_rx.recv() => {
                match received {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Client {} lagged behind, {} events dropped", conn_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    disconnect(&state, conn_id).await;
}

async fn disconnect(state: &AppState, conn_id: u64) {
    let (count, was_typing, users) = {
        let mut st = state.lock().await;
        let was_typing = st.registry.is_typing(conn_id);
        let count = st.registry.leave(conn_id);
        (count, was_typing, st.registry.typing_names())
    };
    state.broadcast(ServerEvent::ActiveUsers { count });
    if was_typing {
        state.broadcast(ServerEvent::TypingUsers { users });
    }
    log::info!("Client {} disconnected (total: {})", conn_id, count);
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(WsMessage::Text(text.into())).await,
        Err(e) => {
            log::error!("Failed to serialize outbound event: {}", e);
            Ok(())
        }
    }
}

async fn dispatch(state: &AppState, conn_id: u64, event: ClientEvent) -> Result<(), RelayError> {
    match event {
        ClientEvent::SendMessage {
            id,
            text,
            attachment,
            sender_name,
        } => {
            state.accept_message(id, text, attachment, sender_name).await?;
        }
        ClientEvent::EditMessage {
            id,
            text,
            sender_name,
        } => {
            state.edit_message(&id, &sender_name, &text).await?;
        }
        ClientEvent::DeleteMessage { id, sender_name } => {
            state.delete_message(&id, &sender_name).await?;
        }
        ClientEvent::Typing {
            is_typing,
            sender_name,
        } => {
            let users = {
                let mut st = state.lock().await;
                st.registry
                    .set_typing(conn_id, sender_name, is_typing, state.policy.typing_expiry)
            };
            state.broadcast(ServerEvent::TypingUsers { users });
        }
        ClientEvent::AddReaction {
            id,
            symbol,
            sender_name,
        } => {
            state.react(&id, &sender_name, &symbol).await?;
        }
        ClientEvent::ReportMessage {
            id,
            reason,
            sender_name,
        } => {
            state.report(&id, &sender_name, &reason).await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ApiError {
    Unauthorized,
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_json) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Missing or invalid admin token" }),
            ),
            ApiError::Store(StoreError::NotFound(key)) => (
                StatusCode::NOT_FOUND,
                json!({ "error": format!("Message #{} not found", key) }),
            ),
            ApiError::Store(e) => {
                log::error!("Store error on HTTP surface: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Durable store unavailable" }),
                )
            }
        };
        (status, Json(error_json)).into_response()
    }
}

/// Shared-secret gate around the privileged endpoints. A policy wrapper,
/// not a core concern: with no token configured the endpoints stay closed.
fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = state
        .policy
        .admin_token
        .as_deref()
        .ok_or(ApiError::Unauthorized)?;
    let provided = headers.get("x-admin-token").and_then(|v| v.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    /// Substring filter on the body.
    q: Option<String>,
    sender: Option<String>,
    limit: Option<usize>,
}

async fn messages_handler(
    State(state): State<AppState>,
    Query(params): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = MessageFilter {
        text_contains: params.q,
        sender: params.sender,
        limit: params.limit,
    };
    let messages = state.query_messages(&filter).await?;
    Ok(Json(json!({ "messages": messages })))
}

async fn reports_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_admin(&state, &headers)?;
    let reports = state.store.list_reports().await?;
    Ok(Json(json!({ "reports": reports })))
}

async fn delete_message_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    check_admin(&state, &headers)?;
    state.admin_delete(key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (cached, pending, active) = state.health_counts().await;
    Json(json!({
        "status": "ok",
        "messagesCached": cached,
        "pendingWrites": pending,
        "activeUsers": active,
    }))
}
