//! InkShare WebSocket Relay Server
//!
//! Holds the live canvas snapshot and presence records as opaque string
//! values under paths, and forwards every write to the other subscribers of
//! the same path.
//!
//! ## Protocol
//!
//! Messages are JSON with the following format:
//! ```json
//! { "type": "subscribe", "path": "canvas" }
//! { "type": "set", "path": "users/ada", "value": "{\"name\":\"Ada\",...}" }
//! { "type": "changed", "path": "canvas", "value": "...", "from": "<peer>" }
//! ```

mod state;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use inkshare_core::protocol::{ClientMessage, ServerMessage};
use state::AppState;
use std::{collections::HashSet, net::SocketAddr, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Realtime relay for InkShare canvases.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "INKSHARE_ADDR", default_value = "0.0.0.0:3030")]
    addr: SocketAddr,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkshare_server=info,tower_http=info".into()),
        )
        .init();

    let app = router(Arc::new(AppState::new()));

    let listener = match tokio::net::TcpListener::bind(args.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", args.addr, e);
            std::process::exit(1);
        }
    };
    info!("InkShare relay server listening on {}", args.addr);
    info!("WebSocket endpoint: ws://{}/ws", args.addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Index page
async fn index() -> &'static str {
    "InkShare Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            error!("Failed to encode message: {}", e);
            None
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New connection: {}", peer_id);

    let (mut sender, mut receiver) = socket.split();
    let mut changes = state.changes();
    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = receiver.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { path }) => {
                                debug!("Peer {} subscribed to {}", peer_id, path);
                                subscribed.insert(path.clone());
                                let value = state.get(&path);
                                Some(ServerMessage::Value { path, value })
                            }
                            Ok(ClientMessage::Get { path }) => {
                                let value = state.get(&path);
                                Some(ServerMessage::Value { path, value })
                            }
                            Ok(ClientMessage::Set { path, value }) => {
                                debug!("Peer {} wrote {} ({} bytes)", peer_id, path, value.len());
                                state.set(&path, value, &peer_id);
                                None
                            }
                            Err(e) => {
                                warn!("Invalid message from {}: {}", peer_id, e);
                                Some(ServerMessage::Error {
                                    message: format!("Invalid message: {}", e),
                                })
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None, // Ignore binary and ping/pong
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", peer_id, e);
                        break;
                    }
                };

                if let Some(out) = reply.as_ref().and_then(encode) {
                    if sender.send(out).await.is_err() {
                        break;
                    }
                }
            }

            // Forward changes on subscribed paths
            change = changes.recv() => {
                let change = match change {
                    Ok(change) => change,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Peer {} lagged, {} changes dropped", peer_id, skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                // Don't echo back to sender
                if change.skip.as_deref() == Some(peer_id.as_str()) {
                    continue;
                }
                let Some(path) = change.path() else {
                    continue;
                };
                if !subscribed.contains(path) {
                    continue;
                }
                if let Some(out) = encode(&change.message) {
                    if sender.send(out).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.disconnect(&peer_id);
    info!("Connection closed: {}", peer_id);
}
