//! # Downstream Transport
//!
//! The axum surface of the relay:
//!
//! - `GET /ws`: websocket subscription (first message selects the topic).
//! - `GET /topics`: websocket that sends the topic listing once and closes.
//! - `GET /topics.json`: the same listing over plain HTTP.
//! - `POST /ingest`, `POST /forward_data`: producer push.
//! - `GET /health`, `GET /status`.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use chrono::{DateTime, Utc};
use futures_util::{future, SinkExt, StreamExt};
use lib_relay::core::{serve_connection, Inbound, Outbound};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::relay_logic::config::Config;
use crate::relay_logic::ingest::ingest_handler;
use crate::relay_logic::state::AppState;

/// Grace period for in-flight TLS connections on shutdown.
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/topics", get(topics_ws_handler))
        .route("/topics.json", get(topics_json_handler))
        .route("/ingest", post(ingest_handler))
        .route("/forward_data", post(ingest_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

/// Serves plain HTTP/websocket on an already bound listener until the
/// state's shutdown token is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    tracing::info!(addr = %listener.local_addr()?, "downstream server listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        tracing::info!("downstream server shutting down");
    })
    .await?;
    Ok(())
}

/// Binds `0.0.0.0:<port>` and serves, over TLS when both certificate and
/// key are configured.
pub async fn run(config: &Config, state: AppState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));

    let Some((cert_path, key_path)) = config.tls_paths() else {
        let listener = TcpListener::bind(addr).await?;
        return serve(listener, state).await;
    };

    let tls_config = RustlsConfig::from_pem_file(cert_path, key_path).await?;
    let handle = axum_server::Handle::new();
    let signal_handle = handle.clone();
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        tracing::info!("downstream TLS server shutting down");
        signal_handle.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
    });

    tracing::info!(%addr, "downstream TLS server listening");
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(router(state).into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

fn inbound_frame(message: Message) -> Inbound {
    match message {
        Message::Text(text) => Inbound::Text(text.as_str().to_owned()),
        Message::Binary(bytes) => Inbound::Binary(bytes.to_vec()),
        Message::Ping(_) => Inbound::Ping,
        Message::Pong(_) => Inbound::Pong,
        Message::Close(_) => Inbound::Close,
    }
}

fn outbound_frame(frame: Outbound) -> Message {
    match frame {
        Outbound::Payload(payload) => Message::Text(payload.to_string().into()),
        Outbound::Ping => Message::Ping(Bytes::new()),
    }
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: AppState) {
    tracing::info!(peer = %addr, "client connected");
    let (sink, stream) = socket.split();
    let inbound = stream.map(|frame| frame.map(inbound_frame));
    let outbound = sink.with(|frame: Outbound| future::ready(Ok::<_, axum::Error>(outbound_frame(frame))));

    serve_connection(
        state.relay.clone(),
        addr.to_string(),
        inbound,
        outbound,
        state.shutdown.child_token(),
    )
    .await;
}

async fn topics_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |mut socket| async move {
        let topics = state.relay.topics();
        match serde_json::to_string(&topics) {
            Ok(listing) => {
                if let Err(e) = socket.send(Message::Text(listing.into())).await {
                    tracing::debug!(error = %e, "topic listing not sent");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize topic listing"),
        }
        let _ = socket.send(Message::Close(None)).await;
    })
}

async fn topics_json_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.relay.topics())
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[derive(Debug, Serialize)]
struct StatusReport {
    revision: u64,
    records: usize,
    subscribers: usize,
    state: &'static str,
    source: String,
    published_at: Option<DateTime<Utc>>,
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.relay.store().get();
    Json(StatusReport {
        revision: snapshot.revision(),
        records: snapshot.len(),
        subscribers: state.relay.registry().len(),
        state: state.scheduler.state().as_str(),
        source: state.scheduler.source_name().to_string(),
        published_at: snapshot.published_at(),
    })
}
