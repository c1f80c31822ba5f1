//! HTTP and websocket front door
//!
//! `/` upgrades websocket requests into relay connections and answers plain
//! GETs with the NIP-11 information document.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::outbox::Outbound;
use crate::relay::Relay;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Browser origin allowed by CORS; any origin when unset
    pub client_domain: Option<String>,
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            client_domain: None,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
    heartbeat_interval: Duration,
}

/// Build the router serving the relay at `/`.
pub fn build_router(relay: Arc<Relay>, config: &ServerConfig) -> Result<Router> {
    let cors = match &config.client_domain {
        Some(domain) => {
            let origin: HeaderValue = domain
                .parse()
                .with_context(|| format!("Invalid client domain {domain}"))?;
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::OPTIONS])
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    };

    let state = AppState {
        relay,
        heartbeat_interval: config.heartbeat_interval,
    };

    Ok(Router::new()
        .route("/", get(root_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

async fn root_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(_) => (
            [(header::CONTENT_TYPE, "application/nostr+json")],
            state.relay.info_document().to_string(),
        )
            .into_response(),
    }
}

/// Drive one websocket: a writer task drains the outbound queue and sends
/// heartbeats while this task reads frames in arrival order.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.relay.config().outbound_queue.max(1));
    let connection = state.relay.connect(tx);
    let connection_id = connection.id();
    tracing::info!(connection = connection_id, "client connected");

    let heartbeat_interval = state.heartbeat_interval;
    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(Outbound::Frame(text)) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => connection.handle(text.as_str()).await,
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => connection.handle(text).await,
                Err(_) => connection.handle("").await,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection = connection_id, error = %e, "socket error");
                break;
            }
        }
        if connection.is_closed() {
            break;
        }
    }

    connection.cleanup();
    tracing::info!(connection = connection_id, "client disconnected");
}

/// A server bound to a local address, running in the background.
pub struct ServerHandle {
    pub addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(self) {
        self.task.abort();
        self.sweeper.abort();
    }
}

/// Bind and serve in the background. Port 0 picks a free port.
pub async fn spawn(relay: Arc<Relay>, config: &ServerConfig) -> Result<ServerHandle> {
    let router = build_router(relay.clone(), config)?;
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    let addr = listener.local_addr()?;

    let sweeper = relay.spawn_session_sweeper();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        addr,
        task,
        sweeper,
    })
}

/// Serve until ctrl-c.
pub async fn serve(relay: Arc<Relay>, config: &ServerConfig) -> Result<()> {
    let router = build_router(relay.clone(), config)?;
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    tracing::info!(addr = %listener.local_addr()?, pubkey = %relay.public_key(), "relay listening");

    let sweeper = relay.spawn_session_sweeper();
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    sweeper.abort();

    tracing::info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
