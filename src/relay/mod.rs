// Remote-install relay server.
//
// Three routes: token minting, the tunnel upgrade, and health. The relay
// holds no standing credentials; everything security-relevant is the token
// discipline (IP-bound, short-lived, single-use) plus the per-session
// validation in `session`.

pub mod command;
pub mod session;
pub mod tokens;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};

use crate::cli::RelayArgs;
use crate::error::TokenError;
use tokens::{MemoryTokenStore, RateLimiter, TokenStore};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct RelayState {
    pub tokens: Arc<dyn TokenStore>,
    pub limiter: RateLimiter,
    pub tunnels: Arc<Semaphore>,
    pub max_tunnels: usize,
    pub session_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl RelayState {
    pub fn from_args(args: &RelayArgs) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tokens: Arc::new(MemoryTokenStore::new(Duration::from_secs(
                args.token_ttl_secs,
            ))),
            limiter: RateLimiter::new(args.token_quota, Duration::from_secs(args.window_secs)),
            tunnels: Arc::new(Semaphore::new(args.max_tunnels)),
            max_tunnels: args.max_tunnels,
            session_timeout: Duration::from_secs(args.session_timeout_secs),
            shutdown,
        }
    }

    pub fn active_tunnels(&self) -> usize {
        self.max_tunnels - self.tunnels.available_permits()
    }

    /// Every open session watches this; flipping it tells them to send a
    /// final frame, kill the child, and close the socket.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

fn token_error_response(err: &TokenError) -> Response {
    let status = match err {
        TokenError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        TokenError::CapacityReached => StatusCode::SERVICE_UNAVAILABLE,
        TokenError::Unknown | TokenError::Expired | TokenError::AlreadyConsumed => {
            StatusCode::UNAUTHORIZED
        }
        TokenError::IpMismatch => StatusCode::FORBIDDEN,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    expires_in_seconds: u64,
}

async fn mint_token(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let ip = peer.ip();
    if let Err(e) = state.limiter.check(ip) {
        warn!("[PHASE: relay] [STEP: mint] Refused {}: {}", ip, e);
        return token_error_response(&e);
    }
    match state.tokens.mint(ip) {
        Ok((token, ttl)) => Json(TokenResponse {
            token,
            expires_in_seconds: ttl.as_secs(),
        })
        .into_response(),
        Err(e) => token_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct TunnelQuery {
    token: String,
}

async fn tunnel(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<TunnelQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Consume before upgrading: a refused token never allocates a session.
    if let Err(e) = state.tokens.consume(&query.token, peer.ip()) {
        warn!("[PHASE: relay] [STEP: tunnel] Refused {}: {}", peer, e);
        return token_error_response(&e);
    }

    let Ok(permit) = Arc::clone(&state.tunnels).try_acquire_owned() else {
        warn!(
            "[PHASE: relay] [STEP: tunnel] At capacity ({} tunnels); refusing {}",
            state.max_tunnels, peer
        );
        return token_error_response(&TokenError::CapacityReached);
    };

    let timeout = state.session_timeout;
    let shutdown = state.subscribe_shutdown();
    ws.on_upgrade(move |socket| async move {
        session::run_session(socket, peer, timeout, shutdown).await;
        drop(permit);
    })
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "activeTunnels": state.active_tunnels(),
    }))
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/install/token", post(mint_token))
        .route("/tunnel", get(tunnel))
        .route("/health", get(health))
        .with_state(state)
}

/// Periodic sweep of expired tokens and elapsed rate-limit windows.
pub fn spawn_prune_task(state: Arc<RelayState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PRUNE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            state.tokens.prune();
            state.limiter.prune();
        }
    })
}

/// Serve until SIGINT/SIGTERM. The signal flips the shutdown watch, which
/// every open session observes: each sends a final error frame, kills its
/// child, and closes. Sessions that fail to drain within the grace period
/// are abandoned by force-returning from serve.
pub async fn serve(args: RelayArgs) -> anyhow::Result<()> {
    let state = Arc::new(RelayState::from_args(&args));
    let prune = spawn_prune_task(Arc::clone(&state));

    let addr = SocketAddr::new(args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        "[PHASE: relay] [STEP: serve] Listening on {} (max_tunnels={}, token_ttl_secs={})",
        addr, args.max_tunnels, args.token_ttl_secs
    );

    let app = router(Arc::clone(&state));
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let state = Arc::clone(&state);
        async move {
            shutdown_signal().await;
            state.begin_shutdown();
        }
    });

    // Both the notify and the force-close are bounded: sessions react to the
    // watch within their select loop, and the grace timer caps how long we
    // wait for stragglers.
    let mut watcher = state.subscribe_shutdown();
    let force_deadline = async move {
        while !*watcher.borrow() {
            if watcher.changed().await.is_err() {
                // Sender lives in the relay state, which outlives this loop.
                std::future::pending::<()>().await;
            }
        }
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    };

    tokio::select! {
        result = server => {
            result?;
            info!("[PHASE: relay] [STEP: shutdown] All tunnels drained");
        }
        () = force_deadline => {
            warn!(
                "[PHASE: relay] [STEP: shutdown] Forcing exit with {} tunnel(s) still open",
                state.active_tunnels()
            );
        }
    }

    prune.abort();
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint =
        signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => info!("[PHASE: relay] [STEP: shutdown] SIGINT received"),
        _ = sigterm.recv() => info!("[PHASE: relay] [STEP: shutdown] SIGTERM received"),
    }
}
