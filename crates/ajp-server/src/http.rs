// SPDX-License-Identifier: Apache-2.0
//! HTTP server for health checks, Prometheus metrics and channel pause/resume.

use crate::channel::{ChannelControl, ChannelState};
use crate::metrics::metrics;
use ajp_realm::Realm;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Readiness state shared between the HTTP server and the AJP channel.
#[derive(Clone)]
pub struct ServerState {
    /// Whether the channel is accepting AJP connections.
    ready: Arc<AtomicBool>,
    /// Cleared once the channel has stopped for good.
    alive: Arc<AtomicBool>,
    realm: Option<Arc<dyn Realm>>,
    control: Option<ChannelControl>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(true)),
            realm: None,
            control: None,
        }
    }

    /// Enables `POST /pause` and `POST /resume` for this channel.
    pub fn with_control(mut self, control: ChannelControl) -> Self {
        self.control = Some(control);
        self
    }

    /// Readiness also requires this realm to report itself available.
    pub fn with_realm(mut self, realm: Arc<dyn Realm>) -> Self {
        self.realm = Some(realm);
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn realm_available(&self) -> bool {
        self.realm.as_ref().is_none_or(|r| r.is_available())
    }

    /// Mirrors channel state transitions until the channel stops.
    pub async fn follow_channel(self, mut states: watch::Receiver<ChannelState>) {
        loop {
            let state = *states.borrow_and_update();
            self.set_ready(state == ChannelState::Running);
            if state == ChannelState::Stopped {
                self.set_alive(false);
                return;
            }
            if states.changed().await.is_err() {
                self.set_ready(false);
                return;
            }
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}

fn json(code: StatusCode, status: &'static str) -> Response {
    (code, axum::Json(HealthResponse { status })).into_response()
}

async fn health_handler() -> impl IntoResponse {
    json(StatusCode::OK, "healthy")
}

/// 200 while the channel runs and the realm is available. A paused channel
/// reports "paused", a stopped one "stopped".
async fn ready_handler(State(state): State<ServerState>) -> Response {
    if !state.is_alive() {
        json(StatusCode::SERVICE_UNAVAILABLE, "stopped")
    } else if !state.is_ready() {
        json(StatusCode::SERVICE_UNAVAILABLE, "paused")
    } else if !state.realm_available() {
        json(StatusCode::SERVICE_UNAVAILABLE, "realm_unavailable")
    } else {
        json(StatusCode::OK, "ready")
    }
}

async fn live_handler(State(state): State<ServerState>) -> Response {
    if state.is_alive() {
        json(StatusCode::OK, "alive")
    } else {
        json(StatusCode::SERVICE_UNAVAILABLE, "dead")
    }
}

/// Applies a pause or resume and reports the resulting channel state.
fn steer(state: &ServerState, pause: bool) -> Response {
    let Some(control) = &state.control else {
        return json(StatusCode::NOT_FOUND, "no_channel");
    };
    if pause {
        control.pause();
    } else {
        control.resume();
    }
    let current = control.state();
    state.set_ready(current == ChannelState::Running);
    match current {
        ChannelState::Running => json(StatusCode::OK, "running"),
        ChannelState::Paused => json(StatusCode::OK, "paused"),
        ChannelState::Stopped => json(StatusCode::CONFLICT, "stopped"),
    }
}

async fn pause_handler(State(state): State<ServerState>) -> Response {
    info!("channel pause requested over HTTP");
    steer(&state, true)
}

async fn resume_handler(State(state): State<ServerState>) -> Response {
    info!("channel resume requested over HTTP");
    steer(&state, false)
}

async fn metrics_handler() -> impl IntoResponse {
    let body = metrics().encode();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .route("/metrics", get(metrics_handler))
        .route("/pause", post(pause_handler))
        .route("/resume", post(resume_handler))
        .with_state(state)
}

pub async fn serve_http(addr: SocketAddr, state: ServerState) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening for health checks and metrics");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
        return Err(e.into());
    }

    Ok(())
}
