use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{info, trace};

use strata_core::ids::{AgentKey, JobId, JobRunId};
use strata_core::models::{JobRun, JobRunTask};
use strata_store::Repository;

use crate::config::ServerSettings;
use crate::dispatcher::{self, RpcDispatcher};
use crate::error::RunError;
use crate::hub::{self, AgentHub};
use crate::orchestrator::JobRunner;
use crate::registry::{self, ConnectionId, ConnectionRegistry};
use crate::remote::{AgentRemote, RemoteService};

const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub runner: Arc<JobRunner>,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
    pub heartbeat_interval: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/agents", get(agents_handler))
        .route("/jobs/{job_id}/run", post(start_run_handler))
        .route("/runs/{run_id}", get(run_handler))
        .route("/runs/{run_id}/stop", post(stop_run_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Start the control plane. `store` must already hold the catalogue.
pub async fn start(
    settings: &ServerSettings,
    store: Arc<dyn Repository>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(settings.max_send_queue));
    let dispatcher = Arc::new(RpcDispatcher::new(
        Arc::clone(&registry),
        settings.rpc_timeout(),
    ));
    let remote: Arc<dyn AgentRemote> = Arc::new(RemoteService::new(Arc::clone(&dispatcher)));
    let runner = Arc::new(JobRunner::new(Arc::clone(&store), remote));

    let cleanup = registry::start_cleanup_task(
        Arc::clone(&registry),
        settings.heartbeat_interval(),
        settings.stale_timeout(),
    );
    let sweep = dispatcher::start_sweep_task(Arc::clone(&dispatcher));

    let (message_tx, message_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let hub = AgentHub {
        registry: Arc::clone(&registry),
        dispatcher,
        runner: Arc::clone(&runner),
        store,
    };
    let messages = tokio::spawn(hub::process_agent_messages(message_rx, hub));

    let router = build_router(AppState {
        registry,
        runner: Arc::clone(&runner),
        message_tx,
        heartbeat_interval: settings.heartbeat_interval(),
    });
    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "control plane listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "http server stopped");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        runner,
        server,
        messages,
        cleanup,
        sweep,
    })
}

/// Keeps the background tasks of a started control plane alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub runner: Arc<JobRunner>,
    server: tokio::task::JoinHandle<()>,
    messages: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
    sweep: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(&self) {
        self.server.abort();
        self.messages.abort();
        self.cleanup.abort();
        self.sweep.abort();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, mut rx) = state.registry.register();
    info!(connection_id = %connection_id, "agent socket opened");
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = connection_id.clone();
    let heartbeat = state.heartbeat_interval;
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat);
        let _ = ping.tick().await;
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!(connection_id = %writer_id, "ping");
                }
            }
        }
    });

    let reader_id = connection_id.clone();
    let registry = Arc::clone(&state.registry);
    let message_tx = state.message_tx.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            registry.record_seen(&reader_id);
            match msg {
                WsMessage::Text(text) => {
                    if message_tx.send((reader_id.clone(), text.to_string())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    let agent_key = state.registry.on_disconnect(&connection_id);
    info!(connection_id = %connection_id, agent_key = ?agent_key, "agent socket closed");
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    agents: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.connection_count(),
        agents: state.registry.connected_agents().len(),
    })
}

async fn agents_handler(State(state): State<AppState>) -> Json<Vec<AgentKey>> {
    Json(state.registry.connected_agents())
}

async fn start_run_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRun>, RunError> {
    let run = state.runner.start_run(&JobId::from_raw(job_id)).await?;
    Ok(Json(run))
}

async fn stop_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<JobRun>, RunError> {
    let run = state.runner.stop_run(&JobRunId::from_raw(run_id)).await?;
    Ok(Json(run))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetails {
    pub run: JobRun,
    pub tasks: Vec<JobRunTask>,
}

async fn run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetails>, RunError> {
    let (run, tasks) = state.runner.run_details(&JobRunId::from_raw(run_id))?;
    Ok(Json(RunDetails { run, tasks }))
}
