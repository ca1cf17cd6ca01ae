use std::path::PathBuf;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    coordinator::ScanCoordinator,
    executor::SingleScanOutcome,
    types::{ScanEvent, ScanRequest, ScanUpdate},
    validate::{validate_request, ValidationError},
};

#[derive(Clone)]
pub struct AppState {
    coordinator: ScanCoordinator,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanOutput {
    pub result: String,
    pub command: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Messages a websocket client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartScan(ScanRequest),
    JoinScan { scan_id: String },
    CancelScan { scan_id: String },
}

/// Messages pushed to a websocket client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionResponse { status: String },
    ScanStarted { scan_id: String, parallel_tasks: usize },
    ScanUpdate(ScanUpdate),
}

pub fn router(coordinator: ScanCoordinator, ui_dir: Option<PathBuf>) -> Router {
    let state = AppState { coordinator };

    let api = Router::new()
        .route("/scan", post(post_scan))
        .route("/scans/{scan_id}", get(get_scan));

    let app = Router::new()
        .nest("/api", api)
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let app = match ui_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true)),
        None => app,
    };
    app.layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, coordinator: ScanCoordinator, ui_dir: Option<PathBuf>) -> Result<()> {
    let app = router(coordinator, ui_dir);
    info!(%bind, "serving scan API");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

fn bad_request(err: ValidationError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: err.to_string(),
            message: None,
            command: None,
        }),
    )
        .into_response()
}

/// Synchronous, non-parallel scan.
async fn post_scan(State(app): State<AppState>, body: Bytes) -> Response {
    let Ok(req) = serde_json::from_slice::<ScanRequest>(&body) else {
        return bad_request(ValidationError::EmptyRequest);
    };
    let spec = match validate_request(&req) {
        Ok(spec) => spec,
        Err(e) => return bad_request(e),
    };

    match app.coordinator.run_single(&spec).await {
        SingleScanOutcome::Completed { output, command } => (
            StatusCode::OK,
            Json(ScanOutput {
                result: output,
                command,
            }),
        )
            .into_response(),
        SingleScanOutcome::Failed { stderr, command } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: "scan failed".to_string(),
                message: Some(stderr),
                command: Some(command),
            }),
        )
            .into_response(),
        SingleScanOutcome::TimedOut { command } => (
            StatusCode::REQUEST_TIMEOUT,
            Json(ErrorBody {
                error: "scan timed out".to_string(),
                message: None,
                command: Some(command),
            }),
        )
            .into_response(),
        SingleScanOutcome::LaunchFailed { error, command } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error,
                message: None,
                command: Some(command),
            }),
        )
            .into_response(),
    }
}

async fn get_scan(State(app): State<AppState>, Path(scan_id): Path<String>) -> Response {
    match app.coordinator.snapshot(&scan_id).await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(socket: WebSocket, app: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(256);
    debug!("websocket client connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx
        .send(ServerMessage::ConnectionResponse {
            status: "connected".to_string(),
        })
        .await;

    // One forwarder per joined scan room.
    let mut forwarders = JoinSet::new();
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(msg) => handle_client_message(msg, &app, &tx, &mut forwarders).await,
                Err(e) => {
                    let _ = tx.send(error_update(None, format!("malformed message: {e}"))).await;
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!("websocket error: {e}");
                break;
            }
            _ => {}
        }
    }

    forwarders.abort_all();
    writer.abort();
    debug!("websocket client disconnected");
}

async fn handle_client_message(
    msg: ClientMessage,
    app: &AppState,
    tx: &mpsc::Sender<ServerMessage>,
    forwarders: &mut JoinSet<()>,
) {
    match msg {
        ClientMessage::StartScan(req) => {
            let spec = match validate_request(&req) {
                Ok(spec) => spec,
                Err(e) => {
                    let _ = tx.send(error_update(None, e.to_string())).await;
                    return;
                }
            };
            let started = app.coordinator.start_scan(spec).await;
            let _ = tx
                .send(ServerMessage::ScanStarted {
                    scan_id: started.scan_id.clone(),
                    parallel_tasks: started.parallelism,
                })
                .await;
            forwarders.spawn(forward_updates(started.events, tx.clone()));
        }
        ClientMessage::JoinScan { scan_id } => match app.coordinator.hub().subscribe(&scan_id).await {
            Some(rx) => {
                debug!(%scan_id, "client joined scan room");
                forwarders.spawn(forward_updates(rx, tx.clone()));
            }
            None => {
                let _ = tx
                    .send(error_update(Some(scan_id), "unknown or finished scan".to_string()))
                    .await;
            }
        },
        ClientMessage::CancelScan { scan_id } => {
            if !app.coordinator.cancel(&scan_id).await {
                debug!(%scan_id, "cancel for unknown scan ignored");
            }
        }
    }
}

fn error_update(scan_id: Option<String>, message: String) -> ServerMessage {
    ServerMessage::ScanUpdate(ScanUpdate {
        scan_id,
        event: ScanEvent::Error { message, error: None },
    })
}

async fn forward_updates(mut rx: broadcast::Receiver<ScanUpdate>, tx: mpsc::Sender<ServerMessage>) {
    loop {
        match rx.recv().await {
            Ok(update) => {
                if tx.send(ServerMessage::ScanUpdate(update)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "websocket subscriber lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
