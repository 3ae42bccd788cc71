//! # Status API
//!
//! Axum router served by `tessera-daemon serve`. Read-mostly: the only
//! mutating endpoint asks for an immediate sync.
//!
//! | Method | Path       | Description                                   |
//! |--------|------------|-----------------------------------------------|
//! | GET    | `/health`  | Liveness probe                                |
//! | GET    | `/status`  | Balances, breaker state, sync bookkeeping     |
//! | POST   | `/sync`    | Run one sync now and return its outcome       |
//! | GET    | `/metrics` | Prometheus exposition                         |
//! | GET    | `/ws`      | WebSocket stream of wallet events             |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tessera_protocol::storage::{ResolveError, SyncError};
use tessera_protocol::Wallet;

use crate::metrics::{self, SharedMetrics};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub wallet: Arc<Wallet>,
    pub metrics: SharedMetrics,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/sync", post(sync_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, error: String, kind: impl std::fmt::Debug) -> Response {
    (
        status,
        Json(ErrorResponse {
            error,
            kind: format!("{kind:?}"),
        }),
    )
        .into_response()
}

/// `GET /health`. Does not touch the wallet.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "version": state.version }))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> Response {
    match state.wallet.status() {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read wallet status");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "StorageFailure")
        }
    }
}

/// `POST /sync`. 409 while another sync runs, 503 in LOCAL mode or without
/// storage nodes, 502 when the nodes failed.
async fn sync_handler(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let result = state.wallet.sync.sync_now().await;
    state
        .metrics
        .sync_duration_seconds
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            state.metrics.sync_failures_total.inc();
            let status = match &e {
                SyncError::AlreadyInProgress => StatusCode::CONFLICT,
                SyncError::LocalMode | SyncError::Resolve(ResolveError::NoNodes) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::BAD_GATEWAY,
            };
            tracing::warn!(error = %e, "requested sync failed");
            error_response(status, e.to_string(), e.kind())
        }
    }
}

/// `GET /ws`. Push-only: client messages are ignored.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.wallet.events.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(ev) => {
                    let payload = match serde_json::to_string(&ev) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to serialize ws event");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "ws subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tessera_protocol::crypto::keys::WalletKeypair;
    use tessera_protocol::devnet::fixtures::issue_token;
    use tessera_protocol::devnet::{InMemoryNetwork, InMemoryStorageNode, LoopbackHub, StorageBackend};
    use tessera_protocol::storage::{StorageNode, WalletDb};
    use tessera_protocol::token::{CoinId, StaticTokenRegistry};
    use tessera_protocol::transfer::CommitmentSigner;
    use tessera_protocol::{Collaborators, SystemClock, WalletConfig, WalletStatus};
    use tower::ServiceExt;

    struct Harness {
        router: Router,
        state: AppState,
        node: Arc<InMemoryStorageNode>,
        keypair: WalletKeypair,
    }

    fn harness() -> Harness {
        let keypair = WalletKeypair::generate();
        let node = Arc::new(InMemoryStorageNode::new("mem", StorageBackend::new()));
        let wallet = Wallet::open(
            keypair.clone(),
            WalletDb::open_temporary().unwrap(),
            Collaborators {
                network: Arc::new(InMemoryNetwork::new()),
                transport: LoopbackHub::new().endpoint("daemon"),
                storage_nodes: vec![node.clone() as Arc<dyn StorageNode>],
                registry: Arc::new(StaticTokenRegistry::new()),
            },
            Arc::new(SystemClock),
            WalletConfig::default(),
        )
        .unwrap();
        let state = AppState {
            version: "0.1.0-test".into(),
            wallet: Arc::new(wallet),
            metrics: Arc::new(crate::metrics::DaemonMetrics::new().unwrap()),
        };
        Harness {
            router: create_router(state.clone()),
            state,
            node,
            keypair,
        }
    }

    async fn send(router: &Router, method: &str, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn health_reports_version() {
        let h = harness();
        let (status, body) = send(&h.router, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], "0.1.0-test");
    }

    #[tokio::test]
    async fn status_lists_tokens_and_breaker() {
        let h = harness();
        let signer = CommitmentSigner::new(h.keypair.clone());
        h.state
            .wallet
            .store
            .put(&issue_token(&signer, CoinId::from_name("UCT"), 40))
            .unwrap();

        let (status, body) = send(&h.router, "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["token_count"], 1);
        assert_eq!(json["balances"][0]["amount"], "40");
        assert_eq!(json["breaker"]["localModeActive"], false);
        assert_eq!(json["storage_nodes"], 1);
    }

    #[tokio::test]
    async fn sync_publishes_and_metrics_follow() {
        let h = harness();
        let mut events = h.state.wallet.events.subscribe();
        let signer = CommitmentSigner::new(h.keypair.clone());
        h.state
            .wallet
            .store
            .put(&issue_token(&signer, CoinId::from_name("UCT"), 5))
            .unwrap();

        let (status, body) = send(&h.router, "POST", "/sync").await;
        assert_eq!(status, StatusCode::OK);
        let outcome: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(outcome["published"], true);
        assert_eq!(outcome["token_count"], 1);

        while let Ok(event) = events.try_recv() {
            h.state.metrics.observe(&event);
        }
        let (status, body) = send(&h.router, "GET", "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("tessera_tokens 1"));
        assert!(text.contains("tessera_syncs_completed_total 1"));
        assert!(text.contains("tessera_local_mode 0"));
    }

    #[tokio::test]
    async fn failed_sync_is_a_bad_gateway() {
        let h = harness();
        h.node.set_offline(true);

        let (status, body) = send(&h.router, "POST", "/sync").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.kind, "StorageFailure");
        assert_eq!(h.state.metrics.sync_failures_total.get(), 1);

        let status: WalletStatus = h.state.wallet.status().unwrap();
        assert!(status.breaker.consecutive_storage_failures >= 1);
    }
}
