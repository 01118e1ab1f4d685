//! HTTP query endpoints and the subscriber WebSocket

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::inspector::MatchRecord;
use crate::provider::ProviderError;
use crate::publisher::Subscription;
use crate::relay::{Relay, RelayHealth, RelayStats};

/// Default block count for `/results?rescan=true`
pub const DEFAULT_RESCAN_LIMIT: usize = 50;

/// Default block count for `/results/scan`
pub const DEFAULT_SCAN_LIMIT: usize = 10;

pub const NOT_FOUND_TEXT: &str = "No SYS pattern found in block";

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("Provider setup failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultsQuery {
    pub rescan: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanQuery {
    pub limit: Option<String>,
}

/// Lenient numeric query value; missing, malformed or zero means `default`
fn parse_limit(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(default)
}

fn is_truthy(raw: Option<&str>) -> bool {
    matches!(raw.map(str::trim), Some("true") | Some("1"))
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultsResponse {
    pub success: bool,
    pub results: Vec<MatchRecord>,
    pub total_results: usize,
    pub processed_blocks: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_matches: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub success: bool,
    pub scanned: usize,
    pub found: usize,
    pub results: Vec<MatchRecord>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockCheckResponse {
    pub success: bool,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<MatchRecord>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub success: bool,
    #[serde(flatten)]
    pub stats: RelayStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub success: bool,
    pub status: &'static str,
    #[serde(flatten)]
    pub health: RelayHealth,
}

/// Build the router over a shared relay
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(subscribe_socket))
        .route("/results", get(results))
        .route("/results/scan", get(scan))
        .route("/result/:hash", get(check_block))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .with_state(relay)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, relay: Arc<Relay>, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Relay listening on {}", addr);
    }
    axum::serve(listener, router(relay))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn results(State(relay): State<Arc<Relay>>, Query(query): Query<ResultsQuery>) -> impl IntoResponse {
    let new_matches = if is_truthy(query.rescan.as_deref()) {
        let limit = parse_limit(query.limit.as_deref(), DEFAULT_RESCAN_LIMIT);
        Some(relay.scan_recent(limit).await.len())
    } else {
        None
    };

    let results = relay.snapshot();
    Json(ResultsResponse {
        success: true,
        total_results: results.len(),
        results,
        processed_blocks: relay.store().processed_count(),
        new_matches,
    })
}

async fn scan(State(relay): State<Arc<Relay>>, Query(query): Query<ScanQuery>) -> impl IntoResponse {
    let limit = parse_limit(query.limit.as_deref(), DEFAULT_SCAN_LIMIT);
    let results = relay.scan_recent(limit).await;
    Json(ScanResponse {
        success: true,
        scanned: limit,
        found: results.len(),
        results,
    })
}

async fn check_block(State(relay): State<Arc<Relay>>, Path(hash): Path<String>) -> impl IntoResponse {
    let response = match relay.check_block(&hash).await {
        Some(record) => BlockCheckResponse {
            success: true,
            found: true,
            result: Some(record),
            message: None,
        },
        None => BlockCheckResponse {
            success: true,
            found: false,
            result: None,
            message: Some(NOT_FOUND_TEXT.to_string()),
        },
    };
    Json(response)
}

async fn stats(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    Json(StatsResponse {
        success: true,
        stats: relay.stats(),
    })
}

async fn health(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    Json(HealthResponse {
        success: true,
        status: "healthy",
        health: relay.health(),
    })
}

async fn subscribe_socket(State(relay): State<Arc<Relay>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| subscriber_session(socket, relay))
}

/// Drive one subscriber connection until either side closes
async fn subscriber_session(socket: WebSocket, relay: Arc<Relay>) {
    let (mut sink, mut stream) = socket.split();
    let Subscription { id, mut receiver } = relay.hub().register();
    info!("Subscriber {} connected ({} total)", id, relay.hub().len());

    if let Err(e) = relay.hub().send_to(id, &relay.welcome()) {
        warn!("Failed to greet subscriber {}: {}", id, e);
    }

    let mut writer = tokio::spawn(async move {
        while let Some(text) = receiver.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("Subscriber {} read error: {}", id, e);
                        break;
                    }
                };
                let reply = relay.handle_client_text(&text);
                if let Err(e) = relay.hub().send_to(id, &reply) {
                    warn!("Failed to answer subscriber {}: {}", id, e);
                }
            }
        }
    }

    relay.hub().remove(id);
    writer.abort();
    info!("Subscriber {} disconnected ({} remaining)", id, relay.hub().len());
}
