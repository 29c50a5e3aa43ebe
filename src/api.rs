//! Control API: lets clients and peers read and write the store.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::future::join_all;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::client::PeerClient;
use crate::gossip::Membership;
use crate::pull::Puller;
use crate::store::{MergeSource, Store};
use crate::types::ServiceSpec;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutSummary {
    pub accepted: Vec<String>,
    /// Stale, unchanged or invalid records.
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullFanout {
    pub reached: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub puller: Arc<Puller>,
    pub membership: Arc<dyn Membership>,
    pub client: PeerClient,
    pub api_key: Option<Arc<str>>,
}

enum ApiError {
    BadRequest(String),
    NotFound,
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::Upstream(message) => (StatusCode::BAD_GATEWAY, message).into_response(),
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    let guarded = Router::new()
        .route("/v1/services", get(get_services).put(put_services))
        .route("/v1/services/:name", get(get_service))
        .route("/v1/pull/:name", get(pull))
        .route("/v1/propagate-and-pull/:name", get(propagate_and_pull))
        .route("/v1/members", get(members))
        .route_layer(middleware::from_fn_with_state(state.clone(), authorize));
    Router::new()
        .route("/v1/health", get(health))
        .merge(guarded)
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    info!("Control API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

async fn authorize(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(key) = &state.api_key {
        let given = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if given != Some(key.as_ref()) {
            warn!("Rejected unauthorized request to {}", request.uri().path());
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(request).await
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn put_services(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PutSummary>, ApiError> {
    let blobs: Vec<String> =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let specs = blobs
        .iter()
        .map(|blob| ServiceSpec::decode(blob))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    // Accepted specs are written to disk, so merge off the async workers.
    let store = state.store.clone();
    let summary = tokio::task::spawn_blocking(move || merge_pushed(&store, specs))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(summary))
}

fn merge_pushed(store: &Store, specs: Vec<ServiceSpec>) -> PutSummary {
    let mut summary = PutSummary::default();
    for spec in specs {
        let name = spec.name.clone();
        match store.merge(spec, MergeSource::Peer) {
            Ok(true) => summary.accepted.push(name),
            Ok(false) => summary.rejected.push(name),
            Err(e) => {
                warn!("Rejected pushed service {}: {}", name, e);
                summary.rejected.push(name);
            }
        }
    }
    summary
}

async fn get_services(State(state): State<AppState>) -> Json<Vec<ServiceSpec>> {
    Json(state.store.list())
}

/// An unknown name answers 200 with an empty body.
async fn get_service(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.store.get(&name) {
        Some(spec) => Json(spec).into_response(),
        None => StatusCode::OK.into_response(),
    }
}

async fn pull(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    info!("Received pull for {}", name);
    let spec = state.store.get(&name).ok_or(ApiError::NotFound)?;
    state
        .puller
        .pull(&spec)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    Ok(StatusCode::OK)
}

/// Asks every known member, this node included, to pull `name` now.
async fn propagate_and_pull(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<PullFanout> {
    info!("Received pull and propagate for {}", name);
    let members = state.membership.members();
    let calls = members.iter().map(|member| {
        let client = &state.client;
        let name = &name;
        async move { (member, client.pull(&member.base_url(), name).await) }
    });

    let mut fanout = PullFanout::default();
    for (member, result) in join_all(calls).await {
        match result {
            Ok(()) => fanout.reached += 1,
            Err(e) => {
                warn!("Failed to broadcast pull to {}: {}", member.id, e);
                fanout.failed += 1;
            }
        }
    }
    Json(fanout)
}

async fn members(State(state): State<AppState>) -> Json<Vec<crate::gossip::Member>> {
    Json(state.membership.members())
}
