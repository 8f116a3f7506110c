//! HTTP facade for the negotiation layer
//!
//! A thin JSON adapter over the lifecycle controller; every route maps 1:1
//! onto a controller operation and carries no semantics of its own. Key and
//! salt material crosses this boundary base64-encoded.

use crate::command::SnapshotRequest;
use crate::controller::{
    AddressFamily, NegotiateRequest, StartRequest, StreamController, TransportDescriptor,
};
use crate::session::StreamCrypto;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub cameras: Arc<HashMap<String, Arc<StreamController>>>,
}

/// JSON response for the camera list
#[derive(Serialize)]
pub struct CameraSummary {
    pub name: String,
    pub active_sessions: usize,
}

/// Per-stream crypto material as it crosses the HTTP boundary
#[derive(Serialize, Deserialize)]
pub struct CryptoBody {
    pub suite: String,
    /// base64-encoded key+salt
    pub key_salt: String,
}

/// JSON request to negotiate a session
#[derive(Deserialize)]
pub struct NegotiateBody {
    pub session_id: String,
    pub controller_address: IpAddr,
    #[serde(default)]
    pub family: AddressFamily,
    pub video: CryptoBody,
    pub audio: CryptoBody,
}

#[derive(Serialize)]
pub struct EndpointBody {
    pub port: u16,
    pub ssrc: u32,
    pub suite: String,
    pub key_salt: String,
}

/// JSON response echoing the negotiated transport parameters
#[derive(Serialize)]
pub struct NegotiateResponse {
    pub session_id: String,
    pub address: IpAddr,
    pub video: EndpointBody,
    pub audio: EndpointBody,
}

#[derive(Serialize)]
pub struct AckResponse {
    pub acknowledged: bool,
}

#[derive(Deserialize)]
pub struct SnapshotQuery {
    pub width: u32,
    pub height: u32,
}

fn endpoint_body(port: u16, ssrc: u32, crypto: &StreamCrypto) -> EndpointBody {
    EndpointBody {
        port,
        ssrc,
        suite: crypto.suite.clone(),
        key_salt: BASE64.encode(&crypto.key_salt),
    }
}

fn descriptor_to_response(session_id: String, d: &TransportDescriptor) -> NegotiateResponse {
    NegotiateResponse {
        session_id,
        address: d.address,
        video: endpoint_body(d.video.port, d.video.ssrc, &d.video.crypto),
        audio: endpoint_body(d.audio.port, d.audio.ssrc, &d.audio.crypto),
    }
}

fn crypto_from_body(body: &CryptoBody) -> Result<StreamCrypto, StatusCode> {
    let key_salt = BASE64
        .decode(&body.key_salt)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok(StreamCrypto {
        suite: body.suite.clone(),
        key_salt,
    })
}

fn lookup(state: &AppState, name: &str) -> Result<Arc<StreamController>, StatusCode> {
    state
        .cameras
        .get(name)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /cameras - list cameras and their live session counts
async fn list_cameras(State(state): State<AppState>) -> Json<Vec<CameraSummary>> {
    let mut cameras = Vec::with_capacity(state.cameras.len());
    for controller in state.cameras.values() {
        cameras.push(CameraSummary {
            name: controller.name().to_string(),
            active_sessions: controller.active_sessions().await,
        });
    }
    Json(cameras)
}

/// GET /cameras/{name}/snapshot - capture a single still frame
async fn snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let controller = lookup(&state, &name)?;
    let request = SnapshotRequest {
        width: query.width,
        height: query.height,
        mode: Default::default(),
    };
    match controller.snapshot(request).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes)),
        Err(e) => {
            log::warn!("snapshot for camera '{}' failed: {}", name, e);
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

/// POST /cameras/{name}/streams - negotiate a session
async fn negotiate(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<NegotiateBody>,
) -> Result<Json<NegotiateResponse>, StatusCode> {
    let controller = lookup(&state, &name)?;
    let request = NegotiateRequest {
        controller_address: body.controller_address,
        family: body.family,
        video_crypto: crypto_from_body(&body.video)?,
        audio_crypto: crypto_from_body(&body.audio)?,
    };
    match controller.negotiate(&body.session_id, request).await {
        Ok(descriptor) => Ok(Json(descriptor_to_response(body.session_id, &descriptor))),
        Err(e) => {
            log::warn!("negotiation for camera '{}' failed: {}", name, e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// POST /cameras/{name}/streams/{id}/start - begin streaming
async fn start_stream(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Json(body): Json<StartRequest>,
) -> Result<Json<AckResponse>, StatusCode> {
    let controller = lookup(&state, &name)?;
    match controller.start(&id, body).await {
        Ok(()) => Ok(Json(AckResponse { acknowledged: true })),
        Err(e) => {
            log::warn!("start for camera '{}' session {} failed: {}", name, id, e);
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

/// POST /cameras/{name}/streams/{id}/reconfigure - acknowledged, not applied
async fn reconfigure_stream(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<AckResponse>, StatusCode> {
    let controller = lookup(&state, &name)?;
    controller.reconfigure(&id, &params).await;
    Ok(Json(AckResponse { acknowledged: true }))
}

/// POST /cameras/{name}/streams/{id}/stop - tear a session down
async fn stop_stream(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Json<AckResponse>, StatusCode> {
    let controller = lookup(&state, &name)?;
    controller.stop(&id).await;
    Ok(Json(AckResponse { acknowledged: true }))
}

/// GET /health - health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/cameras", get(list_cameras))
        .route("/cameras/{name}/snapshot", get(snapshot))
        .route("/cameras/{name}/streams", post(negotiate))
        .route("/cameras/{name}/streams/{id}/start", post(start_stream))
        .route(
            "/cameras/{name}/streams/{id}/reconfigure",
            post(reconfigure_stream),
        )
        .route("/cameras/{name}/streams/{id}/stop", post(stop_stream))
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server until the task is aborted
pub async fn run_http_server(
    state: AppState,
    listen: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("HTTP server listening on {}", listen);

    axum::serve(listener, app).await?;

    Ok(())
}
