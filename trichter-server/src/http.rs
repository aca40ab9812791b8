//! HTTP surface: the ranked snapshot, run mutations and the SSE stream.
//!
//! Every mutation handler resolves the caller, hands the request to
//! [`RunService`] and maps the outcome to JSON. Failures are always
//! `{"success": false, "error": "..."}`.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use trichter_core::NewRun;
use trichter_live::{
    Actor, IngestCredentials, MutationError, RunService, SessionLookup, StreamEndpoint,
    StreamError,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: RunService,
    pub endpoint: StreamEndpoint,
    pub sessions: Arc<dyn SessionLookup>,
    pub ingest: Option<IngestCredentials>,
}

/// Handler failure, rendered as a JSON error body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("malformed request body: {0}")]
    BadRequest(String),
    #[error("stream unavailable: {0}")]
    Unavailable(#[from] StreamError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Mutation(MutationError::Validation(_)) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Mutation(MutationError::Unauthorized) => StatusCode::UNAUTHORIZED,
            Self::Mutation(MutationError::Forbidden(_)) => StatusCode::FORBIDDEN,
            Self::Mutation(MutationError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Mutation(MutationError::Persistence(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Storage details stay in the log.
        let message = match &self {
            Self::Mutation(MutationError::Persistence(_)) => "internal server error".to_string(),
            other => other.to_string(),
        };
        let mut response = (status, Json(json!({ "success": false, "error": message })))
            .into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"Secure Area\""),
            );
        }
        response
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/runs", get(list_runs).post(create_run))
        .route("/api/v1/runs/sse", get(open_stream).post(open_stream))
        .route("/api/v1/runs/{id}", patch(rename_run).delete(delete_run))
        .route("/api/v1/runs/{id}/claim", post(claim_run))
        .route("/api/v1/runs/{id}/owner", put(assign_owner))
        .route("/api/v1/stats", get(stats))
        .with_state(state)
}

/// Work out who is calling from the `Authorization` header.
///
/// `Basic` must carry the ingest credential; `Bearer` is looked up as a
/// session token. Anything else is anonymous.
pub fn resolve_actor(state: &AppState, headers: &HeaderMap) -> Result<Actor, ApiError> {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Ok(Actor::Anonymous);
    };

    if value.starts_with("Basic ") || value.starts_with("basic ") {
        return match &state.ingest {
            Some(creds) if creds.verify_header(value) => Ok(Actor::Device),
            _ => {
                log::warn!("Rejected device credential");
                Err(MutationError::Unauthorized.into())
            }
        };
    }

    if let Some(token) = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
    {
        return Ok(state
            .sessions
            .viewer(token.trim())
            .map_or(Actor::Anonymous, Actor::Viewer));
    }

    Ok(Actor::Anonymous)
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn success<T: serde::Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(json!({ "success": true, "data": data }))).into_response()
}

async fn list_runs(State(state): State<AppState>) -> Result<Response, ApiError> {
    let runs = state.service.list_ranked().await?;
    Ok(Json(runs).into_response())
}

async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let actor = resolve_actor(&state, &headers)?;
    let input: NewRun = parse_body(&body)?;
    let run = state.service.create(&actor, input).await?;
    Ok(success(StatusCode::CREATED, run))
}

async fn claim_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let actor = resolve_actor(&state, &headers)?;
    let run = state.service.claim(&actor, &id).await?;
    Ok(success(StatusCode::OK, run))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignOwner {
    user_id: String,
}

async fn assign_owner(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let actor = resolve_actor(&state, &headers)?;
    let AssignOwner { user_id } = parse_body(&body)?;
    let run = state.service.assign_owner(&actor, &id, &user_id).await?;
    Ok(success(StatusCode::OK, run))
}

#[derive(Debug, Deserialize)]
struct Rename {
    name: String,
}

async fn rename_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let actor = resolve_actor(&state, &headers)?;
    let Rename { name } = parse_body(&body)?;
    let run = state.service.rename(&actor, &id, &name).await?;
    Ok(success(StatusCode::OK, run))
}

async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let actor = resolve_actor(&state, &headers)?;
    state.service.delete(&actor, &id).await?;
    Ok(success(StatusCode::OK, json!({ "id": id })))
}

async fn open_stream(State(state): State<AppState>) -> Result<Response, ApiError> {
    let stream = state.endpoint.open_stream()?;
    log::debug!("SSE viewer attached as connection {}", stream.subscriber().id());

    let headers = [
        (header::CONTENT_TYPE, "text/event-stream"),
        (header::CACHE_CONTROL, "no-cache"),
        (header::CONNECTION, "keep-alive"),
    ];
    let mut response = (headers, Body::from_stream(stream)).into_response();
    response
        .headers_mut()
        .insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let bus = state.service.bus().stats();
    let endpoint = state.endpoint.stats();
    Json(json!({
        "bus": {
            "eventsPublished": bus.events_published,
            "deliveries": bus.deliveries,
            "listenerFailures": bus.listener_failures,
            "activeListeners": bus.active_listeners,
        },
        "stream": {
            "connectionsOpened": endpoint.connections_opened,
            "connectionsClosed": endpoint.connections_closed,
            "framesSent": endpoint.frames_sent,
            "stalled": endpoint.stalled,
            "activeConnections": endpoint.active_connections,
        },
    }))
}
