//! HTTP route handlers
//!
//! `/auth` and `/{endpoint}/auth` run the decision pipeline; `/health`,
//! `/healthz`, and `/explain` report the snapshot and cache state;
//! `/metrics` exposes the Prometheus registry. Decision bodies are
//! intentionally minimal: whatever the response policy rendered, nothing
//! auto-generated. Diagnostics belong to `/explain`, logs, and metrics.

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::error::Error;
use crate::pipeline::state::{RawRequest, RequestState};
use crate::rules::snapshot::{EndpointSnapshot, SkippedDefinition};
use crate::state::AppState;

/// Decision handler for the root endpoint
pub async fn auth_root(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    run_auth(state, None, peer, request).await
}

/// Decision handler for a named endpoint
pub async fn auth_endpoint(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    run_auth(state, Some(endpoint), peer, request).await
}

async fn run_auth(
    state: AppState,
    endpoint: Option<String>,
    peer: SocketAddr,
    request: Request<Body>,
) -> Response {
    let snapshot = state.snapshot().await;
    let Some(definition) = snapshot.resolve(endpoint.as_deref()) else {
        return endpoint_not_found(&snapshot, endpoint.as_deref());
    };

    let correlation_header = state.correlation_header();
    let raw = raw_request(&request, &correlation_header);
    let mut request_state = RequestState::new(
        raw,
        &definition.name,
        state.environment(),
        state.secrets(),
    );

    state
        .pipeline()
        .execute(&mut request_state, &definition, peer.ip())
        .await;

    decision_response(request_state, &correlation_header)
}

/// Convert the evaluated request state into the HTTP response
fn decision_response(state: RequestState, correlation_header: &str) -> Response {
    let status = StatusCode::from_u16(state.response.status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = axum::http::Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        for (name, value) in &state.response.headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            let Ok(value) = HeaderValue::try_from(value.as_str()) else {
                continue;
            };
            headers.insert(name, value);
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(correlation_header),
            HeaderValue::try_from(state.correlation_id.as_str()),
        ) {
            headers.insert(name, value);
        }
    }

    response
        .body(Body::from(state.response.message))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Capture the immutable request facts the pipeline operates on
fn raw_request(request: &Request<Body>, correlation_header: &str) -> RawRequest {
    let mut headers = BTreeMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .or_insert_with(|| value.to_string());
        }
    }

    let mut query = BTreeMap::new();
    if let Some(raw_query) = request.uri().query() {
        for (name, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
            query
                .entry(name.to_lowercase())
                .or_insert_with(|| value.into_owned());
        }
    }

    let correlation_id = headers
        .get(correlation_header)
        .cloned()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let host = headers
        .get("host")
        .cloned()
        .or_else(|| request.uri().host().map(String::from))
        .unwrap_or_default();

    RawRequest {
        method: request.method().as_str().to_string(),
        path: request.uri().path().to_string(),
        host,
        headers,
        query,
        correlation_id,
    }
}

/// 404 body listing what is actually served
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotFoundResponse {
    error: String,
    available_endpoints: Vec<String>,
}

fn endpoint_not_found(snapshot: &EndpointSnapshot, requested: Option<&str>) -> Response {
    let error = match requested {
        Some(name) => format!("unknown endpoint {name:?}"),
        None => "no root endpoint configured".to_string(),
    };
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundResponse {
            error,
            available_endpoints: snapshot.available(),
        }),
    )
        .into_response()
}

/// Health and explain payload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// "ok" or "degraded"
    pub status: String,

    /// Stored cache entries
    pub cache_entries: u64,

    /// Observation time
    pub observed_at: DateTime<Utc>,

    /// The deny-all fallback endpoint is serving
    #[serde(skip_serializing_if = "Option::is_none")]
    pub using_fallback: Option<bool>,

    /// Rule source labels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_sources: Option<Vec<String>>,

    /// Quarantined definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_definitions: Option<Vec<SkippedDefinition>>,

    /// Served endpoint names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_endpoints: Option<Vec<String>>,

    /// Endpoint hint for scoped explain requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// `GET /health` and `GET /healthz`
pub async fn health(State(state): State<AppState>) -> Response {
    health_payload(&state, None, false).await
}

/// `GET /{endpoint}/healthz`
pub async fn health_endpoint(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
) -> Response {
    health_payload(&state, Some(endpoint), false).await
}

/// `GET /explain`
pub async fn explain(State(state): State<AppState>) -> Response {
    health_payload(&state, None, true).await
}

/// `GET /{endpoint}/explain`
pub async fn explain_endpoint(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
) -> Response {
    health_payload(&state, Some(endpoint), true).await
}

async fn health_payload(state: &AppState, scoped: Option<String>, hint: bool) -> Response {
    let snapshot = state.snapshot().await;

    if let Some(name) = &scoped {
        if snapshot.resolve(Some(name)).is_none() {
            return endpoint_not_found(&snapshot, Some(name));
        }
    }

    let payload = HealthResponse {
        status: if snapshot.degraded() {
            "degraded".to_string()
        } else {
            "ok".to_string()
        },
        cache_entries: state.cache().entry_count().await,
        observed_at: Utc::now(),
        using_fallback: snapshot.using_fallback.then_some(true),
        rule_sources: (!snapshot.rule_sources.is_empty()).then(|| snapshot.rule_sources.clone()),
        skipped_definitions: (!snapshot.skipped.is_empty()).then(|| snapshot.skipped.clone()),
        available_endpoints: Some(snapshot.available()),
        endpoint: if hint { scoped } else { None },
    };

    (StatusCode::OK, Json(payload)).into_response()
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> Result<Response, Error> {
    let body = state.metrics().render()?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
