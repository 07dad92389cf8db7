use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use relay_proto::{Envelope, RequestType};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::CallError;
use crate::pending::{CallResult, ResponseEncoding, ResponseSink, SinkMetadata};
use crate::state::AppState;
use crate::websocket::websocket_handler;

pub const API_KEY_HEADER: &str = "x-api-key";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/relay", get(websocket_handler))
        .route("/clients", get(list_clients))
        .route("/api/:request_type", post(call_client))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.registry.len(),
        "pendingRequests": state.pending.len(),
        "uptimeSecs": state.started.elapsed().as_secs(),
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

/// Returns the caller's group key: the presented key, once it matches the
/// shared secret.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented.is_empty() || presented != state.config.shared_secret {
        return Err(error_response(StatusCode::UNAUTHORIZED, "invalid or missing api key"));
    }
    Ok(presented.to_string())
}

async fn list_clients(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let group_key = match authorize(&state, &headers) {
        Ok(group_key) => group_key,
        Err(response) => return response,
    };
    let clients = state.registry.connected_clients(&group_key);
    Json(json!({ "success": true, "clients": clients })).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallQuery {
    client_id: String,
    timeout_ms: Option<u64>,
    encoding: Option<String>,
    filename: Option<String>,
}

fn parse_encoding(raw: &str) -> Option<ResponseEncoding> {
    match raw {
        "json" => Some(ResponseEncoding::Json),
        "raw" => Some(ResponseEncoding::Raw),
        _ => None,
    }
}

fn parse_payload(body: &[u8]) -> Result<Map<String, Value>, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "request body must be a JSON object",
        )),
        Err(err) => Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid JSON body: {err}"),
        )),
    }
}

async fn call_client(
    State(state): State<AppState>,
    Path(request_type): Path<String>,
    Query(query): Query<CallQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let request_type: RequestType = match request_type.parse() {
        Ok(request_type) => request_type,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("{err}")),
    };
    let payload = match parse_payload(&body) {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    let timeout = query.timeout_ms.map(Duration::from_millis);

    let Some(encoding) = query.encoding.as_deref() else {
        return match state
            .dispatcher
            .call(request_type, &query.client_id, payload, timeout)
            .await
        {
            Ok(result) => Json(result).into_response(),
            Err(err) => err.into_response(),
        };
    };

    let Some(encoding) = parse_encoding(encoding) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unsupported encoding `{encoding}`"),
        );
    };
    let (tx, rx) = oneshot::channel();
    let request_id = state.dispatcher.call_into_sink(
        request_type,
        &query.client_id,
        payload,
        timeout,
        Box::new(HttpSink(tx)),
        SinkMetadata {
            encoding,
            filename: query.filename,
        },
    );
    match rx.await {
        Ok(response) => response,
        Err(_) => CallError::Abandoned(request_id).into_response(),
    }
}

/// Writes a call's outcome back to a waiting HTTP handler.
struct HttpSink(oneshot::Sender<Response>);

impl ResponseSink for HttpSink {
    fn finish(self: Box<Self>, outcome: CallResult, metadata: &SinkMetadata) {
        let response = match outcome {
            Ok(result) => render_result(result, metadata),
            Err(err) => err.into_response(),
        };
        if self.0.send(response).is_err() {
            warn!("http caller went away before its response was ready");
        }
    }
}

fn render_result(result: Envelope, metadata: &SinkMetadata) -> Response {
    match metadata.encoding {
        ResponseEncoding::Json => Json(result).into_response(),
        ResponseEncoding::Raw => render_raw(&result, metadata),
    }
}

fn render_raw(result: &Envelope, metadata: &SinkMetadata) -> Response {
    let Some(encoded) = result.get("data").and_then(Value::as_str) else {
        return error_response(StatusCode::BAD_GATEWAY, "result carries no base64 `data`");
    };
    let bytes = match STANDARD.decode(encoded) {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                format!("result `data` is not valid base64: {err}"),
            )
        }
    };
    let mime_type = result
        .get("mimeType")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream");

    let mut response = bytes.into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(filename) = &metadata.filename {
        let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    response
}
