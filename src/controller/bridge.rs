//! Agent-facing bridge endpoints.
//!
//! `PUT /api/bridge/push?bridge=<id>` carries an agent upload to the operator
//! waiting on a push bridge; the request is answered only once the operator
//! side has finished with the stream. `GET /api/bridge/pull?bridge=<id>`
//! hands the agent the body an operator is uploading.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
    Json,
};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{api_error, bridge_error, ApiError, ControllerState};
use crate::bridge::{BridgeStream, ByteStream, Outcome, StreamMeta};

#[derive(Deserialize)]
pub(super) struct BridgeQuery {
    bridge: String,
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .filter(|s| !s.is_empty())
}

fn header_u64(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Stream metadata from `FileName`, `FileSize`, `FileEncoding` and
/// `Content-Length`.
pub(super) fn meta_from_headers(headers: &HeaderMap) -> StreamMeta {
    StreamMeta {
        file_name: header_str(headers, "FileName"),
        file_size: header_u64(headers, "FileSize"),
        encoding: header_str(headers, "FileEncoding"),
        content_length: header_u64(headers, header::CONTENT_LENGTH),
    }
}

/// A request body as a bridge byte stream.
pub(super) fn body_stream(body: Body) -> ByteStream {
    Box::pin(body.into_data_stream().map_err(std::io::Error::other))
}

/// Response carrying `stream`, with its metadata mirrored into headers.
pub(super) fn stream_response(stream: BridgeStream, content_type: &str) -> Response {
    let meta = &stream.meta;
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    if let Some(name) = &meta.file_name {
        if let Ok(v) = HeaderValue::from_str(&content_disposition(name)) {
            builder = builder.header(header::CONTENT_DISPOSITION, v);
        }
        if let Ok(v) = HeaderValue::from_bytes(name.as_bytes()) {
            builder = builder.header("FileName", v);
        }
    }
    if let Some(size) = meta.file_size {
        builder = builder.header("FileSize", size);
    }
    if let Some(encoding) = &meta.encoding {
        if let Ok(v) = HeaderValue::from_str(encoding) {
            builder = builder.header("FileEncoding", v);
        }
    }
    if let Some(len) = meta.content_length {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }
    builder
        .body(Body::from_stream(stream.body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 UTF-8 name.
pub(super) fn content_disposition(name: &str) -> String {
    let ascii: String = name
        .chars()
        .map(|c| if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' { c } else { '_' })
        .collect();
    let mut encoded = String::with_capacity(name.len() * 3);
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b) {
            encoded.push(char::from(b));
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}

/// `PUT /api/bridge/push?bridge=<id>`
pub(super) async fn push(
    State(state): State<ControllerState>,
    Query(query): Query<BridgeQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Value>, ApiError> {
    let meta = meta_from_headers(&headers);
    let stream = BridgeStream::new(meta, body_stream(body));
    let done = state
        .bridges
        .match_push(&query.bridge, stream)
        .map_err(|e| {
            warn!(bridge = %query.bridge, error = %e, "Rejected push");
            bridge_error(&e)
        })?;

    match done.await {
        Ok(Outcome::Completed) => Ok(Json(json!({"ok": true}))),
        Ok(Outcome::Failed) | Err(_) => {
            debug!(bridge = %query.bridge, "Push stream not fully consumed");
            Err(api_error(
                StatusCode::BAD_GATEWAY,
                "STREAM_FAILED",
                "Operator stopped reading the stream",
            ))
        }
    }
}

/// `GET /api/bridge/pull?bridge=<id>`
pub(super) async fn pull(
    State(state): State<ControllerState>,
    Query(query): Query<BridgeQuery>,
) -> Result<Response, ApiError> {
    let stream = state.bridges.match_pull(&query.bridge).map_err(|e| {
        warn!(bridge = %query.bridge, error = %e, "Rejected pull");
        bridge_error(&e)
    })?;
    Ok(stream_response(stream, "application/octet-stream"))
}
