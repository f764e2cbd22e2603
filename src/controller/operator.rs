//! Operator endpoints: each one drives an agent action over its control
//! connection and, for streams, a bridge.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, info_span, warn, Instrument};

use super::bridge::{body_stream, meta_from_headers, stream_response};
use super::{agent_error, api_error, bridge_error, disconnected, send_failed, ApiError, ControllerState};
use crate::auth::check_query_token;
use crate::bridge::{BridgeHandle, BridgeStream, Callbacks, Direction, Outcome, StreamMeta};
use crate::channel::Outbound;
use crate::protocol::{act, Packet};

/// `GET /api/devices`
pub(super) async fn list_devices(State(state): State<ControllerState>) -> Json<Value> {
    let devices = state.devices.read().await;
    let now_ms = state.now_ms();
    let list: Vec<Value> = devices
        .values()
        .map(|d| {
            let hb_ago_ms = now_ms.saturating_sub(d.last_heartbeat_ms.load(Ordering::Relaxed));
            #[allow(clippy::cast_possible_truncation)]
            let connected_ms = d.connected_since.elapsed().as_millis() as u64;
            json!({
                "id": d.id,
                "info": d.info,
                "last_heartbeat_ago_ms": hb_ago_ms,
                "connected_since_ms": connected_ms,
            })
        })
        .collect();
    Json(json!({"devices": list}))
}

#[derive(Deserialize)]
pub(super) struct ListRequest {
    path: String,
}

/// `POST /api/device/{id}/files/list`
pub(super) async fn list_files(
    State(state): State<ControllerState>,
    Path(device): Path<String>,
    Json(req): Json<ListRequest>,
) -> Result<Json<Value>, ApiError> {
    let reply = state.call(&device, act::LIST_FILES, json!({"path": req.path})).await?;
    Ok(Json(Value::Object(reply.data)))
}

#[derive(Deserialize)]
pub(super) struct RemoveRequest {
    files: Vec<String>,
}

/// `POST /api/device/{id}/files/remove`
pub(super) async fn remove_files(
    State(state): State<ControllerState>,
    Path(device): Path<String>,
    Json(req): Json<RemoveRequest>,
) -> Result<Json<Value>, ApiError> {
    state.call(&device, act::REMOVE_FILES, json!({"files": req.files})).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
pub(super) struct GetRequest {
    files: Vec<String>,
    #[serde(default)]
    start: u64,
    #[serde(default)]
    end: u64,
}

/// `POST /api/device/{id}/files/get`: a single file (optionally a byte range)
/// or a ZIP archive of everything named.
pub(super) async fn get_files(
    State(state): State<ControllerState>,
    Path(device): Path<String>,
    Json(req): Json<GetRequest>,
) -> Result<Response, ApiError> {
    if req.files.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "No files requested"));
    }
    let data = json!({"files": req.files, "start": req.start, "end": req.end});
    let stream = push_from_agent(&state, &device, act::UPLOAD_FILES, data).await?;
    Ok(stream_response(stream, "application/octet-stream"))
}

#[derive(Deserialize)]
pub(super) struct TextRequest {
    path: String,
}

/// `POST /api/device/{id}/files/text`: a small text file, with its detected
/// encoding in `FileEncoding`.
pub(super) async fn get_text_file(
    State(state): State<ControllerState>,
    Path(device): Path<String>,
    Json(req): Json<TextRequest>,
) -> Result<Response, ApiError> {
    let stream = push_from_agent(&state, &device, act::UPLOAD_TEXT_FILE, json!({"path": req.path})).await?;
    Ok(stream_response(stream, "text/plain"))
}

/// `GET /api/device/{id}/screenshot`
pub(super) async fn screenshot(
    State(state): State<ControllerState>,
    Path(device): Path<String>,
) -> Result<Response, ApiError> {
    let stream = push_from_agent(&state, &device, act::SCREENSHOT, json!({})).await?;
    Ok(stream_response(stream, "image/png"))
}

#[derive(Deserialize)]
pub(super) struct UploadQuery {
    /// Destination directory on the agent.
    path: String,
    /// Destination file name.
    name: String,
}

/// `PUT /api/device/{id}/files/upload?path=<dir>&name=<file>`: stream the
/// request body into a file on the agent.
pub(super) async fn upload_file(
    State(state): State<ControllerState>,
    Path(device): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Value>, ApiError> {
    let outbound = state.outbound(&device).await?;
    let bridge = uuid::Uuid::new_v4().to_string();
    let meta = StreamMeta {
        file_name: Some(query.name.clone()),
        ..meta_from_headers(&headers)
    };
    let source = BridgeStream::new(meta, body_stream(body));
    let handle = state
        .bridges
        .open(&bridge, Direction::Pull(source), finish_logger(&bridge, act::FETCH_FILE))
        .map_err(|e| bridge_error(&e))?;

    let event = uuid::Uuid::new_v4().to_string();
    let mut reply = state.expect_reply(&device, &event);
    let data = json!({"dir": query.path, "file": query.name, "bridge": &bridge});
    if outbound.send(Packet::action(act::FETCH_FILE, data).with_event(&event)).await.is_err() {
        state.events.remove_event(&event);
        return Err(send_failed());
    }

    let finished = handle.finished();
    tokio::pin!(finished);
    let result = tokio::select! {
        outcome = &mut finished => match outcome {
            // The agent answers once the file is in place.
            Ok(Outcome::Completed) => {
                match tokio::time::timeout(state.config.controller.call_timeout(), &mut reply).await {
                    Ok(Ok(p)) if p.is_ok() => Ok(p),
                    Ok(Ok(p)) => Err(agent_error(&p)),
                    Ok(Err(_)) => Err(disconnected()),
                    Err(_) => Err(api_error(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", "Device did not confirm the upload")),
                }
            }
            Ok(Outcome::Failed) => Err(api_error(StatusCode::BAD_GATEWAY, "STREAM_FAILED", "Upload stream interrupted")),
            Err(e) => Err(bridge_error(&e)),
        },
        r = &mut reply => match r {
            Ok(p) if p.is_ok() => Ok(p),
            Ok(p) => Err(agent_error(&p)),
            Err(_) => Err(disconnected()),
        },
    };
    state.events.remove_event(&event);
    let reply = result?;
    info!(device = %device, bridge = %bridge, "Upload delivered");
    Ok(Json(json!({"ok": true, "size": reply.get_u64("size")})))
}

fn finish_logger(bridge: &str, action: &'static str) -> Callbacks {
    let matched = bridge.to_string();
    let finished = bridge.to_string();
    Callbacks::new()
        .on_push(move |meta| {
            debug!(bridge = %matched, action, file = ?meta.file_name, len = ?meta.content_length, "Agent joined bridge");
        })
        .on_finish(move |outcome| {
            debug!(bridge = %finished, action, ?outcome, "Bridge finished");
        })
}

/// Ask the agent to upload over a fresh push bridge and wait for the stream.
///
/// An error callback from the agent before its upload arrives cancels the
/// bridge. The returned stream completes the bridge when the response body is
/// drained or dropped.
async fn push_from_agent(
    state: &ControllerState,
    device: &str,
    action: &'static str,
    mut data: Value,
) -> Result<BridgeStream, ApiError> {
    let outbound = state.outbound(device).await?;
    let bridge = uuid::Uuid::new_v4().to_string();
    let mut handle = state
        .bridges
        .open(&bridge, Direction::Push, finish_logger(&bridge, action))
        .map_err(|e| bridge_error(&e))?;

    let event = uuid::Uuid::new_v4().to_string();
    let reply = state.expect_reply(device, &event);
    data["bridge"] = json!(&bridge);
    if outbound.send(Packet::action(action, data).with_event(&event)).await.is_err() {
        state.events.remove_event(&event);
        return Err(send_failed());
    }

    let result = await_push(&mut handle, reply).await;
    state.events.remove_event(&event);
    if let Err((status, _)) = &result {
        warn!(device, bridge = %bridge, action, %status, "Agent upload failed");
    }
    result
}

async fn await_push(handle: &mut BridgeHandle, mut reply: oneshot::Receiver<Packet>) -> Result<BridgeStream, ApiError> {
    let accept = handle.accept();
    tokio::pin!(accept);
    let mut replied = false;
    loop {
        tokio::select! {
            res = &mut accept => return res.map_err(|e| bridge_error(&e)),
            r = &mut reply, if !replied => match r {
                Ok(p) if !p.is_ok() => return Err(agent_error(&p)),
                // A success callback can race the push; keep waiting for it.
                Ok(_) => replied = true,
                Err(_) => return Err(disconnected()),
            },
        }
    }
}

#[derive(Deserialize)]
pub(super) struct TerminalQuery {
    token: Option<String>,
    width: Option<u64>,
    height: Option<u64>,
}

/// `GET /api/device/{id}/terminal?token=<secret>[&width=&height=]`
///
/// Relays one agent terminal to the operator's WebSocket. Operator frames are
/// packets with `act` in `inputTerminal`, `resizeTerminal`, `killTerminal`;
/// the terminal id is filled in here. Agent callbacks (`outputTerminal`,
/// `quitTerminal`, errors) are forwarded verbatim.
pub(super) async fn terminal_ws(
    State(state): State<ControllerState>,
    Path(device): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = check_query_token(&state.config.auth.token, query.token.as_deref()) {
        return e.into_response();
    }
    let outbound = match state.outbound(&device).await {
        Ok(o) => o,
        Err(e) => return e.into_response(),
    };
    let terminal = uuid::Uuid::new_v4().to_string();
    let mut init = json!({"terminal": &terminal});
    if let (Some(w), Some(h)) = (query.width, query.height) {
        init["width"] = json!(w);
        init["height"] = json!(h);
    }
    ws.on_upgrade(move |socket| {
        let span = info_span!("terminal", device = %device, terminal = %terminal);
        relay_terminal(socket, state, device, outbound, terminal, init).instrument(span)
    })
}

/// Agent output packets buffered per terminal before the operator is
/// considered too slow and the terminal is closed.
const TERMINAL_BACKLOG: usize = 1024;

/// How a terminal relay loop ended.
#[derive(Debug, PartialEq, Eq)]
enum RelayEnd {
    /// The agent sent `quitTerminal` or an error.
    Quit,
    /// The device disconnected or its control channel closed.
    DeviceGone,
    /// The operator socket closed or failed.
    OperatorLeft,
    /// The operator fell `TERMINAL_BACKLOG` packets behind.
    Overflow,
}

/// Event handler feeding agent output into a bounded queue. A full queue
/// trips `overflow` instead of growing.
fn output_handler(tx: mpsc::Sender<Packet>, overflow: Arc<Notify>) -> impl Fn(Packet) + Send + Sync + 'static {
    move |packet| match tx.try_send(packet) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(_)) => overflow.notify_one(),
    }
}

async fn relay_terminal(
    socket: WebSocket,
    state: ControllerState,
    device: String,
    outbound: Outbound,
    terminal: String,
    init: Value,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let event = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<Packet>(TERMINAL_BACKLOG);
    let overflow = Arc::new(Notify::new());
    state
        .events
        .on_event(&device, &event, output_handler(tx, Arc::clone(&overflow)));

    if outbound.send(Packet::action(act::INIT_TERMINAL, init).with_event(&event)).await.is_err() {
        state.events.remove_event(&event);
        return;
    }
    info!("Terminal opened");

    let end = relay_frames(
        &mut ws_sink,
        &mut ws_stream,
        &mut rx,
        &overflow,
        &outbound,
        &terminal,
        &event,
    )
    .await;
    if end == RelayEnd::Overflow {
        warn!(backlog = TERMINAL_BACKLOG, "Operator too slow for terminal output, closing");
    }
    if matches!(end, RelayEnd::OperatorLeft | RelayEnd::Overflow) {
        let kill = Packet::action(act::KILL_TERMINAL, json!({"terminal": &terminal})).with_event(&event);
        let _ = outbound.send(kill).await;
    }
    // The agent's quit notification for the kill above has nowhere to go.
    state.events.remove_event(&event);
    if end != RelayEnd::Overflow {
        let _ = ws_sink.close().await;
    }
    info!(?end, "Terminal closed");
}

/// Shuttle agent output to the operator and operator input to the agent
/// until either side ends.
async fn relay_frames<S, R>(
    sink: &mut S,
    stream: &mut R,
    rx: &mut mpsc::Receiver<Packet>,
    overflow: &Notify,
    outbound: &Outbound,
    terminal: &str,
    event: &str,
) -> RelayEnd
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        tokio::select! {
            () = overflow.notified() => return RelayEnd::Overflow,
            packet = rx.recv() => {
                // None: the device disconnected and its handlers were dropped.
                let Some(packet) = packet else { return RelayEnd::DeviceGone };
                let last = packet.act == act::QUIT_TERMINAL || !packet.is_ok();
                let sent = tokio::select! {
                    res = sink.send(Message::Text(packet.to_text().into())) => res.is_ok(),
                    () = overflow.notified() => return RelayEnd::Overflow,
                };
                if !sent {
                    return RelayEnd::OperatorLeft;
                }
                if last {
                    return RelayEnd::Quit;
                }
            }
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { return RelayEnd::OperatorLeft };
                match msg {
                    Message::Text(text) => {
                        let Ok(mut packet) = Packet::from_text(&text) else { continue };
                        if !matches!(
                            packet.act.as_str(),
                            act::INPUT_TERMINAL | act::RESIZE_TERMINAL | act::KILL_TERMINAL
                        ) {
                            debug!(act = %packet.act, "Ignoring operator frame");
                            continue;
                        }
                        packet.data.insert("terminal".into(), json!(terminal));
                        packet.event = event.to_string();
                        if outbound.send(packet).await.is_err() {
                            return RelayEnd::DeviceGone;
                        }
                    }
                    Message::Close(_) => return RelayEnd::OperatorLeft,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Operator socket whose send buffer never drains.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn output(n: u8) -> Packet {
        Packet::action(act::OUTPUT_TERMINAL, json!({"terminal": "t", "output": hex::encode([n])}))
    }

    fn silent_operator() -> futures::stream::Pending<Result<Message, axum::Error>> {
        futures::stream::pending()
    }

    #[tokio::test]
    async fn test_stalled_operator_overflows_backlog() {
        let (outbound, _agent_rx) = Outbound::channel(16);
        let (tx, mut rx) = mpsc::channel(2);
        let overflow = Arc::new(Notify::new());
        let handler = output_handler(tx, Arc::clone(&overflow));
        handler(output(0));
        handler(output(1));

        let mut sink = StalledSink;
        let mut stream = silent_operator();
        let relay = relay_frames(&mut sink, &mut stream, &mut rx, &overflow, &outbound, "t", "ev");
        tokio::pin!(relay);
        // One packet is taken off the queue, then the send blocks.
        assert!(timeout(Duration::from_millis(50), &mut relay).await.is_err());

        handler(output(2));
        handler(output(3));
        let end = timeout(Duration::from_secs(5), relay).await.unwrap();
        assert_eq!(end, RelayEnd::Overflow);
    }

    #[tokio::test]
    async fn test_output_forwarded_until_quit() {
        let (outbound, _agent_rx) = Outbound::channel(16);
        let (tx, mut rx) = mpsc::channel(TERMINAL_BACKLOG);
        let overflow = Arc::new(Notify::new());
        let handler = output_handler(tx, Arc::clone(&overflow));
        handler(output(7));
        handler(Packet::action(act::QUIT_TERMINAL, json!({"terminal": "t"})));

        let mut sink = futures::sink::drain();
        let mut stream = silent_operator();
        let end = relay_frames(&mut sink, &mut stream, &mut rx, &overflow, &outbound, "t", "ev").await;
        assert_eq!(end, RelayEnd::Quit);
    }

    #[tokio::test]
    async fn test_operator_frames_tagged_and_filtered() {
        let (outbound, mut agent_rx) = Outbound::channel(16);
        let (_tx, mut rx) = mpsc::channel::<Packet>(TERMINAL_BACKLOG);
        let overflow = Notify::new();

        let frames: Vec<Result<Message, axum::Error>> = vec![
            Ok(Message::Text(
                Packet::action(act::LIST_FILES, json!({"path": "/"})).to_text().into(),
            )),
            Ok(Message::Text(
                Packet::action(act::INPUT_TERMINAL, json!({"terminal": "other", "input": "6869"}))
                    .to_text()
                    .into(),
            )),
            Ok(Message::Close(None)),
        ];
        let mut stream = futures::stream::iter(frames);
        let mut sink = futures::sink::drain();
        let end = relay_frames(&mut sink, &mut stream, &mut rx, &overflow, &outbound, "t1", "ev-1").await;
        assert_eq!(end, RelayEnd::OperatorLeft);

        let forwarded = agent_rx.recv().await.unwrap();
        assert_eq!(forwarded.act, act::INPUT_TERMINAL);
        assert_eq!(forwarded.get_str("terminal"), Some("t1"));
        assert_eq!(forwarded.get_str("input"), Some("6869"));
        assert_eq!(forwarded.event, "ev-1");
        assert!(agent_rx.try_recv().is_err());
    }
}
