//! Agent registration socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{ConnectedDevice, ControllerState};
use crate::auth::check_query_token;
use crate::channel::Outbound;
use crate::protocol::{act, Packet};

/// Outbound packets buffered per agent before senders wait.
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Deserialize)]
pub(super) struct RegisterQuery {
    device: String,
    token: Option<String>,
}

/// Device ids: alphanumeric, dash, underscore, dot, 1-64 chars.
pub(super) fn is_valid_device_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// `GET /api/device/register?device=<id>&token=<secret>`: agent control socket.
pub(super) async fn device_register_ws(
    State(state): State<ControllerState>,
    Query(query): Query<RegisterQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = check_query_token(&state.config.auth.token, query.token.as_deref()) {
        return e.into_response();
    }
    if !is_valid_device_id(&query.device) {
        return (StatusCode::BAD_REQUEST, "Invalid device id").into_response();
    }

    let device = query.device;
    info!(device = %device, "Device connecting...");
    ws.on_upgrade(move |socket| {
        let span = info_span!("device", device = %device);
        handle_device_ws(socket, state, device).instrument(span)
    })
}

async fn handle_device_ws(socket: WebSocket, state: ControllerState, device_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // The first frame must be the agent's registration.
    let register = match ws_stream.next().await {
        Some(Ok(Message::Text(text))) => match Packet::from_text(&text) {
            Ok(p) if p.act == act::REGISTER => p,
            _ => {
                warn!("Device sent invalid registration");
                return;
            }
        },
        _ => {
            warn!("Device disconnected before registration");
            return;
        }
    };

    let (outbound, mut outbound_rx) = Outbound::channel(OUTBOUND_CAPACITY);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let connection = uuid::Uuid::new_v4().to_string();
    let heartbeat_ms = Arc::new(AtomicU64::new(state.now_ms()));

    let device = ConnectedDevice {
        id: device_id.clone(),
        connection: connection.clone(),
        outbound: outbound.clone(),
        info: register.data.clone(),
        last_heartbeat_ms: Arc::clone(&heartbeat_ms),
        connected_since: Instant::now(),
        shutdown_tx,
    };

    // A re-registering id replaces the stale socket; its waiters fail fast.
    {
        let mut devices = state.devices.write().await;
        if let Some(old) = devices.get(&device_id) {
            warn!("Device re-registering while stale connection exists, evicting old");
            let _ = old.shutdown_tx.send(true);
            state.events.remove_device(&device_id);
        }
        devices.insert(device_id.clone(), device);
    }
    info!(info = ?register.data, "Device registered");

    let send_task = tokio::spawn(async move {
        while let Some(packet) = outbound_rx.recv().await {
            if ws_sink.send(Message::Text(packet.to_text().into())).await.is_err() {
                break;
            }
        }
    });

    let _ = outbound
        .send_callback(Packet::ok(json!({"device": &device_id})), &register)
        .await;

    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            _ = shutdown_rx.changed() => {
                info!("Device handler shutting down");
                break;
            }
        };
        heartbeat_ms.store(state.now_ms(), Ordering::Relaxed);
        match msg {
            Message::Text(text) => {
                let Ok(packet) = Packet::from_text(&text) else {
                    warn!("Unparseable frame from device");
                    continue;
                };
                if packet.act == act::PING {
                    let _ = outbound.send_callback(Packet::ok(json!({})), &packet).await;
                } else if !state.events.dispatch(&device_id, packet) {
                    debug!("Callback for unknown or finished event dropped");
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Only tear down the registry entry if it is still ours.
    {
        let mut devices = state.devices.write().await;
        if devices.get(&device_id).is_some_and(|d| d.connection == connection) {
            devices.remove(&device_id);
            let dropped = state.events.remove_device(&device_id);
            if dropped > 0 {
                info!(dropped, "Dropped pending callbacks for disconnected device");
            }
        }
    }
    info!("Device disconnected");
    send_task.abort();
}
