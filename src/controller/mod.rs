//! Controller role: accepts agent registrations and exposes the operator and
//! bridge HTTP endpoints.
//!
//! The controller:
//! 1. Accepts agent control connections at `/api/device/register`
//! 2. Hosts the bridge endpoints agents use for file and screenshot streams
//! 3. Exposes operator endpoints under `/api/device/{id}/...` that trigger
//!    agent actions over the control connection

mod bridge;
mod operator;
mod register;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{info, warn};

use crate::auth::{require_token, Token};
use crate::bridge::{BridgeCorrelator, BridgeError};
use crate::channel::{EventHub, Outbound};
use crate::config::Config;
use crate::protocol::Packet;

/// Error half of every handler result: a status plus `{"error", "code"}`.
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, code: &str, msg: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": msg.into(), "code": code})))
}

/// State shared across all controller handlers.
#[derive(Clone)]
pub struct ControllerState {
    pub config: Arc<Config>,
    /// Connected agents keyed by device id.
    pub devices: Arc<RwLock<HashMap<String, ConnectedDevice>>>,
    /// Routes agent callbacks to waiting handlers by event token.
    pub events: EventHub,
    pub bridges: BridgeCorrelator,
    /// Process epoch for lock-free heartbeat timestamps.
    pub epoch: Instant,
}

/// An agent connected over its outbound control socket.
pub struct ConnectedDevice {
    pub id: String,
    /// Distinguishes this socket from a later one registering the same id.
    pub connection: String,
    pub outbound: Outbound,
    /// Host details from the agent's `register` frame.
    pub info: Map<String, Value>,
    /// Last frame received, as ms since the controller epoch.
    pub last_heartbeat_ms: Arc<AtomicU64>,
    pub connected_since: Instant,
    /// Tells the socket handler to stop (eviction or replacement).
    pub shutdown_tx: watch::Sender<bool>,
}

impl ControllerState {
    pub fn new(config: Arc<Config>) -> Self {
        let bridges = BridgeCorrelator::new(config.controller.bridge_timeout());
        Self {
            config,
            devices: Arc::new(RwLock::new(HashMap::new())),
            events: EventHub::new(),
            bridges,
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// The control connection of `device`, or 404.
    pub async fn outbound(&self, device: &str) -> Result<Outbound, ApiError> {
        self.devices
            .read()
            .await
            .get(device)
            .map(|d| d.outbound.clone())
            .ok_or_else(|| {
                api_error(
                    StatusCode::NOT_FOUND,
                    "DEVICE_NOT_FOUND",
                    format!("Device '{device}' not connected"),
                )
            })
    }

    /// Register a one-shot wait for the callback tagged `event` from `device`.
    ///
    /// The receiver errors if the device disconnects first (its handlers are
    /// dropped with it).
    pub fn expect_reply(&self, device: &str, event: &str) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        let slot = parking_lot::Mutex::new(Some(tx));
        self.events.on_event(device, event, move |packet| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(packet);
            }
        });
        rx
    }

    /// Send `act` to `device` and wait for its callback.
    ///
    /// Error callbacks are mapped through [`agent_error`]; no answer within
    /// the call timeout is a 504.
    pub async fn call(&self, device: &str, act: &str, data: Value) -> Result<Packet, ApiError> {
        let outbound = self.outbound(device).await?;
        let event = uuid::Uuid::new_v4().to_string();
        let reply = self.expect_reply(device, &event);

        if outbound.send(Packet::action(act, data).with_event(&event)).await.is_err() {
            self.events.remove_event(&event);
            return Err(send_failed());
        }

        let result = tokio::time::timeout(self.config.controller.call_timeout(), reply).await;
        self.events.remove_event(&event);
        match result {
            Ok(Ok(packet)) if packet.is_ok() => Ok(packet),
            Ok(Ok(packet)) => Err(agent_error(&packet)),
            Ok(Err(_)) => Err(disconnected()),
            Err(_) => Err(api_error(
                StatusCode::GATEWAY_TIMEOUT,
                "TIMEOUT",
                "Device did not respond in time",
            )),
        }
    }

    /// Evict devices whose last frame is older than the heartbeat timeout.
    /// Returns the evicted ids.
    pub async fn sweep_dead_devices(&self) -> Vec<String> {
        let timeout_ms = self.config.controller.heartbeat_timeout_secs * 1000;
        let now_ms = self.now_ms();

        let mut devices = self.devices.write().await;
        let dead: Vec<String> = devices
            .values()
            .filter(|d| now_ms.saturating_sub(d.last_heartbeat_ms.load(Ordering::Relaxed)) > timeout_ms)
            .map(|d| d.id.clone())
            .collect();
        for id in &dead {
            if let Some(device) = devices.remove(id) {
                let _ = device.shutdown_tx.send(true);
                let dropped = self.events.remove_device(id);
                warn!(device = %id, dropped, "Evicted device (heartbeat timeout)");
            }
        }
        dead
    }

    /// Run [`Self::sweep_dead_devices`] every 30 s until the task is aborted.
    pub fn spawn_heartbeat_sweep(&self) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let evicted = state.sweep_dead_devices().await;
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "Heartbeat sweep evicted devices");
                }
            }
        })
    }

    /// Disconnect every agent (controller shutdown).
    pub async fn drain_all(&self) {
        let mut devices = self.devices.write().await;
        for (id, device) in devices.drain() {
            let _ = device.shutdown_tx.send(true);
            self.events.remove_device(&id);
            info!(device = %id, "Disconnected device for shutdown");
        }
    }
}

/// Build the controller router.
pub fn router(state: ControllerState) -> Router {
    let token = Token(state.config.auth.token.clone());

    // Operator endpoints (Bearer token)
    let operator = Router::new()
        .route("/api/devices", get(operator::list_devices))
        .route("/api/device/{id}/files/list", post(operator::list_files))
        .route("/api/device/{id}/files/remove", post(operator::remove_files))
        .route("/api/device/{id}/files/get", post(operator::get_files))
        .route("/api/device/{id}/files/text", post(operator::get_text_file))
        .route("/api/device/{id}/files/upload", put(operator::upload_file))
        .route("/api/device/{id}/screenshot", get(operator::screenshot))
        .route_layer(middleware::from_fn_with_state(token, require_token));

    // WebSocket upgrades authenticate with ?token=
    let sockets = Router::new()
        .route("/api/device/register", get(register::device_register_ws))
        .route("/api/device/{id}/terminal", get(operator::terminal_ws));

    // Bridge endpoints: single-use random ids, no token
    let bridges = Router::new()
        .route("/api/bridge/push", put(bridge::push))
        .route("/api/bridge/pull", get(bridge::pull));

    operator.merge(sockets).merge(bridges).with_state(state)
}

/// Map an agent's error callback to an HTTP error. The agent puts a stable
/// code in `data.code` when it has one.
pub fn agent_error(packet: &Packet) -> ApiError {
    let code = packet.get_str("code").unwrap_or("AGENT_ERROR");
    let status = match code {
        "INVALID_PATH" | "INVALID_RANGE" | "UNSUPPORTED_ENCODING" | "INVALID_REQUEST" => StatusCode::BAD_REQUEST,
        "FILE_TOO_LARGE" => StatusCode::PAYLOAD_TOO_LARGE,
        "FILE_NOT_FOUND" => StatusCode::NOT_FOUND,
        "PERMISSION_DENIED" => StatusCode::FORBIDDEN,
        "UNSUPPORTED" => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let msg = if packet.msg.is_empty() { "agent reported an error" } else { packet.msg.as_str() };
    api_error(status, code, msg)
}

pub fn bridge_error(e: &BridgeError) -> ApiError {
    let (status, code) = match e {
        BridgeError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
        BridgeError::NotFound => (StatusCode::NOT_FOUND, "BRIDGE_NOT_FOUND"),
        BridgeError::Duplicate => (StatusCode::CONFLICT, "BRIDGE_DUPLICATE"),
        BridgeError::WrongDirection => (StatusCode::BAD_REQUEST, "BRIDGE_DIRECTION"),
        BridgeError::Cancelled => (StatusCode::BAD_GATEWAY, "BRIDGE_CANCELLED"),
    };
    api_error(status, code, e.to_string())
}

fn disconnected() -> ApiError {
    api_error(StatusCode::BAD_GATEWAY, "DEVICE_DISCONNECTED", "Device connection lost")
}

fn send_failed() -> ApiError {
    api_error(StatusCode::BAD_GATEWAY, "DEVICE_SEND_FAILED", "Failed to send to device")
}
