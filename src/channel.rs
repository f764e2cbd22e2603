//! Control-channel primitives: outbound sends and event-token routing.
//!
//! The persistent connection itself (a WebSocket owned by the agent or the
//! controller) is wrapped by two small types:
//!
//! - [`Outbound`]: `send(packet)` and `send_callback(packet, trigger)`. Backed
//!   by an mpsc channel drained by the socket writer task, so senders apply
//!   backpressure instead of buffering without bound.
//! - [`EventHub`]: `on_event(token, handler)` registry used by the controller
//!   to route agent callbacks to whoever issued the request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::Packet;

/// The peer's writer task is gone; the control connection is closed.
#[derive(Debug, thiserror::Error)]
#[error("control channel closed")]
pub struct ChannelClosed;

/// Sending half of a control connection.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Packet>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Packet>) -> Self {
        Self { tx }
    }

    /// Create an `Outbound` together with the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, packet: Packet) -> Result<(), ChannelClosed> {
        self.tx.send(packet).await.map_err(|_| ChannelClosed)
    }

    /// Send `packet` as a reply to `trigger`, copying its correlation token.
    pub async fn send_callback(&self, mut packet: Packet, trigger: &Packet) -> Result<(), ChannelClosed> {
        packet.event.clone_from(&trigger.event);
        self.send(packet).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type Handler = Arc<dyn Fn(Packet) + Send + Sync>;

/// Routes inbound callback packets to handlers registered by event token.
///
/// Handlers are scoped to the device that must answer: a packet from any other
/// device carrying the same token is ignored. Handlers stay registered until
/// [`EventHub::remove_event`] is called, so a single token can receive a stream
/// of packets (terminal output).
#[derive(Clone, Default)]
pub struct EventHub {
    handlers: Arc<Mutex<HashMap<String, (String, Handler)>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event<F>(&self, device: &str, token: &str, handler: F)
    where
        F: Fn(Packet) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .insert(token.to_string(), (device.to_string(), Arc::new(handler)));
    }

    /// Returns `true` if a handler was registered for `token`.
    pub fn remove_event(&self, token: &str) -> bool {
        self.handlers.lock().remove(token).is_some()
    }

    /// Invoke the handler for `packet.event`, if any. The handler runs outside
    /// the registry lock so it may register or remove events itself.
    pub fn dispatch(&self, device: &str, packet: Packet) -> bool {
        if packet.event.is_empty() {
            return false;
        }
        let handler = {
            let handlers = self.handlers.lock();
            match handlers.get(&packet.event) {
                Some((owner, handler)) if owner == device => Arc::clone(handler),
                _ => return false,
            }
        };
        handler(packet);
        true
    }

    /// Drop every handler owned by `device` (called when it disconnects).
    pub fn remove_device(&self, device: &str) -> usize {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|_, (owner, _)| owner != device);
        before - handlers.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
