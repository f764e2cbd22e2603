//! Agent role: outbound control connection to the controller.
//!
//! Maintains a persistent WebSocket to the controller with exponential-backoff
//! reconnect and heartbeat, and hands every inbound packet to the
//! [`Dispatcher`]. Terminals live only as long as the connection that
//! created them.

mod dispatch;

pub use dispatch::Dispatcher;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::channel::Outbound;
use crate::config::Config;
use crate::protocol::{act, Packet};

/// Outbound packets buffered before senders wait on the socket.
const OUTBOUND_CAPACITY: usize = 256;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A running agent loop.
pub struct AgentHandle {
    task: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl AgentHandle {
    /// Close the control connection, kill its terminals and wait for the loop
    /// to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the agent loop.
pub fn spawn(config: Arc<Config>) -> AgentHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(config, shutdown_rx));
    AgentHandle { task, shutdown_tx }
}

/// Connect, serve, and reconnect until `shutdown` flips to `true`.
pub async fn run(config: Arc<Config>, mut shutdown: watch::Receiver<bool>) {
    let client = reqwest::Client::new();
    let base_delay = Duration::from_secs(config.agent.reconnect_delay_secs);
    let max_delay = Duration::from_secs(config.agent.reconnect_max_delay_secs);
    let mut delay = base_delay;

    while !*shutdown.borrow() {
        info!(url = %config.agent.url, "Connecting to controller");
        match connect_and_run(&config, &client, shutdown.clone()).await {
            Ok(()) => {
                info!("Control connection closed cleanly");
                delay = base_delay;
            }
            Err(e) => {
                warn!("Control connection error: {e}, reconnecting in {}s", delay.as_secs());
            }
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            res = shutdown.changed() => {
                if res.is_err() {
                    break;
                }
            }
        }
        delay = (delay * 2).min(max_delay);
    }
    info!("Agent stopped");
}

/// Host details sent in the `register` frame.
fn host_info(config: &Config) -> Value {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    json!({
        "device": config.agent.device_id,
        "hostname": hostname,
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

/// A single connection: register, serve packets until disconnect, then tear
/// down every terminal opened on it.
async fn connect_and_run(
    config: &Arc<Config>,
    client: &reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BoxError> {
    let url = reqwest::Url::parse_with_params(
        &config.agent.url,
        &[
            ("device", config.agent.device_id.as_str()),
            ("token", config.auth.token.as_str()),
        ],
    )?;
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut ws_sink, mut ws_stream) = ws.split();

    let register = Packet::action(act::REGISTER, host_info(config));
    ws_sink.send(Message::Text(register.to_text().into())).await?;
    info!(device = %config.agent.device_id, "Connected, registered with controller");

    let (outbound, mut outbound_rx) = Outbound::channel(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(packet) = outbound_rx.recv().await {
            if ws_sink.send(Message::Text(packet.to_text().into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let heartbeat_outbound = outbound.clone();
    let heartbeat_interval = Duration::from_secs(config.agent.heartbeat_interval_secs);
    let heartbeat = tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            if heartbeat_outbound.send(Packet::action(act::PING, json!({}))).await.is_err() {
                break;
            }
        }
    });

    let dispatcher = Dispatcher::new(Arc::clone(config), client.clone(), outbound);
    let sweeper = dispatcher.terminals().spawn_sweeper();

    let result = loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => msg,
            _ = shutdown.changed() => break Ok(()),
        };
        let Some(msg) = msg else { break Ok(()) };
        match msg {
            Ok(Message::Text(text)) => match Packet::from_text(&text) {
                Ok(packet) => dispatcher.handle(packet).await,
                Err(e) => warn!("Unparseable frame from controller: {e}"),
            },
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Controller closed the connection");
                break Ok(());
            }
            Ok(_) => {}
            Err(e) => break Err(e.into()),
        }
    };

    heartbeat.abort();
    sweeper.abort();
    dispatcher.terminals().kill_all().await;
    writer.abort();
    result
}
