//! Agent-side terminal multiplexer.
//!
//! [`TerminalManager`] owns every PTY session opened over one control
//! connection, keyed by the controller-chosen terminal id.
//!
//! ## Session lifecycle
//!
//! ```text
//! initTerminal ──► running ──(EOF / read error)──► quitTerminal, removed
//!                    │  ▲
//!       killTerminal │  │ inputTerminal / output refresh activity
//!                    ▼  │
//!               SIGKILL to process group, close ──► pump stops ──► quitTerminal, removed
//! ```
//!
//! The idle sweep removes sessions without input or output for longer than
//! `terminal.idle_timeout_secs`, then kills them.
//!
//! ## Concurrency
//!
//! The registry is an `RwLock<HashMap>`: lookups from input/resize take the
//! read lock, start/remove/sweep take the write lock. Activity timestamps are
//! atomics so the output pump never contends with the sweep.

pub mod pty;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{ChannelClosed, Outbound};
use crate::config::TerminalConfig;
use crate::protocol::{act, Packet};
use session::TerminalSession;

const OUTPUT_CHUNK: usize = 4096;
/// Message attached to `quitTerminal` when the id is not (or no longer) live.
pub const SESSION_CLOSED: &str = "terminal session closed";

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("missing field {0:?}")]
    MissingField(&'static str),
    #[error("invalid terminal input: {0}")]
    InvalidInput(#[from] hex::FromHexError),
    #[error("invalid terminal size")]
    InvalidSize,
    #[error("terminal {0} already exists")]
    Duplicate(String),
    #[error("terminal {0} closed")]
    Closed(String),
    #[error("failed to spawn shell: {0}")]
    Spawn(std::io::Error),
    #[error("pty error: {0}")]
    Pty(#[from] nix::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelClosed),
}

/// Registry of live terminal sessions for one control connection.
///
/// Cloneable; clones share the registry.
#[derive(Clone)]
pub struct TerminalManager {
    sessions: Arc<RwLock<HashMap<String, Arc<TerminalSession>>>>,
    outbound: Outbound,
    config: TerminalConfig,
    epoch: Instant,
}

impl TerminalManager {
    pub fn new(config: TerminalConfig, outbound: Outbound) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            outbound,
            config,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn shell(&self) -> String {
        self.config.shell.clone().unwrap_or_else(pty::preferred_shell)
    }

    /// `initTerminal`: spawn a shell and start pumping its output.
    pub async fn start(&self, packet: &Packet) -> Result<(), TerminalError> {
        let id = terminal_id(packet)?;
        let (cols, rows) = match (packet.get_u64("width"), packet.get_u64("height")) {
            (Some(w), Some(h)) => dimensions(w, h)?,
            _ => (self.config.cols, self.config.rows),
        };

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(TerminalError::Duplicate(id));
        }
        let session = Arc::new(TerminalSession::spawn(
            &id,
            packet.clone(),
            &self.shell(),
            rows,
            cols,
            self.now_ms(),
        )?);
        sessions.insert(id, Arc::clone(&session));
        drop(sessions);

        let manager = self.clone();
        tokio::spawn(async move { manager.pump(session).await });
        Ok(())
    }

    /// Forward PTY output as hex `outputTerminal` callbacks until the master
    /// read ends or the session is closed, then notify `quitTerminal` and
    /// drop the session.
    async fn pump(&self, session: Arc<TerminalSession>) {
        let mut buf = vec![0u8; OUTPUT_CHUNK];
        loop {
            match session.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    session.touch(self.now_ms());
                    let output = Packet::action(
                        act::OUTPUT_TERMINAL,
                        json!({"terminal": session.id, "output": hex::encode(&buf[..n])}),
                    );
                    if self.outbound.send_callback(output, &session.trigger).await.is_err() {
                        debug!(terminal = %session.id, "control channel closed, stopping pump");
                        break;
                    }
                }
                // EIO once every slave fd is closed.
                Err(e) => {
                    debug!(terminal = %session.id, "pty read ended: {e}");
                    break;
                }
            }
        }

        let quit = Packet::action(act::QUIT_TERMINAL, json!({"terminal": session.id}));
        let _ = self.outbound.send_callback(quit, &session.trigger).await;
        self.remove(&session).await;
        session.terminate();
        info!(terminal = %session.id, "terminal closed");
    }

    /// Remove `session` unless the id has already been reused.
    async fn remove(&self, session: &Arc<TerminalSession>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&session.id)
            .is_some_and(|live| Arc::ptr_eq(live, session))
        {
            sessions.remove(&session.id);
        }
    }

    async fn lookup(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Tell the controller that `packet`'s terminal is gone.
    async fn notify_closed(&self, id: &str, packet: &Packet) -> Result<(), TerminalError> {
        debug!(terminal = %id, act = %packet.act, "request for closed terminal");
        let mut quit = Packet::action(act::QUIT_TERMINAL, json!({"terminal": id}));
        quit.msg = SESSION_CLOSED.to_string();
        self.outbound.send_callback(quit, packet).await?;
        Ok(())
    }

    /// `inputTerminal`: write hex-decoded bytes to the PTY.
    pub async fn input(&self, packet: &Packet) -> Result<(), TerminalError> {
        let data = hex::decode(packet.get_str("input").ok_or(TerminalError::MissingField("input"))?)?;
        let id = terminal_id(packet)?;
        let Some(session) = self.lookup(&id).await else {
            return self.notify_closed(&id, packet).await;
        };
        session.touch(self.now_ms());
        if session.write(data).await.is_err() {
            return self.notify_closed(&id, packet).await;
        }
        Ok(())
    }

    /// `resizeTerminal`: apply `width` x `height` to the PTY.
    pub async fn resize(&self, packet: &Packet) -> Result<(), TerminalError> {
        let (cols, rows) = dimensions(
            packet.get_u64("width").ok_or(TerminalError::MissingField("width"))?,
            packet.get_u64("height").ok_or(TerminalError::MissingField("height"))?,
        )?;
        let id = terminal_id(packet)?;
        let Some(session) = self.lookup(&id).await else {
            return self.notify_closed(&id, packet).await;
        };
        session.resize(rows, cols)
    }

    /// `killTerminal`: kill the shell; the pump completes the removal.
    pub async fn kill(&self, packet: &Packet) -> Result<(), TerminalError> {
        let id = terminal_id(packet)?;
        let Some(session) = self.lookup(&id).await else {
            return self.notify_closed(&id, packet).await;
        };
        session.terminate();
        Ok(())
    }

    /// Remove and kill every session idle for longer than `idle`.
    pub async fn sweep(&self, idle: Duration) -> Vec<String> {
        let now = self.now_ms();
        let limit = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        let stale: Vec<Arc<TerminalSession>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.idle_ms(now) > limit)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &stale {
            warn!(terminal = %session.id, "closing idle terminal");
            session.terminate();
        }
        stale.iter().map(|s| s.id.clone()).collect()
    }

    /// Run [`Self::sweep`] every `sweep_interval` until the task is aborted.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.sweep_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                let closed = manager.sweep(manager.config.idle_timeout()).await;
                if !closed.is_empty() {
                    info!(count = closed.len(), "swept idle terminals");
                }
            }
        })
    }

    /// Kill every session (control connection lost).
    pub async fn kill_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.terminate();
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "killed all terminals");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn terminal_id(packet: &Packet) -> Result<String, TerminalError> {
    packet
        .get_str("terminal")
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .ok_or(TerminalError::MissingField("terminal"))
}

/// `(cols, rows)` from a width/height pair.
fn dimensions(width: u64, height: u64) -> Result<(u16, u16), TerminalError> {
    let cols = u16::try_from(width).map_err(|_| TerminalError::InvalidSize)?;
    let rows = u16::try_from(height).map_err(|_| TerminalError::InvalidSize)?;
    if cols == 0 || rows == 0 {
        return Err(TerminalError::InvalidSize);
    }
    Ok((cols, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn manager() -> (TerminalManager, mpsc::Receiver<Packet>) {
        let (out, rx) = Outbound::channel(256);
        let config = TerminalConfig {
            shell: Some("/bin/cat".to_string()),
            ..TerminalConfig::default()
        };
        (TerminalManager::new(config, out), rx)
    }

    fn request(act: &str, data: serde_json::Value) -> Packet {
        Packet::action(act, data).with_event("ev-term")
    }

    /// Next packet with `act`, skipping output noise.
    async fn next_act(rx: &mut mpsc::Receiver<Packet>, act: &str) -> Packet {
        timeout(Duration::from_secs(10), async {
            loop {
                let p = rx.recv().await.unwrap();
                if p.act == act {
                    return p;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_terminal_yields_quit() {
        let (mgr, mut rx) = manager();
        mgr.input(&request(act::INPUT_TERMINAL, json!({"terminal": "nope", "input": "6869"})))
            .await
            .unwrap();
        let quit = rx.recv().await.unwrap();
        assert_eq!(quit.act, act::QUIT_TERMINAL);
        assert_eq!(quit.msg, SESSION_CLOSED);
        assert_eq!(quit.event, "ev-term");
        assert_eq!(quit.get_str("terminal"), Some("nope"));

        mgr.resize(&request(
            act::RESIZE_TERMINAL,
            json!({"terminal": "nope", "width": 80, "height": 24}),
        ))
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().msg, SESSION_CLOSED);

        mgr.kill(&request(act::KILL_TERMINAL, json!({"terminal": "nope"})))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().msg, SESSION_CLOSED);
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        let (mgr, _rx) = manager();
        assert!(matches!(
            mgr.input(&request(act::INPUT_TERMINAL, json!({"terminal": "t", "input": "zz"})))
                .await,
            Err(TerminalError::InvalidInput(_))
        ));
        assert!(matches!(
            mgr.input(&request(act::INPUT_TERMINAL, json!({"input": "00"}))).await,
            Err(TerminalError::MissingField("terminal"))
        ));
        assert!(matches!(
            mgr.resize(&request(
                act::RESIZE_TERMINAL,
                json!({"terminal": "t", "width": 70000, "height": 24})
            ))
            .await,
            Err(TerminalError::InvalidSize)
        ));
    }

    #[tokio::test]
    async fn test_echo_and_kill() {
        let (mgr, mut rx) = manager();
        mgr.start(&request(act::INIT_TERMINAL, json!({"terminal": "t1"})))
            .await
            .unwrap();
        assert_eq!(mgr.len().await, 1);
        assert!(matches!(
            mgr.start(&request(act::INIT_TERMINAL, json!({"terminal": "t1"}))).await,
            Err(TerminalError::Duplicate(_))
        ));

        mgr.input(&request(
            act::INPUT_TERMINAL,
            json!({"terminal": "t1", "input": hex::encode("hello\n")}),
        ))
        .await
        .unwrap();

        let mut seen = Vec::new();
        timeout(Duration::from_secs(10), async {
            while !String::from_utf8_lossy(&seen).contains("hello") {
                let p = rx.recv().await.unwrap();
                assert_eq!(p.act, act::OUTPUT_TERMINAL);
                assert_eq!(p.event, "ev-term");
                seen.extend(hex::decode(p.get_str("output").unwrap()).unwrap());
            }
        })
        .await
        .unwrap();

        mgr.resize(&request(
            act::RESIZE_TERMINAL,
            json!({"terminal": "t1", "width": 120.0, "height": 40.0}),
        ))
        .await
        .unwrap();

        mgr.kill(&request(act::KILL_TERMINAL, json!({"terminal": "t1"})))
            .await
            .unwrap();
        let quit = next_act(&mut rx, act::QUIT_TERMINAL).await;
        assert!(quit.msg.is_empty());
        // The pump removes the session right after notifying.
        timeout(Duration::from_secs(5), async {
            while !mgr.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_kill_closes_after_shell_exit_with_detached_job() {
        let (out, mut rx) = Outbound::channel(256);
        let config = TerminalConfig {
            shell: Some("/bin/sh".to_string()),
            ..TerminalConfig::default()
        };
        let mgr = TerminalManager::new(config, out);
        mgr.start(&request(act::INIT_TERMINAL, json!({"terminal": "bg"})))
            .await
            .unwrap();

        // The job ignores SIGHUP and keeps the slave open after the shell exits.
        let script = "sh -c \"trap '' HUP; sleep 5\" &\nexit\n";
        mgr.input(&request(
            act::INPUT_TERMINAL,
            json!({"terminal": "bg", "input": hex::encode(script)}),
        ))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        mgr.kill(&request(act::KILL_TERMINAL, json!({"terminal": "bg"})))
            .await
            .unwrap();
        let quit = next_act(&mut rx, act::QUIT_TERMINAL).await;
        assert_eq!(quit.get_str("terminal"), Some("bg"));
        timeout(Duration::from_secs(5), async {
            while !mgr.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_idle_sweep_then_input_reports_closed() {
        let (mgr, mut rx) = manager();
        mgr.start(&request(act::INIT_TERMINAL, json!({"terminal": "idle"})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(mgr.sweep(Duration::from_secs(300)).await.is_empty());
        assert_eq!(mgr.sweep(Duration::from_millis(20)).await, vec!["idle".to_string()]);
        assert!(mgr.is_empty().await);

        mgr.input(&request(
            act::INPUT_TERMINAL,
            json!({"terminal": "idle", "input": "0a"}),
        ))
        .await
        .unwrap();
        let closed = timeout(Duration::from_secs(10), async {
            loop {
                let p = rx.recv().await.unwrap();
                if p.act == act::QUIT_TERMINAL && p.msg == SESSION_CLOSED {
                    return p;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(closed.get_str("terminal"), Some("idle"));
    }

    #[tokio::test]
    async fn test_kill_all() {
        let (mgr, _rx) = manager();
        for id in ["a", "b"] {
            mgr.start(&request(act::INIT_TERMINAL, json!({"terminal": id})))
                .await
                .unwrap();
        }
        assert_eq!(mgr.len().await, 2);
        mgr.kill_all().await;
        assert!(mgr.is_empty().await);
    }
}
