//! A single PTY-backed terminal session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::pty::{allocate_pty, spawn_on_pty, PtyMaster};
use super::TerminalError;
use crate::protocol::Packet;

pub struct TerminalSession {
    pub id: String,
    /// The `initTerminal` request; its event token tags every callback.
    pub trigger: Packet,
    pid: i32,
    master: Arc<PtyMaster>,
    input_tx: mpsc::Sender<Vec<u8>>,
    /// Milliseconds since the manager's epoch (lock-free).
    last_activity_ms: AtomicU64,
    closed: watch::Sender<bool>,
}

impl TerminalSession {
    /// Spawn `shell` on a fresh PTY.
    pub fn spawn(
        id: &str,
        trigger: Packet,
        shell: &str,
        rows: u16,
        cols: u16,
        now_ms: u64,
    ) -> Result<Self, TerminalError> {
        let pty = allocate_pty(rows, cols)?;
        let mut child = spawn_on_pty(&pty, shell).map_err(TerminalError::Spawn)?;
        let pid = child
            .id()
            .and_then(|p| i32::try_from(p).ok())
            .ok_or_else(|| TerminalError::Spawn(std::io::Error::other("child exited during spawn")))?;
        drop(pty.slave);
        let master = Arc::new(PtyMaster::new(pty.master)?);
        let (closed, _) = watch::channel(false);

        // Input writer: applies chunks in arrival order.
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
        let writer = Arc::clone(&master);
        let mut writer_closed = closed.subscribe();
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    data = input_rx.recv() => data,
                    _ = writer_closed.wait_for(|c| *c) => None,
                };
                let Some(data) = data else { break };
                let written = tokio::select! {
                    res = writer.write_all(&data) => res,
                    _ = writer_closed.wait_for(|c| *c) => break,
                };
                if written.is_err() {
                    break;
                }
            }
        });

        let sid = id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(terminal = %sid, code = status.code().unwrap_or(-1), "shell exited"),
                Err(e) => warn!(terminal = %sid, "shell wait failed: {e}"),
            }
        });

        info!(terminal = %id, shell, pid, "terminal started");
        Ok(Self {
            id: id.to_string(),
            trigger,
            pid,
            master,
            input_tx,
            last_activity_ms: AtomicU64::new(now_ms),
            closed,
        })
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Next chunk of shell output. `Ok(0)` once the session is closed, even
    /// if another process still holds the slave open.
    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            res = self.master.read(buf) => res,
            _ = closed.wait_for(|c| *c) => Ok(0),
        }
    }

    /// Queue bytes for the PTY. Fails once the writer task is gone.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), TerminalError> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| TerminalError::Closed(self.id.clone()))
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), TerminalError> {
        self.master.resize(rows, cols)?;
        Ok(())
    }

    /// SIGKILL the shell's process group and close the session. The pending
    /// output read returns at once, so the pump finishes the close even when
    /// the shell is already gone and a detached job keeps the slave open.
    pub fn terminate(&self) {
        // SAFETY: plain syscall; the shell is a session leader so -pid is its group.
        let ret = unsafe { libc::kill(-self.pid, libc::SIGKILL) };
        if ret == 0 {
            debug!(terminal = %self.id, pid = self.pid, "terminal killed");
        } else {
            debug!(terminal = %self.id, "kill failed: {}", std::io::Error::last_os_error());
        }
        self.closed.send_replace(true);
    }
}
