//! Control-action dispatch on the agent.
//!
//! Terminal actions are handled inline so that input reaches the shell in
//! arrival order. File and screenshot actions run on their own tasks; each
//! answers with exactly one callback tagged with the request's event.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::channel::Outbound;
use crate::config::Config;
use crate::files::{self, ArchiveOptions, TransferError};
use crate::protocol::{act, Packet};
use crate::terminal::{TerminalError, TerminalManager};

#[derive(Debug, thiserror::Error)]
enum ActionError {
    #[error("missing field {0:?}")]
    MissingField(&'static str),
    #[error("screen capture is not supported on this agent")]
    Unsupported,
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

impl ActionError {
    fn code(&self) -> &'static str {
        match self {
            Self::MissingField(_) | Self::UnknownAction(_) => "INVALID_REQUEST",
            Self::Unsupported => "UNSUPPORTED",
            Self::Transfer(e) => e.code(),
            Self::Terminal(_) => "TERMINAL_ERROR",
        }
    }

    fn to_packet(&self) -> Packet {
        let mut packet = Packet::error(self.to_string());
        packet.data.insert("code".into(), json!(self.code()));
        packet
    }
}

fn required<'a>(packet: &'a Packet, key: &'static str) -> Result<&'a str, ActionError> {
    packet.get_str(key).ok_or(ActionError::MissingField(key))
}

/// Routes control packets to the file and terminal subsystems.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<Config>,
    client: reqwest::Client,
    outbound: Outbound,
    terminals: TerminalManager,
    archive: ArchiveOptions,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, client: reqwest::Client, outbound: Outbound) -> Self {
        let terminals = TerminalManager::new(config.terminal.clone(), outbound.clone());
        let archive = ArchiveOptions::from(&config.archive);
        Self {
            config,
            client,
            outbound,
            terminals,
            archive,
        }
    }

    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    /// Handle one packet from the controller.
    pub async fn handle(&self, packet: Packet) {
        match packet.act.as_str() {
            // Callbacks to our own frames (register ack, heartbeat).
            "" => {
                if !packet.is_ok() {
                    warn!(msg = %packet.msg, "Controller reported an error");
                }
            }
            act::INIT_TERMINAL | act::INPUT_TERMINAL | act::RESIZE_TERMINAL | act::KILL_TERMINAL => {
                if let Err(e) = self.terminal(&packet).await {
                    debug!(act = %packet.act, error = %e, "Terminal action failed");
                    self.reply(Err(e), &packet).await;
                }
            }
            act::LIST_FILES
            | act::REMOVE_FILES
            | act::FETCH_FILE
            | act::UPLOAD_FILES
            | act::UPLOAD_TEXT_FILE
            | act::SCREENSHOT => {
                let this = self.clone();
                tokio::spawn(async move {
                    let result = this.file_action(&packet).await;
                    this.reply(result, &packet).await;
                });
            }
            other => {
                warn!(act = other, "Unknown action");
                self.reply(Err(ActionError::UnknownAction(other.to_string())), &packet)
                    .await;
            }
        }
    }

    async fn reply(&self, result: Result<Value, ActionError>, trigger: &Packet) {
        let packet = match result {
            Ok(data) => Packet::ok(data),
            Err(e) => e.to_packet(),
        };
        if self.outbound.send_callback(packet, trigger).await.is_err() {
            debug!(act = %trigger.act, "Control connection gone before reply");
        }
    }

    async fn terminal(&self, packet: &Packet) -> Result<(), ActionError> {
        match packet.act.as_str() {
            act::INIT_TERMINAL => self.terminals.start(packet).await?,
            act::INPUT_TERMINAL => self.terminals.input(packet).await?,
            act::RESIZE_TERMINAL => self.terminals.resize(packet).await?,
            _ => self.terminals.kill(packet).await?,
        }
        Ok(())
    }

    async fn file_action(&self, packet: &Packet) -> Result<Value, ActionError> {
        let base_url = self.config.agent.base_url.as_str();
        match packet.act.as_str() {
            act::LIST_FILES => {
                let path = required(packet, "path")?;
                let entries = files::list_files(Path::new(path))
                    .await
                    .map_err(TransferError::from)?;
                Ok(json!({"files": entries}))
            }
            act::REMOVE_FILES => {
                let targets = packet
                    .get_str_list("files")
                    .ok_or(ActionError::MissingField("files"))?;
                files::remove_files(&targets).await?;
                info!(count = targets.len(), "Removed files");
                Ok(json!({}))
            }
            act::FETCH_FILE => {
                let dir = required(packet, "dir")?;
                let file = required(packet, "file")?;
                let bridge = required(packet, "bridge")?;
                let size = files::fetch_file(&self.client, base_url, Path::new(dir), file, bridge).await?;
                Ok(json!({"size": size}))
            }
            act::UPLOAD_FILES => {
                let targets = packet
                    .get_str_list("files")
                    .filter(|f| !f.is_empty())
                    .ok_or(ActionError::MissingField("files"))?;
                let bridge = required(packet, "bridge")?;
                let start = packet.get_u64("start").unwrap_or(0);
                let end = packet.get_u64("end").unwrap_or(0);
                let report =
                    files::upload_files(&self.client, base_url, &targets, bridge, start, end, &self.archive).await?;
                match report {
                    Some(report) => {
                        info!(
                            bridge,
                            entries = report.entries,
                            failures = report.failures.len(),
                            skipped = report.skipped,
                            cancelled = report.cancelled,
                            "Archive upload finished"
                        );
                        Ok(json!({
                            "entries": report.entries,
                            "failures": report.failures,
                            "cancelled": report.cancelled,
                        }))
                    }
                    None => Ok(json!({})),
                }
            }
            act::UPLOAD_TEXT_FILE => {
                let path = required(packet, "path")?;
                let bridge = required(packet, "bridge")?;
                let body = files::upload_text(Path::new(path)).await?;
                let encoding = body.encoding;
                files::push_body(&self.client, base_url, bridge, body).await?;
                Ok(json!({"encoding": encoding}))
            }
            act::SCREENSHOT => Err(ActionError::Unsupported),
            other => Err(ActionError::UnknownAction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn dispatcher() -> (Dispatcher, mpsc::Receiver<Packet>) {
        let (outbound, rx) = Outbound::channel(16);
        let d = Dispatcher::new(Arc::new(Config::default()), reqwest::Client::new(), outbound);
        (d, rx)
    }

    #[tokio::test]
    async fn test_list_files_reply() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let (d, mut rx) = dispatcher();
        let req = Packet::action(act::LIST_FILES, json!({"path": dir.path()})).with_event("ev-1");
        d.handle(req).await;

        let reply = rx.recv().await.unwrap();
        assert!(reply.is_ok(), "{}", reply.msg);
        assert_eq!(reply.event, "ev-1");
        let files = reply.data["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["name"], "a.txt");
        assert_eq!(files[0]["size"], 3);
        assert_eq!(files[0]["type"], 0);
        assert_eq!(files[1]["name"], "sub");
        assert_eq!(files[1]["type"], 1);
    }

    #[tokio::test]
    async fn test_list_missing_dir_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (d, mut rx) = dispatcher();
        let req = Packet::action(act::LIST_FILES, json!({"path": dir.path().join("nope")})).with_event("ev");
        d.handle(req).await;

        let reply = rx.recv().await.unwrap();
        assert!(!reply.is_ok());
        assert_eq!(reply.get_str("code"), Some("FILE_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_remove_root_rejected() {
        let (d, mut rx) = dispatcher();
        d.handle(Packet::action(act::REMOVE_FILES, json!({"files": ["/"]})).with_event("ev")).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.code, 1);
        assert_eq!(reply.get_str("code"), Some("INVALID_PATH"));
    }

    #[tokio::test]
    async fn test_missing_field() {
        let (d, mut rx) = dispatcher();
        d.handle(Packet::action(act::FETCH_FILE, json!({"dir": "/tmp"})).with_event("ev")).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.get_str("code"), Some("INVALID_REQUEST"));
        assert!(reply.msg.contains("file"), "{}", reply.msg);
    }

    #[tokio::test]
    async fn test_screenshot_unsupported() {
        let (d, mut rx) = dispatcher();
        d.handle(Packet::action(act::SCREENSHOT, json!({"bridge": "b"})).with_event("ev")).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.get_str("code"), Some("UNSUPPORTED"));
        assert_eq!(reply.event, "ev");
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let (d, mut rx) = dispatcher();
        d.handle(Packet::action("reboot", json!({})).with_event("ev")).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.code, 1);
        assert!(reply.msg.contains("reboot"));
    }

    #[tokio::test]
    async fn test_controller_callbacks_ignored() {
        let (d, mut rx) = dispatcher();
        d.handle(Packet::ok(json!({"device": "x"})).with_event("ev")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_terminal_errors_reported() {
        let (d, mut rx) = dispatcher();
        d.handle(Packet::action(act::INPUT_TERMINAL, json!({"input": "00"})).with_event("ev")).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.get_str("code"), Some("TERMINAL_ERROR"));
    }
}
