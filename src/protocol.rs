//! Control-channel envelope shared by the controller and the agent.
//!
//! Every frame on the persistent control connection is a JSON-encoded
//! [`Packet`]. Requests carry an action tag (`act`) and a payload mapping
//! (`data`); replies reuse the request's `event` token so the sender can route
//! them back to whoever is waiting (see [`crate::channel::EventHub`]).
//!
//! | Field   | Meaning                                                  |
//! |---------|----------------------------------------------------------|
//! | `act`   | Action tag (`listFiles`, `initTerminal`, ...)            |
//! | `data`  | Action payload                                           |
//! | `event` | Correlation token; echoed on every callback              |
//! | `code`  | `0` on success, non-zero on failure (callbacks only)     |
//! | `msg`   | Human-readable error message when `code != 0`            |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action tags understood by the agent.
pub mod act {
    pub const PING: &str = "ping";
    pub const REGISTER: &str = "register";
    pub const LIST_FILES: &str = "listFiles";
    pub const REMOVE_FILES: &str = "removeFiles";
    pub const FETCH_FILE: &str = "fetchFile";
    pub const UPLOAD_FILES: &str = "uploadFiles";
    pub const UPLOAD_TEXT_FILE: &str = "uploadTextFile";
    pub const SCREENSHOT: &str = "screenshot";
    pub const INIT_TERMINAL: &str = "initTerminal";
    pub const INPUT_TERMINAL: &str = "inputTerminal";
    pub const RESIZE_TERMINAL: &str = "resizeTerminal";
    pub const KILL_TERMINAL: &str = "killTerminal";
    pub const OUTPUT_TERMINAL: &str = "outputTerminal";
    pub const QUIT_TERMINAL: &str = "quitTerminal";
}

/// A single control-channel message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default)]
    pub code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub act: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
}

impl Packet {
    /// Build a request packet. `data` must be a JSON object; anything else is
    /// treated as an empty payload.
    pub fn action(act: &str, data: Value) -> Self {
        Self {
            act: act.to_string(),
            data: into_map(data),
            ..Self::default()
        }
    }

    /// A successful callback carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            data: into_map(data),
            ..Self::default()
        }
    }

    /// A failed callback (`code = 1`).
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            code: 1,
            msg: msg.into(),
            ..Self::default()
        }
    }

    /// Attach a correlation token.
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    #[allow(clippy::cast_sign_loss)]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(|v| {
            v.as_u64()
                // Browsers send numbers as floats.
                .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
        })
    }

    pub fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        self.data.get(key)?.as_array().map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
    }

    /// Serialize to a JSON text frame.
    pub fn to_text(&self) -> String {
        // A struct of strings, ints and a JSON map cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

fn into_map(data: Value) -> Map<String, Value> {
    match data {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_packet_wire_shape() {
        let p = Packet::action(act::LIST_FILES, json!({"path": "/tmp"})).with_event("ev-1");
        let v: Value = serde_json::from_str(&p.to_text()).unwrap();
        assert_eq!(v["act"], "listFiles");
        assert_eq!(v["data"]["path"], "/tmp");
        assert_eq!(v["event"], "ev-1");
        assert_eq!(v["code"], 0);
        assert!(v.get("msg").is_none());
    }

    #[test]
    fn test_packet_parse_missing_fields() {
        let p = Packet::from_text(r#"{"act":"ping"}"#).unwrap();
        assert_eq!(p.act, "ping");
        assert!(p.data.is_empty());
        assert!(p.event.is_empty());
        assert!(p.is_ok());
    }

    #[test]
    fn test_packet_accessors() {
        let p = Packet::action(
            act::RESIZE_TERMINAL,
            json!({"width": 120.0, "height": 40, "files": ["/a", 3, "/b"]}),
        );
        assert_eq!(p.get_u64("width"), Some(120));
        assert_eq!(p.get_u64("height"), Some(40));
        assert_eq!(p.get_str("width"), None);
        assert_eq!(
            p.get_str_list("files"),
            Some(vec!["/a".to_string(), "/b".to_string()])
        );
    }

    #[test]
    fn test_error_packet() {
        let p = Packet::error("boom");
        assert!(!p.is_ok());
        assert_eq!(p.msg, "boom");
    }
}
