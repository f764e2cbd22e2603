#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! tether library: the controller and agent halves of a reverse-connected
//! remote agent.
//!
//! - `protocol` and `channel`: control-channel packets, sends and event routing
//! - `bridge`: correlates controller HTTP exchanges with agent streams
//! - `files`: listing, bridged transfers and streaming ZIP archives
//! - `terminal`: PTY session multiplexing
//! - `controller` / `agent`: the two roles wired onto axum and tungstenite
//! - `auth`, `config`: shared-secret checks and TOML configuration

pub mod agent;
pub mod auth;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod controller;
pub mod files;
pub mod protocol;
pub mod terminal;

// Re-export key types at crate root for convenience.
pub use bridge::BridgeCorrelator;
pub use config::Config;
pub use controller::ControllerState;
pub use protocol::Packet;
pub use terminal::TerminalManager;
