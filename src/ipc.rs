//! Command channel to the Unity editor.
//!
//! This module is the Rust side of the editor bridge: one TCP connection to
//! the bridge package running inside the Unity Editor, carrying JSON
//! commands and replies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐          TCP :6400          ┌─────────────────────┐
//! │  ConnectionManager   │  ◄────────────────────────► │  Unity Editor       │
//! │  (reader + writer)   │   length-prefixed JSON      │  (bridge package)   │
//! └──────────────────────┘                             └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Every message is a 4-byte big-endian length followed by a UTF-8 JSON
//! body:
//!
//! ```text
//! 00 00 00 2f {"id":"1","type":"get_editor_state","params":{}}
//! ```
//!
//! Replies echo the request `id` and carry `status`, `result` or `error`.
//!
//! # Usage
//!
//! ```ignore
//! use unity_bridge::ipc::ConnectionManager;
//! use serde_json::json;
//!
//! let channel = ConnectionManager::from_config(&config);
//! let state = channel.invoke("get_editor_state", json!({})).await?;
//! ```

mod connection;
mod error;
mod extract;
mod framing;
mod pending;
mod retry;
mod stats;

pub use connection::{
    ChannelStatus, CommandChannel, ConnectionManager, ConnectionState, Connector, TcpConnector,
    BRIDGE_VERSION,
};
pub use error::{is_transient_message, ChannelError};
pub use extract::{find_flag_container, read_flag};
pub use framing::{encode_frame, read_frame, write_frame, MAX_FRAME_SIZE};
pub use pending::{CorrelationTable, Routing, Settlement};
pub use retry::{
    run_transition, wait_for_flag, ModeTransition, RetryPolicy, TransitionError,
    TransitionOutcome, WaitOutcome, DEFAULT_STATUS_COMMAND,
};
pub use stats::StatsSnapshot;
