//! Unity Editor bridge library
//!
//! This library provides the command channel the bridge uses to drive a
//! running Unity Editor:
//!
//! - `ipc` - framed TCP channel, correlation, reconnection and retry policy
//! - `protocol` - request and reply envelopes
//! - `config` - layered bridge configuration
//! - `playmode` - play-mode transitions that survive editor reloads
//!
//! # Example
//!
//! ```ignore
//! use unity_bridge::config::BridgeConfig;
//! use unity_bridge::ipc::{ConnectionManager, RetryPolicy};
//! use unity_bridge::playmode;
//!
//! let channel = ConnectionManager::from_config(&BridgeConfig::load()?);
//! let outcome = playmode::enter_play_mode(&channel, &RetryPolicy::default()).await?;
//! println!("{}", outcome.message);
//! ```

pub mod config;
pub mod ipc;
pub mod playmode;
pub mod protocol;
