//! DingTalk channel plugin for dingbridge.
//!
//! Receives bot messages over the DingTalk stream-mode websocket, merges
//! rapid-fire messages from the same sender into one turn, runs them through
//! the host runtime and streams replies back as session-webhook messages or
//! in-place updated AI cards.

pub mod access;
pub mod auth;
pub mod cards;
pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod merge;
pub mod message;
pub mod outbound;
pub mod pipeline;
pub mod plugin;
pub mod retry;
pub mod state;
pub mod stream;

pub use {
    config::DingTalkAccountConfig,
    error::{Error, Result},
    plugin::DingTalkPlugin,
};

/// Channel identifier used in routes, addresses and activity records.
pub const CHANNEL_ID: &str = "dingtalk";
