//! Shared reply/media types and the error-context helper used across
//! dingbridge crates.

pub mod error;
pub mod types;

pub use error::FromMessage;
