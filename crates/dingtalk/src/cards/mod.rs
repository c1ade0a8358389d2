//! Streaming AI cards: remote create/update calls, the local registry of live
//! cards, the per-card update throttle and the writer that streams reply text
//! through it.

pub mod client;
pub mod registry;
pub mod throttle;
pub mod writer;

pub use {
    client::{CardClient, CardTarget},
    registry::{CardInstance, CardRegistry},
    throttle::{CardThrottle, CardUpdater, UpdateOutcome},
    writer::CardWriter,
};
