//! Channel plugin system.
//!
//! A channel (DingTalk today) implements the `ChannelPlugin` trait with
//! sub-traits for outbound messaging, streaming and status, and consumes the
//! host through the `ChannelRuntime` capability traits.

pub mod error;
pub mod gating;
pub mod plugin;
pub mod runtime;

pub use {
    error::{Error, Result},
    plugin::{
        ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus,
        ChannelStreamOutbound, StreamEvent, StreamReceiver, StreamSender,
    },
    runtime::{
        ActivityPhase, AgentRoute, ChannelRuntime, DeliveryOutcome, DispatchSummary,
        EnvelopeFormatOptions, InboundContext, InboundEnvelope, InboundMedia, PeerRef,
        ReplyDeliverer, ReplyDispatcher, RouteRequest,
    },
};
