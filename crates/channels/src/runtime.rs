//! Host runtime capabilities consumed by channel plugins.
//!
//! The host owns agent routing, session storage, envelope formatting and the
//! reply pipeline. Channels only see these traits; the gateway provides the
//! concrete implementation.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    async_trait::async_trait,
    dingbridge_common::types::{ChatType, ReplyPayload},
    serde::Serialize,
};

/// The conversational peer a route is resolved for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRef {
    pub kind: ChatType,
    /// Sender id for DMs, conversation id for groups.
    pub id: String,
}

/// Input to agent-route resolution.
#[derive(Debug, Clone, Serialize)]
pub struct RouteRequest {
    pub channel: String,
    pub account_id: String,
    pub peer: PeerRef,
}

/// Resolved route: which agent handles the message and its session keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRoute {
    pub agent_id: String,
    pub session_key: String,
    pub main_session_key: String,
}

/// Envelope formatting preferences the host resolves from its config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvelopeFormatOptions {
    pub include_timestamp: bool,
    pub include_elapsed: bool,
    pub timezone: Option<String>,
}

/// Raw material for the host's inbound envelope.
#[derive(Debug, Clone, Serialize)]
pub struct InboundEnvelope {
    pub channel: String,
    /// Display label of the sender (nick, or id when no nick is known).
    pub from: String,
    pub chat_type: ChatType,
    pub conversation_title: Option<String>,
    pub timestamp_ms: i64,
    pub previous_timestamp_ms: Option<i64>,
    pub body: String,
}

/// Locally stored media handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMedia {
    pub path: PathBuf,
    pub mime_type: String,
    pub file_name: String,
}

/// Fully assembled inbound context handed to the reply pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct InboundContext {
    /// Envelope-formatted body shown to the agent.
    pub body: String,
    /// Merged user text without envelope decoration.
    pub raw_body: String,
    pub channel: String,
    pub account_id: String,
    pub agent_id: String,
    pub session_key: String,
    /// Canonical sender address (`dingtalk:<id>`).
    pub from: String,
    /// Canonical reply address (`dingtalk:<id>` or `dingtalk:group:<id>`).
    pub to: String,
    pub chat_type: ChatType,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub conversation_id: String,
    pub conversation_title: Option<String>,
    pub message_id: String,
    pub timestamp_ms: i64,
    pub was_mentioned: bool,
    pub media: Vec<InboundMedia>,
    pub model: Option<String>,
}

/// Lifecycle marker for activity recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityPhase {
    Start,
    Stop,
}

/// Result of delivering one reply chunk back to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed { error: String },
}

impl DeliveryOutcome {
    #[must_use]
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self::Failed {
            error: error.to_string(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Counts reported by the host once a dispatch completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
}

/// Channel-side sink for reply chunks. Never returns an error: failures are
/// reported as [`DeliveryOutcome::Failed`] so the host decides what to do.
#[async_trait]
pub trait ReplyDeliverer: Send + Sync {
    async fn deliver(&self, payload: ReplyPayload) -> DeliveryOutcome;
}

/// A host reply dispatcher bound to one inbound turn.
#[async_trait]
pub trait ReplyDispatcher: Send + Sync {
    /// Run the agent for `ctx`, feeding every reply chunk to the deliverer.
    async fn dispatch(&self, ctx: InboundContext) -> anyhow::Result<DispatchSummary>;

    /// Tell the host the channel is done with this turn (stops typing state).
    fn mark_idle(&self);
}

/// Capability set the host runtime exposes to channel plugins.
#[async_trait]
pub trait ChannelRuntime: Send + Sync {
    async fn resolve_agent_route(&self, request: RouteRequest) -> anyhow::Result<AgentRoute>;

    fn resolve_store_path(&self, agent_id: &str) -> PathBuf;

    async fn read_session_updated_at(&self, store_path: &Path, session_key: &str) -> Option<i64>;

    async fn record_inbound_session(
        &self,
        store_path: &Path,
        ctx: &InboundContext,
    ) -> anyhow::Result<()>;

    fn envelope_format_options(&self) -> EnvelopeFormatOptions {
        EnvelopeFormatOptions::default()
    }

    fn format_inbound_envelope(
        &self,
        envelope: &InboundEnvelope,
        options: &EnvelopeFormatOptions,
    ) -> String;

    fn finalize_inbound_context(&self, ctx: InboundContext) -> InboundContext {
        ctx
    }

    fn create_reply_dispatcher(&self, deliverer: Arc<dyn ReplyDeliverer>)
    -> Box<dyn ReplyDispatcher>;

    /// Decide a DM from a sender under the `pairing` policy.
    async fn check_pairing(&self, _channel: &str, _account_id: &str, _sender_id: &str) -> bool {
        false
    }

    async fn record_activity(&self, _channel: &str, _account_id: &str, _phase: ActivityPhase) {}
}
