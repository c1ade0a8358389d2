use {
    dingbridge_channels::gating::{self, DmPolicy, GroupPolicy},
    dingbridge_common::types::ChatType,
};

use crate::{config::DingTalkAccountConfig, message::BotMessage};

/// Outcome of a successful access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessGrant {
    Allowed,
    /// Policy is `pairing`: the host runtime makes the final call.
    NeedsPairing,
}

/// Determine if an inbound message should be processed.
///
/// DMs are matched against the allowlist by staff id and by the raw platform
/// sender id; groups by conversation id.
pub fn check_access(
    config: &DingTalkAccountConfig,
    message: &BotMessage,
) -> Result<AccessGrant, AccessDenied> {
    match message.chat_type() {
        ChatType::Dm => check_dm_access(config, message.sender_id(), &message.sender_id),
        ChatType::Group => check_group_access(config, &message.conversation_id),
    }
}

fn check_dm_access(
    config: &DingTalkAccountConfig,
    staff_id: &str,
    platform_id: &str,
) -> Result<AccessGrant, AccessDenied> {
    match config.dm_policy {
        DmPolicy::Disabled => Err(AccessDenied::DmsDisabled),
        DmPolicy::Open => Ok(AccessGrant::Allowed),
        DmPolicy::Pairing => Ok(AccessGrant::NeedsPairing),
        DmPolicy::Allowlist => {
            if gating::is_allowed(staff_id, &config.allowlist)
                || gating::is_allowed(platform_id, &config.allowlist)
            {
                Ok(AccessGrant::Allowed)
            } else {
                Err(AccessDenied::NotOnAllowlist)
            }
        },
    }
}

fn check_group_access(
    config: &DingTalkAccountConfig,
    conversation_id: &str,
) -> Result<AccessGrant, AccessDenied> {
    match config.group_policy {
        GroupPolicy::Disabled => Err(AccessDenied::GroupsDisabled),
        GroupPolicy::Open => Ok(AccessGrant::Allowed),
        GroupPolicy::Allowlist => {
            if gating::is_allowed(conversation_id, &config.group_allowlist) {
                Ok(AccessGrant::Allowed)
            } else {
                Err(AccessDenied::GroupNotOnAllowlist)
            }
        },
    }
}

/// Reason an inbound message was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenied {
    DmsDisabled,
    NotOnAllowlist,
    PairingRejected,
    GroupsDisabled,
    GroupNotOnAllowlist,
}

impl AccessDenied {
    /// DM denials get a notice back; group denials are dropped silently.
    #[must_use]
    pub fn notifies_sender(self) -> bool {
        matches!(self, Self::NotOnAllowlist | Self::PairingRejected)
    }
}

impl std::fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DmsDisabled => write!(f, "DMs are disabled"),
            Self::NotOnAllowlist => write!(f, "sender not on allowlist"),
            Self::PairingRejected => write!(f, "sender not paired"),
            Self::GroupsDisabled => write!(f, "groups are disabled"),
            Self::GroupNotOnAllowlist => write!(f, "group not on allowlist"),
        }
    }
}
