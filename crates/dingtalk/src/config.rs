use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    dingbridge_channels::gating::{DmPolicy, GroupPolicy},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
};

pub const DEFAULT_API_BASE: &str = "https://api.dingtalk.com";
pub const DEFAULT_OAPI_BASE: &str = "https://oapi.dingtalk.com";

/// How replies are rendered in the conversation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageMode {
    /// Markdown messages through the session webhook.
    #[default]
    Text,
    /// A streaming AI card updated in place.
    Card,
}

/// Language for user-visible notices (denials, thinking text).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Zh,
    En,
}

impl Locale {
    #[must_use]
    pub fn thinking_text(self) -> &'static str {
        match self {
            Self::Zh => "思考中...",
            Self::En => "Thinking...",
        }
    }

    #[must_use]
    pub fn denial_notice(self, sender_id: &str) -> String {
        match self {
            Self::Zh => format!(
                "抱歉，您暂无权限使用此机器人。\n您的用户 ID：{sender_id}\n请联系管理员将该 ID 加入白名单。"
            ),
            Self::En => format!(
                "Sorry, you are not allowed to use this bot.\nYour user ID: {sender_id}\nAsk an administrator to add it to the allowlist."
            ),
        }
    }

    #[must_use]
    pub fn reply_title(self) -> &'static str {
        match self {
            Self::Zh => "回复",
            Self::En => "Reply",
        }
    }
}

/// Configuration for a single DingTalk robot account.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DingTalkAccountConfig {
    /// App key (client id) of the DingTalk application.
    pub client_id: String,

    /// App secret (client secret).
    #[serde(serialize_with = "serialize_secret")]
    pub client_secret: Secret<String>,

    /// Robot code used for sends and file downloads; defaults to `client_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_code: Option<String>,

    /// DM access policy.
    pub dm_policy: DmPolicy,

    /// Group access policy.
    pub group_policy: GroupPolicy,

    /// Sender allowlist for DMs (staff ids, `*` wildcard).
    pub allowlist: Vec<String>,

    /// Conversation id allowlist for groups.
    pub group_allowlist: Vec<String>,

    /// How replies are rendered.
    pub message_mode: MessageMode,

    /// AI card template id, required for `message_mode = card`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_template_id: Option<String>,

    /// Send a working acknowledgment before the agent replies.
    pub show_thinking: bool,

    /// Override for the acknowledgment text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_text: Option<String>,

    /// Language for user-visible notices.
    pub locale: Locale,

    /// Merge window for rapid-fire inbound messages (ms).
    pub merge_window_ms: u64,

    /// Flush a merge window early once it holds this many messages.
    pub merge_max_messages: usize,

    /// Minimum interval between updates of one card (ms).
    pub card_throttle_ms: u64,

    /// A card with no updates for this long stops being tracked as streaming.
    pub card_inactivity_secs: u64,

    /// Cards not updated for this long are evicted from the registry.
    pub card_ttl_secs: u64,

    /// Period of the card registry sweep.
    pub card_sweep_secs: u64,

    /// Host session inactivity timeout; downloaded media lives twice as long.
    pub session_timeout_secs: u64,

    /// Root directory for session-scoped media (defaults to a directory next to
    /// the agent's session store).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_dir: Option<PathBuf>,

    /// Retries for transient API failures.
    pub max_retries: u32,

    /// Base URL of the `api.dingtalk.com` family of endpoints.
    pub api_base: String,

    /// Base URL of the legacy `oapi.dingtalk.com` endpoints (media upload).
    pub oapi_base: String,

    /// Default model ID for sessions started from this account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl std::fmt::Debug for DingTalkAccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DingTalkAccountConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("robot_code", &self.robot_code)
            .field("dm_policy", &self.dm_policy)
            .field("group_policy", &self.group_policy)
            .field("message_mode", &self.message_mode)
            .finish_non_exhaustive()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Default for DingTalkAccountConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: Secret::new(String::new()),
            robot_code: None,
            dm_policy: DmPolicy::Open,
            group_policy: GroupPolicy::Open,
            allowlist: Vec::new(),
            group_allowlist: Vec::new(),
            message_mode: MessageMode::Text,
            card_template_id: None,
            show_thinking: true,
            thinking_text: None,
            locale: Locale::Zh,
            merge_window_ms: 2_000,
            merge_max_messages: 5,
            card_throttle_ms: 500,
            card_inactivity_secs: 60,
            card_ttl_secs: 3_600,
            card_sweep_secs: 1_800,
            session_timeout_secs: 1_800,
            media_dir: None,
            max_retries: 3,
            api_base: DEFAULT_API_BASE.into(),
            oapi_base: DEFAULT_OAPI_BASE.into(),
            model: None,
        }
    }
}

impl DingTalkAccountConfig {
    /// Reject configs that cannot possibly run.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::message("dingtalk client_id is required"));
        }
        if self.client_secret.expose_secret().trim().is_empty() {
            return Err(Error::message("dingtalk client_secret is required"));
        }
        if self.message_mode == MessageMode::Card
            && self
                .card_template_id
                .as_deref()
                .is_none_or(|id| id.trim().is_empty())
        {
            return Err(Error::message(
                "dingtalk card_template_id is required when message_mode is \"card\"",
            ));
        }
        if self.merge_max_messages == 0 {
            return Err(Error::message("dingtalk merge_max_messages must be at least 1"));
        }
        Ok(())
    }

    #[must_use]
    pub fn robot_code(&self) -> &str {
        self.robot_code
            .as_deref()
            .filter(|code| !code.is_empty())
            .unwrap_or(&self.client_id)
    }

    #[must_use]
    pub fn thinking_text(&self) -> &str {
        self.thinking_text
            .as_deref()
            .unwrap_or_else(|| self.locale.thinking_text())
    }

    #[must_use]
    pub fn merge_window(&self) -> Duration {
        Duration::from_millis(self.merge_window_ms)
    }

    #[must_use]
    pub fn card_throttle(&self) -> Duration {
        Duration::from_millis(self.card_throttle_ms)
    }

    #[must_use]
    pub fn card_inactivity(&self) -> Duration {
        Duration::from_secs(self.card_inactivity_secs)
    }

    #[must_use]
    pub fn card_ttl(&self) -> Duration {
        Duration::from_secs(self.card_ttl_secs)
    }

    #[must_use]
    pub fn card_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.card_sweep_secs)
    }

    /// Downloaded media outlives the session by one extra timeout.
    #[must_use]
    pub fn media_retention(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs.saturating_mul(2))
    }

    #[must_use]
    pub fn media_root(&self, store_path: &Path) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| store_path.join("dingtalk-media"))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }
}

/// Account ids declared in a channel config object.
///
/// Accepts `{"accounts": {"<id>": {...}}}`; a config with top-level
/// credentials and no `accounts` map is the single account `"default"`.
pub fn list_account_ids(config: &serde_json::Value) -> Vec<String> {
    if let Some(accounts) = config.get("accounts").and_then(|a| a.as_object()) {
        let mut ids: Vec<String> = accounts.keys().cloned().collect();
        ids.sort();
        return ids;
    }
    let has_credentials = config
        .get("client_id")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.is_empty());
    if has_credentials {
        vec!["default".to_string()]
    } else {
        Vec::new()
    }
}
