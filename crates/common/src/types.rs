use serde::{Deserialize, Serialize};

/// Kind of conversation a message arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    /// One-to-one conversation with the bot.
    Dm,
    /// Multi-member group conversation.
    Group,
}

impl ChatType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dm => "direct",
            Self::Group => "group",
        }
    }
}

/// A media item attached to an outbound reply.
///
/// `url` may be a local path, a `file://` URL, an `http(s)://` URL or a
/// base64 `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub url: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Where a reply chunk sits in the agent's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    /// Partial streamed block of the answer.
    Block,
    /// Tool progress or tool result summary.
    Tool,
    /// Last chunk of the answer.
    #[default]
    Final,
}

/// Outbound reply chunk produced by the host runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub kind: ReplyKind,
}

impl ReplyPayload {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn block(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: ReplyKind::Block,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_media(mut self, media: MediaAttachment) -> Self {
        self.media.push(media);
        self
    }

    #[must_use]
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}
