//! Bot callback payloads and push-stream frames.

use {
    dingbridge_common::types::ChatType,
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
};

use crate::error::Result;

/// Topic carrying bot messages on the push stream.
pub const BOT_MESSAGE_TOPIC: &str = "/v1.0/im/bot/messages/get";

/// Kind of a media reference attached to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    File,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::File => "file",
        }
    }
}

/// A remote file that can be fetched with the robot's download code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub download_code: String,
    pub kind: MediaKind,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TextContent {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RichTextPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub download_code: Option<String>,
}

/// `content` object of non-text messages.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub download_code: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    /// Speech-to-text result for audio messages.
    #[serde(default)]
    pub recognition: Option<String>,
    #[serde(default)]
    pub rich_text: Vec<RichTextPart>,
}

/// Inbound bot message as delivered on [`BOT_MESSAGE_TOPIC`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotMessage {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub conversation_id: String,
    /// `"1"` for one-on-one chats, `"2"` for groups.
    #[serde(default)]
    pub conversation_type: String,
    #[serde(default)]
    pub conversation_title: Option<String>,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_staff_id: Option<String>,
    #[serde(default)]
    pub sender_nick: Option<String>,
    #[serde(default)]
    pub chatbot_user_id: String,
    #[serde(default)]
    pub robot_code: Option<String>,
    #[serde(default)]
    pub session_webhook: Option<String>,
    /// Expiry of `session_webhook`, epoch milliseconds.
    #[serde(default)]
    pub session_webhook_expired_time: Option<i64>,
    /// Creation time, epoch milliseconds.
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub msgtype: String,
    #[serde(default)]
    pub text: Option<TextContent>,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub is_in_at_list: Option<bool>,
}

impl BotMessage {
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    #[must_use]
    pub fn chat_type(&self) -> ChatType {
        if self.conversation_type == "2" {
            ChatType::Group
        } else {
            ChatType::Dm
        }
    }

    /// Stable sender id: the staff id when present, else the platform id.
    #[must_use]
    pub fn sender_id(&self) -> &str {
        self.sender_staff_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.sender_id)
    }

    #[must_use]
    pub fn sender_label(&self) -> &str {
        self.sender_nick
            .as_deref()
            .filter(|nick| !nick.is_empty())
            .unwrap_or_else(|| self.sender_id())
    }

    /// Whether the bot itself sent this message.
    #[must_use]
    pub fn is_from_self(&self) -> bool {
        !self.chatbot_user_id.is_empty()
            && (self.sender_id == self.chatbot_user_id
                || self.sender_staff_id.as_deref() == Some(self.chatbot_user_id.as_str()))
    }

    /// Session webhook if it is still valid at `now_ms`.
    #[must_use]
    pub fn live_session_webhook(&self, now_ms: i64) -> Option<&str> {
        let webhook = self.session_webhook.as_deref().filter(|w| !w.is_empty())?;
        match self.session_webhook_expired_time {
            Some(expires) if expires <= now_ms => None,
            _ => Some(webhook),
        }
    }

    /// Plain text carried by the message. Empty for pure media.
    #[must_use]
    pub fn text(&self) -> String {
        match self.msgtype.as_str() {
            "text" => self
                .text
                .as_ref()
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default(),
            "richText" => self
                .content
                .as_ref()
                .map(|c| {
                    c.rich_text
                        .iter()
                        .filter_map(|part| part.text.as_deref())
                        .map(str::trim)
                        .filter(|text| !text.is_empty())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default(),
            "audio" => self
                .content
                .as_ref()
                .and_then(|c| c.recognition.as_deref())
                .map(|text| text.trim().to_string())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Media the message references, in message order.
    #[must_use]
    pub fn media(&self) -> Vec<MediaRef> {
        let Some(content) = self.content.as_ref() else {
            return Vec::new();
        };
        let kind = match self.msgtype.as_str() {
            "picture" => MediaKind::Image,
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            "file" => MediaKind::File,
            "richText" => {
                return content
                    .rich_text
                    .iter()
                    .filter(|part| part.kind.as_deref() == Some("picture"))
                    .filter_map(|part| part.download_code.clone())
                    .filter(|code| !code.is_empty())
                    .map(|download_code| MediaRef {
                        download_code,
                        kind: MediaKind::Image,
                        file_name: None,
                    })
                    .collect();
            },
            _ => return Vec::new(),
        };
        content
            .download_code
            .clone()
            .filter(|code| !code.is_empty())
            .map(|download_code| MediaRef {
                download_code,
                kind,
                file_name: content.file_name.clone(),
            })
            .into_iter()
            .collect()
    }

    /// Text handed to the agent: the message text, or a bracketed marker per
    /// attachment when the message is pure media.
    #[must_use]
    pub fn body(&self) -> String {
        let text = self.text();
        if !text.is_empty() {
            return text;
        }
        self.media()
            .iter()
            .map(|media| match (media.kind, media.file_name.as_deref()) {
                (MediaKind::File, Some(name)) => format!("[File: {name}]"),
                (MediaKind::Image, _) => "[Image]".to_string(),
                (MediaKind::Audio, _) => "[Voice message]".to_string(),
                (MediaKind::Video, _) => "[Video]".to_string(),
                (MediaKind::File, None) => "[File]".to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Frame type on the push stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    System,
    Event,
    Callback,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameHeaders {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
}

/// One frame received on the push-stream websocket. `data` is itself JSON.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    #[serde(default)]
    pub spec_version: Option<String>,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub headers: FrameHeaders,
    #[serde(default)]
    pub data: String,
}

impl StreamFrame {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Acknowledge the frame with `data` as the response payload.
    #[must_use]
    pub fn ack(&self, data: &str) -> String {
        json!({
            "code": 200,
            "headers": {
                "contentType": "application/json",
                "messageId": self.headers.message_id,
            },
            "message": "OK",
            "data": data,
        })
        .to_string()
    }

    /// Acknowledgment for a bot callback.
    #[must_use]
    pub fn callback_ack(&self) -> String {
        self.ack(&json!({ "response": Value::Null }).to_string())
    }
}
