use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    anyhow::Result as AnyResult,
    async_trait::async_trait,
    base64::Engine,
    serde_json::{Value, json},
    tracing::{debug, warn},
};

use {
    dingbridge_channels::{
        gating::strip_channel_prefix,
        plugin::{ChannelOutbound, ChannelStreamOutbound, StreamEvent, StreamReceiver},
    },
    dingbridge_common::types::{MediaAttachment, ReplyPayload},
};

use crate::{
    cards::{CardClient, CardRegistry, CardTarget, CardThrottle, CardWriter, UpdateOutcome},
    client::DingTalkClient,
    config::Locale,
    error::{Context, Error, Result},
    media::{MediaTransfer, MediaType},
    state::AccountStateMap,
};

const USER_SEND_PATH: &str = "/v1.0/robot/oToMessages/batchSend";
const GROUP_SEND_PATH: &str = "/v1.0/robot/groupMessages/send";

/// Longest markdown title the client renders in notifications.
const MAX_TITLE_CHARS: usize = 20;

/// Recipient of a proactive message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Staff id of a user (one-on-one chat with the robot).
    User(String),
    /// Open conversation id of a group.
    Group(String),
}

impl Target {
    /// Parse an outbound address: `group:<cid>` or a bare `cid…` id is a
    /// group, `user:<id>` or any other id is a user. Channel prefixes such as
    /// `dingtalk:` are ignored.
    pub fn parse(to: &str) -> Result<Self> {
        let id = strip_channel_prefix(to);
        let target = if let Some(rest) = id.strip_prefix("group:") {
            Self::Group(rest.trim().to_string())
        } else if let Some(rest) = id.strip_prefix("user:") {
            Self::User(rest.trim().to_string())
        } else if id.starts_with("cid") {
            Self::Group(id.to_string())
        } else {
            Self::User(id.to_string())
        };
        match &target {
            Self::User(id) | Self::Group(id) if id.is_empty() => {
                Err(dingbridge_channels::Error::invalid_input(format!("dingtalk target {to:?}")).into())
            },
            _ => Ok(target),
        }
    }

    #[must_use]
    pub fn card_target(&self) -> CardTarget {
        match self {
            Self::User(id) => CardTarget::User(id.clone()),
            Self::Group(id) => CardTarget::Group(id.clone()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Group(id) => id,
        }
    }
}

/// Notification title for a markdown message: the first non-empty line with
/// markdown markers stripped, shortened to [`MAX_TITLE_CHARS`].
#[must_use]
pub fn markdown_title(text: &str, fallback: &str) -> String {
    let line = text
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(['#', '>', '-', '*', ' '])
                .replace(['*', '`', '_'], "")
        })
        .find(|line| !line.trim().is_empty());
    match line {
        Some(line) => line.trim().chars().take(MAX_TITLE_CHARS).collect(),
        None => fallback.to_string(),
    }
}

/// Sends messages for one account: session-webhook replies with proactive
/// fallback, and media uploads.
#[derive(Clone)]
pub struct DingTalkSender {
    client: DingTalkClient,
    media: MediaTransfer,
    locale: Locale,
}

impl DingTalkSender {
    pub fn new(client: DingTalkClient, locale: Locale) -> Self {
        Self {
            media: MediaTransfer::new(client.clone()),
            client,
            locale,
        }
    }

    #[must_use]
    pub fn media(&self) -> &MediaTransfer {
        &self.media
    }

    /// Send `text` as markdown, through `session_webhook` when given and
    /// falling back to a proactive message when the webhook fails.
    pub async fn send_markdown(
        &self,
        target: &Target,
        text: &str,
        session_webhook: Option<&str>,
    ) -> Result<()> {
        let title = markdown_title(text, self.locale.reply_title());
        if let Some(webhook) = session_webhook {
            let body = json!({
                "msgtype": "markdown",
                "markdown": { "title": title, "text": text },
            });
            match self.client.post_session_webhook(webhook, &body).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    target = target.id(),
                    error = %e,
                    "session webhook send failed, falling back to proactive send"
                ),
            }
        }
        self.send_proactive(
            target,
            "sampleMarkdown",
            json!({ "title": title, "text": text }),
        )
        .await
    }

    /// Send a short plain-text notice (denials, acknowledgments).
    pub async fn send_notice(
        &self,
        target: &Target,
        text: &str,
        session_webhook: Option<&str>,
    ) -> Result<()> {
        if let Some(webhook) = session_webhook {
            let body = json!({ "msgtype": "text", "text": { "content": text } });
            match self.client.post_session_webhook(webhook, &body).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    target = target.id(),
                    error = %e,
                    "session webhook notice failed, falling back to proactive send"
                ),
            }
        }
        self.send_proactive(target, "sampleText", json!({ "content": text }))
            .await
    }

    async fn send_proactive(&self, target: &Target, msg_key: &str, param: Value) -> Result<()> {
        let robot_code = self.client.robot_code();
        let (operation, path, body) = match target {
            Target::User(user_id) => ("user send", USER_SEND_PATH, json!({
                "robotCode": robot_code,
                "userIds": [user_id],
                "msgKey": msg_key,
                "msgParam": param.to_string(),
            })),
            Target::Group(conversation_id) => ("group send", GROUP_SEND_PATH, json!({
                "robotCode": robot_code,
                "openConversationId": conversation_id,
                "msgKey": msg_key,
                "msgParam": param.to_string(),
            })),
        };
        let _: Value = self.client.post_json(operation, path, &body).await?;
        debug!(target = target.id(), msg_key, "proactive message sent");
        Ok(())
    }

    /// Send one attachment. Remote images are sent by URL; everything else is
    /// uploaded first.
    pub async fn send_attachment(&self, target: &Target, attachment: &MediaAttachment) -> Result<()> {
        let is_image = attachment.mime_type.starts_with("image/");
        if is_image && is_remote_url(&attachment.url) {
            return self
                .send_proactive(target, "sampleImageMsg", json!({ "photoURL": attachment.url }))
                .await;
        }

        let (path, temporary) = local_attachment_path(attachment).await?;
        let declared = declared_type(&attachment.mime_type);
        let uploaded = self.media.upload(&path, declared).await;
        if temporary && let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %e, "failed to remove temp attachment");
        }
        let uploaded = uploaded.ok_or_else(|| {
            Error::message(format!("dingtalk upload failed for {}", path.display()))
        })?;

        if uploaded.media_type == MediaType::Image {
            return self
                .send_proactive(
                    target,
                    "sampleImageMsg",
                    json!({ "photoURL": uploaded.media_id }),
                )
                .await;
        }
        let file_name = attachment
            .file_name
            .clone()
            .or_else(|| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "file".to_string());
        let file_type = Path::new(&file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("file")
            .to_ascii_lowercase();
        self.send_proactive(
            target,
            "sampleFile",
            json!({
                "mediaId": uploaded.media_id,
                "fileName": file_name,
                "fileType": file_type,
            }),
        )
        .await
    }
}

fn is_remote_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn declared_type(mime_type: &str) -> MediaType {
    match mime_type.split('/').next().unwrap_or_default() {
        "image" => MediaType::Image,
        "audio" => MediaType::Voice,
        "video" => MediaType::Video,
        _ => MediaType::File,
    }
}

/// Resolve an attachment to a local file. Returns the path and whether it is
/// a temporary copy the caller must delete.
async fn local_attachment_path(attachment: &MediaAttachment) -> Result<(PathBuf, bool)> {
    let url = attachment.url.as_str();
    if let Some(rest) = url.strip_prefix("data:") {
        let (meta, data) = rest.split_once(',').context("malformed data URI")?;
        if !meta.ends_with(";base64") {
            return Err(Error::message("only base64 data URIs are supported"));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .context("decode data URI")?;
        let ext = attachment
            .file_name
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(str::to_string)
            .or_else(|| meta.split(['/', ';']).nth(1).map(str::to_string))
            .unwrap_or_else(|| "bin".to_string());
        let path = std::env::temp_dir().join(format!(
            "dingbridge-{}.{ext}",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&path, bytes).await?;
        return Ok((path, true));
    }
    if is_remote_url(url) {
        return Err(Error::message(format!(
            "remote {} attachments must be downloaded before sending",
            attachment.mime_type
        )));
    }
    let path = url
        .strip_prefix("file://")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(url));
    Ok((path, false))
}

/// Outbound adapter over every running account.
pub struct DingTalkOutbound {
    pub(crate) accounts: AccountStateMap,
}

struct StreamParts {
    sender: DingTalkSender,
    cards: Option<(CardClient, CardThrottle)>,
    registry: Arc<CardRegistry>,
}

impl DingTalkOutbound {
    fn sender(&self, account_id: &str) -> AnyResult<DingTalkSender> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .map(|s| s.sender.clone())
            .ok_or_else(|| dingbridge_channels::Error::unknown_account(account_id).into())
    }

    fn stream_parts(&self, account_id: &str) -> AnyResult<StreamParts> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        let state = accounts
            .get(account_id)
            .ok_or_else(|| dingbridge_channels::Error::unknown_account(account_id))?;
        Ok(StreamParts {
            sender: state.sender.clone(),
            cards: state
                .cards
                .clone()
                .map(|cards| (cards, state.throttle.clone())),
            registry: Arc::clone(&state.registry),
        })
    }
}

#[async_trait]
impl ChannelOutbound for DingTalkOutbound {
    async fn send_text(
        &self,
        account_id: &str,
        to: &str,
        text: &str,
        _reply_to: Option<&str>,
    ) -> AnyResult<()> {
        let sender = self.sender(account_id)?;
        let target = Target::parse(to)?;
        sender.send_markdown(&target, text, None).await?;
        Ok(())
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
        _reply_to: Option<&str>,
    ) -> AnyResult<()> {
        let sender = self.sender(account_id)?;
        let target = Target::parse(to)?;
        let mut failures = 0usize;
        for attachment in &payload.media {
            if let Err(e) = sender.send_attachment(&target, attachment).await {
                failures += 1;
                warn!(account_id, to, url = %attachment.url, error = %e, "attachment send failed");
            }
        }
        if payload.has_text() {
            sender.send_markdown(&target, &payload.text, None).await?;
        }
        if failures > 0 && failures == payload.media.len() && !payload.has_text() {
            anyhow::bail!("all {failures} attachments failed to send");
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelStreamOutbound for DingTalkOutbound {
    async fn send_stream(
        &self,
        account_id: &str,
        to: &str,
        _reply_to: Option<&str>,
        mut stream: StreamReceiver,
    ) -> AnyResult<()> {
        let parts = self.stream_parts(account_id)?;
        let target = Target::parse(to)?;
        let mut accumulated = String::new();
        let mut writer: Option<CardWriter> = None;
        let mut card_failed = false;

        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::Delta(delta) => {
                    accumulated.push_str(&delta);
                    if let Some(writer) = &writer {
                        writer.push(accumulated.clone());
                        continue;
                    }
                    let Some((cards, throttle)) = parts.cards.as_ref() else {
                        continue;
                    };
                    if card_failed || accumulated.trim().is_empty() {
                        continue;
                    }
                    match CardWriter::open(
                        cards,
                        &target.card_target(),
                        &accumulated,
                        &parts.registry,
                        throttle.clone(),
                    )
                    .await
                    {
                        Ok(opened) => writer = Some(opened),
                        Err(e) => {
                            card_failed = true;
                            warn!(account_id, to, error = %e, "stream card create failed");
                        },
                    }
                },
                StreamEvent::Done => break,
                StreamEvent::Error(e) => {
                    debug!(account_id, to, "stream error: {e}");
                    break;
                },
            }
        }

        if accumulated.trim().is_empty() {
            return Ok(());
        }
        if let Some(writer) = &writer {
            match writer.finalize(Some(accumulated.clone())).await {
                Ok(UpdateOutcome::Cancelled) => {
                    warn!(card_id = writer.card_id(), "card gone before final update, sending text");
                },
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(card_id = writer.card_id(), error = %e, "final card update failed, sending text");
                },
            }
        }
        parts.sender.send_markdown(&target, &accumulated, None).await?;
        Ok(())
    }

    async fn is_stream_enabled(&self, account_id: &str) -> bool {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.get(account_id).is_some_and(|s| s.cards.is_some())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::client::tests::test_client, mockito::Matcher, rstest::rstest};

    #[rstest]
    #[case("dingtalk:manager01", Target::User("manager01".into()))]
    #[case("user:manager01", Target::User("manager01".into()))]
    #[case("group:cidAbC==", Target::Group("cidAbC==".into()))]
    #[case("cidAbC==", Target::Group("cidAbC==".into()))]
    #[case("dd:group:cid1", Target::Group("cid1".into()))]
    fn parses_targets(#[case] raw: &str, #[case] expected: Target) {
        assert_eq!(Target::parse(raw).unwrap(), expected);
    }

    #[test]
    fn empty_target_is_rejected() {
        assert!(Target::parse("dingtalk:").is_err());
        assert!(Target::parse("group:").is_err());
    }

    #[rstest]
    #[case("# Weekly report\n\nbody", "Weekly report")]
    #[case("\n\n**Bold** start", "Bold start")]
    #[case("", "Reply")]
    #[case("abcdefghijklmnopqrstuvwxyz", "abcdefghijklmnopqrst")]
    fn markdown_titles(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(markdown_title(text, "Reply"), expected);
    }

    #[tokio::test]
    async fn markdown_goes_through_session_webhook() {
        let mut server = mockito::Server::new_async().await;
        let webhook = server
            .mock("POST", "/robot/sendBySession")
            .match_body(Matcher::PartialJson(json!({
                "msgtype": "markdown",
                "markdown": { "title": "Hello", "text": "Hello\nworld" },
            })))
            .with_status(200)
            .with_body(r#"{"errcode":0}"#)
            .create_async()
            .await;
        let proactive = server
            .mock("POST", USER_SEND_PATH)
            .expect(0)
            .create_async()
            .await;

        let sender = DingTalkSender::new(test_client(&server.url()).await, Locale::En);
        let url = format!("{}/robot/sendBySession", server.url());
        sender
            .send_markdown(&Target::User("u1".into()), "Hello\nworld", Some(&url))
            .await
            .unwrap();
        webhook.assert_async().await;
        proactive.assert_async().await;
    }

    #[tokio::test]
    async fn failed_webhook_falls_back_to_proactive() {
        let mut server = mockito::Server::new_async().await;
        let _webhook = server
            .mock("POST", "/robot/sendBySession")
            .with_status(200)
            .with_body(r#"{"errcode":300001,"errmsg":"expired"}"#)
            .create_async()
            .await;
        let proactive = server
            .mock("POST", GROUP_SEND_PATH)
            .match_body(Matcher::PartialJson(json!({
                "robotCode": "ding_app",
                "openConversationId": "cid9",
                "msgKey": "sampleMarkdown",
            })))
            .with_status(200)
            .with_body(r#"{"processQueryKey":"k"}"#)
            .expect(1)
            .create_async()
            .await;

        let sender = DingTalkSender::new(test_client(&server.url()).await, Locale::Zh);
        let url = format!("{}/robot/sendBySession", server.url());
        sender
            .send_markdown(&Target::Group("cid9".into()), "hi", Some(&url))
            .await
            .unwrap();
        proactive.assert_async().await;
    }

    #[tokio::test]
    async fn remote_image_is_sent_by_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", USER_SEND_PATH)
            .match_body(Matcher::PartialJson(json!({
                "msgKey": "sampleImageMsg",
                "msgParam": r#"{"photoURL":"https://cdn.example.com/chart.png"}"#,
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let sender = DingTalkSender::new(test_client(&server.url()).await, Locale::En);
        sender
            .send_attachment(&Target::User("u1".into()), &MediaAttachment {
                url: "https://cdn.example.com/chart.png".into(),
                mime_type: "image/png".into(),
                file_name: None,
            })
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn local_file_is_uploaded_then_sent() {
        let mut server = mockito::Server::new_async().await;
        let upload = server
            .mock("POST", "/media/upload")
            .match_query(Matcher::UrlEncoded("type".into(), "file".into()))
            .with_status(200)
            .with_body(r#"{"errcode":0,"media_id":"@file1","created_at":1700000000}"#)
            .create_async()
            .await;
        let send = server
            .mock("POST", USER_SEND_PATH)
            .match_body(Matcher::PartialJson(json!({ "msgKey": "sampleFile" })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let sender = DingTalkSender::new(test_client(&server.url()).await, Locale::En);
        sender
            .send_attachment(&Target::User("u1".into()), &MediaAttachment {
                url: format!("file://{}", path.display()),
                mime_type: "application/pdf".into(),
                file_name: Some("notes.pdf".into()),
            })
            .await
            .unwrap();
        upload.assert_async().await;
        send.assert_async().await;
    }

    #[tokio::test]
    async fn missing_local_file_fails() {
        let server = mockito::Server::new_async().await;
        let sender = DingTalkSender::new(test_client(&server.url()).await, Locale::En);
        let err = sender
            .send_attachment(&Target::User("u1".into()), &MediaAttachment {
                url: "/nope/missing.pdf".into(),
                mime_type: "application/pdf".into(),
                file_name: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("upload failed"));
    }

    #[tokio::test]
    async fn data_uri_is_written_to_temp_file() {
        let attachment = MediaAttachment {
            url: "data:image/png;base64,aGVsbG8=".into(),
            mime_type: "image/png".into(),
            file_name: None,
        };
        let (path, temporary) = local_attachment_path(&attachment).await.unwrap();
        assert!(temporary);
        assert_eq!(path.extension().unwrap(), "png");
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        std::fs::remove_file(path).unwrap();
    }
}
