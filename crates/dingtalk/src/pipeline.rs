//! Inbound message handling: one merged batch in, one agent turn out.

use std::{
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    tokio::sync::Mutex as AsyncMutex,
    tracing::{debug, info, warn},
};

use {
    dingbridge_channels::{
        ActivityPhase, AgentRoute, ChannelRuntime, DeliveryOutcome, DispatchSummary,
        InboundContext, InboundEnvelope, InboundMedia, PeerRef, ReplyDeliverer, RouteRequest,
    },
    dingbridge_common::types::{ChatType, MediaAttachment, ReplyKind, ReplyPayload},
};

use crate::{
    CHANNEL_ID,
    access::{self, AccessDenied, AccessGrant},
    cards::{CardClient, CardRegistry, CardThrottle, CardWriter, UpdateOutcome},
    config::{DingTalkAccountConfig, MessageMode},
    error::Result,
    media::{DownloadRequest, cleanup_session_media, session_media_dir},
    merge::MergedBatch,
    message::BotMessage,
    outbound::{DingTalkSender, Target},
};

/// How a batch left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The batch held no messages.
    Empty,
    /// Sent by the bot itself.
    SelfMessage,
    Denied(AccessDenied),
    /// Nothing to hand to the agent after merging.
    EmptyText,
    Dispatched(DispatchSummary),
}

/// Runs merged batches for one account through access control, media
/// download, context assembly and reply dispatch.
#[derive(Clone)]
pub struct InboundPipeline {
    account_id: String,
    config: DingTalkAccountConfig,
    runtime: Arc<dyn ChannelRuntime>,
    sender: DingTalkSender,
    cards: Option<CardClient>,
    registry: Arc<CardRegistry>,
    throttle: CardThrottle,
}

impl InboundPipeline {
    pub fn new(
        account_id: impl Into<String>,
        config: DingTalkAccountConfig,
        runtime: Arc<dyn ChannelRuntime>,
        sender: DingTalkSender,
        cards: Option<CardClient>,
        registry: Arc<CardRegistry>,
        throttle: CardThrottle,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            config,
            runtime,
            sender,
            cards,
            registry,
            throttle,
        }
    }

    /// Process one batch. Activity is recorded around the whole run.
    pub async fn process(&self, batch: MergedBatch) -> anyhow::Result<ProcessOutcome> {
        self.runtime
            .record_activity(CHANNEL_ID, &self.account_id, ActivityPhase::Start)
            .await;
        let result = self.run(&batch).await;
        self.runtime
            .record_activity(CHANNEL_ID, &self.account_id, ActivityPhase::Stop)
            .await;
        if let Err(e) = &result {
            warn!(
                account_id = %self.account_id,
                conversation_id = %batch.key.conversation_id,
                error = %e,
                "inbound pipeline failed"
            );
        }
        result
    }

    async fn run(&self, batch: &MergedBatch) -> anyhow::Result<ProcessOutcome> {
        let (Some(carrier), Some(latest)) = (batch.carrier(), batch.latest()) else {
            return Ok(ProcessOutcome::Empty);
        };
        let account_id = self.account_id.as_str();

        if carrier.is_from_self() {
            debug!(account_id, "ignoring message sent by the bot");
            return Ok(ProcessOutcome::SelfMessage);
        }

        let chat_type = carrier.chat_type();
        let sender_id = carrier.sender_id().to_string();
        let target = reply_target(carrier);
        let webhook = latest.live_session_webhook(now_ms()).map(str::to_string);

        if let Err(reason) = self.authorize(carrier).await {
            warn!(account_id, %reason, sender_id = %sender_id, "access denied");
            if reason.notifies_sender() {
                let notice = self.config.locale.denial_notice(&sender_id);
                if let Err(e) = self
                    .sender
                    .send_notice(&target, &notice, webhook.as_deref())
                    .await
                {
                    warn!(account_id, error = %e, "failed to send denial notice");
                }
            }
            return Ok(ProcessOutcome::Denied(reason));
        }

        let raw_body = batch.merged_text();
        if raw_body.trim().is_empty() {
            debug!(account_id, "merged message has no text, skipping");
            return Ok(ProcessOutcome::EmptyText);
        }

        let peer_id = match chat_type {
            ChatType::Dm => sender_id.clone(),
            ChatType::Group => carrier.conversation_id.clone(),
        };
        let route = self
            .runtime
            .resolve_agent_route(RouteRequest {
                channel: CHANNEL_ID.to_string(),
                account_id: account_id.to_string(),
                peer: PeerRef {
                    kind: chat_type,
                    id: peer_id,
                },
            })
            .await?;

        let store_path = self.runtime.resolve_store_path(&route.agent_id);
        let media_root = self.config.media_root(&store_path);
        let media = self.download_media(batch, &route, &media_root).await;

        let previous = self
            .runtime
            .read_session_updated_at(&store_path, &route.session_key)
            .await;
        let timestamp_ms = if carrier.create_at > 0 {
            carrier.create_at
        } else {
            now_ms()
        };
        let envelope = InboundEnvelope {
            channel: CHANNEL_ID.to_string(),
            from: carrier.sender_label().to_string(),
            chat_type,
            conversation_title: carrier.conversation_title.clone(),
            timestamp_ms,
            previous_timestamp_ms: previous,
            body: raw_body.clone(),
        };
        let options = self.runtime.envelope_format_options();
        let body = self.runtime.format_inbound_envelope(&envelope, &options);

        let ctx = self.runtime.finalize_inbound_context(InboundContext {
            body,
            raw_body,
            channel: CHANNEL_ID.to_string(),
            account_id: account_id.to_string(),
            agent_id: route.agent_id.clone(),
            session_key: route.session_key.clone(),
            from: format!("{CHANNEL_ID}:{sender_id}"),
            to: reply_address(&target),
            chat_type,
            sender_id: sender_id.clone(),
            sender_name: carrier.sender_nick.clone(),
            conversation_id: carrier.conversation_id.clone(),
            conversation_title: carrier.conversation_title.clone(),
            message_id: carrier.msg_id.clone(),
            timestamp_ms,
            was_mentioned: carrier
                .is_in_at_list
                .unwrap_or(chat_type == ChatType::Group),
            media,
            model: self.config.model.clone(),
        });

        if let Err(e) = self.runtime.record_inbound_session(&store_path, &ctx).await {
            warn!(account_id, session_key = %route.session_key, error = %e, "failed to record inbound session");
        }

        info!(
            account_id,
            sender_id = %sender_id,
            conversation_id = %carrier.conversation_id,
            messages = batch.len(),
            "dispatching inbound message"
        );

        let thinking_card = self.acknowledge(&target, webhook.as_deref()).await;
        let deliverer = Arc::new(DingTalkReplyDeliverer::new(
            self.sender.clone(),
            target,
            webhook,
            self.cards.clone().map(|cards| CardStreaming {
                cards,
                registry: Arc::clone(&self.registry),
                throttle: self.throttle.clone(),
            }),
            thinking_card,
        ));
        let dispatcher = self
            .runtime
            .create_reply_dispatcher(Arc::clone(&deliverer) as Arc<dyn ReplyDeliverer>);
        let result = dispatcher.dispatch(ctx).await;
        deliverer.finish().await;
        dispatcher.mark_idle();

        let session_dir = session_media_dir(&media_root, &route.session_key);
        let removed = cleanup_session_media(&session_dir, self.config.media_retention()).await;
        if removed > 0 {
            debug!(account_id, removed, "expired session media removed");
        }

        Ok(ProcessOutcome::Dispatched(result?))
    }

    async fn authorize(&self, message: &BotMessage) -> std::result::Result<(), AccessDenied> {
        match access::check_access(&self.config, message)? {
            AccessGrant::Allowed => Ok(()),
            AccessGrant::NeedsPairing => {
                let approved = self
                    .runtime
                    .check_pairing(CHANNEL_ID, &self.account_id, message.sender_id())
                    .await;
                if approved {
                    Ok(())
                } else {
                    Err(AccessDenied::PairingRejected)
                }
            },
        }
    }

    async fn download_media(
        &self,
        batch: &MergedBatch,
        route: &AgentRoute,
        media_root: &Path,
    ) -> Vec<InboundMedia> {
        let mut media = Vec::new();
        for item in batch.media() {
            let request = DownloadRequest {
                download_code: &item.download_code,
                kind: item.kind,
                session_key: &route.session_key,
                store_dir: media_root,
                file_name: item.file_name.as_deref(),
                retention: self.config.media_retention(),
            };
            match self.sender.media().download(&request).await {
                Some(file) => {
                    let file_name = file.original_file_name.unwrap_or_else(|| {
                        file.local_path
                            .file_name()
                            .map(|name| name.to_string_lossy().into_owned())
                            .unwrap_or_else(|| item.download_code.clone())
                    });
                    media.push(InboundMedia {
                        path: file.local_path,
                        mime_type: file.mime_type,
                        file_name,
                    });
                },
                None => warn!(
                    account_id = %self.account_id,
                    kind = item.kind.as_str(),
                    "inbound media unavailable, continuing with text"
                ),
            }
        }
        media
    }

    /// Send the "working" acknowledgment. In card mode this creates the card
    /// the reply will stream into.
    async fn acknowledge(&self, target: &Target, webhook: Option<&str>) -> Option<CardWriter> {
        if !self.config.show_thinking {
            return None;
        }
        let thinking = self.config.thinking_text();
        match (&self.config.message_mode, &self.cards) {
            (MessageMode::Card, Some(cards)) => {
                match CardWriter::open(
                    cards,
                    &target.card_target(),
                    thinking,
                    &self.registry,
                    self.throttle.clone(),
                )
                .await
                {
                    Ok(writer) => Some(writer),
                    Err(e) => {
                        warn!(account_id = %self.account_id, error = %e, "failed to create thinking card");
                        None
                    },
                }
            },
            _ => {
                if let Err(e) = self.sender.send_notice(target, thinking, webhook).await {
                    warn!(account_id = %self.account_id, error = %e, "failed to send thinking notice");
                }
                None
            },
        }
    }
}

fn reply_target(message: &BotMessage) -> Target {
    match message.chat_type() {
        ChatType::Dm => Target::User(message.sender_id().to_string()),
        ChatType::Group => Target::Group(message.conversation_id.clone()),
    }
}

fn reply_address(target: &Target) -> String {
    match target {
        Target::User(id) => format!("{CHANNEL_ID}:{id}"),
        Target::Group(id) => format!("{CHANNEL_ID}:group:{id}"),
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// What the deliverer needs to stream into cards.
struct CardStreaming {
    cards: CardClient,
    registry: Arc<CardRegistry>,
    throttle: CardThrottle,
}

/// Delivers reply chunks for one inbound turn.
///
/// Attachments go out first and independently. Text goes out as markdown in
/// text mode; in card mode partial chunks are streamed into the card and the
/// final chunk closes it, falling back to markdown when the card is gone.
pub struct DingTalkReplyDeliverer {
    sender: DingTalkSender,
    target: Target,
    session_webhook: Option<String>,
    streaming: Option<CardStreaming>,
    card: AsyncMutex<Option<CardWriter>>,
}

impl DingTalkReplyDeliverer {
    fn new(
        sender: DingTalkSender,
        target: Target,
        session_webhook: Option<String>,
        streaming: Option<CardStreaming>,
        card: Option<CardWriter>,
    ) -> Self {
        Self {
            sender,
            target,
            session_webhook,
            streaming,
            card: AsyncMutex::new(card),
        }
    }

    /// Send every attachment, returning how many failed.
    async fn send_media(&self, media: &[MediaAttachment]) -> usize {
        let mut failed = 0;
        for attachment in media {
            if let Err(e) = self.sender.send_attachment(&self.target, attachment).await {
                failed += 1;
                warn!(target = self.target.id(), url = %attachment.url, error = %e, "reply attachment failed");
            }
        }
        failed
    }

    async fn send_markdown(&self, text: &str) -> Result<()> {
        self.sender
            .send_markdown(&self.target, text, self.session_webhook.as_deref())
            .await
    }

    async fn deliver_card(&self, streaming: &CardStreaming, payload: &ReplyPayload) -> Result<()> {
        let mut card = self.card.lock().await;
        if card.as_ref().is_some_and(CardWriter::is_finalized) {
            // The turn already produced its final card; later text stands alone.
            return self.send_markdown(&payload.text).await;
        }
        let current = card.as_ref().map(CardWriter::content).unwrap_or_default();
        let content = merge_chunk(&current, payload);

        let writer = match card.as_ref() {
            Some(writer) => writer.clone(),
            None => {
                match CardWriter::open(
                    &streaming.cards,
                    &self.target.card_target(),
                    &content,
                    &streaming.registry,
                    streaming.throttle.clone(),
                )
                .await
                {
                    Ok(writer) => card.insert(writer).clone(),
                    Err(e) => {
                        warn!(target = self.target.id(), error = %e, "card create failed, sending markdown");
                        return self.send_markdown(&payload.text).await;
                    },
                }
            },
        };

        if payload.kind != ReplyKind::Final {
            writer.push(content);
            return Ok(());
        }
        match writer.finalize(Some(content.clone())).await {
            Ok(UpdateOutcome::Cancelled) => {
                warn!(card_id = writer.card_id(), "card gone before final update, sending markdown");
                self.send_markdown(&content).await
            },
            Ok(_) => Ok(()),
            Err(e) if e.is_terminal_card_status() => {
                warn!(card_id = writer.card_id(), error = %e, "card no longer editable, sending markdown");
                self.send_markdown(&content).await
            },
            Err(e) => Err(e),
        }
    }

    /// Close a card that never received a final chunk.
    async fn finish(&self) {
        let card = self.card.lock().await;
        let Some(writer) = card.as_ref() else {
            return;
        };
        if writer.is_finalized() || writer.content().trim().is_empty() {
            return;
        }
        if let Err(e) = writer.finalize(None).await {
            warn!(card_id = writer.card_id(), error = %e, "failed to finalize card");
        }
    }
}

/// Card content after applying `payload` to `current`. Partial chunks are
/// appended as paragraphs; a final chunk that repeats the streamed text
/// replaces it.
fn merge_chunk(current: &str, payload: &ReplyPayload) -> String {
    let text = payload.text.trim_end();
    if current.trim().is_empty() {
        return text.to_string();
    }
    if payload.kind == ReplyKind::Final && text.starts_with(current.trim_end()) {
        return text.to_string();
    }
    format!("{}\n\n{text}", current.trim_end())
}

#[async_trait]
impl ReplyDeliverer for DingTalkReplyDeliverer {
    async fn deliver(&self, payload: ReplyPayload) -> DeliveryOutcome {
        let media_failed = self.send_media(&payload.media).await;

        if !payload.has_text() {
            if !payload.media.is_empty() && media_failed == payload.media.len() {
                return DeliveryOutcome::failed(format!(
                    "all {media_failed} attachments failed to send"
                ));
            }
            if payload.kind == ReplyKind::Final {
                self.finish().await;
            }
            return DeliveryOutcome::Delivered;
        }

        let result = match &self.streaming {
            Some(streaming) => self.deliver_card(streaming, &payload).await,
            None => self.send_markdown(&payload.text).await,
        };
        match result {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) => {
                warn!(target = self.target.id(), error = %e, "reply delivery failed");
                DeliveryOutcome::failed(e)
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            client::tests::test_client,
            config::Locale,
            merge::{BufferedMessage, MergeKey},
            message::{MessageContent, TextContent},
        },
        dingbridge_channels::{EnvelopeFormatOptions, ReplyDispatcher, gating::DmPolicy},
        mockito::Matcher,
        secrecy::Secret,
        serde_json::json,
        std::{path::PathBuf, sync::Mutex, time::Duration},
        tokio::time::Instant,
        tokio_util::sync::CancellationToken,
    };

    /// Host runtime that records what the pipeline asked of it and replies
    /// with a fixed list of chunks.
    struct FakeRuntime {
        store: PathBuf,
        replies: Vec<ReplyPayload>,
        pairing_approved: bool,
        log: Arc<Mutex<Vec<String>>>,
        contexts: Arc<Mutex<Vec<InboundContext>>>,
        outcomes: Arc<Mutex<Vec<DeliveryOutcome>>>,
    }

    impl FakeRuntime {
        fn new(store: &Path, replies: Vec<ReplyPayload>) -> Self {
            Self {
                store: store.to_path_buf(),
                replies,
                pairing_approved: false,
                log: Arc::default(),
                contexts: Arc::default(),
                outcomes: Arc::default(),
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    struct FakeDispatcher {
        deliverer: Arc<dyn ReplyDeliverer>,
        replies: Vec<ReplyPayload>,
        log: Arc<Mutex<Vec<String>>>,
        contexts: Arc<Mutex<Vec<InboundContext>>>,
        outcomes: Arc<Mutex<Vec<DeliveryOutcome>>>,
    }

    #[async_trait]
    impl ReplyDispatcher for FakeDispatcher {
        async fn dispatch(&self, ctx: InboundContext) -> anyhow::Result<DispatchSummary> {
            self.contexts.lock().unwrap().push(ctx);
            let mut summary = DispatchSummary::default();
            for reply in &self.replies {
                let outcome = self.deliverer.deliver(reply.clone()).await;
                if outcome.is_ok() {
                    summary.delivered += 1;
                } else {
                    summary.failed += 1;
                }
                self.outcomes.lock().unwrap().push(outcome);
            }
            Ok(summary)
        }

        fn mark_idle(&self) {
            self.log.lock().unwrap().push("idle".into());
        }
    }

    #[async_trait]
    impl ChannelRuntime for FakeRuntime {
        async fn resolve_agent_route(&self, request: RouteRequest) -> anyhow::Result<AgentRoute> {
            self.log.lock().unwrap().push(format!("route:{}", request.peer.id));
            Ok(AgentRoute {
                agent_id: "main".into(),
                session_key: format!("agent:main:{}:{}", request.channel, request.peer.id),
                main_session_key: "agent:main:main".into(),
            })
        }

        fn resolve_store_path(&self, _agent_id: &str) -> PathBuf {
            self.store.clone()
        }

        async fn read_session_updated_at(&self, _store: &Path, _key: &str) -> Option<i64> {
            Some(1_700_000_000_000)
        }

        async fn record_inbound_session(
            &self,
            _store: &Path,
            ctx: &InboundContext,
        ) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("session:{}", ctx.session_key));
            Ok(())
        }

        fn format_inbound_envelope(
            &self,
            envelope: &InboundEnvelope,
            _options: &EnvelopeFormatOptions,
        ) -> String {
            format!("[{}] {}", envelope.from, envelope.body)
        }

        fn create_reply_dispatcher(
            &self,
            deliverer: Arc<dyn ReplyDeliverer>,
        ) -> Box<dyn ReplyDispatcher> {
            Box::new(FakeDispatcher {
                deliverer,
                replies: self.replies.clone(),
                log: Arc::clone(&self.log),
                contexts: Arc::clone(&self.contexts),
                outcomes: Arc::clone(&self.outcomes),
            })
        }

        async fn check_pairing(&self, _channel: &str, _account: &str, _sender: &str) -> bool {
            self.pairing_approved
        }

        async fn record_activity(&self, channel: &str, account_id: &str, phase: ActivityPhase) {
            self.log
                .lock()
                .unwrap()
                .push(format!("activity:{channel}:{account_id}:{phase:?}"));
        }
    }

    fn text_event(msg_id: &str, text: &str, webhook: &str) -> BotMessage {
        BotMessage {
            msg_id: msg_id.into(),
            conversation_id: "cidDm1".into(),
            conversation_type: "1".into(),
            sender_id: "$:LWCP_v1:$abc".into(),
            sender_staff_id: Some("staff42".into()),
            sender_nick: Some("Li Lei".into()),
            chatbot_user_id: "bot-1".into(),
            session_webhook: Some(webhook.into()),
            create_at: 1_700_000_100_000,
            msgtype: "text".into(),
            text: Some(TextContent {
                content: text.into(),
            }),
            ..Default::default()
        }
    }

    fn batch(events: Vec<BotMessage>) -> MergedBatch {
        let key = MergeKey::for_message("default", &events[0]);
        MergedBatch {
            key,
            messages: events
                .into_iter()
                .map(|event| BufferedMessage {
                    content: event.body(),
                    event,
                    received_at: Instant::now(),
                })
                .collect(),
        }
    }

    fn config(server_url: &str) -> DingTalkAccountConfig {
        DingTalkAccountConfig {
            client_id: "ding_app".into(),
            client_secret: Secret::new("secret".into()),
            api_base: server_url.to_string(),
            oapi_base: server_url.to_string(),
            show_thinking: false,
            locale: Locale::En,
            ..Default::default()
        }
    }

    async fn pipeline(
        server_url: &str,
        config: DingTalkAccountConfig,
        runtime: Arc<FakeRuntime>,
    ) -> InboundPipeline {
        let client = test_client(server_url).await;
        let registry = Arc::new(CardRegistry::new(
            config.card_ttl(),
            CancellationToken::new(),
        ));
        let cards = config
            .card_template_id
            .clone()
            .map(|template| CardClient::new(client.clone(), template));
        let updater: Arc<dyn crate::cards::CardUpdater> = match &cards {
            Some(cards) => Arc::new(cards.clone()),
            None => Arc::new(CardClient::new(client.clone(), "unused")),
        };
        let throttle = CardThrottle::new(
            updater,
            Arc::clone(&registry),
            config.card_throttle(),
            config.card_inactivity(),
        );
        InboundPipeline::new(
            "default",
            config.clone(),
            runtime as Arc<dyn ChannelRuntime>,
            DingTalkSender::new(client, config.locale),
            cards,
            registry,
            throttle,
        )
    }

    #[tokio::test]
    async fn merged_dm_is_dispatched_once_and_replied_through_webhook() {
        let mut server = mockito::Server::new_async().await;
        let webhook = server
            .mock("POST", "/robot/sendBySession")
            .match_body(Matcher::PartialJson(json!({
                "msgtype": "markdown",
                "markdown": { "text": "pong" },
            })))
            .with_status(200)
            .with_body(r#"{"errcode":0}"#)
            .expect(1)
            .create_async()
            .await;

        let store = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(store.path(), vec![ReplyPayload::text("pong")]));
        let pipeline = pipeline(&server.url(), config(&server.url()), Arc::clone(&runtime)).await;
        let url = format!("{}/robot/sendBySession", server.url());

        let outcome = pipeline
            .process(batch(vec![
                text_event("m1", "part one", &url),
                text_event("m2", "part two", &url),
            ]))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Dispatched(DispatchSummary {
                delivered: 1,
                failed: 0
            })
        );
        webhook.assert_async().await;

        let contexts = runtime.contexts.lock().unwrap().clone();
        assert_eq!(contexts.len(), 1);
        let ctx = &contexts[0];
        assert_eq!(ctx.raw_body, "part one\n\npart two");
        assert_eq!(ctx.body, "[Li Lei] part one\n\npart two");
        assert_eq!(ctx.sender_id, "staff42");
        assert_eq!(ctx.from, "dingtalk:staff42");
        assert_eq!(ctx.to, "dingtalk:staff42");
        assert_eq!(ctx.message_id, "m1");
        assert_eq!(ctx.session_key, "agent:main:dingtalk:staff42");

        assert_eq!(runtime.log(), vec![
            "activity:dingtalk:default:Start".to_string(),
            "route:staff42".to_string(),
            "session:agent:main:dingtalk:staff42".to_string(),
            "idle".to_string(),
            "activity:dingtalk:default:Stop".to_string(),
        ]);
    }

    #[tokio::test]
    async fn own_messages_are_dropped() {
        let server = mockito::Server::new_async().await;
        let store = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(store.path(), vec![]));
        let pipeline = pipeline(&server.url(), config(&server.url()), Arc::clone(&runtime)).await;

        let mut event = text_event("m1", "echo", "http://unused");
        event.sender_id = "bot-1".into();
        event.sender_staff_id = None;
        let outcome = pipeline.process(batch(vec![event])).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::SelfMessage);
        assert!(runtime.contexts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn allowlist_rejection_notifies_sender_with_their_id() {
        let mut server = mockito::Server::new_async().await;
        let notice = server
            .mock("POST", "/robot/sendBySession")
            .match_body(Matcher::Regex("staff42".into()))
            .with_status(200)
            .with_body(r#"{"errcode":0}"#)
            .expect(1)
            .create_async()
            .await;

        let store = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(store.path(), vec![ReplyPayload::text("no")]));
        let mut config = config(&server.url());
        config.dm_policy = DmPolicy::Allowlist;
        config.allowlist = vec!["someone-else".into()];
        let pipeline = pipeline(&server.url(), config, Arc::clone(&runtime)).await;
        let url = format!("{}/robot/sendBySession", server.url());

        let outcome = pipeline
            .process(batch(vec![text_event("m1", "hello", &url)]))
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Denied(AccessDenied::NotOnAllowlist));
        notice.assert_async().await;
        assert!(runtime.contexts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pairing_defers_to_runtime() {
        let server = mockito::Server::new_async().await;
        let store = tempfile::tempdir().unwrap();
        let mut config = config(&server.url());
        config.dm_policy = DmPolicy::Pairing;

        let mut approving = FakeRuntime::new(store.path(), vec![]);
        approving.pairing_approved = true;
        let approved = pipeline(&server.url(), config.clone(), Arc::new(approving)).await;
        let outcome = approved
            .process(batch(vec![text_event("m1", "hi", "http://unused")]))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Dispatched(_)));

        let rejecting = pipeline(
            &server.url(),
            config,
            Arc::new(FakeRuntime::new(store.path(), vec![])),
        )
        .await;
        let outcome = rejecting
            .process(batch(vec![text_event("m1", "hi", "http://127.0.0.1:9/expired")]))
            .await;
        // The notice fails (nothing listens), which must not fail the turn.
        assert_eq!(
            outcome.unwrap(),
            ProcessOutcome::Denied(AccessDenied::PairingRejected)
        );
    }

    #[tokio::test]
    async fn empty_merged_text_skips_dispatch() {
        let server = mockito::Server::new_async().await;
        let store = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(store.path(), vec![]));
        let pipeline = pipeline(&server.url(), config(&server.url()), Arc::clone(&runtime)).await;

        let outcome = pipeline
            .process(batch(vec![text_event("m1", "   ", "http://unused")]))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::EmptyText);
        assert!(!runtime.log().iter().any(|entry| entry.starts_with("route:")));
    }

    #[tokio::test]
    async fn failed_media_download_keeps_text() {
        let mut server = mockito::Server::new_async().await;
        let _resolve = server
            .mock("POST", "/v1.0/robot/messageFiles/download")
            .with_status(403)
            .with_body(r#"{"code":"Forbidden"}"#)
            .create_async()
            .await;

        let store = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(store.path(), vec![]));
        let pipeline = pipeline(&server.url(), config(&server.url()), Arc::clone(&runtime)).await;

        let mut event = text_event("m1", "", "http://unused");
        event.msgtype = "picture".into();
        event.text = None;
        event.content = Some(MessageContent {
            download_code: Some("code-1".into()),
            ..Default::default()
        });
        let outcome = pipeline.process(batch(vec![event])).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::Dispatched(_)));
        let contexts = runtime.contexts.lock().unwrap().clone();
        assert_eq!(contexts[0].raw_body, "[Image]");
        assert!(contexts[0].media.is_empty());
    }

    #[tokio::test]
    async fn downloaded_media_always_carries_a_file_name() {
        let mut server = mockito::Server::new_async().await;
        let _resolve_picture = server
            .mock("POST", "/v1.0/robot/messageFiles/download")
            .match_body(Matcher::PartialJson(json!({ "downloadCode": "code-pic" })))
            .with_status(200)
            .with_body(json!({ "downloadUrl": format!("{}/blob/pic", server.url()) }).to_string())
            .create_async()
            .await;
        let _resolve_file = server
            .mock("POST", "/v1.0/robot/messageFiles/download")
            .match_body(Matcher::PartialJson(json!({ "downloadCode": "code-doc" })))
            .with_status(200)
            .with_body(json!({ "downloadUrl": format!("{}/blob/doc", server.url()) }).to_string())
            .create_async()
            .await;
        let _pic = server
            .mock("GET", "/blob/pic")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(b"\x89PNG")
            .create_async()
            .await;
        let _doc = server
            .mock("GET", "/blob/doc")
            .with_status(200)
            .with_header("content-type", "application/pdf")
            .with_body(b"%PDF-1.4")
            .create_async()
            .await;

        let store = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(store.path(), vec![]));
        let pipeline = pipeline(&server.url(), config(&server.url()), Arc::clone(&runtime)).await;

        let mut picture = text_event("m1", "", "http://unused");
        picture.msgtype = "picture".into();
        picture.text = None;
        picture.content = Some(MessageContent {
            download_code: Some("code-pic".into()),
            ..Default::default()
        });
        let mut document = text_event("m2", "", "http://unused");
        document.msgtype = "file".into();
        document.text = None;
        document.content = Some(MessageContent {
            download_code: Some("code-doc".into()),
            file_name: Some("report.pdf".into()),
            ..Default::default()
        });
        pipeline
            .process(batch(vec![picture, document]))
            .await
            .unwrap();

        let contexts = runtime.contexts.lock().unwrap().clone();
        let media = &contexts[0].media;
        assert_eq!(media.len(), 2);

        let image = &media[0];
        assert_eq!(image.mime_type, "image/png");
        assert!(!image.file_name.is_empty());
        assert_eq!(
            image.path.file_name().unwrap().to_string_lossy(),
            image.file_name
        );
        assert_eq!(media[1].file_name, "report.pdf");
    }

    #[tokio::test]
    async fn card_mode_streams_reply_into_thinking_card() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/v1.0/card/instances/createAndDeliver")
            .match_body(Matcher::PartialJson(json!({
                "cardData": { "cardParamMap": { "content": "Thinking..." } },
            })))
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .expect(1)
            .create_async()
            .await;
        let finalize = server
            .mock("PUT", "/v1.0/card/streaming")
            .match_body(Matcher::PartialJson(json!({
                "content": "part one\n\npart two",
                "isFinalize": true,
            })))
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;
        let _partial = server
            .mock("PUT", "/v1.0/card/streaming")
            .match_body(Matcher::PartialJson(json!({ "isFinalize": false })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let store = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(store.path(), vec![
            ReplyPayload::block("part one"),
            ReplyPayload::text("part two"),
        ]));
        let mut config = config(&server.url());
        config.message_mode = MessageMode::Card;
        config.card_template_id = Some("tpl.schema".into());
        config.show_thinking = true;
        config.thinking_text = Some("Thinking...".into());
        let pipeline = pipeline(&server.url(), config, Arc::clone(&runtime)).await;

        let outcome = pipeline
            .process(batch(vec![text_event("m1", "question", "http://unused")]))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Dispatched(DispatchSummary {
                delivered: 2,
                failed: 0
            })
        );
        create.assert_async().await;
        finalize.assert_async().await;
    }

    #[tokio::test]
    async fn attachment_failure_does_not_block_text() {
        let mut server = mockito::Server::new_async().await;
        let text = server
            .mock("POST", "/robot/sendBySession")
            .with_status(200)
            .with_body(r#"{"errcode":0}"#)
            .expect(1)
            .create_async()
            .await;

        let store = tempfile::tempdir().unwrap();
        let reply = ReplyPayload::text("see attached").with_media(MediaAttachment {
            url: "/missing/report.pdf".into(),
            mime_type: "application/pdf".into(),
            file_name: None,
        });
        let runtime = Arc::new(FakeRuntime::new(store.path(), vec![
            reply,
            ReplyPayload::default().with_media(MediaAttachment {
                url: "/missing/chart.png".into(),
                mime_type: "image/png".into(),
                file_name: None,
            }),
        ]));
        let pipeline = pipeline(&server.url(), config(&server.url()), Arc::clone(&runtime)).await;
        let url = format!("{}/robot/sendBySession", server.url());

        let outcome = pipeline
            .process(batch(vec![text_event("m1", "report?", &url)]))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Dispatched(DispatchSummary {
                delivered: 1,
                failed: 1
            })
        );
        text.assert_async().await;
        let outcomes = runtime.outcomes.lock().unwrap().clone();
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], DeliveryOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn stale_session_media_is_swept_after_dispatch() {
        let server = mockito::Server::new_async().await;
        let store = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(store.path(), vec![]));
        let mut config = config(&server.url());
        config.session_timeout_secs = 0;
        let pipeline = pipeline(&server.url(), config.clone(), Arc::clone(&runtime)).await;

        let dir = session_media_dir(&config.media_root(store.path()), "agent:main:dingtalk:staff42");
        std::fs::create_dir_all(&dir).unwrap();
        let stale = dir.join("old.png");
        std::fs::write(&stale, b"png").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        pipeline
            .process(batch(vec![text_event("m1", "hi", "http://unused")]))
            .await
            .unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn final_chunk_replaces_streamed_prefix() {
        assert_eq!(merge_chunk("", &ReplyPayload::block("a")), "a");
        assert_eq!(merge_chunk("a", &ReplyPayload::block("b")), "a\n\nb");
        assert_eq!(merge_chunk("a\n\nb", &ReplyPayload::text("a\n\nb\n\nc")), "a\n\nb\n\nc");
        assert_eq!(merge_chunk("a", &ReplyPayload::text("z")), "a\n\nz");
    }
}
