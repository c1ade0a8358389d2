//! Stream-mode push connection.
//!
//! The platform hands out a one-shot websocket endpoint and ticket; every
//! frame received on it must be acknowledged by message id or it is
//! redelivered. Bot callbacks are deduplicated and pushed into the merge
//! buffer; everything else is acknowledged and dropped.

use std::{collections::HashMap, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    secrecy::ExposeSecret,
    serde::Deserialize,
    serde_json::{Value, json},
    tokio::{task::JoinHandle, time::Instant},
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    client::DingTalkClient,
    error::{Error, Result},
    merge::{MergeBuffer, MergeKey, PushOutcome},
    message::{BOT_MESSAGE_TOPIC, BotMessage, FrameType, StreamFrame},
    retry::with_retry,
};

const OPEN_PATH: &str = "/v1.0/gateway/connections/open";

/// How long a delivered message id is remembered for redelivery dedup.
pub const DEDUP_TTL: Duration = Duration::from_secs(300);

/// Endpoint and ticket for one websocket session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTicket {
    pub endpoint: String,
    pub ticket: String,
}

impl ConnectionTicket {
    /// Websocket URL with the ticket attached.
    pub fn url(&self) -> Result<url::Url> {
        url::Url::parse_with_params(&self.endpoint, &[("ticket", &self.ticket)])
            .map_err(|e| Error::external("invalid stream endpoint", e))
    }
}

/// Message ids seen within the last [`DEDUP_TTL`].
#[derive(Debug)]
pub struct SeenMessages {
    ttl: Duration,
    seen: HashMap<String, Instant>,
}

impl SeenMessages {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
        }
    }

    /// Record `id` and return whether it is new. Expired ids are forgotten.
    pub fn first_sighting(&mut self, id: &str) -> bool {
        let now = Instant::now();
        let ttl = self.ttl;
        self.seen.retain(|_, at| now.duration_since(*at) < ttl);
        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// What to do after handling one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAction {
    /// Send this text back on the socket.
    Reply(String),
    /// The server asked us to reconnect.
    Reconnect,
    Ignore,
}

/// One account's push-stream session.
pub struct StreamConnection {
    account_id: String,
    client: DingTalkClient,
    merge: MergeBuffer,
    seen: SeenMessages,
}

impl StreamConnection {
    pub fn new(account_id: impl Into<String>, client: DingTalkClient, merge: MergeBuffer) -> Self {
        Self {
            account_id: account_id.into(),
            client,
            merge,
            seen: SeenMessages::new(DEDUP_TTL),
        }
    }

    /// Ask the platform for a websocket endpoint.
    pub async fn open_ticket(&self) -> Result<ConnectionTicket> {
        let credentials = self.client.credentials();
        let url = format!("{}{OPEN_PATH}", credentials.api_base);
        let body = json!({
            "clientId": credentials.client_id,
            "clientSecret": credentials.client_secret.expose_secret(),
            "subscriptions": [
                { "type": "EVENT", "topic": "*" },
                { "type": "CALLBACK", "topic": BOT_MESSAGE_TOPIC },
            ],
            "ua": concat!("dingbridge/", env!("CARGO_PKG_VERSION")),
        });
        with_retry(self.client.retry_policy(), "stream open", || {
            self.open_once(&url, &body)
        })
        .await
    }

    async fn open_once(&self, url: &str, body: &Value) -> Result<ConnectionTicket> {
        let resp = self.client.http().post(url).json(body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Error::api("stream open", status.as_u16(), text));
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Handle one raw frame.
    pub fn handle_frame(&mut self, raw: &str) -> FrameAction {
        let frame = match StreamFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(account_id = %self.account_id, error = %e, "unparseable stream frame");
                return FrameAction::Ignore;
            },
        };
        match frame.frame_type {
            FrameType::System => match frame.headers.topic.as_str() {
                "ping" => FrameAction::Reply(frame.ack(&frame.data)),
                "disconnect" => {
                    info!(account_id = %self.account_id, "stream server requested disconnect");
                    FrameAction::Reconnect
                },
                topic => {
                    debug!(account_id = %self.account_id, topic, "ignoring system frame");
                    FrameAction::Ignore
                },
            },
            FrameType::Event => FrameAction::Reply(
                frame.ack(&json!({ "status": "SUCCESS", "message": "success" }).to_string()),
            ),
            FrameType::Callback => {
                if frame.headers.topic == BOT_MESSAGE_TOPIC {
                    self.accept_bot_message(&frame);
                } else {
                    debug!(account_id = %self.account_id, topic = %frame.headers.topic, "ignoring callback topic");
                }
                FrameAction::Reply(frame.callback_ack())
            },
        }
    }

    fn accept_bot_message(&mut self, frame: &StreamFrame) {
        let message = match BotMessage::from_json(&frame.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(account_id = %self.account_id, error = %e, "malformed bot message");
                return;
            },
        };
        let id = if message.msg_id.is_empty() {
            frame.headers.message_id.as_str()
        } else {
            message.msg_id.as_str()
        };
        if !id.is_empty() && !self.seen.first_sighting(id) {
            debug!(account_id = %self.account_id, msg_id = id, "duplicate delivery ignored");
            return;
        }
        let key = MergeKey::for_message(&self.account_id, &message);
        match self.merge.push(key, message) {
            PushOutcome::Buffered { count } => {
                debug!(account_id = %self.account_id, count, "message buffered");
            },
            PushOutcome::Flushed { count } => {
                debug!(account_id = %self.account_id, count, "merge window flushed");
            },
        }
    }

    /// Connect, pump frames and reconnect with backoff until cancelled.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let policy = *self.client.retry_policy();
            let mut attempt = 1u32;
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.connect_and_run(&cancel) => result,
                };
                match result {
                    Ok(true) => attempt = 1,
                    Ok(false) => {},
                    Err(e) => {
                        warn!(account_id = %self.account_id, error = %e, "stream connection error");
                    },
                }
                if cancel.is_cancelled() {
                    break;
                }
                let delay = policy.delay_for(attempt);
                attempt = attempt.saturating_add(1);
                info!(account_id = %self.account_id, delay_ms = delay.as_millis() as u64, "reconnecting stream");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {},
                }
            }
            info!(account_id = %self.account_id, "stream stopped");
        })
    }

    /// One websocket session. Returns `Ok(true)` when the session got as far
    /// as receiving frames.
    async fn connect_and_run(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let ticket = self.open_ticket().await?;
        let (socket, _response) = connect_async(ticket.url()?.as_str()).await?;
        info!(account_id = %self.account_id, endpoint = %ticket.endpoint, "stream connected");
        let (mut sink, mut reader) = socket.split();
        let mut received = false;

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(received);
                }
                message = reader.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => {
                    received = true;
                    match self.handle_frame(&text) {
                        FrameAction::Reply(reply) => sink.send(Message::Text(reply.into())).await?,
                        FrameAction::Reconnect => {
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(received);
                        },
                        FrameAction::Ignore => {},
                    }
                },
                Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => {
                    debug!(account_id = %self.account_id, "stream closed by server");
                    return Ok(received);
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{client::tests::test_client, merge::MergeConfig},
        mockito::Matcher,
    };

    fn callback_frame(frame_id: &str, msg_id: &str, text: &str) -> String {
        let data = json!({
            "msgId": msg_id,
            "conversationId": "cid1",
            "conversationType": "1",
            "senderId": "$:abc",
            "senderStaffId": "staff1",
            "chatbotUserId": "bot",
            "msgtype": "text",
            "text": { "content": text },
        });
        json!({
            "specVersion": "1.0",
            "type": "CALLBACK",
            "headers": { "messageId": frame_id, "topic": BOT_MESSAGE_TOPIC },
            "data": data.to_string(),
        })
        .to_string()
    }

    async fn connection(
        server_url: &str,
        max_messages: usize,
    ) -> (
        StreamConnection,
        tokio::sync::mpsc::UnboundedReceiver<crate::merge::MergedBatch>,
    ) {
        let (merge, rx) = MergeBuffer::new(
            MergeConfig {
                window: Duration::from_millis(2_000),
                max_messages,
            },
            CancellationToken::new(),
        );
        let conn = StreamConnection::new("default", test_client(server_url).await, merge);
        (conn, rx)
    }

    #[tokio::test]
    async fn ping_is_echoed_with_its_message_id() {
        let (mut conn, _rx) = connection("http://unused", 5).await;
        let raw = json!({
            "type": "SYSTEM",
            "headers": { "messageId": "sys-1", "topic": "ping" },
            "data": "{\"opaque\":\"abc\"}",
        })
        .to_string();

        let FrameAction::Reply(reply) = conn.handle_frame(&raw) else {
            panic!("ping must be answered");
        };
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["code"], 200);
        assert_eq!(reply["headers"]["messageId"], "sys-1");
        assert_eq!(reply["data"], "{\"opaque\":\"abc\"}");
    }

    #[tokio::test]
    async fn disconnect_requests_reconnect() {
        let (mut conn, _rx) = connection("http://unused", 5).await;
        let raw = r#"{"type":"SYSTEM","headers":{"messageId":"s","topic":"disconnect"},"data":""}"#;
        assert_eq!(conn.handle_frame(raw), FrameAction::Reconnect);
    }

    #[tokio::test]
    async fn garbage_is_ignored() {
        let (mut conn, _rx) = connection("http://unused", 5).await;
        assert_eq!(conn.handle_frame("not json"), FrameAction::Ignore);
    }

    #[tokio::test]
    async fn callbacks_are_acked_and_redeliveries_dropped() {
        let (mut conn, mut rx) = connection("http://unused", 1).await;

        let first = conn.handle_frame(&callback_frame("f1", "msg-1", "hello"));
        let redelivered = conn.handle_frame(&callback_frame("f2", "msg-1", "hello"));
        assert!(matches!(first, FrameAction::Reply(_)));
        let FrameAction::Reply(ack) = redelivered else {
            panic!("redelivery must still be acked");
        };
        assert!(ack.contains("f2"));

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.merged_text(), "hello");
        assert_eq!(batch.key.sender_id, "staff1");
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.seen.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn seen_messages_expire() {
        let mut seen = SeenMessages::new(DEDUP_TTL);
        assert!(seen.first_sighting("a"));
        assert!(!seen.first_sighting("a"));
        tokio::time::sleep(DEDUP_TTL + Duration::from_secs(1)).await;
        assert!(seen.first_sighting("a"));
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn open_ticket_posts_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", OPEN_PATH)
            .match_body(Matcher::PartialJson(json!({
                "clientId": "ding_app",
                "clientSecret": "secret",
            })))
            .with_status(200)
            .with_body(r#"{"endpoint":"wss://stream.example.com/connect","ticket":"t-1"}"#)
            .create_async()
            .await;

        let (conn, _rx) = connection(&server.url(), 5).await;
        let ticket = conn.open_ticket().await.unwrap();
        mock.assert_async().await;
        assert_eq!(
            ticket.url().unwrap().as_str(),
            "wss://stream.example.com/connect?ticket=t-1"
        );
    }

    #[tokio::test]
    async fn session_acks_frames_over_websocket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _open = server
            .mock("POST", OPEN_PATH)
            .with_status(200)
            .with_body(format!(
                r#"{{"endpoint":"ws://{addr}/connect","ticket":"t-1"}}"#
            ))
            .create_async()
            .await;

        let ws_server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(callback_frame("f1", "msg-1", "hi").into()))
                .await
                .unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text.to_string(),
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected websocket message: {other:?}"),
                }
            }
        });

        let (conn, mut rx) = connection(&server.url(), 1).await;
        let cancel = CancellationToken::new();
        let handle = conn.spawn(cancel.clone());

        let ack = ws_server.await.unwrap();
        let ack: Value = serde_json::from_str(&ack).unwrap();
        assert_eq!(ack["headers"]["messageId"], "f1");
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.merged_text(), "hi");

        cancel.cancel();
        handle.await.unwrap();
    }
}
