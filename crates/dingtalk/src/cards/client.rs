//! Create-and-deliver and streaming-update calls for AI cards.

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
    tracing::debug,
};

use crate::{
    cards::throttle::CardUpdater,
    client::DingTalkClient,
    error::{Error, Result},
};

const CREATE_PATH: &str = "/v1.0/card/instances/createAndDeliver";
const STREAMING_PATH: &str = "/v1.0/card/streaming";

/// Template variable that carries the streamed markdown.
pub const CONTENT_KEY: &str = "content";

/// Where a card is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardTarget {
    /// One-on-one chat with a user (staff id).
    User(String),
    /// Group conversation (open conversation id).
    Group(String),
}

impl CardTarget {
    #[must_use]
    pub fn open_space_id(&self) -> String {
        match self {
            Self::User(user_id) => format!("dtv1.card//IM_ROBOT.{user_id}"),
            Self::Group(conversation_id) => format!("dtv1.card//IM_GROUP.{conversation_id}"),
        }
    }

    /// Conversation key the card is registered under.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::User(id) | Self::Group(id) => id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamingUpdate<'a> {
    out_track_id: &'a str,
    guid: String,
    key: &'a str,
    content: &'a str,
    is_full: bool,
    is_finalize: bool,
    is_error: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCardResponse {
    #[serde(default)]
    success: Option<bool>,
}

/// Create-and-deliver and streaming-update calls for AI cards.
#[derive(Clone)]
pub struct CardClient {
    client: DingTalkClient,
    template_id: String,
}

impl CardClient {
    pub fn new(client: DingTalkClient, template_id: impl Into<String>) -> Self {
        Self {
            client,
            template_id: template_id.into(),
        }
    }

    /// Create a card showing `content` and deliver it to `target`.
    /// Returns the new card id (`outTrackId`).
    pub async fn create_card(&self, target: &CardTarget, content: &str) -> Result<String> {
        let card_id = uuid::Uuid::new_v4().to_string();
        let body = self.create_body(&card_id, target, content);
        let resp: Option<CreateCardResponse> = self
            .client
            .post_json("card create", CREATE_PATH, &body)
            .await?;
        if resp.and_then(|r| r.success) == Some(false) {
            return Err(Error::message("dingtalk card create reported failure"));
        }
        debug!(card_id = %card_id, conversation_id = target.conversation_id(), "card created");
        Ok(card_id)
    }

    fn create_body(&self, card_id: &str, target: &CardTarget, content: &str) -> Value {
        let mut body = json!({
            "cardTemplateId": self.template_id,
            "outTrackId": card_id,
            "cardData": {
                "cardParamMap": {
                    CONTENT_KEY: content,
                },
            },
            "callbackType": "STREAM",
            "openSpaceId": target.open_space_id(),
            "userIdType": 1,
        });
        match target {
            CardTarget::User(user_id) => {
                body["imRobotOpenSpaceModel"] = json!({ "supportForward": true });
                body["imRobotOpenDeliverModel"] = json!({
                    "spaceType": "IM_ROBOT",
                    "robotCode": self.client.robot_code(),
                    "userIds": [user_id],
                });
            },
            CardTarget::Group(_) => {
                body["imGroupOpenSpaceModel"] = json!({ "supportForward": true });
                body["imGroupOpenDeliverModel"] = json!({
                    "robotCode": self.client.robot_code(),
                });
            },
        }
        body
    }

    /// Replace the card's content in full.
    pub async fn stream_update(&self, card_id: &str, content: &str, finalize: bool) -> Result<()> {
        let body = StreamingUpdate {
            out_track_id: card_id,
            guid: uuid::Uuid::new_v4().to_string(),
            key: CONTENT_KEY,
            content,
            is_full: true,
            is_finalize: finalize,
            is_error: false,
        };
        let _: Value = self
            .client
            .put_json("card update", STREAMING_PATH, &body)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CardUpdater for CardClient {
    async fn update_card(&self, card_id: &str, content: &str, finalize: bool) -> Result<()> {
        self.stream_update(card_id, content, finalize).await
    }
}
