use {dingbridge_common::FromMessage, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error(transparent)]
    Channel(#[from] dingbridge_channels::Error),

    /// Non-success HTTP status (or non-zero `errcode`) from a DingTalk endpoint.
    #[error("dingtalk {operation} failed ({status}): {body}")]
    Api {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("{message}")]
    Message { message: String },

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn api(operation: &'static str, status: u16, body: impl Into<String>) -> Self {
        Self::Api {
            operation,
            status,
            body: body.into(),
        }
    }

    /// HTTP status carried by the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Reqwest(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Transient failures worth another attempt: network errors, timeouts,
    /// 5xx, 429 and 401 (stale token).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => is_retryable_status(*status),
            Self::Reqwest(e) => match e.status() {
                Some(status) => is_retryable_status(status.as_u16()),
                None => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            },
            Self::WebSocket(_) => true,
            _ => false,
        }
    }

    /// The remote card is gone or no longer editable: 403, 404 or 410.
    #[must_use]
    pub fn is_terminal_card_status(&self) -> bool {
        matches!(self.status(), Some(403 | 404 | 410))
    }
}

fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 401
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

dingbridge_common::impl_context!();
