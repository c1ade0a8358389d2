/// Result type for channel-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors a channel reports back to the host about how it was called.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An outbound target or account config the channel cannot use.
    #[error("invalid channel input: {message}")]
    InvalidInput { message: String },

    /// No running account with this id.
    #[error("unknown channel account: {account_id}")]
    UnknownAccount { account_id: String },

    /// The channel is not wired up enough to do this yet.
    #[error("channel operation unavailable: {message}")]
    Unavailable { message: String },
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_account(account_id: impl std::fmt::Display) -> Self {
        Self::UnknownAccount {
            account_id: account_id.to_string(),
        }
    }
}
