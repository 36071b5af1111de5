use thiserror::Error;

/// Errors produced by the flurry proxy engine.
#[derive(Debug, Error)]
pub enum FlurryError {
    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    #[error("invalid answer: {0}")]
    InvalidAnswer(String),

    #[error("relay not allowed: {0}")]
    RelayNotAllowed(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("unexpected broker status: {0}")]
    UnexpectedStatus(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<url::ParseError> for FlurryError {
    fn from(e: url::ParseError) -> Self {
        FlurryError::InvalidUrl(e.to_string())
    }
}

pub type FlurryResult<T> = Result<T, FlurryError>;
