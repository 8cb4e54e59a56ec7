use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("realtime error: {0}")]
    Realtime(String),

    #[error("unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Realtime(err.to_string())
    }
}

impl From<url::ParseError> for ChatError {
    fn from(err: url::ParseError) -> Self {
        ChatError::Config(format!("invalid URL: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
