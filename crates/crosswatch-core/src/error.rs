use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrosswatchError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("channel list error ({path}): {reason}")]
    ChannelList { path: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CrosswatchError>;
