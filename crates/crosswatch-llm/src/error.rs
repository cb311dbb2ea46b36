use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("hourly budget exhausted ({used}/{limit})")]
    BudgetExhausted { used: u32, limit: u32 },
}

pub type Result<T> = std::result::Result<T, LlmError>;
