use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] crosswatch_store::StoreError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
