use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("receipt handle not found: {0}")]
    NotFound(String),

    #[error("queue is stopped")]
    Stopped,

    #[error("broker error: {0}")]
    Broker(String),

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "embedded")]
impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Storage(e.to_string())
    }
}
