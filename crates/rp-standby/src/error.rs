use thiserror::Error;

#[derive(Error, Debug)]
pub enum StandbyError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("leader election already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, StandbyError>;
