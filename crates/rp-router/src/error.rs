use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    /// Bad input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// State conflict, e.g. a pool that already exists.
    #[error("business rule violation: {0}")]
    BusinessRule(String),

    /// Optimistic-lock or rare race.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("mediation error: {0}")]
    Mediation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RouterError {
    /// HTTP status for API handlers surfacing this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::Validation(_) => StatusCode::BAD_REQUEST,
            RouterError::NotFound(_) => StatusCode::NOT_FOUND,
            RouterError::BusinessRule(_) | RouterError::Concurrency(_) => StatusCode::CONFLICT,
            RouterError::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for RouterError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
