use thiserror::Error;

#[derive(Error, Debug)]
pub enum WhirrError {
    #[error("data root not initialized: {0}")]
    NotInitialized(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("job {job_id} is not owned by worker {worker_id}")]
    NotOwner { job_id: i64, worker_id: String },

    #[error("job {job_id} is {status}; only failed or cancelled jobs can be retried")]
    NotRetryable { job_id: i64, status: String },

    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for WhirrError {
    fn from(e: rusqlite::Error) -> Self {
        WhirrError::StoreUnavailable(e.to_string())
    }
}

impl From<sqlx::Error> for WhirrError {
    fn from(e: sqlx::Error) -> Self {
        WhirrError::StoreUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for WhirrError {
    fn from(e: reqwest::Error) -> Self {
        WhirrError::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WhirrError>;
