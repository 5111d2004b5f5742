use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error {0}")]
    RedisError(#[from] redis::RedisError),

    #[error(transparent)]
    DatabaseError(#[from] conveyor_database::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error(transparent)]
    Utf8Error(#[from] std::string::FromUtf8Error),

    #[error("Invalid options: {0}")]
    BadOptions(String),

    #[error("Job {job_id} already exists")]
    Duplicate { job_id: String },

    #[error("Job {job_id} not found")]
    NotFound { job_id: String },

    #[error("Lock on job {job_id} is not held by this token")]
    LockLost { job_id: String },

    #[error("Rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Job error: {0}")]
    JobError(anyhow::Error),
}
