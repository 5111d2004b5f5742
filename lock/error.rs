use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error {0}")]
    RedisError(#[from] redis::RedisError),

    #[error(transparent)]
    DatabaseError(#[from] conveyor_database::Error),

    #[error("Lock on {resource} could not be acquired")]
    LockUnavailable { resource: String },

    #[error("Lock on {resource} was lost while held")]
    LockLost { resource: String },

    #[error("Task error: {0}")]
    TaskError(anyhow::Error),
}
