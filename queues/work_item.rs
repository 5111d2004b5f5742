use serde::de::DeserializeOwned;

use crate::{error::Error, job::JobOpts, job_record::JobRecord, Queue};

/// A reserved job as seen by a handler: the deserialized payload plus the
/// pieces of queue state a handler may want while running.
#[derive(Debug)]
pub struct ActiveJob<T: Send + Sync> {
    queue: Queue,
    pub id: String,
    pub data: T,
    pub attempts_made: u32,
    pub opts: JobOpts,
    token: String,
}

impl<T: DeserializeOwned + Send + Sync> ActiveJob<T> {
    pub(crate) fn new(queue: Queue, record: &JobRecord, token: &str) -> Result<Self, Error> {
        let data: T = serde_json::from_slice(record.data.as_slice())?;
        Ok(ActiveJob {
            queue,
            id: record.id.clone(),
            data,
            attempts_made: record.attempts_made,
            opts: record.opts.clone(),
            token: String::from(token),
        })
    }
}

impl<T: Send + Sync> ActiveJob<T> {
    /// Record progress (0-100) and emit a `progress` event.
    pub async fn update_progress(&self, progress: u8) -> Result<bool, Error> {
        self.queue.update_progress(&self.id, progress).await
    }

    /// Check whether our reservation still holds. Useful for long-running
    /// handlers that want to stop early once the stalled checker has taken
    /// the job back.
    pub async fn is_locked(&self) -> Result<bool, Error> {
        self.queue.lock_token(&self.id).await.map(|held| {
            held.as_deref() == Some(self.token.as_str())
        })
    }
}
