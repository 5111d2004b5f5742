use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job_record::JobRecord;

/// One archived failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJobEntry {
    pub id: String,
    pub queue: String,
    pub job_id: String,
    pub payload: Vec<u8>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Sink the worker hands terminally failed jobs to. Storage backends live
/// outside the engine; this is only the surface it calls.
#[async_trait]
pub trait FailedJobSink: Send + Sync {
    /// Archive a failure and return the archive id.
    async fn log(
        &self,
        queue: &str,
        job: &JobRecord,
        error: &str,
    ) -> Result<String, anyhow::Error>;

    async fn all(&self) -> Result<Vec<FailedJobEntry>, anyhow::Error>;

    async fn find(&self, id: &str) -> Result<Option<FailedJobEntry>, anyhow::Error>;

    /// Drop one archived failure. Returns whether it existed.
    async fn forget(&self, id: &str) -> Result<bool, anyhow::Error>;

    /// Drop everything, or everything older than the given age.
    async fn flush(&self, older_than: Option<Duration>) -> Result<(), anyhow::Error>;

    /// Drop entries older than the given age and return how many went.
    async fn prune(&self, older_than: Duration) -> Result<usize, anyhow::Error>;
}

/// Discards everything.
pub struct NullSink;

#[async_trait]
impl FailedJobSink for NullSink {
    async fn log(
        &self,
        _queue: &str,
        _job: &JobRecord,
        _error: &str,
    ) -> Result<String, anyhow::Error> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn all(&self) -> Result<Vec<FailedJobEntry>, anyhow::Error> {
        Ok(Vec::new())
    }

    async fn find(&self, _id: &str) -> Result<Option<FailedJobEntry>, anyhow::Error> {
        Ok(None)
    }

    async fn forget(&self, _id: &str) -> Result<bool, anyhow::Error> {
        Ok(false)
    }

    async fn flush(&self, _older_than: Option<Duration>) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn prune(&self, _older_than: Duration) -> Result<usize, anyhow::Error> {
        Ok(0)
    }
}

/// In-process sink for tests and examples.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<FailedJobEntry>>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }
}

#[async_trait]
impl FailedJobSink for MemorySink {
    async fn log(
        &self,
        queue: &str,
        job: &JobRecord,
        error: &str,
    ) -> Result<String, anyhow::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let entry = FailedJobEntry {
            id: id.clone(),
            queue: queue.to_string(),
            job_id: job.id.clone(),
            payload: job.data.clone(),
            error: error.to_string(),
            failed_at: job.finished_on.unwrap_or_else(Utc::now),
        };
        self.entries.lock().unwrap().push(entry);
        Ok(id)
    }

    async fn all(&self) -> Result<Vec<FailedJobEntry>, anyhow::Error> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn find(&self, id: &str) -> Result<Option<FailedJobEntry>, anyhow::Error> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn forget(&self, id: &str) -> Result<bool, anyhow::Error> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() != before)
    }

    async fn flush(&self, older_than: Option<Duration>) -> Result<(), anyhow::Error> {
        let mut entries = self.entries.lock().unwrap();
        match older_than {
            Some(age) => {
                let cutoff = Utc::now() - chrono::Duration::from_std(age)?;
                entries.retain(|e| e.failed_at > cutoff);
            }
            None => entries.clear(),
        }
        Ok(())
    }

    async fn prune(&self, older_than: Duration) -> Result<usize, anyhow::Error> {
        let mut entries = self.entries.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than)?;
        let before = entries.len();
        entries.retain(|e| e.failed_at > cutoff);
        Ok(before - entries.len())
    }
}
