use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::{error::Error, job::JobOpts};

/// The status containers a job id can live in. A job id is in at most one
/// of these at any externally observable moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
    DependencyWait,
}

/// Full read-back of a job hash.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub data: Vec<u8>,
    pub opts: JobOpts,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_millis")]
    pub delay: Duration,
    pub priority: u32,
    pub attempts_made: u32,
    pub stalled_count: u32,
    pub progress: u8,
    pub stacktrace: Vec<String>,
    pub returnvalue: Option<serde_json::Value>,
    pub finished_on: Option<DateTime<Utc>>,
    pub processed_on: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub dependencies: Vec<String>,
}

impl JobRecord {
    /// Parse an HGETALL reply. An empty map means the hash does not exist.
    pub(crate) fn from_hash(
        mut fields: HashMap<String, Vec<u8>>,
    ) -> Result<Option<JobRecord>, Error> {
        if fields.is_empty() {
            return Ok(None);
        }

        let take_str = |fields: &mut HashMap<String, Vec<u8>>, name: &str| {
            fields
                .remove(name)
                .map(String::from_utf8)
                .transpose()
                .map_err(Error::from)
        };

        let id = match take_str(&mut fields, "id")? {
            Some(id) => id,
            None => return Ok(None),
        };
        let queue = take_str(&mut fields, "name")?.unwrap_or_default();
        let data = fields.remove("data").unwrap_or_default();
        let opts: JobOpts = match fields.remove("opts") {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => JobOpts::default(),
        };

        let parse_i64 = |value: Option<String>| -> Result<Option<i64>, Error> {
            value
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<i64>())
                .transpose()
                .map_err(Error::from)
        };

        let timestamp = parse_i64(take_str(&mut fields, "timestamp")?)?
            .map(|ms| Utc.timestamp_millis(ms))
            .unwrap_or_else(Utc::now);
        let delay = parse_i64(take_str(&mut fields, "delay")?)?
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
            .unwrap_or_default();
        let priority = parse_i64(take_str(&mut fields, "priority")?)?.unwrap_or(0) as u32;
        let attempts_made = parse_i64(take_str(&mut fields, "attemptsMade")?)?.unwrap_or(0) as u32;
        let stalled_count = parse_i64(take_str(&mut fields, "stalledCount")?)?.unwrap_or(0) as u32;
        let progress = parse_i64(take_str(&mut fields, "progress")?)?.unwrap_or(0).min(100) as u8;

        let stacktrace = match fields.remove("stacktrace") {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => Vec::new(),
        };
        let dependencies = match fields.remove("dependencies") {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => Vec::new(),
        };
        let returnvalue = fields
            .remove("returnvalue")
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()?;

        let finished_on = parse_i64(take_str(&mut fields, "finishedOn")?)?
            .map(|ms| Utc.timestamp_millis(ms));
        let processed_on = parse_i64(take_str(&mut fields, "processedOn")?)?
            .map(|ms| Utc.timestamp_millis(ms));
        let failed_reason = take_str(&mut fields, "failedReason")?;

        Ok(Some(JobRecord {
            id,
            queue,
            data,
            opts,
            timestamp,
            delay,
            priority,
            attempts_made,
            stalled_count,
            progress,
            stacktrace,
            returnvalue,
            finished_on,
            processed_on,
            failed_reason,
            dependencies,
        }))
    }

    /// Deserialize the payload bytes.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(self.data.as_slice()).map_err(Error::from)
    }

    /// Whether the job has reached `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.finished_on.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(entries: &[(&str, &[u8])]) -> HashMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn empty_hash_is_absent() {
        assert!(JobRecord::from_hash(HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn parses_full_hash() {
        let record = JobRecord::from_hash(hash(&[
            ("id", b"7"),
            ("name", b"mail"),
            ("data", br##"{"x":1}"##),
            ("opts", br##"{"attempts":5,"lifo":true}"##),
            ("timestamp", b"1600000000000"),
            ("delay", b"250"),
            ("priority", b"1"),
            ("attemptsMade", b"2"),
            ("stalledCount", b"0"),
            ("progress", b"40"),
            ("stacktrace", br##"["boom"]"##),
            ("dependencies", br##"["3"]"##),
            ("failedReason", b"boom"),
            ("finishedOn", b"1600000001000"),
        ]))
        .unwrap()
        .expect("record");

        assert_eq!(record.id, "7");
        assert_eq!(record.queue, "mail");
        assert_eq!(record.data, br##"{"x":1}"##);
        assert_eq!(record.opts.attempts, 5);
        assert!(record.opts.lifo);
        assert_eq!(record.delay, Duration::from_millis(250));
        assert_eq!(record.priority, 1);
        assert_eq!(record.attempts_made, 2);
        assert_eq!(record.progress, 40);
        assert_eq!(record.stacktrace, vec!["boom"]);
        assert_eq!(record.dependencies, vec!["3"]);
        assert_eq!(record.failed_reason.as_deref(), Some("boom"));
        assert!(record.is_terminal());
        assert_eq!(
            record.finished_on,
            Some(Utc.timestamp_millis(1600000001000))
        );

        let payload: serde_json::Value = record.payload().unwrap();
        assert_eq!(payload["x"], 1);
    }

    #[test]
    fn payload_bytes_survive_verbatim() {
        let raw: &[u8] = b"{\"n\":  1e3,\"s\":\"\xc3\xa9\"}";
        let record = JobRecord::from_hash(hash(&[
            ("id", b"x-1"),
            ("name", b"mail"),
            ("data", raw),
            ("opts", b"{}"),
            ("timestamp", b"1600000000000"),
        ]))
        .unwrap()
        .expect("record");
        assert_eq!(record.data.as_slice(), raw);
    }
}
