use std::{borrow::Cow, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{backoff_plan::BackoffPlan, error::Error};

/// What to do with a job hash after a terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalPolicy {
    /// Keep the hash and the status-list entry.
    Keep,
    /// Delete the hash outright.
    Remove,
    /// Keep the hash, but trim the status list (and the hashes of evicted
    /// entries) down to the most recent N.
    KeepLast(u32),
}

impl Default for RemovalPolicy {
    fn default() -> Self {
        RemovalPolicy::Keep
    }
}

impl Serialize for RemovalPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RemovalPolicy::Keep => serializer.serialize_bool(false),
            RemovalPolicy::Remove => serializer.serialize_bool(true),
            RemovalPolicy::KeepLast(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for RemovalPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            Count(u32),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Flag(false) => RemovalPolicy::Keep,
            Repr::Flag(true) => RemovalPolicy::Remove,
            Repr::Count(n) => RemovalPolicy::KeepLast(n),
        })
    }
}

fn string_or_seq<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::One(id) => vec![id],
        Repr::Many(ids) => ids,
    })
}

/// Enqueue options. Serialized as-is into the job hash so that every later
/// transition (retry routing, removal policy, dependent promotion) can read
/// the snapshot the producer supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobOpts {
    /// Schedule the first attempt `delay` after enqueue.
    #[serde(with = "serde_millis")]
    pub delay: Duration,
    /// Maximum tries including the first.
    pub attempts: u32,
    pub backoff: Option<BackoffPlan>,
    /// Priority level, `0..levels`. Higher levels are reserved sooner.
    pub priority: u32,
    /// Push at the tail instead of the head, turning the list into a stack.
    pub lifo: bool,
    /// Per-attempt handler timeout.
    #[serde(with = "serde_millis")]
    pub timeout: Option<Duration>,
    /// Parent job ids that must complete before this job runs.
    #[serde(deserialize_with = "string_or_seq")]
    pub depends_on: Vec<String>,
    pub remove_on_complete: RemovalPolicy,
    pub remove_on_fail: RemovalPolicy,
    /// Suppress deletion regardless of the removal policies.
    pub keep_jobs: bool,
}

impl Default for JobOpts {
    fn default() -> Self {
        JobOpts {
            delay: Duration::from_millis(0),
            attempts: 3,
            backoff: None,
            priority: 0,
            lifo: false,
            timeout: None,
            depends_on: Vec::new(),
            remove_on_complete: RemovalPolicy::Keep,
            remove_on_fail: RemovalPolicy::Keep,
            keep_jobs: false,
        }
    }
}

/// A job to enqueue. When `id` is `None` an id is drawn from the queue's
/// counter; supplied ids act as idempotency keys.
#[derive(Default)]
pub struct Job<'a> {
    pub id: Option<&'a str>,
    pub payload: Cow<'a, [u8]>,
    pub opts: JobOpts,
}

impl<'a> std::fmt::Debug for Job<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .field("opts", &self.opts)
            .finish()
    }
}

impl<'a> Job<'a> {
    pub fn from_bytes(id: Option<&'a str>, bytes: &'a [u8]) -> Job<'a> {
        Job {
            id,
            payload: Cow::Borrowed(bytes),
            ..Default::default()
        }
    }

    pub fn from_json_payload<T: Serialize>(
        id: Option<&'a str>,
        payload: &T,
    ) -> Result<Job<'a>, serde_json::Error> {
        let data = serde_json::to_vec(payload)?;
        Ok(Job {
            id,
            payload: Cow::Owned(data),
            ..Default::default()
        })
    }

    pub fn with_opts(mut self, opts: JobOpts) -> Job<'a> {
        self.opts = opts;
        self
    }
}

/// Queue names become key segments, so they must be non-empty and free of
/// the key separator.
pub(crate) fn validate_queue_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::BadOptions("queue name must not be empty".to_string()));
    }
    if name.contains(':') {
        return Err(Error::BadOptions(format!(
            "queue name {} must not contain ':'",
            name
        )));
    }
    Ok(())
}

/// Caller-supplied job ids share a namespace with counter-generated ids
/// (decimal integers) and are embedded in keys, so pure integers and ids
/// containing ':' are rejected.
pub(crate) fn validate_job_id(id: &str) -> Result<(), Error> {
    if id.is_empty() {
        return Err(Error::BadOptions("job id must not be empty".to_string()));
    }
    if id.contains(':') {
        return Err(Error::BadOptions(format!(
            "job id {} must not contain ':'",
            id
        )));
    }
    if id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::BadOptions(format!(
            "job id {} must not be a pure integer",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn opts_round_trip() {
        let opts = JobOpts {
            delay: Duration::from_millis(500),
            attempts: 5,
            backoff: Some(BackoffPlan::exponential(Duration::from_millis(100))),
            priority: 2,
            lifo: true,
            timeout: Some(Duration::from_secs(30)),
            depends_on: vec!["a-parent".to_string()],
            remove_on_complete: RemovalPolicy::KeepLast(100),
            remove_on_fail: RemovalPolicy::Remove,
            keep_jobs: false,
        };

        let json = serde_json::to_string(&opts).unwrap();
        let parsed: JobOpts = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, opts);
    }

    #[test]
    fn opts_field_names() {
        let json = serde_json::to_value(&JobOpts::default()).unwrap();
        let object = json.as_object().unwrap();
        for field in [
            "delay",
            "attempts",
            "priority",
            "lifo",
            "dependsOn",
            "removeOnComplete",
            "removeOnFail",
            "keepJobs",
        ] {
            assert!(object.contains_key(field), "missing field {}", field);
        }
    }

    #[test]
    fn depends_on_accepts_string_or_array() {
        let single: JobOpts = serde_json::from_str(r##"{"dependsOn":"p1"}"##).unwrap();
        assert_eq!(single.depends_on, vec!["p1"]);

        let many: JobOpts = serde_json::from_str(r##"{"dependsOn":["p1","p2"]}"##).unwrap();
        assert_eq!(many.depends_on, vec!["p1", "p2"]);
    }

    #[test]
    fn removal_policy_forms() {
        let keep: RemovalPolicy = serde_json::from_str("false").unwrap();
        assert_eq!(keep, RemovalPolicy::Keep);
        let remove: RemovalPolicy = serde_json::from_str("true").unwrap();
        assert_eq!(remove, RemovalPolicy::Remove);
        let last: RemovalPolicy = serde_json::from_str("25").unwrap();
        assert_eq!(last, RemovalPolicy::KeepLast(25));

        assert_eq!(serde_json::to_string(&RemovalPolicy::Keep).unwrap(), "false");
        assert_eq!(
            serde_json::to_string(&RemovalPolicy::KeepLast(25)).unwrap(),
            "25"
        );
    }

    #[test]
    fn queue_name_validation() {
        assert_matches!(validate_queue_name("mail"), Ok(()));
        assert_matches!(validate_queue_name(""), Err(Error::BadOptions(_)));
        assert_matches!(validate_queue_name("a:b"), Err(Error::BadOptions(_)));
    }

    #[test]
    fn job_id_validation() {
        assert_matches!(validate_job_id("order-15"), Ok(()));
        assert_matches!(validate_job_id(""), Err(Error::BadOptions(_)));
        assert_matches!(validate_job_id("a:b"), Err(Error::BadOptions(_)));
        assert_matches!(validate_job_id("12345"), Err(Error::BadOptions(_)));
    }
}
