use smallvec::SmallVec;

/// Precomputed key names for one queue. Every key the engine touches is
/// `<prefix>:<queue>:<suffix>`; job hashes and per-job locks hang off the
/// `job:` and `lock:` prefixes.
#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    pub root: String,
    /// One waiting list per priority level, indexed by level. Level 0 is
    /// the plain `waiting` list.
    pub waiting: SmallVec<[String; 4]>,
    pub active: String,
    pub delayed: String,
    pub completed: String,
    pub failed: String,
    pub dependency_wait: String,
    pub paused: String,
    pub id_counter: String,
    pub events: String,
    pub metrics: String,
    pub limit: String,
    pub job_prefix: String,
    pub lock_prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue_name: &str, priority_levels: u32) -> QueueKeys {
        let root = format!("{}:{}", prefix, queue_name);
        let waiting_base = format!("{}:waiting", root);
        let waiting: SmallVec<[String; 4]> = (0..priority_levels.max(1))
            .map(|level| {
                if level == 0 {
                    waiting_base.clone()
                } else {
                    format!("{}:{}", waiting_base, level)
                }
            })
            .collect();

        QueueKeys {
            waiting,
            active: format!("{}:active", root),
            delayed: format!("{}:delayed", root),
            completed: format!("{}:completed", root),
            failed: format!("{}:failed", root),
            dependency_wait: format!("{}:dependency-wait", root),
            paused: format!("{}:paused", root),
            id_counter: format!("{}:id", root),
            events: format!("{}:events", root),
            metrics: format!("{}:metrics", root),
            limit: format!("{}:limit", root),
            job_prefix: format!("{}:job:", root),
            lock_prefix: format!("{}:lock:", root),
            root,
        }
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}{}", self.job_prefix, job_id)
    }

    pub fn dependents(&self, job_id: &str) -> String {
        format!("{}{}:dependents", self.job_prefix, job_id)
    }

    pub fn lock(&self, job_id: &str) -> String {
        format!("{}{}", self.lock_prefix, job_id)
    }

    pub fn limit_for(&self, discriminator: Option<&str>) -> String {
        match discriminator {
            Some(d) => format!("{}:{}", self.limit, d),
            None => self.limit.clone(),
        }
    }

    /// The base name scripts use to rebuild per-level waiting keys.
    pub fn waiting_base(&self) -> &str {
        self.waiting[0].as_str()
    }

    /// Waiting lists ordered highest level first, the order reservation
    /// probes them.
    pub fn waiting_desc(&self) -> impl Iterator<Item = &str> {
        self.waiting.iter().rev().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let keys = QueueKeys::new("cvq", "mail", 1);
        assert_eq!(keys.root, "cvq:mail");
        assert_eq!(keys.waiting.to_vec(), vec!["cvq:mail:waiting"]);
        assert_eq!(keys.active, "cvq:mail:active");
        assert_eq!(keys.delayed, "cvq:mail:delayed");
        assert_eq!(keys.dependency_wait, "cvq:mail:dependency-wait");
        assert_eq!(keys.job("42"), "cvq:mail:job:42");
        assert_eq!(keys.dependents("42"), "cvq:mail:job:42:dependents");
        assert_eq!(keys.lock("42"), "cvq:mail:lock:42");
        assert_eq!(keys.limit_for(None), "cvq:mail:limit");
        assert_eq!(keys.limit_for(Some("tenant-1")), "cvq:mail:limit:tenant-1");
    }

    #[test]
    fn priority_levels() {
        let keys = QueueKeys::new("cvq", "mail", 3);
        assert_eq!(
            keys.waiting.to_vec(),
            vec![
                "cvq:mail:waiting",
                "cvq:mail:waiting:1",
                "cvq:mail:waiting:2"
            ]
        );
        let probe: Vec<&str> = keys.waiting_desc().collect();
        assert_eq!(
            probe,
            vec![
                "cvq:mail:waiting:2",
                "cvq:mail:waiting:1",
                "cvq:mail:waiting"
            ]
        );
    }
}
