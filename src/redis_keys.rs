//! Redis key schema for a queue.
//!
//! All queue state lives under `{prefix}:{name}:{suffix}`; every component
//! reasons about state through this fixed key set.

/// Derives the Redis keys for a queue with a given prefix and name.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
    name: String,
}

impl Keys {
    /// Create a new Keys instance for the given prefix and queue name.
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
        }
    }

    /// Get the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.name, suffix)
    }

    /// Key for the job id counter (INTEGER), INCR'd on save.
    pub fn id(&self) -> String {
        self.key("id")
    }

    /// Key for the job payload hash (HASH, id -> JSON record).
    pub fn jobs(&self) -> String {
        self.key("jobs")
    }

    /// Key for ids awaiting fetch (LIST); LPUSH on enqueue, BRPOPLPUSH on fetch.
    pub fn waiting(&self) -> String {
        self.key("waiting")
    }

    /// Key for ids currently being processed (LIST).
    pub fn active(&self) -> String {
        self.key("active")
    }

    /// Key for ids expected to heartbeat this stall window (SET).
    pub fn stalling(&self) -> String {
        self.key("stalling")
    }

    /// Key for ids of completed jobs (SET), unless purged on success.
    pub fn succeeded(&self) -> String {
        self.key("succeeded")
    }

    /// Key for ids of terminally failed jobs (SET).
    pub fn failed(&self) -> String {
        self.key("failed")
    }

    /// Pub/sub channel carrying job event messages.
    pub fn events(&self) -> String {
        self.key("events")
    }

    /// Every key that holds queue state, in a fixed order.
    ///
    /// Used by `destroy` to drop the whole queue in one DEL.
    pub fn all(&self) -> [String; 7] {
        [
            self.id(),
            self.jobs(),
            self.waiting(),
            self.active(),
            self.stalling(),
            self.succeeded(),
            self.failed(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let keys = Keys::new("bq", "addition");
        assert_eq!(keys.id(), "bq:addition:id");
        assert_eq!(keys.jobs(), "bq:addition:jobs");
        assert_eq!(keys.waiting(), "bq:addition:waiting");
        assert_eq!(keys.active(), "bq:addition:active");
        assert_eq!(keys.stalling(), "bq:addition:stalling");
        assert_eq!(keys.succeeded(), "bq:addition:succeeded");
        assert_eq!(keys.failed(), "bq:addition:failed");
        assert_eq!(keys.events(), "bq:addition:events");
    }

    #[test]
    fn test_keys_custom_prefix() {
        let keys = Keys::new("myapp:queues", "mail");
        assert_eq!(keys.waiting(), "myapp:queues:mail:waiting");
        assert_eq!(keys.name(), "mail");
    }

    #[test]
    fn test_keys_all_excludes_events_channel() {
        let keys = Keys::new("bq", "q");
        let all = keys.all();
        assert_eq!(all.len(), 7);
        assert!(!all.contains(&keys.events()));
    }

    #[test]
    fn test_keys_clone() {
        let keys1 = Keys::new("bq", "q");
        let keys2 = keys1.clone();
        assert_eq!(keys1.waiting(), keys2.waiting());
    }
}
