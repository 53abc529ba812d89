//! Queue settings.

use std::time::Duration;

/// Settings for a queue handle.
///
/// A queue may act as producer only, worker only, or both; the `is_worker`,
/// `get_events`, and `send_events` toggles control which of the up to three
/// Redis connections (command, blocking fetch, subscriber) are opened.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Redis connection URL.
    pub redis_url: String,
    /// Key namespace prefix.
    pub prefix: String,
    /// Stall window length; active jobs must heartbeat within it.
    pub stall_interval: Duration,
    /// Whether this queue opens the blocking fetch connection and may `process`.
    pub is_worker: bool,
    /// Whether this queue subscribes to the events channel and emits local events.
    pub get_events: bool,
    /// Whether this queue publishes events for jobs it processes.
    pub send_events: bool,
    /// On success, purge the job payload instead of adding to the succeeded set.
    pub remove_on_success: bool,
    /// Treat handler panics as job failures instead of leaving the job for
    /// stall recovery.
    pub catch_exceptions: bool,
    /// Granularity of the blocking fetch; shutdown interleaves at this period.
    pub fetch_timeout: Duration,
    /// How long `close` waits for in-flight handlers to drain.
    pub close_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            prefix: "bq".to_string(),
            stall_interval: Duration::from_millis(5000),
            is_worker: true,
            get_events: true,
            send_events: true,
            remove_on_success: false,
            catch_exceptions: false,
            fetch_timeout: Duration::from_secs(1),
            close_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueSettings {
    /// Create a new builder.
    pub fn builder() -> QueueSettingsBuilder {
        QueueSettingsBuilder::new()
    }
}

/// Builder for QueueSettings.
#[derive(Debug, Default)]
pub struct QueueSettingsBuilder {
    settings: QueueSettings,
}

impl QueueSettingsBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            settings: QueueSettings::default(),
        }
    }

    /// Set the Redis URL.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.settings.redis_url = url.into();
        self
    }

    /// Set the key namespace prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.prefix = prefix.into();
        self
    }

    /// Set the stall window length.
    pub fn stall_interval(mut self, interval: Duration) -> Self {
        self.settings.stall_interval = interval;
        self
    }

    /// Set whether this queue is a worker.
    pub fn is_worker(mut self, is_worker: bool) -> Self {
        self.settings.is_worker = is_worker;
        self
    }

    /// Set whether this queue subscribes to job events.
    pub fn get_events(mut self, get_events: bool) -> Self {
        self.settings.get_events = get_events;
        self
    }

    /// Set whether this queue publishes job events.
    pub fn send_events(mut self, send_events: bool) -> Self {
        self.settings.send_events = send_events;
        self
    }

    /// Set whether successful jobs are purged instead of recorded.
    pub fn remove_on_success(mut self, remove: bool) -> Self {
        self.settings.remove_on_success = remove;
        self
    }

    /// Set whether handler panics are converted into job failures.
    pub fn catch_exceptions(mut self, catch: bool) -> Self {
        self.settings.catch_exceptions = catch;
        self
    }

    /// Set the blocking fetch granularity.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.settings.fetch_timeout = timeout;
        self
    }

    /// Set the close drain timeout.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.settings.close_timeout = timeout;
        self
    }

    /// Build the QueueSettings.
    pub fn build(self) -> QueueSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = QueueSettings::default();
        assert_eq!(settings.prefix, "bq");
        assert_eq!(settings.stall_interval, Duration::from_millis(5000));
        assert!(settings.is_worker);
        assert!(settings.get_events);
        assert!(settings.send_events);
        assert!(!settings.remove_on_success);
        assert!(!settings.catch_exceptions);
    }

    #[test]
    fn test_builder() {
        let settings = QueueSettings::builder()
            .redis_url("redis://example:6380")
            .prefix("myapp")
            .stall_interval(Duration::from_secs(1))
            .is_worker(false)
            .get_events(false)
            .send_events(false)
            .remove_on_success(true)
            .catch_exceptions(true)
            .build();
        assert_eq!(settings.redis_url, "redis://example:6380");
        assert_eq!(settings.prefix, "myapp");
        assert_eq!(settings.stall_interval, Duration::from_secs(1));
        assert!(!settings.is_worker);
        assert!(!settings.get_events);
        assert!(!settings.send_events);
        assert!(settings.remove_on_success);
        assert!(settings.catch_exceptions);
    }
}
