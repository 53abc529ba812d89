//! Job handles and the stored job record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{QueueError, Result};
use crate::events::{EventMessage, EventPublisher, JobEvent, JobFailure};
use crate::queue::Inner;

/// Queue-scoped job identifier, assigned by INCR on the id counter at save.
///
/// Ids are strictly increasing within a queue and never reused; a retried job
/// keeps its original id. Serialized as a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime options for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Remaining retry budget; decrements on each retry.
    #[serde(default)]
    pub retries: u32,
    /// Execution deadline in milliseconds; absent means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            retries: 0,
            timeout: None,
        }
    }
}

impl JobOptions {
    /// Check whether the job has retry budget left.
    pub fn can_retry(&self) -> bool {
        self.retries > 0
    }

    /// Consume one retry and return the updated options.
    pub(crate) fn decrement_retry(mut self) -> Self {
        self.retries = self.retries.saturating_sub(1);
        self
    }
}

/// The JSON record stored in the `jobs` hash: `{"data": ..., "options": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    pub data: Value,
    #[serde(default)]
    pub options: JobOptions,
}

impl JobRecord {
    pub(crate) fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A job handle.
///
/// Producers get one from [`Queue::create_job`](crate::Queue::create_job),
/// configure it with the chainable setters, and persist it with
/// [`save`](Job::save). Handlers receive one per invocation and may call
/// [`report_progress`](Job::report_progress). Saved handles on queues with
/// `get_events` receive the job's lifecycle events.
pub struct Job {
    pub(crate) core: Option<Arc<Inner>>,
    pub(crate) id: Option<JobId>,
    pub(crate) data: Value,
    pub(crate) options: JobOptions,
    pub(crate) progress: u8,
    pub(crate) events: Option<mpsc::UnboundedReceiver<JobEvent>>,
    pub(crate) publisher: Option<EventPublisher>,
}

impl Job {
    /// A fresh, unsaved job with defaulted options.
    pub(crate) fn unsaved(core: Option<Arc<Inner>>, data: Value) -> Self {
        Self {
            core,
            id: None,
            data,
            options: JobOptions::default(),
            progress: 0,
            events: None,
            publisher: None,
        }
    }

    /// A job handle reconstructed from a stored record (`get_job`).
    pub(crate) fn loaded(core: Option<Arc<Inner>>, id: JobId, record: JobRecord) -> Self {
        Self {
            core,
            id: Some(id),
            data: record.data,
            options: record.options,
            progress: 0,
            events: None,
            publisher: None,
        }
    }

    /// The job handle passed to a handler invocation.
    pub(crate) fn for_dispatch(id: JobId, record: JobRecord, publisher: EventPublisher) -> Self {
        Self {
            core: None,
            id: Some(id),
            data: record.data,
            options: record.options,
            progress: 0,
            events: None,
            publisher: Some(publisher),
        }
    }

    /// The job's id, if it has been saved.
    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    /// The job payload.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Decode the payload into a concrete type.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// The job's options.
    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// The last progress value reported during execution.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Set the retry budget. Chainable; only meaningful before `save`.
    pub fn retries(mut self, retries: u32) -> Self {
        self.options.retries = retries;
        self
    }

    /// Set the execution timeout in milliseconds. Chainable; only meaningful
    /// before `save`.
    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.options.timeout = Some(timeout_ms);
        self
    }

    pub(crate) fn record(&self) -> JobRecord {
        JobRecord {
            data: self.data.clone(),
            options: self.options.clone(),
        }
    }

    /// Report execution progress, in [0, 100].
    ///
    /// Valid only inside a handler. Sets the in-memory progress and publishes
    /// a `progress` event; delivery is best-effort.
    pub async fn report_progress(&mut self, progress: u8) -> Result<()> {
        if progress > 100 {
            return Err(QueueError::Misuse("progress must be in 0..=100"));
        }
        if self.publisher.is_none() {
            return Err(QueueError::Misuse(
                "report_progress is only valid inside a handler",
            ));
        }
        self.progress = progress;
        if let (Some(publisher), Some(id)) = (self.publisher.as_ref(), self.id) {
            publisher.publish(&EventMessage::progress(id, progress)).await;
        }
        Ok(())
    }

    /// Receive the next event for this job, or None when the subscription is
    /// gone (queue closed, or the terminal event was already delivered).
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        match self.events.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Consume events until the terminal one and return the job's outcome.
    ///
    /// Progress events update [`progress`](Job::progress) along the way;
    /// `retrying` events are skipped. Fails with `Closed` if the subscription
    /// ends before a terminal event, and with a misuse error on a handle that
    /// has no event subscription (`get_events` disabled, or not saved).
    pub async fn wait(&mut self) -> Result<std::result::Result<Value, JobFailure>> {
        if self.events.is_none() {
            return Err(QueueError::Misuse("job has no event subscription"));
        }
        while let Some(event) = self.next_event().await {
            match event {
                JobEvent::Progress(progress) => self.progress = progress,
                JobEvent::Retrying(_) => {}
                JobEvent::Succeeded(result) => return Ok(Ok(result)),
                JobEvent::Failed(failure) => return Ok(Err(failure)),
            }
        }
        Err(QueueError::Closed)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("data", &self.data)
            .field("options", &self.options)
            .field("progress", &self.progress)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_id_display_and_serialization() {
        let id = JobId(42);
        assert_eq!(format!("{}", id), "42");
        assert_eq!(serde_json::to_value(id).unwrap(), json!(42));
    }

    #[test]
    fn test_record_round_trip() {
        let record = JobRecord {
            data: json!({"x": 2, "y": 3}),
            options: JobOptions {
                retries: 2,
                timeout: Some(100),
            },
        };
        let json = record.to_json().unwrap();
        let decoded = JobRecord::from_json(&json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_defaults_apply_when_options_missing() {
        let decoded = JobRecord::from_json(r#"{"data": 1}"#).unwrap();
        assert_eq!(decoded.options.retries, 0);
        assert_eq!(decoded.options.timeout, None);
    }

    #[test]
    fn test_record_omits_unset_timeout() {
        let record = JobRecord {
            data: json!(null),
            options: JobOptions::default(),
        };
        let json = record.to_json().unwrap();
        assert!(!json.contains("timeout"));
    }

    #[test]
    fn test_chainable_setters() {
        let job = Job::unsaved(None, json!("payload")).retries(3).timeout(250);
        assert_eq!(job.options().retries, 3);
        assert_eq!(job.options().timeout, Some(250));
        assert_eq!(job.id(), None);
    }

    #[test]
    fn test_decrement_retry_saturates() {
        let options = JobOptions {
            retries: 1,
            timeout: None,
        };
        let options = options.decrement_retry();
        assert_eq!(options.retries, 0);
        assert!(!options.can_retry());
        let options = options.decrement_retry();
        assert_eq!(options.retries, 0);
    }

    #[test]
    fn test_data_as() {
        #[derive(Deserialize)]
        struct Payload {
            x: i64,
        }
        let job = Job::unsaved(None, json!({"x": 7}));
        let payload: Payload = job.data_as().unwrap();
        assert_eq!(payload.x, 7);
    }

    #[tokio::test]
    async fn test_report_progress_outside_handler_is_misuse() {
        let mut job = Job::unsaved(None, json!(null));
        let err = job.report_progress(50).await.unwrap_err();
        assert!(matches!(err, QueueError::Misuse(_)));
    }

    #[tokio::test]
    async fn test_wait_without_subscription_is_misuse() {
        let mut job = Job::unsaved(None, json!(null));
        let err = job.wait().await.unwrap_err();
        assert!(matches!(err, QueueError::Misuse(_)));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_terminal_event() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut job = Job::unsaved(None, json!(null));
        job.events = Some(rx);

        tx.send(JobEvent::Progress(50)).unwrap();
        tx.send(JobEvent::Retrying(JobFailure::new("boom"))).unwrap();
        tx.send(JobEvent::Succeeded(json!(7))).unwrap();

        let outcome = job.wait().await.unwrap();
        assert_eq!(outcome.unwrap(), json!(7));
        assert_eq!(job.progress(), 50);
    }

    #[tokio::test]
    async fn test_wait_reports_closed_when_channel_drops() {
        let (tx, rx) = mpsc::unbounded_channel::<JobEvent>();
        let mut job = Job::unsaved(None, json!(null));
        job.events = Some(rx);
        drop(tx);

        let err = job.wait().await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
