//! The event bus: wire messages, local event fan-out, and the subscriber.
//!
//! Workers publish `{event, id, data}` JSON messages to the queue's events
//! channel. Queues with `get_events` run a subscriber task that re-emits each
//! message on a broadcast channel and routes it to the saved job handle that
//! created the job, if it lives in this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::job::JobId;

/// A handler-reported, synthesized, or captured job failure.
///
/// Carried through retry/fail disposition and delivered on `retrying` and
/// `failed` events. Timeout failures set the `timeout` flag so consumers can
/// distinguish them from handler-reported errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    /// Error message.
    pub message: String,
    /// Optional stack or backtrace text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Whether this failure was synthesized by the job timeout.
    #[serde(default, skip_serializing_if = "is_false")]
    pub timeout: bool,
}

fn is_false(flag: &bool) -> bool {
    !flag
}

impl JobFailure {
    /// Create a new failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            timeout: false,
        }
    }

    /// Attach stack text to this failure.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The failure synthesized when a handler misses its deadline.
    pub fn timed_out(timeout_ms: u64) -> Self {
        Self {
            message: format!("job timed out after {} ms", timeout_ms),
            stack: None,
            timeout: true,
        }
    }

    /// The failure captured from a handler panic under `catch_exceptions`.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::new(format!("handler panicked: {}", message))
    }

    /// Whether this failure came from the job timeout.
    pub fn is_timeout(&self) -> bool {
        self.timeout
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobFailure {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

/// The kind of a published job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Succeeded,
    Retrying,
    Failed,
}

/// Wire format of a message on the events channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: EventKind,
    pub id: JobId,
    pub data: Value,
}

impl EventMessage {
    pub(crate) fn progress(id: JobId, progress: u8) -> Self {
        Self {
            event: EventKind::Progress,
            id,
            data: Value::from(progress),
        }
    }

    pub(crate) fn succeeded(id: JobId, result: &Value) -> Self {
        Self {
            event: EventKind::Succeeded,
            id,
            data: result.clone(),
        }
    }

    pub(crate) fn retrying(id: JobId, failure: &JobFailure) -> Self {
        Self {
            event: EventKind::Retrying,
            id,
            data: serde_json::to_value(failure).unwrap_or(Value::Null),
        }
    }

    pub(crate) fn failed(id: JobId, failure: &JobFailure) -> Self {
        Self {
            event: EventKind::Failed,
            id,
            data: serde_json::to_value(failure).unwrap_or(Value::Null),
        }
    }

    /// Interpret the `data` field according to the event kind.
    ///
    /// Returns None when the data does not fit the kind (e.g. a non-integer
    /// progress value from a foreign publisher).
    pub(crate) fn to_job_event(&self) -> Option<JobEvent> {
        match self.event {
            EventKind::Progress => {
                let n = self.data.as_u64()?;
                u8::try_from(n).ok().filter(|n| *n <= 100).map(JobEvent::Progress)
            }
            EventKind::Succeeded => Some(JobEvent::Succeeded(self.data.clone())),
            EventKind::Retrying => serde_json::from_value(self.data.clone())
                .ok()
                .map(JobEvent::Retrying),
            EventKind::Failed => serde_json::from_value(self.data.clone())
                .ok()
                .map(JobEvent::Failed),
        }
    }
}

/// A job lifecycle event as delivered to local consumers.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The handler reported progress in [0, 100].
    Progress(u8),
    /// The job completed with a result.
    Succeeded(Value),
    /// The job failed with retries remaining and was re-enqueued.
    Retrying(JobFailure),
    /// The job failed terminally.
    Failed(JobFailure),
}

impl JobEvent {
    /// Whether this event ends the job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Succeeded(_) | JobEvent::Failed(_))
    }
}

/// An event emitted on the queue-level broadcast channel.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A job event, for any job on this queue (the "job <event>" surface).
    Job { id: JobId, event: JobEvent },
    /// A transport error observed by a background task.
    Error(String),
}

/// In-process map from job id to the saved handle's event sender.
///
/// Entries are inserted on `save` when `get_events` is enabled and removed on
/// terminal events and on `close`.
pub(crate) type Registry = Arc<Mutex<HashMap<JobId, mpsc::UnboundedSender<JobEvent>>>>;

/// Publishes event messages to the queue's events channel.
///
/// Fire-and-forget: pub/sub is not durable, so publish errors are logged at
/// debug and otherwise ignored.
#[derive(Clone)]
pub(crate) struct EventPublisher {
    conn: ConnectionManager,
    channel: String,
    enabled: bool,
}

impl EventPublisher {
    pub(crate) fn new(conn: ConnectionManager, channel: String, enabled: bool) -> Self {
        Self {
            conn,
            channel,
            enabled,
        }
    }

    pub(crate) async fn publish(&self, message: &EventMessage) {
        if !self.enabled {
            return;
        }
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to encode job event");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn.publish::<_, _, ()>(&self.channel, payload).await {
            tracing::debug!(error = %e, "Failed to publish job event");
        }
    }
}

/// Fan one inbound message out to the broadcast channel and the per-job
/// handle, dropping the registry entry on terminal events.
pub(crate) fn dispatch(
    message: &EventMessage,
    events_tx: &broadcast::Sender<QueueEvent>,
    registry: &Registry,
) {
    let Some(event) = message.to_job_event() else {
        tracing::debug!(job_id = %message.id, "Ignoring malformed event message");
        return;
    };

    let _ = events_tx.send(QueueEvent::Job {
        id: message.id,
        event: event.clone(),
    });

    let Ok(mut registry) = registry.lock() else {
        return;
    };
    if let Some(tx) = registry.get(&message.id) {
        let _ = tx.send(event.clone());
        if event.is_terminal() {
            registry.remove(&message.id);
        }
    }
}

/// Drive the subscriber connection, dispatching messages until it closes.
pub(crate) async fn run_subscriber(
    pubsub: redis::aio::PubSub,
    events_tx: broadcast::Sender<QueueEvent>,
    registry: Registry,
) {
    use futures_util::StreamExt;

    let mut stream = pubsub.into_on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring non-string event payload");
                continue;
            }
        };
        match serde_json::from_str::<EventMessage>(&payload) {
            Ok(message) => dispatch(&message, &events_tx, &registry),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed event message");
            }
        }
    }
    tracing::debug!("Event subscriber stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_wire_format() {
        let message = EventMessage::progress(JobId(7), 50);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json, json!({"event": "progress", "id": 7, "data": 50}));
    }

    #[test]
    fn test_succeeded_wire_format() {
        let message = EventMessage::succeeded(JobId(3), &json!(5));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json, json!({"event": "succeeded", "id": 3, "data": 5}));
    }

    #[test]
    fn test_failure_wire_format_omits_empty_fields() {
        let message = EventMessage::failed(JobId(1), &JobFailure::new("nope"));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            json!({"event": "failed", "id": 1, "data": {"message": "nope"}})
        );
    }

    #[test]
    fn test_failure_wire_format_with_stack() {
        let failure = JobFailure::new("boom").with_stack("at handler");
        let data = serde_json::to_value(&failure).unwrap();
        assert_eq!(data, json!({"message": "boom", "stack": "at handler"}));
    }

    #[test]
    fn test_timeout_failure_round_trip() {
        let failure = JobFailure::timed_out(100);
        assert!(failure.is_timeout());
        let data = serde_json::to_value(&failure).unwrap();
        let decoded: JobFailure = serde_json::from_value(data).unwrap();
        assert!(decoded.is_timeout());
        assert!(decoded.message.contains("timed out after 100 ms"));
    }

    #[test]
    fn test_plain_failure_decodes_without_flags() {
        let decoded: JobFailure = serde_json::from_value(json!({"message": "boom"})).unwrap();
        assert_eq!(decoded.message, "boom");
        assert_eq!(decoded.stack, None);
        assert!(!decoded.is_timeout());
    }

    #[test]
    fn test_to_job_event_rejects_out_of_range_progress() {
        let message = EventMessage {
            event: EventKind::Progress,
            id: JobId(1),
            data: json!(250),
        };
        assert!(message.to_job_event().is_none());

        let message = EventMessage {
            event: EventKind::Progress,
            id: JobId(1),
            data: json!("half"),
        };
        assert!(message.to_job_event().is_none());
    }

    #[test]
    fn test_from_panic_payloads() {
        let failure = JobFailure::from_panic(Box::new("boom"));
        assert!(failure.message.contains("boom"));
        let failure = JobFailure::from_panic(Box::new("boom".to_string()));
        assert!(failure.message.contains("boom"));
        let failure = JobFailure::from_panic(Box::new(42u32));
        assert!(failure.message.contains("handler panicked"));
    }

    #[test]
    fn test_dispatch_routes_to_registered_handle() {
        let (events_tx, mut events_rx) = broadcast::channel(16);
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.lock().unwrap().insert(JobId(7), tx);

        dispatch(
            &EventMessage::progress(JobId(7), 50),
            &events_tx,
            &registry,
        );

        match rx.try_recv().unwrap() {
            JobEvent::Progress(n) => assert_eq!(n, 50),
            other => panic!("unexpected event: {:?}", other),
        }
        match events_rx.try_recv().unwrap() {
            QueueEvent::Job { id, .. } => assert_eq!(id, JobId(7)),
            other => panic!("unexpected event: {:?}", other),
        }
        // Progress is not terminal; the handle stays registered.
        assert!(registry.lock().unwrap().contains_key(&JobId(7)));
    }

    #[test]
    fn test_dispatch_removes_handle_on_terminal_event() {
        let (events_tx, _events_rx) = broadcast::channel(16);
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.lock().unwrap().insert(JobId(9), tx);

        dispatch(
            &EventMessage::succeeded(JobId(9), &json!("done")),
            &events_tx,
            &registry,
        );

        assert!(matches!(rx.try_recv().unwrap(), JobEvent::Succeeded(_)));
        assert!(!registry.lock().unwrap().contains_key(&JobId(9)));
    }

    #[test]
    fn test_dispatch_ignores_unregistered_ids() {
        let (events_tx, mut events_rx) = broadcast::channel(16);
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

        dispatch(
            &EventMessage::failed(JobId(4), &JobFailure::new("nope")),
            &events_tx,
            &registry,
        );

        // Still visible on the queue-level channel.
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            QueueEvent::Job { id: JobId(4), .. }
        ));
    }
}
