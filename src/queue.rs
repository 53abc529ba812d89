//! The queue handle: construction, producer path, introspection, and close.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::QueueSettings;
use crate::error::{QueueError, Result};
use crate::events::{self, EventPublisher, JobFailure, QueueEvent, Registry};
use crate::job::{Job, JobId, JobRecord};
use crate::redis_keys::Keys;
use crate::scripts::{FinishMode, Scripts};
use crate::{stall, worker};

/// State shared between the queue handle, its job handles, and its
/// background tasks.
pub(crate) struct Inner {
    pub(crate) settings: QueueSettings,
    pub(crate) keys: Keys,
    pub(crate) scripts: Scripts,
    pub(crate) conn: ConnectionManager,
    pub(crate) fetch_conn: Option<ConnectionManager>,
    pub(crate) registry: Registry,
    pub(crate) events_tx: broadcast::Sender<QueueEvent>,
    pub(crate) closed: AtomicBool,
    pub(crate) processing: AtomicBool,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) drain: Notify,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn publisher(&self) -> EventPublisher {
        EventPublisher::new(
            self.conn.clone(),
            self.keys.events(),
            self.settings.send_events,
        )
    }

    /// Log a background failure and re-emit it on the queue event channel.
    pub(crate) fn emit_error(&self, context: &'static str, message: String) {
        tracing::error!(queue = self.keys.name(), context, error = %message, "Queue error");
        let _ = self
            .events_tx
            .send(QueueEvent::Error(format!("{}: {}", context, message)));
    }

    pub(crate) async fn check_stalled(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        self.scripts.check_stalled(&mut conn, &self.keys).await
    }

    pub(crate) async fn finish_job(
        &self,
        id: JobId,
        mode: FinishMode,
        record: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        self.scripts
            .finish_job(&mut conn, &self.keys, id.0, mode, record)
            .await
    }

    /// One heartbeat: leave the current stall window.
    pub(crate) async fn srem_stalling(&self, id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(self.keys.stalling(), id.0).await?;
        Ok(())
    }

    pub(crate) async fn lrem_active(&self, id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(self.keys.active(), 0, id.0).await?;
        Ok(())
    }

    pub(crate) async fn read_record(&self, id: JobId) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(self.keys.jobs(), id.0).await?)
    }
}

/// A named handle over a Redis key group that can produce, consume, or
/// observe jobs.
///
/// Constructing a queue connects to Redis and caches the atomic scripts;
/// [`Queue::new`] returning `Ok` is the readiness signal. See the crate docs
/// for producer and worker examples.
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    /// Connect to Redis and open a queue handle with the given settings.
    ///
    /// Opens the command connection, the blocking fetch connection when
    /// `is_worker`, and the subscriber connection when `get_events`, and
    /// loads every atomic script.
    pub async fn new(name: impl Into<String>, settings: QueueSettings) -> Result<Self> {
        let name = name.into();
        let client = redis::Client::open(settings.redis_url.as_str())?;
        let mut conn = ConnectionManager::new(client.clone()).await?;

        let keys = Keys::new(settings.prefix.clone(), name);
        let scripts = Scripts::new();
        scripts.load(&mut conn).await?;

        let fetch_conn = if settings.is_worker {
            Some(ConnectionManager::new(client.clone()).await?)
        } else {
            None
        };

        let pubsub = if settings.get_events {
            let mut pubsub = client.get_async_pubsub().await?;
            pubsub.subscribe(keys.events()).await?;
            Some(pubsub)
        } else {
            None
        };

        let (events_tx, _) = broadcast::channel(1024);
        let inner = Arc::new(Inner {
            settings,
            keys,
            scripts,
            conn,
            fetch_conn,
            registry: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            closed: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drain: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        });

        if let Some(pubsub) = pubsub {
            let handle = tokio::spawn(events::run_subscriber(
                pubsub,
                inner.events_tx.clone(),
                inner.registry.clone(),
            ));
            if let Ok(mut tasks) = inner.tasks.lock() {
                tasks.push(handle);
            }
        }

        tracing::info!(queue = inner.keys.name(), "Queue ready");
        Ok(Self { inner })
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        self.inner.keys.name()
    }

    /// The queue's settings.
    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Subscribe to queue-level events: one `QueueEvent::Job` per event
    /// message observed for any job on this queue, plus `QueueEvent::Error`
    /// notices from background tasks.
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Create a fresh in-memory job with defaulted options.
    ///
    /// The job is not persisted until [`Job::save`] is called.
    pub fn create_job<T: Serialize>(&self, data: &T) -> Result<Job> {
        self.inner.ensure_open()?;
        let data = serde_json::to_value(data)?;
        Ok(Job::unsaved(Some(self.inner.clone()), data))
    }

    /// Fetch a job's stored record by id.
    ///
    /// Returns `Ok(None)` for unknown ids and for jobs purged by
    /// `remove_on_success`.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.ensure_open()?;
        match self.inner.read_record(id).await? {
            Some(raw) => {
                let record = JobRecord::from_json(&raw)?;
                Ok(Some(Job::loaded(Some(self.inner.clone()), id, record)))
            }
            None => Ok(None),
        }
    }

    /// Start processing jobs with the given handler and concurrency cap.
    ///
    /// Spawns the fetch loop and the stall supervisor and returns
    /// immediately. At most `concurrency` handler invocations run at once;
    /// newly enqueued ids wait in Redis until a slot frees.
    ///
    /// Fails with a misuse error on a non-worker queue, on a second call, or
    /// with a zero concurrency.
    pub fn process<F, Fut>(&self, concurrency: usize, handler: F) -> Result<()>
    where
        F: Fn(Job) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = std::result::Result<Value, JobFailure>> + Send + 'static,
    {
        self.inner.ensure_open()?;
        if !self.inner.settings.is_worker {
            return Err(QueueError::Misuse("process requires a worker queue"));
        }
        if concurrency == 0 {
            return Err(QueueError::Misuse("concurrency must be at least 1"));
        }
        if self.inner.processing.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Misuse("process may only be called once"));
        }

        let fetch = tokio::spawn(worker::run(self.inner.clone(), concurrency, handler));
        let supervisor = tokio::spawn(stall::run(self.inner.clone()));
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(fetch);
            tasks.push(supervisor);
        }

        tracing::info!(
            queue = self.inner.keys.name(),
            concurrency,
            "Worker started"
        );
        Ok(())
    }

    /// Recover jobs whose worker missed the stall window, once.
    ///
    /// Every id still in the stalling set is moved back to waiting, then the
    /// current active list is snapshotted into a fresh stalling set. Returns
    /// the number of re-enqueued jobs. The worker loop runs this on a timer;
    /// calling it ad hoc is also valid.
    pub async fn check_stalled_jobs(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        self.inner.check_stalled().await
    }

    /// Number of jobs awaiting fetch.
    pub async fn waiting_len(&self) -> Result<usize> {
        self.inner.ensure_open()?;
        let mut conn = self.inner.conn.clone();
        Ok(conn.llen(self.inner.keys.waiting()).await?)
    }

    /// Number of jobs currently being processed.
    pub async fn active_len(&self) -> Result<usize> {
        self.inner.ensure_open()?;
        let mut conn = self.inner.conn.clone();
        Ok(conn.llen(self.inner.keys.active()).await?)
    }

    /// Number of completed jobs still recorded in the succeeded set.
    pub async fn succeeded_len(&self) -> Result<usize> {
        self.inner.ensure_open()?;
        let mut conn = self.inner.conn.clone();
        Ok(conn.scard(self.inner.keys.succeeded()).await?)
    }

    /// Number of terminally failed jobs.
    pub async fn failed_len(&self) -> Result<usize> {
        self.inner.ensure_open()?;
        let mut conn = self.inner.conn.clone();
        Ok(conn.scard(self.inner.keys.failed()).await?)
    }

    /// Delete every key belonging to this queue.
    pub async fn destroy(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let mut conn = self.inner.conn.clone();
        let keys = self.inner.keys.all();
        conn.del::<_, ()>(&keys[..]).await?;
        tracing::info!(queue = self.inner.keys.name(), "Queue destroyed");
        Ok(())
    }

    /// Close the queue.
    ///
    /// Stops issuing new fetches, waits up to `close_timeout` for in-flight
    /// handlers to finish (or hit their timeouts), then stops the
    /// subscriber and supervisor tasks and drops the job handle registry.
    /// Idempotent; all other operations fail with `Closed` afterwards.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(queue = self.inner.keys.name(), "Queue closing");

        let deadline = tokio::time::Instant::now() + self.inner.settings.close_timeout;
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    in_flight = self.inner.in_flight.load(Ordering::SeqCst),
                    "Close timeout reached, abandoning in-flight jobs"
                );
                break;
            }
            tokio::select! {
                _ = self.inner.drain.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        let handles: Vec<JoinHandle<()>> = match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.abort();
        }
        if let Ok(mut registry) = self.inner.registry.lock() {
            registry.clear();
        }

        tracing::info!(queue = self.inner.keys.name(), "Queue closed");
        Ok(())
    }
}

impl Job {
    /// Persist the job: assign its id, store its record, and push it onto
    /// the waiting list, atomically.
    ///
    /// On a queue with `get_events`, the saved handle is registered to
    /// receive this job's lifecycle events. On a transport error the save
    /// did not take effect as far as this process can tell, though a lost
    /// acknowledgement may leave the job enqueued anyway; callers should
    /// treat the error as "unknown outcome" rather than retry blindly.
    pub async fn save(mut self) -> Result<Job> {
        let core = self
            .core
            .clone()
            .ok_or(QueueError::Misuse("job is not attached to a queue"))?;
        if self.id.is_some() {
            return Err(QueueError::Misuse("job is already saved"));
        }
        core.ensure_open()?;

        let record = self.record().to_json()?;
        let mut conn = core.conn.clone();
        let id = JobId(core.scripts.add_job(&mut conn, &core.keys, &record).await?);
        self.id = Some(id);

        if core.settings.get_events {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Ok(mut registry) = core.registry.lock() {
                registry.insert(id, tx);
            }
            self.events = Some(rx);
        }

        tracing::debug!(queue = core.keys.name(), job_id = %id, "Job saved");
        Ok(self)
    }
}
