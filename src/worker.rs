//! The worker loop: blocking fetch, handler dispatch, and disposition.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Result;
use crate::events::{EventMessage, JobFailure};
use crate::job::{Job, JobId, JobRecord};
use crate::queue::Inner;
use crate::scripts::FinishMode;

/// How a handler invocation ended.
enum HandlerRun {
    /// The handler resolved (or its panic was converted under
    /// `catch_exceptions`, or the timeout fired first).
    Done(std::result::Result<Value, JobFailure>),
    /// The handler panicked and `catch_exceptions` is off; the job is left
    /// in active for stall recovery.
    Panicked(String),
}

/// Drive the fetch loop until the queue closes.
///
/// A semaphore with `concurrency` permits gates the blocking fetch, so the
/// number of in-flight handler invocations never exceeds the cap; each
/// fetched job runs in its own task holding a permit.
pub(crate) async fn run<F, Fut>(core: Arc<Inner>, concurrency: usize, handler: F)
where
    F: Fn(Job) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = std::result::Result<Value, JobFailure>> + Send + 'static,
{
    let Some(mut fetch_conn) = core.fetch_conn.clone() else {
        return;
    };
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let waiting = core.keys.waiting();
    let active = core.keys.active();

    tracing::debug!(queue = core.keys.name(), "Fetch loop started");

    while !core.is_closed() {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let Some(id) = next_id(&core, &mut fetch_conn, &waiting, &active).await else {
            break;
        };
        core.in_flight.fetch_add(1, Ordering::SeqCst);
        let core = core.clone();
        let handler = handler.clone();
        tokio::spawn(run_job(core, handler, id, permit));
    }

    tracing::debug!("Fetch loop stopped");
}

/// Block on BRPOPLPUSH waiting -> active until an id arrives or the queue
/// closes.
///
/// The pop is issued with a short timeout in a loop so close() can
/// interleave; the handoff itself is still the single atomic move. Transport
/// errors are surfaced on the queue event channel and retried after a pause.
async fn next_id(
    core: &Arc<Inner>,
    conn: &mut ConnectionManager,
    waiting: &str,
    active: &str,
) -> Option<JobId> {
    let timeout_secs = core.settings.fetch_timeout.as_secs_f64();
    loop {
        if core.is_closed() {
            return None;
        }
        match conn
            .brpoplpush::<_, _, Option<u64>>(waiting, active, timeout_secs)
            .await
        {
            Ok(Some(id)) => return Some(JobId(id)),
            Ok(None) => continue,
            Err(e) => {
                core.emit_error("fetch", e.to_string());
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn run_job<F, Fut>(core: Arc<Inner>, handler: F, id: JobId, permit: OwnedSemaphorePermit)
where
    F: Fn(Job) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = std::result::Result<Value, JobFailure>> + Send + 'static,
{
    let _permit = permit;
    if let Err(e) = process_one(&core, handler, id).await {
        core.emit_error("dispatch", e.to_string());
    }
    core.in_flight.fetch_sub(1, Ordering::SeqCst);
    core.drain.notify_one();
}

async fn process_one<F, Fut>(core: &Arc<Inner>, handler: F, id: JobId) -> Result<()>
where
    F: Fn(Job) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = std::result::Result<Value, JobFailure>> + Send + 'static,
{
    // Leave the current stall window before running.
    core.srem_stalling(id).await?;

    let raw = match core.read_record(id).await? {
        Some(raw) => raw,
        None => {
            tracing::warn!(job_id = %id, "Fetched id has no stored record, dropping");
            core.lrem_active(id).await?;
            return Ok(());
        }
    };
    let record = match JobRecord::from_json(&raw) {
        Ok(record) => record,
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "Failed to decode job record");
            let failure = JobFailure::new(format!("invalid job record: {}", e));
            core.finish_job(id, FinishMode::Failed, None).await?;
            core.publisher()
                .publish(&EventMessage::failed(id, &failure))
                .await;
            return Ok(());
        }
    };

    let data = record.data.clone();
    let options = record.options.clone();
    let job = Job::for_dispatch(id, record, core.publisher());

    tracing::debug!(queue = core.keys.name(), job_id = %id, "Processing job");

    // Heartbeat once per stall window while the handler runs.
    let heartbeat = spawn_heartbeat(core.clone(), id);
    let outcome = run_handler(
        (handler)(job),
        options.timeout,
        core.settings.catch_exceptions,
    )
    .await;
    heartbeat.abort();

    match outcome {
        HandlerRun::Panicked(message) => {
            // Same recovery path as a crashed worker: the id stays in active
            // until the stall supervisor re-enqueues it.
            core.emit_error("handler panic", message);
            Ok(())
        }
        HandlerRun::Done(Ok(result)) => {
            let mode = if core.settings.remove_on_success {
                FinishMode::Purge
            } else {
                FinishMode::Succeeded
            };
            core.finish_job(id, mode, None).await?;
            core.publisher()
                .publish(&EventMessage::succeeded(id, &result))
                .await;
            tracing::debug!(job_id = %id, "Job succeeded");
            Ok(())
        }
        HandlerRun::Done(Err(failure)) => {
            if options.can_retry() {
                let record = JobRecord {
                    data,
                    options: options.decrement_retry(),
                };
                core.finish_job(id, FinishMode::Retry, Some(&record.to_json()?))
                    .await?;
                core.publisher()
                    .publish(&EventMessage::retrying(id, &failure))
                    .await;
                tracing::debug!(
                    job_id = %id,
                    retries_left = record.options.retries,
                    error = %failure,
                    "Job retrying"
                );
            } else {
                core.finish_job(id, FinishMode::Failed, None).await?;
                core.publisher()
                    .publish(&EventMessage::failed(id, &failure))
                    .await;
                tracing::warn!(job_id = %id, error = %failure, "Job failed");
            }
            Ok(())
        }
    }
}

/// Resolve a handler future exactly once: first of handler completion,
/// timeout expiry, or panic.
async fn run_handler<Fut>(fut: Fut, timeout_ms: Option<u64>, catch_exceptions: bool) -> HandlerRun
where
    Fut: Future<Output = std::result::Result<Value, JobFailure>>,
{
    let run = async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(outcome) => HandlerRun::Done(outcome),
            Err(payload) if catch_exceptions => {
                HandlerRun::Done(Err(JobFailure::from_panic(payload)))
            }
            Err(payload) => HandlerRun::Panicked(JobFailure::from_panic(payload).message),
        }
    };
    match timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
            Ok(outcome) => outcome,
            Err(_) => HandlerRun::Done(Err(JobFailure::timed_out(ms))),
        },
        None => run.await,
    }
}

fn spawn_heartbeat(core: Arc<Inner>, id: JobId) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(core.settings.stall_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; the initial SREM already
        // happened at dispatch.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = core.srem_stalling(id).await {
                tracing::debug!(job_id = %id, error = %e, "Heartbeat failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_handler_success() {
        let outcome = run_handler(async { Ok(json!(5)) }, None, false).await;
        match outcome {
            HandlerRun::Done(Ok(value)) => assert_eq!(value, json!(5)),
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn test_run_handler_failure_passes_through() {
        let outcome = run_handler(async { Err(JobFailure::new("boom")) }, Some(1000), false).await;
        match outcome {
            HandlerRun::Done(Err(failure)) => {
                assert_eq!(failure.message, "boom");
                assert!(!failure.is_timeout());
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_handler_synthesizes_timeout() {
        let outcome = run_handler(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!("late"))
            },
            Some(100),
            false,
        )
        .await;
        match outcome {
            HandlerRun::Done(Err(failure)) => {
                assert!(failure.is_timeout());
                assert!(failure.message.contains("100 ms"));
            }
            _ => panic!("expected timeout failure"),
        }
    }

    #[tokio::test]
    async fn test_run_handler_catches_panic_when_configured() {
        let outcome = run_handler(async { panic!("kaboom") }, None, true).await;
        match outcome {
            HandlerRun::Done(Err(failure)) => {
                assert!(failure.message.contains("kaboom"));
                assert!(!failure.is_timeout());
            }
            _ => panic!("expected captured panic"),
        }
    }

    #[tokio::test]
    async fn test_run_handler_reports_panic_when_not_catching() {
        let outcome = run_handler(async { panic!("kaboom") }, None, false).await;
        match outcome {
            HandlerRun::Panicked(message) => assert!(message.contains("kaboom")),
            _ => panic!("expected panic report"),
        }
    }
}
