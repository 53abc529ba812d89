//! # redq - Redis-backed distributed job queue
//!
//! A Rust library for real-time job queues on a single Redis instance:
//! producers enqueue small JSON work items, worker processes pull jobs and
//! run a user handler, and progress/result events fan back to the producer
//! over pub/sub.
//!
//! ## Features
//!
//! - **Atomic lifecycle transitions**: every multi-key state change runs as
//!   a server-side Lua script, so a job is always in exactly one of
//!   waiting, active, succeeded, or failed
//! - **Reliable handoff**: BRPOPLPUSH moves each id from waiting to active
//!   in one step; a crash between fetch and completion cannot lose the job
//! - **Stall recovery**: jobs abandoned by crashed or hung workers are
//!   detected within two stall windows and re-enqueued
//! - **Timeouts and retries**: per-job execution deadline and retry budget
//! - **Job events**: `progress`, `succeeded`, `retrying`, and `failed`
//!   events delivered to the saved job handle in the producing process
//! - **Concurrency cap**: at most the configured number of handlers run at
//!   once per worker; excess jobs wait in Redis
//!
//! ## Quick Start
//!
//! ### Producer (enqueuing jobs)
//!
//! ```rust,no_run
//! use redq::{Queue, QueueSettings};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> redq::Result<()> {
//!     let queue = Queue::new("addition", QueueSettings::default()).await?;
//!
//!     let mut job = queue
//!         .create_job(&json!({"x": 2, "y": 3}))?
//!         .retries(2)
//!         .timeout(3000)
//!         .save()
//!         .await?;
//!
//!     match job.wait().await? {
//!         Ok(result) => println!("result: {}", result),
//!         Err(failure) => eprintln!("failed: {}", failure),
//!     }
//!
//!     queue.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Worker (processing jobs)
//!
//! ```rust,no_run
//! use redq::{Queue, QueueSettings};
//! use serde_json::Value;
//!
//! #[tokio::main]
//! async fn main() -> redq::Result<()> {
//!     let queue = Queue::new("addition", QueueSettings::default()).await?;
//!
//!     queue.process(4, |job| async move {
//!         let x = job.data()["x"].as_i64().unwrap_or(0);
//!         let y = job.data()["y"].as_i64().unwrap_or(0);
//!         Ok(Value::from(x + y))
//!     })?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     queue.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod queue;
pub mod redis_keys;

mod scripts;
mod stall;
mod worker;

// Re-export main types
pub use config::{QueueSettings, QueueSettingsBuilder};
pub use error::{QueueError, Result};
pub use events::{EventKind, EventMessage, JobEvent, JobFailure, QueueEvent};
pub use job::{Job, JobId, JobOptions};
pub use queue::Queue;
pub use redis_keys::Keys;
