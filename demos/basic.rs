//! Basic example: one process acting as both producer and worker.
//!
//! This example demonstrates:
//! - Creating a queue
//! - Enqueueing jobs with retries and a timeout
//! - Processing jobs with progress reporting
//! - Observing per-job events on the producer side
//!
//! Requires a Redis server on localhost. Run with: `cargo run --example basic`

use redq::{Queue, QueueSettings};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> redq::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("redq job queue example\n");

    let queue = Queue::new("addition", QueueSettings::default()).await?;

    queue.process(2, |mut job| async move {
        let x = job.data()["x"].as_i64().unwrap_or(0);
        let y = job.data()["y"].as_i64().unwrap_or(0);
        job.report_progress(50).await?;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        job.report_progress(100).await?;
        Ok(Value::from(x + y))
    })?;

    let pairs = [(2, 3), (10, 32), (7, 0)];
    println!("Enqueueing {} jobs...\n", pairs.len());

    let mut jobs = Vec::new();
    for (x, y) in pairs {
        let job = queue
            .create_job(&json!({"x": x, "y": y}))?
            .retries(1)
            .timeout(5000)
            .save()
            .await?;
        if let Some(id) = job.id() {
            println!("  enqueued job {}", id);
        }
        jobs.push(job);
    }

    for mut job in jobs {
        match job.wait().await? {
            Ok(result) => println!("  job {:?} result: {}", job.id(), result),
            Err(failure) => println!("  job {:?} failed: {}", job.id(), failure),
        }
    }

    println!("\nwaiting: {}", queue.waiting_len().await?);
    println!("succeeded: {}", queue.succeeded_len().await?);

    queue.close().await?;
    Ok(())
}
