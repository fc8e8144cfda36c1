//! Short-lived client connections toward workers.
//!
//! Each outbound call opens its own TCP JSON transport, waits for the
//! worker to acknowledge receipt within a bounded deadline, and drops
//! the connection. There are no retries at this layer.

use std::time::{Duration, SystemTime};

use anyhow::Result;
use tarpc::{client, context, tokio_serde::formats::Json};

use crate::{PingInfo, TaskSpec, WorkerRecord, WorkerServiceClient};

/// A context whose deadline expires after `timeout`.
pub fn deadline(timeout: Duration) -> context::Context {
    let mut ctx = context::current();
    ctx.deadline = SystemTime::now() + timeout;
    ctx
}

async fn connect(worker: &WorkerRecord) -> Result<WorkerServiceClient> {
    let transport =
        tarpc::serde_transport::tcp::connect((worker.host.as_str(), worker.port), Json::default)
            .await?;
    Ok(WorkerServiceClient::new(client::Config::default(), transport).spawn())
}

/// Send a health probe. The worker answers asynchronously with `pong`.
pub async fn ping(worker: &WorkerRecord, info: PingInfo, timeout: Duration) -> Result<()> {
    let client = connect(worker).await?;
    client.ping(deadline(timeout), info).await?;
    Ok(())
}

/// Hand a task to a worker. Resolves once the worker acknowledges
/// receipt; completion arrives later through `finish`.
pub async fn run(worker: &WorkerRecord, task: TaskSpec, timeout: Duration) -> Result<()> {
    let client = connect(worker).await?;
    client.run(deadline(timeout), task).await?;
    Ok(())
}
