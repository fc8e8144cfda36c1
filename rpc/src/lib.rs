//! Wire contract between the farm master and its workers.
//!
//! The master runs a JSON-RPC server implementing [`MasterService`] and
//! opens short-lived client connections toward workers implementing
//! [`WorkerService`]. All payloads are plain serde records; resource
//! options are carried opaquely as JSON values.

use serde::{Deserialize, Serialize};

pub mod client;

/// RPC surface of the master, called by workers.
#[tarpc::service]
pub trait MasterService {
    /// Reply to a `ping`, carrying buffered remote log lines.
    async fn pong(info: PongInfo);
    /// Report that a task (or a resource fetch) finished on a worker.
    async fn finish(info: FinishInfo);
}

/// RPC surface of a worker, called by the master.
#[tarpc::service]
pub trait WorkerService {
    /// Health probe. The worker answers out of band with `pong`.
    async fn ping(info: PingInfo);
    /// Hand a task to the worker. Acknowledges receipt only; completion
    /// arrives later through `finish`.
    async fn run(task: TaskSpec);
}

/// Identity and endpoints of one process in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub name: String,
    pub host: String,
    /// JSON-RPC port.
    pub port: u16,
    /// HTTP port serving `/results/{taskName}`.
    pub resource_port: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Producing,
    Reducing,
}

/// Reference to a completed upstream task, consumed by reducing tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_name: String,
    pub worker_name: String,
}

/// A unit of remote work. Immutable once created; the name is the sole
/// correlation key between the dispatch and its eventual `finish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    pub session_name: String,
    pub execution_name: String,
    /// Partition index for producing tasks.
    pub index: u32,
    /// Upstream results for reducing tasks; empty for producing tasks.
    pub inputs: Vec<TaskResult>,
    /// Session resource options, opaque to the control plane.
    pub resources: serde_json::Value,
}

/// Completion notification. Tagged so a task completion and a resource
/// fetching completion can never collide on the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum FinishInfo {
    #[serde(rename = "TASK")]
    Task { task: TaskSpec, worker_name: String },
    #[serde(rename = "FETCHING")]
    Fetching {
        task_name: String,
        worker_name: String,
        /// Sessions whose staged resources the worker now holds.
        cached_sessions: Vec<String>,
    },
}

impl FinishInfo {
    pub fn task_name(&self) -> &str {
        match self {
            FinishInfo::Task { task, .. } => &task.name,
            FinishInfo::Fetching { task_name, .. } => task_name,
        }
    }

    pub fn worker_name(&self) -> &str {
        match self {
            FinishInfo::Task { worker_name, .. } => worker_name,
            FinishInfo::Fetching { worker_name, .. } => worker_name,
        }
    }

    /// The upstream reference a later reduce consumes.
    pub fn as_result(&self) -> TaskResult {
        TaskResult {
            task_name: self.task_name().to_owned(),
            worker_name: self.worker_name().to_owned(),
        }
    }
}

/// One buffered log line relayed from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub from: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongInfo {
    pub worker_name: String,
    pub logs: Vec<LogRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingInfo {
    pub worker_name: String,
    /// Master identity, so a freshly booted worker learns its callback
    /// address. None until the first fleet reconciliation tick.
    pub master: Option<WorkerRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_info_wire_tags() {
        let info = FinishInfo::Fetching {
            task_name: "task1-1".into(),
            worker_name: "w0".into(),
            cached_sessions: vec!["session1-2".into()],
        };
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["type"], "FETCHING");
        // camelCase on the wire, matching the worker protocol.
        assert_eq!(v["taskName"], "task1-1");
        assert_eq!(v["cachedSessions"][0], "session1-2");

        let back: FinishInfo = serde_json::from_value(v).unwrap();
        assert_eq!(back.task_name(), "task1-1");
        assert_eq!(back.worker_name(), "w0");
    }

    #[test]
    fn task_finish_correlates_by_task_name() {
        let info = FinishInfo::Task {
            task: TaskSpec {
                name: "task9-3".into(),
                kind: TaskKind::Reducing,
                session_name: "s".into(),
                execution_name: "e".into(),
                index: 0,
                inputs: vec![TaskResult {
                    task_name: "task9-1".into(),
                    worker_name: "w1".into(),
                }],
                resources: serde_json::Value::Null,
            },
            worker_name: "w2".into(),
        };
        assert_eq!(info.task_name(), "task9-3");
        assert_eq!(info.as_result().worker_name, "w2");
    }
}
