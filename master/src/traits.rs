//! Contracts of the master's external collaborators.
//!
//! The orchestration engine only needs to know these exist; placement
//! policy, cloud APIs and fleet-sizing policy live behind them.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use farm_rpc::{FinishInfo, TaskResult, WorkerRecord};

use crate::session::{Execution, Session};

/// Decides which worker runs a given task and owns the pending queue.
pub trait Scheduler: Send + Sync {
    /// Create one producing task for partition `index`; returns the
    /// generated task name.
    fn create_producing_task(&self, session: &Session, execution: &mut Execution, index: u32)
        -> String;

    /// Create one reducing task over `inputs`; returns the generated
    /// task name.
    fn create_reducing_task(
        &self,
        session: &Session,
        execution: &mut Execution,
        inputs: Vec<TaskResult>,
    ) -> String;

    /// Trigger a placement pass. Dispatch is fire-and-forget; nothing
    /// is awaited.
    fn schedule(&self);

    /// The worker roster snapshot was replaced.
    fn update_workers(&self);

    /// Placement bookkeeping for a completion, before the orchestrator
    /// sees it.
    fn dispatch_finish(&self, info: &FinishInfo);
}

/// The `{master, workers}` identity records of the current fleet.
#[derive(Debug, Clone)]
pub struct Instances {
    pub master: WorkerRecord,
    pub workers: HashMap<String, WorkerRecord>,
}

/// Enumerates, creates and destroys worker processes.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    async fn get_instances(&self) -> Result<Instances>;
    async fn spawn_instance(&self) -> Result<()>;
    async fn destroy_instance(&self, name: &str) -> Result<()>;
}

/// Applies fleet-sizing policy on each reconciliation tick.
#[async_trait]
pub trait InstanceManager: Send + Sync {
    /// `spawn_interval` throttles consecutive instance creations.
    async fn manage(&self, spawn_interval: std::time::Duration) -> Result<()>;
}
