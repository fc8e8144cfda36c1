//! Completion future registry.
//!
//! Correlates an in-flight task name with the code awaiting its
//! asynchronous `finish` notification. Task completions and resource
//! fetching completions are distinct namespaces kept in separate maps
//! so the two kinds can never collide on the same key.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use farm_rpc::FinishInfo;

#[derive(Debug, Default)]
struct Pending {
    tasks: HashMap<String, oneshot::Sender<FinishInfo>>,
    fetchings: HashMap<String, oneshot::Sender<FinishInfo>>,
}

/// One-time-resolved completion handles, at most one per outstanding
/// task name. A `finish` with no pending waiter is silently dropped.
#[derive(Debug, Default)]
pub struct FinishRegistry {
    pending: Mutex<Pending>,
}

impl FinishRegistry {
    /// Register a wait for a TASK completion of `name`.
    pub fn await_task(&self, name: &str) -> oneshot::Receiver<FinishInfo> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().tasks.insert(name.to_owned(), tx);
        rx
    }

    /// Register a wait for a FETCHING completion of `name`.
    pub fn await_fetching(&self, name: &str) -> oneshot::Receiver<FinishInfo> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .fetchings
            .insert(name.to_owned(), tx);
        rx
    }

    /// Resolve the pending wait matching `info`, if any. Unmatched or
    /// duplicate notifications are dropped; late delivery must never
    /// crash the master.
    pub fn resolve(&self, info: &FinishInfo) {
        let sender = {
            let mut pending = self.pending.lock().unwrap();
            match info {
                FinishInfo::Task { task, .. } => pending.tasks.remove(&task.name),
                FinishInfo::Fetching { task_name, .. } => pending.fetchings.remove(task_name),
            }
        };
        if let Some(tx) = sender {
            // The receiver may have been dropped by a caller that gave
            // up; that is equivalent to an unmatched delivery.
            let _ = tx.send(info.clone());
        }
    }

    /// Number of waits currently pending, `(tasks, fetchings)`.
    pub fn pending_counts(&self) -> (usize, usize) {
        let pending = self.pending.lock().unwrap();
        (pending.tasks.len(), pending.fetchings.len())
    }
}
