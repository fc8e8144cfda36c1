//! Session/execution bookkeeping and the shared master state.

use std::collections::{HashMap, VecDeque};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use farm_rpc::WorkerRecord;

/// A unit of shared input resources. One session serves any number of
/// executions; its affinity list remembers which workers already hold
/// the staged inputs.
#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    /// Resource options, opaque to the control plane.
    pub resources: serde_json::Value,
    /// Workers known to hold this session's resources. Most recently
    /// used at the tail; rotated, never shrunk, no duplicates.
    pub cached_workers: VecDeque<String>,
}

/// One rendering request against a session. Lives only as long as its
/// orchestration future; never persisted.
#[derive(Debug, Clone)]
pub struct Execution {
    pub name: String,
    pub session_name: String,
    /// Desired number of producing tasks.
    pub parallel: u32,
    pub started: Instant,
    /// Names of the tasks spawned so far.
    pub tasks: Vec<String>,
}

/// Mutable master state shared between the orchestrator, the RPC
/// dispatch path and the scheduler. Guarded by one mutex; the lock is
/// never held across an await point.
#[derive(Debug, Default)]
pub struct State {
    seed: u64,
    pub sessions: HashMap<String, Session>,
    pub master: Option<WorkerRecord>,
    /// Worker roster snapshot, replaced wholesale on each fleet
    /// reconciliation tick.
    pub workers: HashMap<String, WorkerRecord>,
}

impl State {
    /// Unique, monotonically distinguishable id: unix seconds plus a
    /// per-master counter.
    pub fn next_id(&mut self) -> String {
        self.seed += 1;
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{}-{}", secs, self.seed)
    }

    /// Rotate the session's affinity list: pop the most recently used
    /// worker off the tail, recycle it to the head and return its
    /// record. None if the session is unknown, its list is empty, or
    /// the worker has dropped out of the roster snapshot.
    pub fn next_cached_worker(&mut self, session_name: &str) -> Option<WorkerRecord> {
        let session = self.sessions.get_mut(session_name)?;
        let name = session.cached_workers.pop_back()?;
        session.cached_workers.push_front(name.clone());
        self.workers.get(&name).cloned()
    }

    /// Record that `worker` now holds `session`'s resources. Appending
    /// an already known worker is a no-op.
    pub fn record_cached_worker(&mut self, session_name: &str, worker: &str) {
        if let Some(session) = self.sessions.get_mut(session_name) {
            if !session.cached_workers.iter().any(|w| w == worker) {
                session.cached_workers.push_back(worker.to_owned());
            }
        }
    }
}
