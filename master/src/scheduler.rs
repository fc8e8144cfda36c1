//! Minimal FIFO queue scheduler.
//!
//! Holds created tasks in a pending queue until a placement pass
//! assigns each to a worker and fires the `run` dispatch. Placement
//! prefers workers already caching the task's session resources
//! (affinity rotation) and otherwise picks a random roster worker.
//! Tasks with no available worker stay queued for the next pass.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use rand::seq::IteratorRandom;

use farm_rpc::{client, FinishInfo, TaskKind, TaskResult, TaskSpec, WorkerRecord};

use crate::session::{Execution, Session, State};
use crate::traits::Scheduler;

#[derive(Debug, Default)]
struct Queue {
    pending: VecDeque<TaskSpec>,
    /// Task name to the worker it was sent to.
    running: HashMap<String, String>,
}

pub struct QueueScheduler {
    state: Arc<Mutex<State>>,
    queue: Mutex<Queue>,
    rpc_timeout: Duration,
}

impl QueueScheduler {
    pub fn new(state: Arc<Mutex<State>>, rpc_timeout: Duration) -> Self {
        Self {
            state,
            queue: Mutex::new(Queue::default()),
            rpc_timeout,
        }
    }

    fn next_task_name(&self) -> String {
        format!("task{}", self.state.lock().unwrap().next_id())
    }

    fn push(&self, task: TaskSpec) {
        self.queue.lock().unwrap().pending.push_back(task);
    }

    fn place(&self, state: &mut State, task: &TaskSpec) -> Option<WorkerRecord> {
        if let Some(worker) = state.next_cached_worker(&task.session_name) {
            return Some(worker);
        }
        let mut rng = rand::thread_rng();
        state.workers.values().choose(&mut rng).cloned()
    }

    /// Tasks dispatched but not yet finished.
    pub fn running_count(&self) -> usize {
        self.queue.lock().unwrap().running.len()
    }
}

impl Scheduler for QueueScheduler {
    fn create_producing_task(
        &self,
        session: &Session,
        execution: &mut Execution,
        index: u32,
    ) -> String {
        let name = self.next_task_name();
        execution.tasks.push(name.clone());
        self.push(TaskSpec {
            name: name.clone(),
            kind: TaskKind::Producing,
            session_name: session.name.clone(),
            execution_name: execution.name.clone(),
            index,
            inputs: Vec::new(),
            resources: session.resources.clone(),
        });
        name
    }

    fn create_reducing_task(
        &self,
        session: &Session,
        execution: &mut Execution,
        inputs: Vec<TaskResult>,
    ) -> String {
        let name = self.next_task_name();
        execution.tasks.push(name.clone());
        self.push(TaskSpec {
            name: name.clone(),
            kind: TaskKind::Reducing,
            session_name: session.name.clone(),
            execution_name: execution.name.clone(),
            index: 0,
            inputs,
            resources: session.resources.clone(),
        });
        name
    }

    fn schedule(&self) {
        let mut queue = self.queue.lock().unwrap();
        let mut waiting = VecDeque::new();
        while let Some(task) = queue.pending.pop_front() {
            let worker = {
                let mut state = self.state.lock().unwrap();
                self.place(&mut state, &task)
            };
            let worker = match worker {
                Some(w) => w,
                None => {
                    trace!("no worker available for {}, kept pending", task.name);
                    waiting.push_back(task);
                    continue;
                }
            };
            debug!("task {} sent to {}", task.name, worker.name);
            queue.running.insert(task.name.clone(), worker.name.clone());
            let timeout = self.rpc_timeout;
            // Fire-and-forget: a lost dispatch surfaces as a task that
            // never finishes, not as an error here.
            tokio::spawn(async move {
                if let Err(e) = client::run(&worker, task, timeout).await {
                    warn!("run dispatch to {} failed: {}", worker.name, e);
                }
            });
        }
        queue.pending = waiting;
    }

    fn update_workers(&self) {
        let count = self.state.lock().unwrap().workers.len();
        debug!("worker roster updated, {} workers", count);
        // New workers may unblock tasks that had nowhere to go.
        self.schedule();
    }

    fn dispatch_finish(&self, info: &FinishInfo) {
        if let FinishInfo::Task { task, .. } = info {
            self.queue.lock().unwrap().running.remove(&task.name);
        }
    }
}
