//! The orchestration engine.
//!
//! [`Master`] owns the session table, the worker roster snapshot and
//! the completion future registry, serves the inbound `pong`/`finish`
//! RPC surface, and drives executions through fetch, parallel produce,
//! two-layer reduce and result retrieval. Placement is delegated to the
//! external [`Scheduler`]; the fleet is refreshed by the provider and
//! sized by the instance manager on a periodic loop.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::process;
use std::sync::{Arc, Mutex};

use futures::stream::FuturesUnordered;
use futures::{future, prelude::*};
use log::{debug, error, info, trace};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time;

use tarpc::{
    context,
    server::{self, incoming::Incoming, Channel},
    tokio_serde::formats::Json,
};

use farm_rpc::{
    client, FinishInfo, LogRecord, MasterService, PingInfo, PongInfo, TaskResult, WorkerRecord,
};

use crate::config::MasterConfig;
use crate::error::{Error, Result};
use crate::registry::FinishRegistry;
use crate::session::{Execution, Session, State};
use crate::traits::{InstanceManager, InstanceProvider, Scheduler};

/// A single reducing task comfortably combines this many inputs; above
/// it the orchestrator switches to two-layer reduction.
const SINGLE_REDUCE_LIMIT: usize = 4;

/// Request for one execution against an existing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    pub session_name: String,
    /// Desired number of producing tasks (at least 1).
    pub parallel: u32,
}

#[derive(Clone)]
pub struct Master {
    cfg: Arc<MasterConfig>,
    state: Arc<Mutex<State>>,
    finishes: Arc<FinishRegistry>,
    scheduler: Arc<dyn Scheduler>,
    provider: Arc<dyn InstanceProvider>,
    manager: Arc<dyn InstanceManager>,
}

impl Master {
    pub fn new(
        cfg: MasterConfig,
        state: Arc<Mutex<State>>,
        scheduler: Arc<dyn Scheduler>,
        provider: Arc<dyn InstanceProvider>,
        manager: Arc<dyn InstanceManager>,
    ) -> Self {
        Self {
            cfg: Arc::new(cfg),
            state,
            finishes: Arc::new(FinishRegistry::default()),
            scheduler,
            provider,
            manager,
        }
    }

    pub fn finishes(&self) -> &FinishRegistry {
        &self.finishes
    }

    //
    // Session management
    //

    /// Create a session holding `resources` and return its generated
    /// name.
    pub fn create_session(&self, resources: serde_json::Value) -> String {
        let mut state = self.state.lock().unwrap();
        let name = format!("session{}", state.next_id());
        state.sessions.insert(
            name.clone(),
            Session {
                name: name.clone(),
                resources,
                cached_workers: Default::default(),
            },
        );
        info!("session {} created", name);
        name
    }

    /// Delete a session. Deleting an unknown name is a no-op.
    pub fn delete_session(&self, name: &str) {
        self.state.lock().unwrap().sessions.remove(name);
    }

    /// Rotate and return the next worker caching `session_name`'s
    /// resources.
    pub fn next_cached_worker(&self, session_name: &str) -> Option<WorkerRecord> {
        self.state.lock().unwrap().next_cached_worker(session_name)
    }

    //
    // Execution orchestration
    //

    /// Run one full execution: fetch, parallel produce, (two-layer)
    /// reduce, retrieve. Resolves with the raw result bytes.
    pub async fn create_execution(&self, options: ExecutionOptions) -> Result<Vec<u8>> {
        let parallel = options.parallel.max(1);
        let (session, mut execution) = {
            let mut state = self.state.lock().unwrap();
            let session = state
                .sessions
                .get(&options.session_name)
                .cloned()
                .ok_or_else(|| Error::NoSuchSession(options.session_name.clone()))?;
            let name = format!("execution{}", state.next_id());
            let execution = Execution {
                name,
                session_name: session.name.clone(),
                parallel,
                started: std::time::Instant::now(),
                tasks: Vec::new(),
            };
            (session, execution)
        };
        info!("execution {} created", execution.name);

        // The first producing task pays the resource staging cost. Its
        // TASK completion may arrive right after the FETCHING one, so
        // both waits are registered before the schedule pass.
        let first = self
            .scheduler
            .create_producing_task(&session, &mut execution, 0);
        let fetching_rx = self.finishes.await_fetching(&first);
        let first_rx = self.finishes.await_task(&first);
        self.scheduler.schedule();
        self.wait_finish(first.clone(), fetching_rx).await?;
        debug!("execution {}: fetching finished", execution.name);

        let mut producing = vec![(first, first_rx)];
        for index in 1..parallel {
            let name = self
                .scheduler
                .create_producing_task(&session, &mut execution, index);
            let rx = self.finishes.await_task(&name);
            producing.push((name, rx));
        }
        self.scheduler.schedule();

        let produced = if producing.len() <= SINGLE_REDUCE_LIMIT {
            let waits = producing
                .into_iter()
                .map(|(name, rx)| self.wait_finish(name, rx));
            future::try_join_all(waits)
                .await?
                .iter()
                .map(FinishInfo::as_result)
                .collect()
        } else {
            self.intermediate_reducing(&session, &mut execution, producing)
                .await?
        };

        let final_name = self
            .scheduler
            .create_reducing_task(&session, &mut execution, produced);
        let final_rx = self.finishes.await_task(&final_name);
        self.scheduler.schedule();
        let reduced = self.wait_finish(final_name, final_rx).await?;

        let image = self
            .receive(reduced.worker_name(), reduced.task_name())
            .await?;
        info!(
            "elapsed time of execution {}: {}ms",
            execution.name,
            execution.started.elapsed().as_millis()
        );
        Ok(image)
    }

    /// Two-layer reduction for wide executions: consume producing
    /// results in arrival order into batches of `floor(sqrt(N))`, spawn
    /// an intermediate reducing task the moment a batch fills (or the
    /// final partial batch completes), and hand the intermediate
    /// outputs to the final reduce. Bounds the fan-in of any single
    /// reduce to roughly sqrt(N).
    async fn intermediate_reducing(
        &self,
        session: &Session,
        execution: &mut Execution,
        producing: Vec<(String, oneshot::Receiver<FinishInfo>)>,
    ) -> Result<Vec<TaskResult>> {
        let total = producing.len();
        let unit = (total as f64).sqrt() as usize;
        trace!(
            "execution {}: two-layer reduction, unit {}",
            execution.name,
            unit
        );

        let mut arrivals: FuturesUnordered<_> = producing
            .into_iter()
            .map(|(name, rx)| self.wait_finish(name, rx))
            .collect();
        let mut reduces = FuturesUnordered::new();
        let mut batch = Vec::new();
        let mut arrived = 0;

        while let Some(finished) = arrivals.next().await {
            arrived += 1;
            batch.push(finished?.as_result());
            if batch.len() == unit || arrived == total {
                let name = self.scheduler.create_reducing_task(
                    session,
                    execution,
                    std::mem::take(&mut batch),
                );
                let rx = self.finishes.await_task(&name);
                self.scheduler.schedule();
                reduces.push(self.wait_finish(name, rx));
            }
        }

        let mut outputs = Vec::new();
        while let Some(finished) = reduces.next().await {
            outputs.push(finished?.as_result());
        }
        Ok(outputs)
    }

    async fn wait_finish(
        &self,
        name: String,
        rx: oneshot::Receiver<FinishInfo>,
    ) -> Result<FinishInfo> {
        let finished = match self.cfg.completion_timeout {
            // Unbounded by default; a lost finish blocks its execution.
            None => rx.await,
            Some(limit) => time::timeout(limit, rx)
                .await
                .map_err(|_| Error::CompletionTimeout(name.clone()))?,
        };
        finished.map_err(|_| Error::CompletionDropped(name))
    }

    //
    // Result retrieval
    //

    /// Fetch the raw result bytes of `task_name` from the worker that
    /// produced it.
    pub async fn receive(&self, worker_name: &str, task_name: &str) -> Result<Vec<u8>> {
        let worker = self
            .state
            .lock()
            .unwrap()
            .workers
            .get(worker_name)
            .cloned()
            .ok_or_else(|| Error::NoSuchWorker(worker_name.to_owned()))?;
        let url = format!(
            "http://{}:{}/results/{}",
            worker.host, worker.resource_port, task_name
        );
        let response = reqwest::get(&url).await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    //
    // Inbound RPC dispatch
    //

    /// Route a completion: placement bookkeeping first, then the
    /// affinity cache for FETCHING, then the matching pending future.
    pub fn dispatch_finish(&self, info: &FinishInfo) {
        self.scheduler.dispatch_finish(info);
        if let FinishInfo::Fetching {
            worker_name,
            cached_sessions,
            ..
        } = info
        {
            let mut state = self.state.lock().unwrap();
            for session in cached_sessions {
                // Sessions deleted while the fetch was in flight are
                // skipped.
                state.record_cached_worker(session, worker_name);
            }
        }
        self.finishes.resolve(info);
    }

    /// Append relayed worker log lines to the master's log stream.
    pub fn dispatch_pong(&self, info: &PongInfo) {
        for LogRecord { from, message } in &info.logs {
            info!("[{}] {}: {}", info.worker_name, from, message);
        }
    }

    //
    // Ping / pong management
    //

    /// Fan one `ping` out to every known worker. Fire-and-forget: a
    /// failed ping is simply never answered with a pong. Returns the
    /// number of dispatches issued.
    pub fn send_pings(&self) -> usize {
        let (master, workers) = {
            let state = self.state.lock().unwrap();
            (
                state.master.clone(),
                state.workers.values().cloned().collect::<Vec<_>>(),
            )
        };
        if !workers.is_empty() {
            info!("sending pings to {} workers...", workers.len());
        }
        let issued = workers.len();
        for worker in workers {
            let info = PingInfo {
                worker_name: worker.name.clone(),
                master: master.clone(),
            };
            let timeout = self.cfg.rpc_timeout;
            tokio::spawn(async move {
                if let Err(e) = client::ping(&worker, info, timeout).await {
                    debug!("ping to {} failed: {}", worker.name, e);
                }
            });
        }
        issued
    }

    //
    // Fleet reconciliation
    //

    /// One reconciliation step: refresh the roster snapshot wholesale,
    /// notify the scheduler, apply fleet-sizing policy.
    pub async fn reconcile(&self) -> Result<()> {
        let instances = self.provider.get_instances().await?;
        {
            let mut state = self.state.lock().unwrap();
            state.master = Some(instances.master);
            state.workers = instances.workers;
        }
        self.scheduler.update_workers();
        self.manager.manage(self.cfg.spawn_interval).await?;
        Ok(())
    }

    //
    // Server loop
    //

    /// Start the periodic loops and serve the master RPC endpoint.
    /// Never returns under normal operation.
    pub async fn launch(&self) -> Result<()> {
        let master = self.clone();
        tokio::spawn(async move {
            loop {
                // An error here is an uncaught asynchronous failure of
                // the control loop; fail fast over running with a
                // corrupted fleet view.
                if let Err(e) = master.reconcile().await {
                    error!("fleet reconciliation failed: {}", e);
                    process::exit(1);
                }
                time::sleep(master.cfg.manage_interval).await;
            }
        });

        let master = self.clone();
        tokio::spawn(async move {
            loop {
                master.send_pings();
                time::sleep(master.cfg.ping_interval).await;
            }
        });

        let server_addr: SocketAddr =
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.cfg.port).into();
        info!(
            "waiting on port {} for JSON RPC requests...",
            self.cfg.port
        );
        let mut listener = tarpc::serde_transport::tcp::listen(&server_addr, Json::default).await?;
        listener.config_mut().max_frame_length(4294967296);
        listener
            // Ignore accept errors.
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            // Limit channels to 10 per IP.
            .max_channels_per_key(10, |t| t.transport().peer_addr().unwrap().ip())
            .map(|channel| {
                channel
                    .execute(self.clone().serve())
                    .for_each(|response| async move {
                        tokio::spawn(response);
                    })
            })
            .buffer_unordered(10)
            .for_each(|_| async {})
            .await;
        Ok(())
    }
}

impl MasterService for Master {
    async fn pong(self, _: context::Context, info: PongInfo) {
        self.dispatch_pong(&info);
    }

    async fn finish(self, _: context::Context, info: FinishInfo) {
        if let FinishInfo::Task { ref task, .. } = info {
            trace!("finish received for {}", task.name);
        }
        self.dispatch_finish(&info);
    }
}
