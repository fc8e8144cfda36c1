//! End-to-end orchestration tests against scripted collaborators and a
//! loopback RPC round trip against the real master endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, prelude::*};
use serde_json::json;
use tarpc::{
    client, context,
    server::{self, Channel},
    tokio_serde::formats::Json,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time;

use farm_master::config::MasterConfig;
use farm_master::error::Error;
use farm_master::master::{ExecutionOptions, Master};
use farm_master::session::{Execution, Session, State};
use farm_master::traits::{InstanceManager, InstanceProvider, Instances, Scheduler};
use farm_rpc::{
    FinishInfo, MasterServiceClient, PingInfo, PongInfo, TaskKind, TaskResult, TaskSpec,
    WorkerRecord, WorkerService,
};

const WORKER: &str = "w0";

fn init_logs() {
    let _ = pretty_env_logger::try_init();
}

fn worker_record(name: &str, port: u16, resource_port: u16) -> WorkerRecord {
    WorkerRecord {
        name: name.into(),
        host: "127.0.0.1".into(),
        port,
        resource_port,
    }
}

//
// Scripted collaborators
//

struct StaticProvider {
    instances: Instances,
}

#[async_trait]
impl InstanceProvider for StaticProvider {
    async fn get_instances(&self) -> anyhow::Result<Instances> {
        Ok(self.instances.clone())
    }

    async fn spawn_instance(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy_instance(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

struct NoopManager;

#[async_trait]
impl InstanceManager for NoopManager {
    async fn manage(&self, _spawn_interval: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Calls {
    producing: Vec<TaskSpec>,
    reducing: Vec<TaskSpec>,
    schedule_passes: usize,
    finishes: usize,
    unsent: Vec<TaskSpec>,
}

/// Plays the worker side: every scheduled task finishes successfully on
/// `WORKER`, the first producing task reporting its FETCHING completion
/// first. `hold_tasks` suppresses the TASK completions entirely and
/// `task_delay` postpones them, for exercising the wait paths.
#[derive(Default)]
struct ScriptedScheduler {
    master: Mutex<Option<Master>>,
    calls: Mutex<Calls>,
    hold_tasks: bool,
    task_delay: Duration,
}

impl ScriptedScheduler {
    fn attach(&self, master: &Master) {
        *self.master.lock().unwrap() = Some(master.clone());
    }

    fn finish_task(
        master: Master,
        task: TaskSpec,
        fetch_first: bool,
        hold: bool,
        delay: Duration,
    ) {
        tokio::spawn(async move {
            if fetch_first {
                master.dispatch_finish(&FinishInfo::Fetching {
                    task_name: task.name.clone(),
                    worker_name: WORKER.into(),
                    cached_sessions: vec![task.session_name.clone()],
                });
            }
            if hold {
                return;
            }
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            master.dispatch_finish(&FinishInfo::Task {
                task,
                worker_name: WORKER.into(),
            });
        });
    }
}

impl Scheduler for ScriptedScheduler {
    fn create_producing_task(
        &self,
        session: &Session,
        execution: &mut Execution,
        index: u32,
    ) -> String {
        let mut calls = self.calls.lock().unwrap();
        let name = format!("{}-p{}", execution.name, index);
        let task = TaskSpec {
            name: name.clone(),
            kind: TaskKind::Producing,
            session_name: session.name.clone(),
            execution_name: execution.name.clone(),
            index,
            inputs: Vec::new(),
            resources: session.resources.clone(),
        };
        execution.tasks.push(name.clone());
        calls.producing.push(task.clone());
        calls.unsent.push(task);
        name
    }

    fn create_reducing_task(
        &self,
        session: &Session,
        execution: &mut Execution,
        inputs: Vec<TaskResult>,
    ) -> String {
        let mut calls = self.calls.lock().unwrap();
        let name = format!("{}-r{}", execution.name, calls.reducing.len());
        let task = TaskSpec {
            name: name.clone(),
            kind: TaskKind::Reducing,
            session_name: session.name.clone(),
            execution_name: execution.name.clone(),
            index: 0,
            inputs,
            resources: session.resources.clone(),
        };
        execution.tasks.push(name.clone());
        calls.reducing.push(task.clone());
        calls.unsent.push(task);
        name
    }

    fn schedule(&self) {
        let master = self.master.lock().unwrap().clone().unwrap();
        let unsent = std::mem::take(&mut self.calls.lock().unwrap().unsent);
        for task in unsent {
            let fetch_first = task.kind == TaskKind::Producing && task.index == 0;
            Self::finish_task(
                master.clone(),
                task,
                fetch_first,
                self.hold_tasks,
                self.task_delay,
            );
        }
        self.calls.lock().unwrap().schedule_passes += 1;
    }

    fn update_workers(&self) {}

    fn dispatch_finish(&self, _info: &FinishInfo) {
        self.calls.lock().unwrap().finishes += 1;
    }
}

fn scripted_master_with(
    scheduler: Arc<ScriptedScheduler>,
    cfg: MasterConfig,
    resource_port: u16,
) -> Master {
    let mut workers = HashMap::new();
    workers.insert(WORKER.to_string(), worker_record(WORKER, 1, resource_port));
    let provider = Arc::new(StaticProvider {
        instances: Instances {
            master: worker_record("master", 5000, 3000),
            workers,
        },
    });
    let master = Master::new(
        cfg,
        Arc::new(Mutex::new(State::default())),
        scheduler.clone(),
        provider,
        Arc::new(NoopManager),
    );
    scheduler.attach(&master);
    master
}

fn scripted_master(resource_port: u16) -> (Master, Arc<ScriptedScheduler>) {
    let scheduler = Arc::new(ScriptedScheduler::default());
    let master = scripted_master_with(scheduler.clone(), MasterConfig::new(true), resource_port);
    (master, scheduler)
}

/// Minimal canned results endpoint: answers every request with `status`
/// and `body`.
async fn serve_results(listener: TcpListener, status: &'static str, body: &'static [u8]) {
    loop {
        let (mut socket, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await;
        let head = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status,
            body.len()
        );
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(body).await;
    }
}

async fn start_results_server(status: &'static str, body: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_results(listener, status, body));
    port
}

//
// Orchestration scenarios
//

#[tokio::test]
async fn execution_against_missing_session_fails_fast() {
    init_logs();
    let (master, scheduler) = scripted_master(1);
    master.reconcile().await.unwrap();

    let result = master
        .create_execution(ExecutionOptions {
            session_name: "nope".into(),
            parallel: 2,
        })
        .await;
    assert!(matches!(result, Err(Error::NoSuchSession(_))));

    let calls = scheduler.calls.lock().unwrap();
    assert!(calls.producing.is_empty());
    assert!(calls.reducing.is_empty());
    assert_eq!(calls.schedule_passes, 0);
    assert_eq!(master.finishes().pending_counts(), (0, 0));
}

#[tokio::test]
async fn single_producing_execution_returns_result_bytes() {
    init_logs();
    let port = start_results_server("200 OK", b"imagedata").await;
    let (master, scheduler) = scripted_master(port);
    master.reconcile().await.unwrap();

    let session = master.create_session(json!({ "resources": [] }));
    let image = master
        .create_execution(ExecutionOptions {
            session_name: session.clone(),
            parallel: 1,
        })
        .await
        .unwrap();
    assert_eq!(image, b"imagedata");

    let calls = scheduler.calls.lock().unwrap();
    assert_eq!(calls.producing.len(), 1);
    assert_eq!(calls.reducing.len(), 1);
    // Fetching, producing and reducing completions all passed through
    // the scheduler first.
    assert_eq!(calls.finishes, 3);
    assert_eq!(master.finishes().pending_counts(), (0, 0));

    // The fetch recorded the worker into the session's affinity list.
    assert_eq!(
        master.next_cached_worker(&session).map(|w| w.name),
        Some(WORKER.to_string())
    );
}

#[tokio::test]
async fn wide_execution_uses_two_layer_reduction() {
    init_logs();
    let port = start_results_server("200 OK", b"wide").await;
    let (master, scheduler) = scripted_master(port);
    master.reconcile().await.unwrap();

    let session = master.create_session(json!({ "resources": [] }));
    let image = master
        .create_execution(ExecutionOptions {
            session_name: session,
            parallel: 6,
        })
        .await
        .unwrap();
    assert_eq!(image, b"wide");

    let calls = scheduler.calls.lock().unwrap();
    assert_eq!(calls.producing.len(), 6);
    // unit = floor(sqrt(6)) = 2, so ceil(6/2) = 3 intermediates plus
    // one final reduce.
    assert_eq!(calls.reducing.len(), 4);

    let producing_names: Vec<&str> = calls.producing.iter().map(|t| t.name.as_str()).collect();
    let intermediates = &calls.reducing[..3];
    let mut covered = 0;
    for reduce in intermediates {
        assert!(reduce.inputs.len() <= 2);
        covered += reduce.inputs.len();
        for input in &reduce.inputs {
            assert!(producing_names.contains(&input.task_name.as_str()));
        }
    }
    assert_eq!(covered, 6);

    let final_reduce = &calls.reducing[3];
    assert_eq!(final_reduce.inputs.len(), 3);
    for input in &final_reduce.inputs {
        assert!(intermediates.iter().any(|r| r.name == input.task_name));
    }
}

#[tokio::test]
async fn deleting_a_missing_session_is_idempotent() {
    init_logs();
    let (master, _scheduler) = scripted_master(1);
    master.delete_session("never-created");

    let session = master.create_session(json!({}));
    master.delete_session(&session);
    master.delete_session(&session);

    let result = master
        .create_execution(ExecutionOptions {
            session_name: session,
            parallel: 1,
        })
        .await;
    assert!(matches!(result, Err(Error::NoSuchSession(_))));
}

#[tokio::test]
async fn failing_results_endpoint_fails_the_execution() {
    init_logs();
    let port = start_results_server("500 Internal Server Error", b"").await;
    let (master, _scheduler) = scripted_master(port);
    master.reconcile().await.unwrap();

    let session = master.create_session(json!({}));
    let result = master
        .create_execution(ExecutionOptions {
            session_name: session,
            parallel: 1,
        })
        .await;
    assert!(matches!(result, Err(Error::Receive(_))));
    // Every completion future resolved before the retrieval failed.
    assert_eq!(master.finishes().pending_counts(), (0, 0));
}

#[tokio::test]
async fn result_fetch_from_unknown_worker_fails() {
    init_logs();
    // No reconciliation: the roster snapshot stays empty, so the worker
    // that reported the final reduce cannot be resolved.
    let (master, _scheduler) = scripted_master(1);

    let session = master.create_session(json!({}));
    let result = master
        .create_execution(ExecutionOptions {
            session_name: session,
            parallel: 1,
        })
        .await;
    match result {
        Err(Error::NoSuchWorker(name)) => assert_eq!(name, WORKER),
        other => panic!("expected a missing-worker error, got {:?}", other),
    }
    assert_eq!(master.finishes().pending_counts(), (0, 0));
}

//
// Completion timeout
//

#[tokio::test]
async fn enabled_completion_timeout_names_the_stuck_task() {
    init_logs();
    let scheduler = Arc::new(ScriptedScheduler {
        hold_tasks: true,
        ..Default::default()
    });
    let mut cfg = MasterConfig::new(true);
    cfg.completion_timeout = Some(Duration::from_millis(50));
    let master = scripted_master_with(scheduler.clone(), cfg, 1);
    master.reconcile().await.unwrap();

    let session = master.create_session(json!({}));
    let result = master
        .create_execution(ExecutionOptions {
            session_name: session,
            parallel: 1,
        })
        .await;

    // The fetch completed but the producing task never did.
    let stuck = scheduler.calls.lock().unwrap().producing[0].name.clone();
    match result {
        Err(Error::CompletionTimeout(name)) => assert_eq!(name, stuck),
        other => panic!("expected a completion timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn unbounded_wait_survives_a_slow_finish() {
    init_logs();
    let port = start_results_server("200 OK", b"late").await;
    let scheduler = Arc::new(ScriptedScheduler {
        task_delay: Duration::from_millis(150),
        ..Default::default()
    });
    // completion_timeout stays None: the waits must not be bounded by
    // any built-in deadline.
    let master = scripted_master_with(scheduler.clone(), MasterConfig::new(true), port);
    master.reconcile().await.unwrap();

    let session = master.create_session(json!({}));
    let image = master
        .create_execution(ExecutionOptions {
            session_name: session,
            parallel: 1,
        })
        .await
        .unwrap();
    assert_eq!(image, b"late");
}

//
// Health fan-out against loopback workers
//

#[derive(Clone)]
struct FakeWorker {
    pings: Arc<AtomicUsize>,
}

impl WorkerService for FakeWorker {
    async fn ping(self, _: context::Context, _info: PingInfo) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }

    async fn run(self, _: context::Context, _task: TaskSpec) {}
}

async fn start_fake_worker(pings: Arc<AtomicUsize>) -> u16 {
    let mut listener = tarpc::serde_transport::tcp::listen("127.0.0.1:0", Json::default)
        .await
        .unwrap();
    let port = listener.local_addr().port();
    let worker = FakeWorker { pings };
    tokio::spawn(async move {
        listener
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .map(|channel| {
                channel
                    .execute(worker.clone().serve())
                    .for_each(|response| async move {
                        tokio::spawn(response);
                    })
            })
            .buffer_unordered(10)
            .for_each(|_| async {})
            .await;
    });
    port
}

#[tokio::test]
async fn health_tick_pings_every_roster_worker() {
    init_logs();
    let pings = Arc::new(AtomicUsize::new(0));
    let mut workers = HashMap::new();
    for i in 0..3 {
        let port = start_fake_worker(pings.clone()).await;
        let name = format!("w{}", i);
        workers.insert(name.clone(), worker_record(&name, port, 1));
    }

    let scheduler = Arc::new(ScriptedScheduler::default());
    let provider = Arc::new(StaticProvider {
        instances: Instances {
            master: worker_record("master", 5000, 3000),
            workers,
        },
    });
    let master = Master::new(
        MasterConfig::new(true),
        Arc::new(Mutex::new(State::default())),
        scheduler.clone(),
        provider,
        Arc::new(NoopManager),
    );
    scheduler.attach(&master);
    master.reconcile().await.unwrap();

    assert_eq!(master.send_pings(), 3);
    for _ in 0..100 {
        if pings.load(Ordering::SeqCst) == 3 {
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(pings.load(Ordering::SeqCst), 3);
}

//
// Loopback round trip through the real master endpoint
//

#[tokio::test]
async fn finish_and_pong_round_trip_over_rpc() {
    init_logs();
    let port = 36115;
    let scheduler = Arc::new(ScriptedScheduler::default());
    let provider = Arc::new(StaticProvider {
        instances: Instances {
            master: worker_record("master", port, 3000),
            workers: HashMap::new(),
        },
    });
    let mut cfg = MasterConfig::new(true);
    cfg.port = port;
    let master = Master::new(
        cfg,
        Arc::new(Mutex::new(State::default())),
        scheduler.clone(),
        provider,
        Arc::new(NoopManager),
    );
    scheduler.attach(&master);
    {
        let launching = master.clone();
        tokio::spawn(async move {
            let _ = launching.launch().await;
        });
    }
    let addr = format!("127.0.0.1:{}", port);
    let client = connect_with_retry(&addr).await;

    let rx = master.finishes().await_task("task-loopback");
    client
        .finish(
            context::current(),
            FinishInfo::Task {
                task: TaskSpec {
                    name: "task-loopback".into(),
                    kind: TaskKind::Producing,
                    session_name: "s".into(),
                    execution_name: "e".into(),
                    index: 0,
                    inputs: Vec::new(),
                    resources: serde_json::Value::Null,
                },
                worker_name: WORKER.into(),
            },
        )
        .await
        .unwrap();
    let info = rx.await.unwrap();
    assert_eq!(info.task_name(), "task-loopback");
    assert_eq!(scheduler.calls.lock().unwrap().finishes, 1);

    client
        .pong(
            context::current(),
            PongInfo {
                worker_name: WORKER.into(),
                logs: vec![farm_rpc::LogRecord {
                    from: "renderer".into(),
                    message: "frame done".into(),
                }],
            },
        )
        .await
        .unwrap();
}

async fn connect_with_retry(addr: &str) -> MasterServiceClient {
    for _ in 0..100 {
        if let Ok(transport) = tarpc::serde_transport::tcp::connect(addr, Json::default).await {
            return MasterServiceClient::new(client::Config::default(), transport).spawn();
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    panic!("master endpoint never came up at {}", addr);
}
