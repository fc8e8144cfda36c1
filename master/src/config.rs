//! Configuration surface and component assembly.
//!
//! The three collaborator kinds are selected by name; an unknown name
//! is a configuration error and fatal at startup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use farm_rpc::WorkerRecord;

use crate::error::{Error, Result};
use crate::fleet::{LocalProvider, StaticManager};
use crate::master::Master;
use crate::scheduler::QueueScheduler;
use crate::session::State;
use crate::traits::{InstanceManager, InstanceProvider, Scheduler};

const DEFAULT_SPAWN_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MANAGE_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval and endpoint configuration of a running master.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// JSON-RPC listen port.
    pub port: u16,
    /// Port of the REST facade collaborator.
    pub rest_port: u16,
    pub spawn_interval: Duration,
    pub manage_interval: Duration,
    pub ping_interval: Duration,
    /// Deadline for each outbound ping/run dispatch. Zero retries.
    pub rpc_timeout: Duration,
    /// Optional deadline on completion waits. Off by default: a task
    /// that never finishes blocks its execution indefinitely unless an
    /// operator opts into a deadline.
    pub completion_timeout: Option<Duration>,
}

impl MasterConfig {
    /// Defaults; `test` shortens the fleet intervals for accelerated
    /// test runs.
    pub fn new(test: bool) -> Self {
        Self {
            port: 5000,
            rest_port: 3000,
            spawn_interval: if test {
                Duration::ZERO
            } else {
                DEFAULT_SPAWN_INTERVAL
            },
            manage_interval: if test {
                Duration::from_secs(5)
            } else {
                DEFAULT_MANAGE_INTERVAL
            },
            ping_interval: DEFAULT_PING_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            completion_timeout: None,
        }
    }
}

/// Startup settings, typically parsed from the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    pub instance_type: String,
    pub instance_manager_type: String,
    pub scheduler_type: String,
    pub port: u16,
    pub rest_port: u16,
    pub fleet_size: usize,
    pub test: bool,
    pub completion_timeout: Option<Duration>,
    /// Seed roster for the local provider.
    pub workers: Vec<WorkerRecord>,
    /// First port assigned to locally spawned workers.
    pub base_worker_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instance_type: "local".into(),
            instance_manager_type: "static".into(),
            scheduler_type: "queue".into(),
            port: 5000,
            rest_port: 3000,
            fleet_size: 8,
            test: false,
            completion_timeout: None,
            workers: Vec::new(),
            base_worker_port: 5100,
        }
    }
}

/// `host:port:resource_port`, e.g. `127.0.0.1:5100:5101`.
pub fn parse_worker(s: &str) -> std::result::Result<WorkerRecord, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(format!("expected host:port:resource_port, got {:?}", s));
    }
    let port = parts[1].parse::<u16>().map_err(|e| e.to_string())?;
    let resource_port = parts[2].parse::<u16>().map_err(|e| e.to_string())?;
    Ok(WorkerRecord {
        name: format!("worker-{}", port),
        host: parts[0].to_owned(),
        port,
        resource_port,
    })
}

/// Resolve the configured component types and assemble a master.
pub fn build_master(settings: Settings) -> Result<Master> {
    let mut cfg = MasterConfig::new(settings.test);
    cfg.port = settings.port;
    cfg.rest_port = settings.rest_port;
    cfg.completion_timeout = settings.completion_timeout;

    let state = Arc::new(Mutex::new(State::default()));

    let master_record = WorkerRecord {
        name: "master".into(),
        host: "127.0.0.1".into(),
        port: cfg.port,
        resource_port: cfg.rest_port,
    };

    let provider: Arc<dyn InstanceProvider> = match settings.instance_type.as_str() {
        "local" => Arc::new(LocalProvider::new(
            master_record,
            settings.base_worker_port,
            settings.workers,
        )),
        // Cloud provisioning is configured here but lives outside this
        // build.
        other => {
            return Err(Error::UnknownComponent {
                kind: "instance",
                value: other.to_owned(),
            })
        }
    };

    let manager: Arc<dyn InstanceManager> = match settings.instance_manager_type.as_str() {
        "static" => Arc::new(StaticManager::new(provider.clone(), settings.fleet_size)),
        other => {
            return Err(Error::UnknownComponent {
                kind: "instance manager",
                value: other.to_owned(),
            })
        }
    };

    let scheduler: Arc<dyn Scheduler> = match settings.scheduler_type.as_str() {
        "queue" => Arc::new(QueueScheduler::new(state.clone(), cfg.rpc_timeout)),
        other => {
            return Err(Error::UnknownComponent {
                kind: "scheduler",
                value: other.to_owned(),
            })
        }
    };

    Ok(Master::new(cfg, state, scheduler, provider, manager))
}
