use std::time::Duration;

use structopt::StructOpt;

use farm_master::config::{self, parse_worker, Settings};
use farm_rpc::WorkerRecord;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"))]
struct Opt {
    /// Worker instance type (local)
    #[structopt(long, default_value = "local")]
    instance_type: String,

    /// Instance manager type (static)
    #[structopt(long, default_value = "static")]
    instance_manager_type: String,

    /// Scheduler type (queue)
    #[structopt(long, default_value = "queue")]
    scheduler_type: String,

    /// Port of the JSON RPC server
    #[structopt(short, long, default_value = "5000")]
    port: u16,

    /// Port of the REST facade
    #[structopt(long, default_value = "3000")]
    rest_port: u16,

    /// Target number of workers in the fleet
    #[structopt(long, default_value = "8")]
    fleet_size: usize,

    /// Shorten fleet intervals for accelerated test runs
    #[structopt(long)]
    test: bool,

    /// Optional deadline in seconds for completion waits; unbounded
    /// when absent
    #[structopt(long)]
    completion_timeout: Option<u64>,

    /// Already running worker, as host:port:resource_port (repeatable)
    #[structopt(long = "worker", parse(try_from_str = parse_worker))]
    workers: Vec<WorkerRecord>,

    /// First port assigned to locally spawned workers
    #[structopt(long, default_value = "5100")]
    base_worker_port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let master = config::build_master(Settings {
        instance_type: opt.instance_type,
        instance_manager_type: opt.instance_manager_type,
        scheduler_type: opt.scheduler_type,
        port: opt.port,
        rest_port: opt.rest_port,
        fleet_size: opt.fleet_size,
        test: opt.test,
        completion_timeout: opt.completion_timeout.map(Duration::from_secs),
        workers: opt.workers,
        base_worker_port: opt.base_worker_port,
    })?;
    master.launch().await?;
    Ok(())
}
