//! Local instance provider and static fleet-sizing policy.
//!
//! The local provider keeps an in-process roster for development and
//! test runs; worker processes themselves are launched out of band at
//! the advertised ports. Cloud providers implement the same
//! [`InstanceProvider`] contract elsewhere.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use tokio::time;

use farm_rpc::WorkerRecord;

use crate::traits::{InstanceManager, InstanceProvider, Instances};

#[derive(Debug)]
struct LocalFleet {
    workers: HashMap<String, WorkerRecord>,
    spawned: u16,
}

pub struct LocalProvider {
    master: WorkerRecord,
    base_port: u16,
    fleet: Mutex<LocalFleet>,
}

impl LocalProvider {
    /// `seeds` are workers already running; further spawns allocate
    /// port pairs upward from `base_port`.
    pub fn new(master: WorkerRecord, base_port: u16, seeds: Vec<WorkerRecord>) -> Self {
        let workers = seeds.into_iter().map(|w| (w.name.clone(), w)).collect();
        Self {
            master,
            base_port,
            fleet: Mutex::new(LocalFleet {
                workers,
                spawned: 0,
            }),
        }
    }
}

#[async_trait]
impl InstanceProvider for LocalProvider {
    async fn get_instances(&self) -> Result<Instances> {
        let fleet = self.fleet.lock().unwrap();
        Ok(Instances {
            master: self.master.clone(),
            workers: fleet.workers.clone(),
        })
    }

    async fn spawn_instance(&self) -> Result<()> {
        let mut fleet = self.fleet.lock().unwrap();
        let n = fleet.spawned;
        // Widened so a high base port cannot wrap the pair allocation.
        let port = u32::from(self.base_port) + 2 * u32::from(n);
        if port + 1 > u32::from(u16::MAX) {
            anyhow::bail!("local worker ports exhausted above {}", self.base_port);
        }
        fleet.spawned += 1;
        let worker = WorkerRecord {
            name: format!("local-worker-{}", n),
            host: "127.0.0.1".into(),
            port: port as u16,
            resource_port: port as u16 + 1,
        };
        info!(
            "local worker {} registered at ports {}/{}",
            worker.name, worker.port, worker.resource_port
        );
        fleet.workers.insert(worker.name.clone(), worker);
        Ok(())
    }

    async fn destroy_instance(&self, name: &str) -> Result<()> {
        self.fleet.lock().unwrap().workers.remove(name);
        Ok(())
    }
}

/// Keeps the fleet at a fixed target size, spawning one instance at a
/// time with `spawn_interval` between creations.
pub struct StaticManager {
    provider: Arc<dyn InstanceProvider>,
    size: usize,
}

impl StaticManager {
    pub fn new(provider: Arc<dyn InstanceProvider>, size: usize) -> Self {
        Self { provider, size }
    }
}

#[async_trait]
impl InstanceManager for StaticManager {
    async fn manage(&self, spawn_interval: Duration) -> Result<()> {
        let current = self.provider.get_instances().await?.workers.len();
        for _ in current..self.size {
            self.provider.spawn_instance().await?;
            if !spawn_interval.is_zero() {
                time::sleep(spawn_interval).await;
            }
        }
        Ok(())
    }
}
