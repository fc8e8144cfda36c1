//! Control plane of a distributed rendering farm.
//!
//! A single master process coordinates a pool of remote workers to run
//! a rendering job as a two-layer map-reduce over image partitions and
//! returns the aggregated result to the caller. The master owns the
//! session/execution/task bookkeeping, the completion-future registry,
//! the per-session worker-affinity cache, and the periodic loops that
//! ping workers and reconcile the fleet. Placement itself is delegated
//! to a [`traits::Scheduler`].

pub mod config;
pub mod error;
pub mod fleet;
pub mod master;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod traits;

pub use crate::config::MasterConfig;
pub use crate::error::{Error, Result};
pub use crate::master::{ExecutionOptions, Master};
