//! Skyhook turns queued HPC jobs into running cloud worker nodes and keeps
//! the scheduler's view of those nodes synchronized with the cloud provider.
//!
//! The crate is organized around long-running component loops in the style of
//! background services: each component owns one event loop and is driven
//! through an RPC handle. External systems (the durable task queue, the cloud
//! inventory API, the batch scheduler CLI, the metrics sink) are collaborator
//! traits implemented by the embedding application.

pub mod common;
pub mod config;
pub mod events;
pub mod inventory;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod scheduler;
pub mod taskqueue;

use fxhash::FxBuildHasher;

pub type Map<K, V> = hashbrown::HashMap<K, V, FxBuildHasher>;
pub type Set<T> = hashbrown::HashSet<T, FxBuildHasher>;

pub type Error = crate::common::error::SkyhookError;
pub type Result<T> = std::result::Result<T, Error>;
