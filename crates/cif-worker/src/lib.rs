//! CIF Worker Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Consumes observables from the work queue, enriches them and persists and
//! republishes the results.
//!
//! # Components
//!
//! - **Backends**: the storage port, its process-wide lock and a name registry
//! - **Pipeline**: ordered meta-fetchers and plugins
//! - **Broker**: the queue port with AMQP and in-memory transports
//! - **Consumer**: per-thread delivery loop and message processing
//! - **Supervisor**: keeps the consumer threads of one worker process alive
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cif_worker::{AmqpBroker, BackendRegistry, EnrichmentRegistry, WorkerConfig, WorkerProcess};
//! use tokio_util::sync::CancellationToken;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = WorkerConfig::load()?;
//!     let broker = Arc::new(AmqpBroker::new(&config.mq_uri));
//!     let mut worker = WorkerProcess::start(
//!         &config,
//!         &BackendRegistry::builtin(),
//!         &EnrichmentRegistry::builtin(),
//!         broker,
//!     )?;
//!     worker.run(&CancellationToken::new());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod broker;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod pipeline;
pub mod supervisor;

pub use backend::{Backend, BackendRegistry, CreateAtomicity, SharedBackend};
pub use broker::{AmqpBroker, Broker, BrokerChannel, Delivery, MemoryBroker, Topology};
pub use config::WorkerConfig;
pub use consumer::{Consumer, ConsumerThread, ProcessOutcome};
pub use pipeline::{EnrichmentRegistry, Enricher, Pipeline, Plugin};
pub use supervisor::{SupervisorState, WorkerProcess};
