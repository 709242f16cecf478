//! Worker configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::BackendRegistry;
use crate::broker::{Topology, DEFAULT_OBSERVABLE_EXCHANGE, DEFAULT_WORK_QUEUE};
use crate::pipeline::EnrichmentRegistry;

// ============================================================================
// Worker Configuration Constants
// ============================================================================

/// Default number of consumer threads per worker process.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Default seconds between two supervisor reconcile ticks.
pub const DEFAULT_SUPERVISE_INTERVAL_SECS: u64 = 5;

/// Default storage backend.
pub const DEFAULT_STORAGE: &str = "memory";

/// Default storage URI for the default backend.
pub const DEFAULT_STORAGE_URI: &str = "memory://";

/// Default broker URI for local development.
pub const DEFAULT_MQ_URI: &str = "amqp://127.0.0.1:5672/%2f";

/// Worker process configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name, used in thread names and consumer tags
    pub name: String,
    pub threads: usize,
    pub supervise_interval_secs: u64,
    pub storage: String,
    pub storage_uri: String,
    pub mq_uri: String,
    pub work_queue: String,
    pub exchange: String,
    /// Meta-fetchers, in the order they run
    pub meta: Vec<String>,
    /// Plugins, in the order they run
    pub plugins: Vec<String>,
}

impl WorkerConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = WorkerConfig {
            name: std::env::var("CIF_WORKER_NAME").unwrap_or(defaults.name),
            threads: parse_var("CIF_WORKER_THREADS")?.unwrap_or(DEFAULT_WORKER_THREADS),
            supervise_interval_secs: parse_var("CIF_SUPERVISE_INTERVAL_SECS")?
                .unwrap_or(DEFAULT_SUPERVISE_INTERVAL_SECS),
            storage: std::env::var("CIF_STORAGE").unwrap_or(defaults.storage),
            storage_uri: std::env::var("CIF_STORAGE_URI").unwrap_or(defaults.storage_uri),
            mq_uri: std::env::var("CIF_MQ_URI").unwrap_or(defaults.mq_uri),
            work_queue: std::env::var("CIF_MQ_WORK_QUEUE").unwrap_or(defaults.work_queue),
            exchange: std::env::var("CIF_MQ_OBSERVABLE_EXCHANGE").unwrap_or(defaults.exchange),
            meta: std::env::var("CIF_WORKER_META")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.meta),
            plugins: std::env::var("CIF_WORKER_PLUGINS")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.plugins),
        };

        Ok(config)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.supervise_interval_secs)
    }

    pub fn topology(&self) -> Topology {
        Topology {
            work_queue: self.work_queue.clone(),
            exchange: self.exchange.clone(),
        }
    }

    /// Validate configuration against the registries it names entries from
    pub fn validate(
        &self,
        backends: &BackendRegistry,
        enrichment: &EnrichmentRegistry,
    ) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Worker name cannot be empty");
        }

        if self.threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        if self.supervise_interval_secs == 0 {
            anyhow::bail!("Supervise interval must be greater than 0");
        }

        if !backends.contains(&self.storage) {
            anyhow::bail!(
                "Unknown storage backend '{}' (available: {})",
                self.storage,
                backends.names().collect::<Vec<_>>().join(", ")
            );
        }

        if self.mq_uri.is_empty() {
            anyhow::bail!("Broker URI cannot be empty");
        }

        if self.work_queue.is_empty() || self.exchange.is_empty() {
            anyhow::bail!("Work queue and observable exchange names cannot be empty");
        }

        for name in &self.meta {
            if !enrichment.has_enricher(name) {
                anyhow::bail!("Unknown meta-fetcher '{}'", name);
            }
        }

        for name in &self.plugins {
            if !enrichment.has_plugin(name) {
                anyhow::bail!("Unknown plugin '{}'", name);
            }
        }

        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            threads: DEFAULT_WORKER_THREADS,
            supervise_interval_secs: DEFAULT_SUPERVISE_INTERVAL_SECS,
            storage: DEFAULT_STORAGE.to_string(),
            storage_uri: DEFAULT_STORAGE_URI.to_string(),
            mq_uri: DEFAULT_MQ_URI.to_string(),
            work_queue: DEFAULT_WORK_QUEUE.to_string(),
            exchange: DEFAULT_OBSERVABLE_EXCHANGE.to_string(),
            meta: Vec::new(),
            plugins: Vec::new(),
        }
    }
}

fn default_worker_name() -> String {
    format!("worker{}", std::process::id())
}

fn parse_var<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        Err(_) => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
