//! Worker process supervisor
//!
//! Keeps a fixed number of consumer threads alive around one shared backend
//! connection. Each [`WorkerProcess::reconcile`] tick refills empty slots and
//! replaces threads that exited or panicked; [`WorkerProcess::run`] ticks
//! until shutdown and then drains.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cif_common::Result;

use crate::backend::{BackendRegistry, SharedBackend};
use crate::broker::Broker;
use crate::config::WorkerConfig;
use crate::consumer::{Consumer, ConsumerThread};
use crate::pipeline::{EnrichmentRegistry, Pipeline};

/// Granularity of the interruptible sleep between ticks
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

pub struct WorkerProcess {
    name: String,
    interval: Duration,
    consumer: Arc<Consumer>,
    slots: Vec<Option<ConsumerThread>>,
    stop: CancellationToken,
    state: SupervisorState,
    restarts: u64,
}

impl WorkerProcess {
    /// Connect the configured backend once and build the pipeline.
    ///
    /// A backend that cannot be resolved or connected is fatal.
    pub fn start(
        config: &WorkerConfig,
        backends: &BackendRegistry,
        enrichment: &EnrichmentRegistry,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        let backend = backends.open(&config.storage, &config.storage_uri)?;
        let pipeline = enrichment.pipeline(&config.meta, &config.plugins)?;
        Ok(Self::from_parts(config, backend, pipeline, broker))
    }

    /// Assemble a worker around an already connected backend
    pub fn from_parts(
        config: &WorkerConfig,
        backend: SharedBackend,
        pipeline: Pipeline,
        broker: Arc<dyn Broker>,
    ) -> Self {
        info!(
            worker = %config.name,
            threads = config.threads,
            backend = %backend.name(),
            meta = ?pipeline.enricher_names(),
            plugins = ?pipeline.plugin_names(),
            "Starting worker"
        );

        let consumer = Consumer::new(&config.name, config.topology(), pipeline, backend, broker);

        Self {
            name: config.name.clone(),
            interval: config.supervise_interval(),
            consumer: Arc::new(consumer),
            slots: (0..config.threads).map(|_| None).collect(),
            stop: CancellationToken::new(),
            state: SupervisorState::Starting,
            restarts: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Threads that are currently running
    pub fn alive(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|thread| !thread.is_finished())
            .count()
    }

    /// Threads replaced after they ended
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Fill empty slots and replace finished threads.
    ///
    /// Returns how many threads were spawned on this tick.
    pub fn reconcile(&mut self) -> usize {
        if matches!(self.state, SupervisorState::Draining | SupervisorState::Stopped) {
            return 0;
        }

        let mut spawned = 0;
        for index in 0..self.slots.len() {
            let slot = index + 1;

            match self.slots[index].take() {
                Some(thread) if !thread.is_finished() => {
                    self.slots[index] = Some(thread);
                    continue;
                },
                Some(thread) => {
                    self.restarts += 1;
                    match thread.join() {
                        Ok(()) => warn!(worker = %self.name, slot, "Consumer thread exited, restarting"),
                        Err(e) => error!(worker = %self.name, slot, error = %e, "Consumer thread died, restarting"),
                    }
                },
                None => {},
            }

            match ConsumerThread::spawn(self.consumer.clone(), slot, self.stop.child_token()) {
                Ok(thread) => {
                    debug!(worker = %self.name, slot, "Spawned consumer thread");
                    self.slots[index] = Some(thread);
                    spawned += 1;
                },
                Err(e) => error!(worker = %self.name, slot, error = %e, "Failed to spawn consumer thread"),
            }
        }

        if self.state == SupervisorState::Starting {
            self.state = SupervisorState::Running;
            info!(worker = %self.name, threads = self.slots.len(), "Worker running");
        }
        spawned
    }

    /// Reconcile every interval until `shutdown` fires, then drain
    pub fn run(&mut self, shutdown: &CancellationToken) {
        while !shutdown.is_cancelled() {
            self.reconcile();

            let deadline = Instant::now() + self.interval;
            while !shutdown.is_cancelled() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep(SHUTDOWN_POLL.min(deadline - now));
            }
        }

        info!(worker = %self.name, "Shutdown requested");
        self.drain();
    }

    /// Stop every thread after its in-flight delivery and wait for all of them
    pub fn drain(&mut self) {
        if self.state == SupervisorState::Stopped {
            return;
        }
        self.state = SupervisorState::Draining;
        self.stop.cancel();

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(thread) = slot.take() {
                if let Err(e) = thread.join() {
                    warn!(worker = %self.name, slot = index + 1, error = %e, "Consumer thread ended with an error");
                }
            }
        }

        self.state = SupervisorState::Stopped;
        info!(worker = %self.name, restarts = self.restarts, "Worker stopped");
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("slots", &self.slots.len())
            .field("restarts", &self.restarts)
            .finish()
    }
}
