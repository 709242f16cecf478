//! Consumer threads
//!
//! Each consumer thread owns one broker connection and a private
//! current-thread tokio runtime. It takes one delivery at a time (prefetch 1),
//! runs it through the enrichment pipeline, persists the results through the
//! process-wide [`SharedBackend`] and republishes them to the fan-out
//! exchange.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use cif_common::{CifError, Observable, Result};

use crate::backend::{panic_message, SharedBackend};
use crate::broker::{Broker, BrokerChannel, Delivery, Topology};
use crate::pipeline::Pipeline;

/// Unacknowledged deliveries a consumer may hold
pub const WORK_PREFETCH: u16 = 1;

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Persisted and acked; `republished` counts successful publishes
    Acked { persisted: usize, republished: usize },
    /// Nacked without touching the backend, or after the backend failed
    Rejected { reason: String, requeue: bool },
}

/// Everything a consumer thread needs, shared by all threads of a worker
pub struct Consumer {
    worker: String,
    topology: Topology,
    pipeline: Pipeline,
    backend: SharedBackend,
    broker: Arc<dyn Broker>,
}

impl Consumer {
    pub fn new(
        worker: impl Into<String>,
        topology: Topology,
        pipeline: Pipeline,
        backend: SharedBackend,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            worker: worker.into(),
            topology,
            pipeline,
            backend,
            broker,
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Handle one delivery and settle it on `channel`.
    ///
    /// Only broker failures while settling are returned as errors; every
    /// other fault ends in a nack and a [`ProcessOutcome::Rejected`].
    pub async fn process(
        &self,
        channel: &mut dyn BrokerChannel,
        delivery: Delivery,
    ) -> Result<ProcessOutcome> {
        debug!(
            tag = delivery.tag,
            redelivered = delivery.redelivered,
            delivery_count = ?delivery.delivery_count,
            bytes = delivery.body.len(),
            "Received delivery"
        );

        let primary = match Observable::from_json(&delivery.body) {
            Ok(observable) => observable,
            Err(e) => {
                warn!(tag = delivery.tag, error = %e, "Dropping malformed message");
                return reject(channel, delivery.tag, e.to_string(), false).await;
            },
        };

        let results = match panic::catch_unwind(AssertUnwindSafe(|| self.pipeline.run(primary))) {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                warn!(tag = delivery.tag, error = %e, "Enrichment failed");
                return reject(channel, delivery.tag, e.to_string(), true).await;
            },
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(tag = delivery.tag, panic = %message, "Enrichment panicked");
                return reject(channel, delivery.tag, message, true).await;
            },
        };

        if let Err(e) = self.backend.create(&results) {
            warn!(
                tag = delivery.tag,
                backend = %self.backend.name(),
                atomicity = ?self.backend.atomicity(),
                error = %e,
                "Failed to persist observables"
            );
            return reject(channel, delivery.tag, e.to_string(), true).await;
        }

        channel.ack(delivery.tag).await?;

        let republished = self.republish(channel, &results).await;
        debug!(
            tag = delivery.tag,
            persisted = results.len(),
            republished,
            "Processed delivery"
        );

        Ok(ProcessOutcome::Acked {
            persisted: results.len(),
            republished,
        })
    }

    async fn republish(&self, channel: &mut dyn BrokerChannel, results: &[Observable]) -> usize {
        let mut republished = 0;
        for observable in results {
            let outcome = match observable.to_json() {
                Ok(body) => channel.publish(&self.topology.exchange, "", &body).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => republished += 1,
                Err(e) => warn!(
                    exchange = %self.topology.exchange,
                    otype = %observable.otype(),
                    observable = %observable.value(),
                    error = %e,
                    "Failed to republish observable"
                ),
            }
        }
        republished
    }

    /// Connect, declare, consume until `stop` fires or the broker ends the
    /// consumer. `stop` is only observed between deliveries.
    pub async fn run(&self, slot: usize, stop: CancellationToken) -> Result<()> {
        let mut channel = self.broker.connect().await?;
        channel.declare(&self.topology).await?;
        channel.set_prefetch(WORK_PREFETCH).await?;
        channel
            .consume(&self.topology.work_queue, &format!("{}-{}", self.worker, slot))
            .await?;
        info!(queue = %self.topology.work_queue, "Consumer ready");

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = channel.next_delivery() => next?,
            };

            let Some(delivery) = next else {
                info!("Broker ended the consumer");
                break;
            };
            self.process(channel.as_mut(), delivery).await?;
        }

        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close broker channel");
        }
        Ok(())
    }
}

async fn reject(
    channel: &mut dyn BrokerChannel,
    tag: u64,
    reason: String,
    requeue: bool,
) -> Result<ProcessOutcome> {
    channel.nack(tag, requeue).await?;
    Ok(ProcessOutcome::Rejected { reason, requeue })
}

/// Handle to one running consumer thread
#[derive(Debug)]
pub struct ConsumerThread {
    slot: usize,
    stop: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl ConsumerThread {
    /// Spawn a named OS thread running `consumer` until `stop` fires
    pub fn spawn(consumer: Arc<Consumer>, slot: usize, stop: CancellationToken) -> Result<Self> {
        let name = format!("cif-worker-{}-{}", consumer.worker(), slot);
        let thread_stop = stop.clone();

        let handle = thread::Builder::new().name(name).spawn(move || -> Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let span = info_span!("consumer", worker = %consumer.worker(), thread = slot);
            runtime.block_on(consumer.run(slot, thread_stop).instrument(span))
        })?;

        Ok(Self { slot, stop, handle })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Ask the thread to stop after its in-flight delivery
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for the thread and report how it ended
    pub fn join(self) -> Result<()> {
        match self.handle.join() {
            Ok(result) => result,
            Err(payload) => Err(CifError::Broker(format!(
                "consumer thread {} panicked: {}",
                self.slot,
                panic_message(payload.as_ref())
            ))),
        }
    }
}
