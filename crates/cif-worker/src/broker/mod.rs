//! Message broker port
//!
//! A [`Broker`] hands out one [`BrokerChannel`] per consumer thread. The
//! channel is used from that thread only, so its methods take `&mut self`
//! and nothing about it is synchronized.

use async_trait::async_trait;

use cif_common::Result;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Default name of the durable work queue
pub const DEFAULT_WORK_QUEUE: &str = "cif-work";

/// Default name of the fan-out exchange results are republished to
pub const DEFAULT_OBSERVABLE_EXCHANGE: &str = "cif-observables";

/// One message taken off the work queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    /// Set by the broker when the message was delivered before and not acked
    pub redelivered: bool,
    /// `x-delivery-count` header, when the broker provides one
    pub delivery_count: Option<u32>,
}

/// Queue and exchange names a consumer declares on start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub work_queue: String,
    pub exchange: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            work_queue: DEFAULT_WORK_QUEUE.to_string(),
            exchange: DEFAULT_OBSERVABLE_EXCHANGE.to_string(),
        }
    }
}

/// Connection factory shared by every consumer thread of a worker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new connection with a single channel on it
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>>;
}

#[async_trait]
pub trait BrokerChannel: Send {
    /// Declare the durable work queue and the fan-out exchange
    async fn declare(&mut self, topology: &Topology) -> Result<()>;

    /// Limit unacknowledged deliveries on this channel
    async fn set_prefetch(&mut self, count: u16) -> Result<()>;

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<()>;

    /// Wait for the next delivery. `None` means the broker ended the consumer.
    ///
    /// Must be cancel-safe: dropping the future before it resolves loses no
    /// message.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;

    async fn ack(&mut self, tag: u64) -> Result<()>;

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<()>;

    async fn publish(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
