//! In-process broker used by tests and `CIF_MQ_URI=memory://`
//!
//! Models the parts of AMQP the worker relies on: per-channel prefetch,
//! ack/nack with requeue, redelivery of unacked messages when a channel goes
//! away, and a record of everything published to exchanges.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

use cif_common::{CifError, Result};

use super::{Broker, BrokerChannel, Delivery, Topology};

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
    delivery_count: u32,
}

#[derive(Debug)]
struct Unacked {
    channel: u64,
    queue: String,
    message: Message,
}

#[derive(Debug, Default)]
struct State {
    queues: BTreeMap<String, VecDeque<Message>>,
    exchanges: BTreeMap<String, Vec<Vec<u8>>>,
    unacked: HashMap<u64, Unacked>,
    acked: Vec<Vec<u8>>,
    nacked: Vec<(Vec<u8>, bool)>,
    next_tag: u64,
    next_channel: u64,
    connections: usize,
    max_outstanding: usize,
    fail_publish: bool,
    closed: bool,
}

impl State {
    fn outstanding(&self, channel: u64) -> usize {
        self.unacked.values().filter(|u| u.channel == channel).count()
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle; every clone sees the same queues
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a message on a queue, as a feeder would
    pub fn enqueue(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.shared
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Message {
                body: body.into(),
                redelivered: false,
                delivery_count: 0,
            });
        self.shared.notify.notify_waiters();
    }

    /// Messages waiting on a queue, not counting unacked ones
    pub fn pending(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.shared.lock().acked.clone()
    }

    /// Nacked bodies with the requeue flag they were nacked with
    pub fn nacked(&self) -> Vec<(Vec<u8>, bool)> {
        self.shared.lock().nacked.clone()
    }

    pub fn published(&self, exchange: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .exchanges
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    /// Connections opened so far
    pub fn connections(&self) -> usize {
        self.shared.lock().connections
    }

    /// Highest number of unacked deliveries any single channel ever held
    pub fn max_outstanding(&self) -> usize {
        self.shared.lock().max_outstanding
    }

    /// Make every `publish` fail until switched off again
    pub fn set_fail_publish(&self, fail: bool) {
        self.shared.lock().fail_publish = fail;
    }

    /// End every consumer and refuse new connections
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(CifError::Broker("memory broker is closed".to_string()));
        }
        state.next_channel += 1;
        state.connections += 1;

        Ok(Box::new(MemoryChannel {
            id: state.next_channel,
            shared: self.shared.clone(),
            prefetch: 0,
            queue: None,
        }))
    }
}

/// Channel handed to one consumer; unacked messages are requeued on drop
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    shared: Arc<Shared>,
    prefetch: u16,
    queue: Option<String>,
}

impl MemoryChannel {
    fn try_take(&self, queue: &str) -> Result<Option<Option<Delivery>>> {
        let mut state = self.shared.lock();
        if state.closed {
            return Ok(Some(None));
        }

        let outstanding = state.outstanding(self.id);
        if self.prefetch > 0 && outstanding >= usize::from(self.prefetch) {
            return Ok(None);
        }

        let Some(mut message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        message.delivery_count += 1;

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery {
            tag,
            body: message.body.clone(),
            redelivered: message.redelivered,
            delivery_count: Some(message.delivery_count),
        };

        state.unacked.insert(
            tag,
            Unacked {
                channel: self.id,
                queue: queue.to_string(),
                message,
            },
        );
        state.max_outstanding = state.max_outstanding.max(outstanding + 1);

        Ok(Some(Some(delivery)))
    }

    fn settle(&self, tag: u64) -> Result<Unacked> {
        let mut state = self.shared.lock();
        match state.unacked.remove(&tag) {
            Some(unacked) if unacked.channel == self.id => Ok(unacked),
            Some(other) => {
                state.unacked.insert(tag, other);
                Err(CifError::Broker(format!("delivery tag {} belongs to another channel", tag)))
            },
            None => Err(CifError::Broker(format!("unknown delivery tag {}", tag))),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare(&mut self, topology: &Topology) -> Result<()> {
        let mut state = self.shared.lock();
        state.queues.entry(topology.work_queue.clone()).or_default();
        state.exchanges.entry(topology.exchange.clone()).or_default();
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<()> {
        self.prefetch = count;
        Ok(())
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<()> {
        debug!(channel = self.id, queue = %queue, consumer_tag = %consumer_tag, "Consuming");
        self.queue = Some(queue.to_string());
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        let queue = self
            .queue
            .clone()
            .ok_or_else(|| CifError::Broker("memory channel is not consuming".to_string()))?;

        loop {
            // Register interest before looking so a concurrent enqueue is not missed
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.try_take(&queue)? {
                return Ok(outcome);
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        let unacked = self.settle(tag)?;
        self.shared.lock().acked.push(unacked.message.body);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<()> {
        let unacked = self.settle(tag)?;
        let mut state = self.shared.lock();
        state.nacked.push((unacked.message.body.clone(), requeue));
        if requeue {
            let mut message = unacked.message;
            message.redelivered = true;
            state.queues.entry(unacked.queue).or_default().push_front(message);
        }
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&mut self, exchange: &str, _routing_key: &str, body: &[u8]) -> Result<()> {
        let mut state = self.shared.lock();
        if state.fail_publish {
            return Err(CifError::Broker(format!("publish to {} refused", exchange)));
        }
        state
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .push(body.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.queue = None;
        self.requeue_unacked();
        Ok(())
    }
}

impl MemoryChannel {
    fn requeue_unacked(&self) {
        let mut state = self.shared.lock();
        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == self.id)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                state.queues.entry(unacked.queue).or_default().push_front(message);
            }
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.requeue_unacked();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn consuming(broker: &MemoryBroker, prefetch: u16) -> Box<dyn BrokerChannel> {
        let mut channel = broker.connect().await.unwrap();
        channel.declare(&Topology::default()).await.unwrap();
        channel.set_prefetch(prefetch).await.unwrap();
        channel.consume("cif-work", "test").await.unwrap();
        channel
    }

    #[tokio::test]
    async fn test_prefetch_holds_back_second_delivery() {
        let broker = MemoryBroker::new();
        broker.enqueue("cif-work", "one");
        broker.enqueue("cif-work", "two");

        let mut channel = consuming(&broker, 1).await;
        let first = channel.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.body, b"one");

        let blocked = tokio::time::timeout(Duration::from_millis(50), channel.next_delivery()).await;
        assert!(blocked.is_err(), "second delivery must wait for the ack");

        channel.ack(first.tag).await.unwrap();
        let second = channel.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.body, b"two");
        assert_eq!(broker.max_outstanding(), 1);
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_with_count() {
        let broker = MemoryBroker::new();
        broker.enqueue("cif-work", "flaky");

        let mut channel = consuming(&broker, 1).await;
        let first = channel.next_delivery().await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(first.delivery_count, Some(1));
        channel.nack(first.tag, true).await.unwrap();

        let again = channel.next_delivery().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.delivery_count, Some(2));

        channel.nack(again.tag, false).await.unwrap();
        assert_eq!(broker.pending("cif-work"), 0);
        assert_eq!(broker.nacked().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_channel_returns_unacked() {
        let broker = MemoryBroker::new();
        broker.enqueue("cif-work", "in-flight");

        let mut channel = consuming(&broker, 1).await;
        channel.next_delivery().await.unwrap().unwrap();
        assert_eq!(broker.unacked(), 1);
        drop(channel);

        assert_eq!(broker.unacked(), 0);
        assert_eq!(broker.pending("cif-work"), 1);
    }

    #[tokio::test]
    async fn test_close_ends_consumers() {
        let broker = MemoryBroker::new();
        let mut channel = consuming(&broker, 1).await;

        let closer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        assert!(channel.next_delivery().await.unwrap().is_none());
        assert!(broker.connect().await.is_err());
    }
}
