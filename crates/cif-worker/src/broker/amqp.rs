//! AMQP 0-9-1 transport on top of lapin

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tracing::{debug, instrument, warn};

use cif_common::{CifError, Result};

use super::{Broker, BrokerChannel, Delivery, Topology};

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

fn amqp_error(op: &'static str) -> impl FnOnce(lapin::Error) -> CifError {
    move |e| CifError::Broker(format!("amqp {op}: {e}"))
}

/// Connects to a RabbitMQ-compatible broker
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    uri: String,
}

impl AmqpBroker {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[instrument(level = "debug", skip(self))]
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(amqp_error("connect"))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(amqp_error("channel"))?;

        Ok(Box::new(AmqpChannel {
            connection,
            channel,
            consumer: None,
        }))
    }
}

/// One connection with one channel, owned by a single consumer thread
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare(&mut self, topology: &Topology) -> Result<()> {
        self.channel
            .queue_declare(
                &topology.work_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error("queue declare"))?;

        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error("exchange declare"))?;

        debug!(queue = %topology.work_queue, exchange = %topology.exchange, "Declared topology");
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(amqp_error("qos"))
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<()> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error("consume"))?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        let consumer = self
            .consumer
            .as_mut()
            .ok_or_else(|| CifError::Broker("amqp delivery: channel is not consuming".to_string()))?;

        match consumer.next().await {
            Some(delivery) => {
                let mut delivery = delivery.map_err(amqp_error("delivery"))?;
                let delivery_count = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .and_then(delivery_count);

                Ok(Some(Delivery {
                    tag: delivery.delivery_tag,
                    body: std::mem::take(&mut delivery.data),
                    redelivered: delivery.redelivered,
                    delivery_count,
                }))
            },
            None => Ok(None),
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(amqp_error("ack"))
    }

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(amqp_error("nack"))
    }

    async fn publish(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(amqp_error("publish"))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer = None;
        if let Err(e) = self.channel.close(200, "consumer stopped").await {
            warn!(error = %e, "Failed to close amqp channel");
        }
        self.connection
            .close(200, "consumer stopped")
            .await
            .map_err(amqp_error("close"))
    }
}

/// Read `x-delivery-count` whatever integer width the broker chose
fn delivery_count(headers: &FieldTable) -> Option<u32> {
    let (_, value) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)?;

    match value {
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}
