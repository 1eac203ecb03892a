use crate::resources::ExchangeKind;
use async_trait::async_trait;
use futures_util::Stream;
use lapin::{
    message::Delivery,
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use std::{pin::Pin, sync::Arc};
use tracing::error;
use typebus_messaging::BrokerError;

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, lapin::Error>> + Send>>;

/// Capability surface over the AMQP channel.
///
/// Every wire operation the broker performs goes through this trait, which
/// keeps the rest of the crate testable against a mock.
#[async_trait]
pub trait AmqpClient: Send + Sync {
    fn channel(&self) -> Arc<Channel>;
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;
    async fn declare_reply_queue(&self) -> Result<String, BrokerError>;
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;
    async fn consumer(
        &self,
        queue: &str,
        tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, BrokerError>;
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        payload: &[u8],
    ) -> Result<(), BrokerError>;
}

pub struct LapinClient {
    channel: Arc<Channel>,
}

impl LapinClient {
    pub fn new(channel: Arc<Channel>) -> Arc<LapinClient> {
        Arc::new(LapinClient { channel })
    }
}

#[async_trait]
impl AmqpClient for LapinClient {
    fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::map(kind),
                ExchangeDeclareOptions {
                    auto_delete: false,
                    durable: true,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare exchange");
                BrokerError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare queue");
                BrokerError::DeclareQueueError(name.to_owned())
            })
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        // anonymous, exclusive and auto-delete: it lives and dies with us
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare reply queue");
                BrokerError::DeclareQueueError("reply".to_owned())
            })?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to bind queue");
                BrokerError::BindQueueError(queue.to_owned(), exchange.to_owned())
            })
    }

    async fn consumer(
        &self,
        queue: &str,
        tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to create consumer");
                BrokerError::ConsumerError(queue.to_owned())
            })?;

        Ok(Box::pin(consumer))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                BrokerError::PublishingError
            })
    }
}
