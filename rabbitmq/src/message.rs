use crate::client::AmqpClient;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    types::ShortString,
    BasicProperties,
};
use std::sync::Arc;
use tracing::error;
use typebus_messaging::{BrokerError, ReplyDescriptor};

/// A decoded delivery handed to a subscriber, together with the plumbing to
/// ack/nack/reject it and to reply when it belongs to an RPC exchange.
pub struct Message<T> {
    data: T,
    delivery: Delivery,
    client: Arc<dyn AmqpClient>,
}

impl<T> Message<T> {
    pub(crate) fn new(data: T, delivery: Delivery, client: Arc<dyn AmqpClient>) -> Self {
        Message {
            data,
            delivery,
            client,
        }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    /// Acknowledges this message, optionally every delivery up to it.
    pub async fn ack(&self, multiple: bool) -> Result<(), BrokerError> {
        self.delivery
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to ack message");
                BrokerError::AckMessageError
            })
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.delivery
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to nack message");
                BrokerError::NackMessageError
            })
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.delivery
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to reject message");
                BrokerError::RejectMessageError
            })
    }

    /// Replies to an RPC request: publishes through the default exchange to
    /// the requester's private reply queue, propagating its correlation id.
    pub async fn reply<R>(
        &self,
        descriptor: &ReplyDescriptor<R>,
        value: &R,
    ) -> Result<(), BrokerError> {
        let Some(reply_to) = self.delivery.properties.reply_to().clone() else {
            return Err(BrokerError::PreconditionError(
                "message carries no reply-to address".to_owned(),
            ));
        };

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(descriptor.content_type()));
        if let Some(correlation_id) = self.delivery.properties.correlation_id().clone() {
            properties = properties.with_correlation_id(correlation_id);
        }

        let payload = descriptor.encode(value)?;

        self.client
            .publish("", reply_to.as_str(), properties, &payload)
            .await
    }
}
