use crate::{
    client::{AmqpClient, DeliveryStream},
    resources::ExchangeKind,
};
use async_trait::async_trait;
use lapin::{BasicProperties, Channel};
use mockall::mock;
use std::sync::Arc;
use typebus_messaging::BrokerError;

mock! {
    pub LapinClient {}

    #[async_trait]
    impl AmqpClient for LapinClient {
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
}
