pub mod broker;
pub mod client;
pub mod consumer;
pub mod message;
pub mod naming;
pub mod resources;
pub mod rpc;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

pub use broker::{AmqpBroker, BrokerState};
pub use client::{AmqpClient, DeliveryStream, LapinClient};
pub use consumer::MessageHandler;
pub use message::Message;
pub use resources::{ExchangeKind, Resources, ResourcesBuilder};
pub use rpc::PendingReply;
