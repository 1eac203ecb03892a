use crate::{
    client::{AmqpClient, DeliveryStream},
    message::Message,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use std::{collections::HashMap, sync::Arc, sync::Weak};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use typebus_messaging::{BrokerError, Codec};

/// Handler invoked for every decoded delivery of a subscribed queue.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, message: Message<T>) -> Result<(), BrokerError>;
}

/// Live consumer state for one physical queue; at most one exists per name.
///
/// `deliveries` holds the buffered receiving end until a handler claims it.
pub(crate) struct Subscription {
    pub deliveries: Option<mpsc::UnboundedReceiver<Delivery>>,
    pub tasks: Vec<JoinHandle<()>>,
}

pub(crate) type SubscriptionMap = Arc<Mutex<HashMap<String, Subscription>>>;

/// Forwards raw deliveries into the unbounded buffer, so the transport side
/// never waits on handler latency. When the stream ends (consumer cancelled
/// server-side, channel gone) the subscription entry is removed.
pub(crate) async fn forward_deliveries(
    mut consumer: DeliveryStream,
    deliveries: mpsc::UnboundedSender<Delivery>,
    subscriptions: Weak<Mutex<HashMap<String, Subscription>>>,
    physical_name: String,
) {
    while let Some(result) = consumer.next().await {
        match result {
            Ok(delivery) => {
                if deliveries.send(delivery).is_err() {
                    break;
                }
            }
            Err(err) => error!(
                error = err.to_string(),
                queue = physical_name.as_str(),
                "error while consuming"
            ),
        }
    }

    if let Some(subscriptions) = subscriptions.upgrade() {
        subscriptions.lock().await.remove(&physical_name);
    }

    debug!(queue = physical_name.as_str(), "consumer stopped");
}

/// Drains the buffer, handling every delivery on its own task: decode with
/// the descriptor codec, wrap, invoke the handler. Decode and handler
/// failures are logged and swallowed here, one bad message never stops the
/// stream or other in-flight handlers.
pub(crate) async fn dispatch_loop<T>(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    codec: Arc<dyn Codec<T>>,
    handler: Arc<dyn MessageHandler<T>>,
    client: Arc<dyn AmqpClient>,
    queue: String,
) where
    T: Send + 'static,
{
    while let Some(delivery) = deliveries.recv().await {
        let codec = codec.clone();
        let handler = handler.clone();
        let client = client.clone();
        let queue = queue.clone();

        tokio::spawn(async move {
            let data = match codec.decode(&delivery.data) {
                Ok(data) => data,
                Err(err) => {
                    error!(
                        queue = queue.as_str(),
                        error = err.to_string(),
                        "failure to decode delivery, message dropped"
                    );
                    return;
                }
            };

            let message = Message::new(data, delivery, client);
            if let Err(err) = handler.handle(message).await {
                warn!(
                    queue = queue.as_str(),
                    error = err.to_string(),
                    "handler failed"
                );
            }
        });
    }

    debug!(queue = queue.as_str(), "dispatch loop stopped");
}
