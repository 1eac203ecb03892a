use crate::{
    client::{AmqpClient, LapinClient},
    consumer::{self, MessageHandler, Subscription, SubscriptionMap},
    naming::QueueNaming,
    resources::Resources,
    rpc::{self, CallTable, PendingReply},
};
use lapin::{
    types::{LongString, ShortString},
    BasicProperties, Connection, ConnectionProperties,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use typebus_messaging::{BrokerError, QueueDescriptor, ReplyDescriptor};
use uuid::Uuid;

const CLOSE_REPLY_SUCCESS: u16 = 200;

/// Connection state of a broker instance. Written only by the lifecycle
/// paths; everything else just reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownKind {
    /// Protocol-level failure; reconnecting will not help.
    Hard,
    /// Network-level interruption, worth one reconnect attempt.
    Soft,
}

pub(crate) fn classify(error: &lapin::Error) -> ShutdownKind {
    match error {
        lapin::Error::ProtocolError(_) => ShutdownKind::Hard,
        _ => ShutdownKind::Soft,
    }
}

struct ShutdownSignal {
    generation: u64,
    error: lapin::Error,
}

/// Typed pub/sub and request/reply façade over an AMQP broker.
///
/// One instance owns one connection and one channel; publish, subscribe and
/// call all route logical queue names through the group naming scheme
/// configured in [`Resources`].
pub struct AmqpBroker {
    inner: Arc<Inner>,
}

struct Inner {
    resources: Resources,
    naming: QueueNaming,
    state: watch::Sender<BrokerState>,
    connection: Mutex<Option<Connection>>,
    client: StdMutex<Option<Arc<dyn AmqpClient>>>,
    reply_queue: StdMutex<Option<String>>,
    last_url: StdMutex<Option<String>>,
    // lapin offers no listener deregistration; bumping the generation makes
    // signals from a replaced connection stale instead
    generation: AtomicU64,
    subscriptions: SubscriptionMap,
    calls: Arc<CallTable>,
    shutdown: mpsc::UnboundedSender<ShutdownSignal>,
}

impl AmqpBroker {
    pub fn new(resources: Resources) -> Self {
        let (state, _) = watch::channel(BrokerState::Idle);
        let (shutdown, signals) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            naming: QueueNaming::new(&resources),
            resources,
            state,
            connection: Mutex::new(None),
            client: StdMutex::new(None),
            reply_queue: StdMutex::new(None),
            last_url: StdMutex::new(None),
            generation: AtomicU64::new(0),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(CallTable::default()),
            shutdown,
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), signals));

        AmqpBroker { inner }
    }

    pub fn resources(&self) -> &Resources {
        &self.inner.resources
    }

    pub fn state(&self) -> BrokerState {
        *self.inner.state.borrow()
    }

    /// Watchable state, useful for waiting until Connected.
    pub fn state_watch(&self) -> watch::Receiver<BrokerState> {
        self.inner.state.subscribe()
    }

    /// Connects to the broker at `url`, replacing any previous connection,
    /// and runs [`AmqpBroker::setup`]. Connect failures surface as
    /// [`BrokerError::ConnectionError`] and are not retried here.
    pub async fn connect(&self, url: &str) -> Result<(), BrokerError> {
        self.inner.connect(url).await
    }

    /// Adopts an already-open connection supplied by the caller, then runs
    /// [`AmqpBroker::setup`].
    pub async fn use_connection(&self, connection: Connection) -> Result<(), BrokerError> {
        self.inner.use_connection(connection).await
    }

    /// Idempotently prepares the broker on its current connection: channel,
    /// private reply queue with its consumer, and the group exchange.
    pub async fn setup(&self) -> Result<(), BrokerError> {
        self.inner.setup().await
    }

    /// Deliberate teardown: closes the connection, fails pending calls and
    /// cancels subscription tasks.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close().await
    }

    /// Fire-and-forget publish to the group exchange with the descriptor's
    /// logical name as routing key. No delivery confirmation is awaited.
    pub async fn publish<T>(
        &self,
        descriptor: &QueueDescriptor<T>,
        message: &T,
    ) -> Result<(), BrokerError> {
        let client = self.inner.client()?;
        let payload = descriptor.encode(message)?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(descriptor.content_type()))
            .with_kind(ShortString::from(descriptor.logical_name().to_owned()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()));

        client
            .publish(
                self.inner.naming.exchange(),
                self.inner.naming.routing_key(descriptor.logical_name()),
                properties,
                &payload,
            )
            .await
    }

    /// Declares, binds and starts consuming the descriptor's queue.
    ///
    /// Returns false when a subscription for the physical queue already
    /// exists; the running consumer is left untouched.
    pub async fn subscribe<T>(&self, descriptor: &QueueDescriptor<T>) -> Result<bool, BrokerError> {
        let client = self.inner.client()?;
        let physical_name = self.inner.naming.physical_name(descriptor.logical_name());

        let mut subscriptions = self.inner.subscriptions.lock().await;
        if subscriptions.contains_key(&physical_name) {
            debug!(queue = physical_name.as_str(), "already subscribed");
            return Ok(false);
        }

        client.declare_queue(&physical_name).await?;
        client
            .bind_queue(
                &physical_name,
                self.inner.naming.exchange(),
                self.inner.naming.routing_key(descriptor.logical_name()),
            )
            .await?;

        let consumer = client
            .consumer(&physical_name, descriptor.logical_name(), false)
            .await?;

        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(consumer::forward_deliveries(
            consumer,
            deliveries_tx,
            Arc::downgrade(&self.inner.subscriptions),
            physical_name.clone(),
        ));

        subscriptions.insert(
            physical_name.clone(),
            Subscription {
                deliveries: Some(deliveries_rx),
                tasks: vec![forwarder],
            },
        );
        info!(queue = physical_name.as_str(), "subscribed");

        Ok(true)
    }

    /// Subscribes (if needed) and attaches `handler` to the queue's buffered
    /// delivery stream. Deliveries are buffered in arrival order but handled
    /// concurrently; a failing handler never stops the stream.
    pub async fn on<T, H>(
        &self,
        descriptor: &QueueDescriptor<T>,
        handler: H,
    ) -> Result<(), BrokerError>
    where
        T: Send + 'static,
        H: MessageHandler<T> + 'static,
    {
        self.subscribe(descriptor).await?;

        let client = self.inner.client()?;
        let physical_name = self.inner.naming.physical_name(descriptor.logical_name());

        let mut subscriptions = self.inner.subscriptions.lock().await;
        let Some(subscription) = subscriptions.get_mut(&physical_name) else {
            return Err(BrokerError::ConsumerError(physical_name));
        };

        let Some(deliveries) = subscription.deliveries.take() else {
            return Err(BrokerError::PreconditionError(format!(
                "queue `{physical_name}` already has a handler attached"
            )));
        };

        let dispatch = tokio::spawn(consumer::dispatch_loop(
            deliveries,
            descriptor.codec(),
            Arc::new(handler) as Arc<dyn MessageHandler<T>>,
            client,
            physical_name.clone(),
        ));
        subscription.tasks.push(dispatch);

        Ok(())
    }

    /// Publishes `message` as an RPC request and returns a handle for the
    /// eventual reply.
    ///
    /// The pending entry is registered before publishing, so a reply that
    /// arrives before `basic_publish` even returns still finds it. When
    /// `timeout` is set, a timer races the reply through the call table;
    /// whoever removes the entry first wins, the loser is a no-op.
    pub async fn call<S, R>(
        &self,
        request: &QueueDescriptor<S>,
        reply: &ReplyDescriptor<R>,
        message: &S,
        timeout: Option<Duration>,
    ) -> Result<PendingReply<R>, BrokerError> {
        let client = self.inner.client()?;
        let reply_queue = self
            .inner
            .reply_queue
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| {
                BrokerError::PreconditionError("broker has not been set up".to_owned())
            })?;

        let payload = request.encode(message)?;
        let (correlation_id, slot) = self.inner.calls.register();

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(request.content_type()))
            .with_correlation_id(ShortString::from(correlation_id.clone()))
            .with_reply_to(ShortString::from(reply_queue))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()));

        if let Err(err) = client
            .publish(
                self.inner.naming.exchange(),
                self.inner.naming.routing_key(request.logical_name()),
                properties,
                &payload,
            )
            .await
        {
            self.inner.calls.discard(&correlation_id);
            return Err(err);
        }

        if let Some(timeout) = timeout {
            let calls = self.inner.calls.clone();
            let correlation_id = correlation_id.clone();

            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if calls.expire(&correlation_id) {
                    warn!(correlation_id = correlation_id.as_str(), "call timed out");
                }
            });
        }

        Ok(PendingReply::new(correlation_id, slot, reply.codec()))
    }
}

impl Inner {
    fn client(&self) -> Result<Arc<dyn AmqpClient>, BrokerError> {
        self.client.lock().unwrap().clone().ok_or_else(|| {
            BrokerError::PreconditionError("an existing connection must be present".to_owned())
        })
    }

    fn open_client(&self) -> Option<Arc<dyn AmqpClient>> {
        let client = self.client.lock().unwrap().clone()?;
        if client.channel().status().connected() {
            Some(client)
        } else {
            None
        }
    }

    fn register_shutdown_listener(&self, connection: &Connection) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shutdown = self.shutdown.clone();

        connection.on_error(move |error| {
            let _ = shutdown.send(ShutdownSignal { generation, error });
        });
    }

    async fn connect(self: &Arc<Self>, url: &str) -> Result<(), BrokerError> {
        {
            let mut connection = self.connection.lock().await;
            if let Some(existing) = connection.take() {
                // make the old listener stale before closing
                self.generation.fetch_add(1, Ordering::SeqCst);
                if existing.status().connected() {
                    if let Err(err) = existing.close(CLOSE_REPLY_SUCCESS, "reconnecting").await {
                        warn!(
                            error = err.to_string(),
                            "error closing previous connection"
                        );
                    }
                }
            }
        }

        self.state.send_replace(BrokerState::Connecting);
        debug!(url, "connecting to rabbitmq...");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.resources.connection_name.clone()));

        let connection = match Connection::connect(url, options).await {
            Ok(connection) => connection,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                self.state.send_replace(BrokerState::Disconnected);
                return Err(BrokerError::ConnectionError);
            }
        };

        self.register_shutdown_listener(&connection);
        *self.connection.lock().await = Some(connection);
        *self.last_url.lock().unwrap() = Some(url.to_owned());

        self.setup().await
    }

    async fn use_connection(self: &Arc<Self>, connection: Connection) -> Result<(), BrokerError> {
        if !connection.status().connected() {
            return Err(BrokerError::PreconditionError(
                "provided connection is not open".to_owned(),
            ));
        }

        self.register_shutdown_listener(&connection);
        *self.connection.lock().await = Some(connection);

        self.setup().await
    }

    async fn setup(&self) -> Result<(), BrokerError> {
        let guard = self.connection.lock().await;
        let Some(connection) = guard.as_ref() else {
            return Err(BrokerError::PreconditionError(
                "an existing connection must be present".to_owned(),
            ));
        };

        if !connection.status().connected() {
            return Err(BrokerError::PreconditionError(
                "an existing connection must be present".to_owned(),
            ));
        }

        // reuse the channel when it is still open, otherwise build a new one
        let client = match self.open_client() {
            Some(client) => client,
            None => {
                let channel = connection.create_channel().await.map_err(|err| {
                    error!(error = err.to_string(), "failure to create a channel");
                    BrokerError::ChannelError
                })?;

                let client: Arc<dyn AmqpClient> = LapinClient::new(Arc::new(channel));
                *self.client.lock().unwrap() = Some(client.clone());
                self.state.send_replace(BrokerState::Connected);
                info!("connected to rabbitmq");
                client
            }
        };

        // always re-declare the reply queue and restart its consumer: both
        // die with the channel
        let reply_queue = client.declare_reply_queue().await?;
        let replies = client.consumer(&reply_queue, "", true).await?;
        tokio::spawn(rpc::run_reply_consumer(replies, self.calls.clone()));
        *self.reply_queue.lock().unwrap() = Some(reply_queue.clone());
        debug!(queue = reply_queue.as_str(), "reply queue ready");

        client
            .declare_exchange(self.naming.exchange(), self.resources.exchange_kind.clone())
            .await?;

        Ok(())
    }

    /// Returns true when a reconnect was attempted.
    async fn on_shutdown(self: &Arc<Self>, kind: ShutdownKind) -> bool {
        self.state.send_replace(BrokerState::Disconnected);
        info!("disconnected from rabbitmq");

        *self.client.lock().unwrap() = None;
        *self.reply_queue.lock().unwrap() = None;

        // the reply queue died with the connection, nothing can complete
        // these anymore
        self.calls.fail_all();

        if kind == ShutdownKind::Hard {
            error!("hard error reported by the broker, not reconnecting");
            return false;
        }

        let url = self.last_url.lock().unwrap().clone();
        let Some(url) = url else { return false };

        info!("reconnecting...");
        if let Err(err) = self.connect(&url).await {
            error!(error = err.to_string(), "reconnect failed");
        }

        // consumers are not re-subscribed here; see DESIGN.md
        true
    }

    async fn close(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(connection) = self.connection.lock().await.take() {
            if connection.status().connected() {
                if let Err(err) = connection.close(CLOSE_REPLY_SUCCESS, "closing").await {
                    warn!(error = err.to_string(), "error closing connection");
                }
            }
        }

        *self.client.lock().unwrap() = None;
        *self.reply_queue.lock().unwrap() = None;
        self.state.send_replace(BrokerState::Disconnected);
        self.calls.fail_all();

        let mut subscriptions = self.subscriptions.lock().await;
        for (_, subscription) in subscriptions.drain() {
            for task in subscription.tasks {
                task.abort();
            }
        }

        Ok(())
    }
}

async fn supervise(inner: Weak<Inner>, mut signals: mpsc::UnboundedReceiver<ShutdownSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else { return };

        // signal from a connection we already replaced or closed
        if signal.generation != inner.generation.load(Ordering::SeqCst) {
            continue;
        }

        error!(error = signal.error.to_string(), "connection shut down");
        inner.on_shutdown(classify(&signal.error)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DeliveryStream;
    use crate::mocks::MockLapinClient;
    use crate::resources::ExchangeKind;
    use futures_util::stream;
    use serde::{Deserialize, Serialize};
    use std::io;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u64,
    }

    fn install_client(broker: &AmqpBroker, client: MockLapinClient) {
        *broker.inner.client.lock().unwrap() = Some(Arc::new(client));
    }

    #[tokio::test]
    async fn should_start_idle() {
        let broker = AmqpBroker::new(Resources::default());

        assert_eq!(broker.state(), BrokerState::Idle);
    }

    #[tokio::test]
    async fn should_fail_operations_before_any_connection() {
        let broker = AmqpBroker::new(Resources::default());
        let descriptor = QueueDescriptor::<Ping>::new("ping");

        let res = broker.publish(&descriptor, &Ping { seq: 1 }).await;
        assert!(matches!(res, Err(BrokerError::PreconditionError(_))));

        let res = broker.subscribe(&descriptor).await;
        assert!(matches!(res, Err(BrokerError::PreconditionError(_))));

        let res = broker
            .call(&descriptor, &ReplyDescriptor::<Pong>::new(), &Ping { seq: 1 }, None)
            .await;
        assert!(matches!(res, Err(BrokerError::PreconditionError(_))));
    }

    #[tokio::test]
    async fn should_report_duplicate_subscription() {
        let broker = AmqpBroker::new(Resources::builder().group("g").build());

        let mut client = MockLapinClient::new();
        client
            .expect_declare_queue()
            .times(1)
            .returning(|_| Ok(()));
        client
            .expect_bind_queue()
            .times(1)
            .returning(|_, _, _| Ok(()));
        client.expect_consumer().times(1).returning(|_, _, _| {
            let consumer: DeliveryStream = Box::pin(stream::pending());
            Ok(consumer)
        });
        install_client(&broker, client);

        let descriptor = QueueDescriptor::<Ping>::new("ping");

        assert!(broker.subscribe(&descriptor).await.unwrap());
        assert!(!broker.subscribe(&descriptor).await.unwrap());

        assert_eq!(broker.inner.subscriptions.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn should_resolve_call_even_when_reply_beats_publish() {
        let broker = AmqpBroker::new(Resources::builder().group("g").build());
        *broker.inner.reply_queue.lock().unwrap() = Some("amq.gen-reply".to_owned());

        // the "server" answers before basic_publish even returns; the call
        // table entry must already exist
        let calls = broker.inner.calls.clone();
        let mut client = MockLapinClient::new();
        client
            .expect_publish()
            .returning(move |_, _, properties, _| {
                let correlation_id = properties.correlation_id().clone().unwrap();
                assert!(calls.complete(correlation_id.as_str(), b"{\"seq\":1}".to_vec()));
                Ok(())
            });
        install_client(&broker, client);

        let pending = broker
            .call(
                &QueueDescriptor::<Ping>::new("ping"),
                &ReplyDescriptor::<Pong>::new(),
                &Ping { seq: 1 },
                None,
            )
            .await
            .unwrap();

        assert_eq!(pending.recv().await, Ok(Pong { seq: 1 }));
    }

    #[tokio::test]
    async fn should_time_out_call_without_reply() {
        let broker = AmqpBroker::new(Resources::builder().group("g").build());
        *broker.inner.reply_queue.lock().unwrap() = Some("amq.gen-reply".to_owned());

        let mut client = MockLapinClient::new();
        client.expect_publish().returning(|_, _, _, _| Ok(()));
        install_client(&broker, client);

        let pending = broker
            .call(
                &QueueDescriptor::<Ping>::new("ping"),
                &ReplyDescriptor::<Pong>::new(),
                &Ping { seq: 1 },
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        let correlation_id = pending.correlation_id().to_owned();
        assert_eq!(pending.recv().await, Err(BrokerError::TimeoutError));

        // a reply arriving after the timeout is discarded
        assert!(!broker.inner.calls.complete(&correlation_id, vec![]));
    }

    #[tokio::test]
    async fn should_drop_pending_call_when_publish_fails() {
        let broker = AmqpBroker::new(Resources::builder().group("g").build());
        *broker.inner.reply_queue.lock().unwrap() = Some("amq.gen-reply".to_owned());

        let mut client = MockLapinClient::new();
        client
            .expect_publish()
            .returning(|_, _, _, _| Err(BrokerError::PublishingError));
        install_client(&broker, client);

        let res = broker
            .call(
                &QueueDescriptor::<Ping>::new("ping"),
                &ReplyDescriptor::<Pong>::new(),
                &Ping { seq: 1 },
                None,
            )
            .await;

        assert!(matches!(res, Err(BrokerError::PublishingError)));
        assert_eq!(broker.inner.calls.pending_count(), 0);
    }

    #[tokio::test]
    async fn should_not_reconnect_after_hard_shutdown() {
        let broker = AmqpBroker::new(Resources::default());
        *broker.inner.last_url.lock().unwrap() = Some("amqp://127.0.0.1:1".to_owned());
        let (_, slot) = broker.inner.calls.register();

        let attempted = broker.inner.on_shutdown(ShutdownKind::Hard).await;

        assert!(!attempted);
        assert_eq!(broker.state(), BrokerState::Disconnected);
        assert!(matches!(
            slot.await,
            Ok(Err(BrokerError::ConnectionClosedError))
        ));
    }

    #[tokio::test]
    async fn should_attempt_one_reconnect_after_soft_shutdown() {
        let broker = AmqpBroker::new(Resources::default());
        // unreachable on purpose: the attempt itself is what we observe
        *broker.inner.last_url.lock().unwrap() = Some("amqp://127.0.0.1:1".to_owned());
        let (_, slot) = broker.inner.calls.register();

        let attempted = broker.inner.on_shutdown(ShutdownKind::Soft).await;

        assert!(attempted);
        assert_eq!(broker.state(), BrokerState::Disconnected);
        assert!(matches!(
            slot.await,
            Ok(Err(BrokerError::ConnectionClosedError))
        ));
    }

    #[tokio::test]
    async fn should_skip_reconnect_without_a_known_url() {
        let broker = AmqpBroker::new(Resources::default());

        let attempted = broker.inner.on_shutdown(ShutdownKind::Soft).await;

        assert!(!attempted);
        assert_eq!(broker.state(), BrokerState::Disconnected);
    }

    #[test]
    fn should_classify_io_errors_as_soft() {
        let error = lapin::Error::IOError(Arc::new(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset by peer",
        )));

        assert_eq!(classify(&error), ShutdownKind::Soft);
    }

    #[tokio::test]
    async fn should_publish_with_routing_through_the_group_exchange() {
        let broker = AmqpBroker::new(
            Resources::builder()
                .group("g")
                .sub_group("s")
                .exchange_kind(ExchangeKind::Direct)
                .build(),
        );

        let mut client = MockLapinClient::new();
        client
            .expect_publish()
            .withf(|exchange, routing_key, _, _| exchange == "g" && routing_key == "ping")
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        install_client(&broker, client);

        broker
            .publish(&QueueDescriptor::<Ping>::new("ping"), &Ping { seq: 9 })
            .await
            .unwrap();
    }
}
