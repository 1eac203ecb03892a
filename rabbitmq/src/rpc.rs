use crate::client::DeliveryStream;
use futures_util::StreamExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::oneshot;
use tracing::{debug, error};
use typebus_messaging::{BrokerError, Codec};
use uuid::Uuid;

type ReplySlot = oneshot::Sender<Result<Vec<u8>, BrokerError>>;

/// Table of in-flight calls keyed by correlation id.
///
/// Removal doubles as the exactly-once tie-break: reply, timeout and
/// connection teardown all race on `remove`, and only the winner holds the
/// single-assignment slot. Losers observe an absent entry and do nothing.
#[derive(Default)]
pub(crate) struct CallTable {
    pending: Mutex<HashMap<String, ReplySlot>>,
}

impl CallTable {
    /// Registers a fresh pending call and returns its correlation id plus the
    /// receiving end of the slot. Must happen before the request is
    /// published, so an early reply always finds the entry.
    pub fn register(&self) -> (String, oneshot::Receiver<Result<Vec<u8>, BrokerError>>) {
        let correlation_id = Uuid::new_v4().to_string();
        let (slot, pending_reply) = oneshot::channel();

        self.pending
            .lock()
            .unwrap()
            .insert(correlation_id.clone(), slot);

        (correlation_id, pending_reply)
    }

    /// Resolves the matching call with the raw reply payload. Returns false
    /// when the entry is already gone (timed out, failed or never existed).
    pub fn complete(&self, correlation_id: &str, payload: Vec<u8>) -> bool {
        match self.pending.lock().unwrap().remove(correlation_id) {
            Some(slot) => {
                let _ = slot.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Times the matching call out. No-op when a reply already won the race.
    pub fn expire(&self, correlation_id: &str) -> bool {
        match self.pending.lock().unwrap().remove(correlation_id) {
            Some(slot) => {
                let _ = slot.send(Err(BrokerError::TimeoutError));
                true
            }
            None => false,
        }
    }

    /// Drops the entry without resolving it; used when publishing the request
    /// itself failed and the caller already holds the error.
    pub fn discard(&self, correlation_id: &str) {
        self.pending.lock().unwrap().remove(correlation_id);
    }

    /// Fails every in-flight call. Called when the owning connection is torn
    /// down: the reply queue died with it, nothing can complete them anymore.
    pub fn fail_all(&self) {
        let drained: Vec<ReplySlot> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, slot)| slot).collect()
        };

        for slot in drained {
            let _ = slot.send(Err(BrokerError::ConnectionClosedError));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Handle for the eventual result of a `call`, resolved exactly once by
/// whichever of reply, timeout or teardown wins.
pub struct PendingReply<R> {
    correlation_id: String,
    slot: oneshot::Receiver<Result<Vec<u8>, BrokerError>>,
    codec: Arc<dyn Codec<R>>,
}

impl<R> PendingReply<R> {
    pub(crate) fn new(
        correlation_id: String,
        slot: oneshot::Receiver<Result<Vec<u8>, BrokerError>>,
        codec: Arc<dyn Codec<R>>,
    ) -> Self {
        PendingReply {
            correlation_id,
            slot,
            codec,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Waits for the resolution and decodes the reply payload with the
    /// expected reply codec.
    pub async fn recv(self) -> Result<R, BrokerError> {
        match self.slot.await {
            Ok(Ok(payload)) => self.codec.decode(&payload),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(BrokerError::ConnectionClosedError),
        }
    }
}

/// Consumes the private reply queue and completes pending calls. Replies with
/// no correlation id, or whose call already expired, are discarded silently.
pub(crate) async fn run_reply_consumer(mut replies: DeliveryStream, calls: Arc<CallTable>) {
    while let Some(result) = replies.next().await {
        match result {
            Ok(delivery) => {
                let Some(correlation_id) = delivery.properties.correlation_id().clone() else {
                    debug!("reply without correlation id, discarding");
                    continue;
                };

                if !calls.complete(correlation_id.as_str(), delivery.data) {
                    debug!(
                        correlation_id = correlation_id.as_str(),
                        "reply for unknown or expired call, discarding"
                    );
                }
            }
            Err(err) => error!(error = err.to_string(), "error while consuming reply"),
        }
    }

    debug!("reply consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use lapin::{acker::Acker, protocol::basic::AMQPProperties, types::ShortString};
    use serde::{Deserialize, Serialize};
    use std::{collections::HashSet, time::Duration};
    use tokio::time::Instant;
    use typebus_messaging::JsonCodec;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u64,
    }

    fn reply_delivery(correlation_id: Option<&str>, payload: &[u8]) -> lapin::message::Delivery {
        let mut properties = AMQPProperties::default();
        if let Some(correlation_id) = correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }

        lapin::message::Delivery {
            acker: Acker::default(),
            data: payload.to_vec(),
            delivery_tag: 0,
            exchange: ShortString::from(""),
            properties,
            redelivered: false,
            routing_key: ShortString::from(""),
        }
    }

    #[test]
    fn should_issue_unique_correlation_ids() {
        let calls = CallTable::default();
        let mut seen = HashSet::new();

        for _ in 0..10_000 {
            let (correlation_id, _pending) = calls.register();
            seen.insert(correlation_id);
        }

        assert_eq!(seen.len(), 10_000);
    }

    #[tokio::test]
    async fn should_resolve_with_reply_and_ignore_late_timeout() {
        let calls = CallTable::default();
        let (correlation_id, slot) = calls.register();

        assert!(calls.complete(&correlation_id, b"{\"seq\":1}".to_vec()));
        // the timer lost the race and must observe an absent entry
        assert!(!calls.expire(&correlation_id));

        let reply = PendingReply::<Pong>::new(correlation_id, slot, Arc::new(JsonCodec));
        assert_eq!(reply.recv().await, Ok(Pong { seq: 1 }));
    }

    #[tokio::test]
    async fn should_resolve_with_timeout_and_discard_late_reply() {
        let calls = Arc::new(CallTable::default());
        let (correlation_id, slot) = calls.register();

        let timer = {
            let calls = calls.clone();
            let correlation_id = correlation_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                calls.expire(&correlation_id)
            })
        };

        let started = Instant::now();
        let reply = PendingReply::<Pong>::new(correlation_id.clone(), slot, Arc::new(JsonCodec));
        assert_eq!(reply.recv().await, Err(BrokerError::TimeoutError));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(timer.await.unwrap());

        // a reply arriving afterwards is a no-op
        assert!(!calls.complete(&correlation_id, b"{\"seq\":2}".to_vec()));
        assert_eq!(calls.pending_count(), 0);
    }

    #[tokio::test]
    async fn should_fail_pending_calls_on_teardown() {
        let calls = CallTable::default();
        let (_, first) = calls.register();
        let (_, second) = calls.register();

        calls.fail_all();

        assert!(matches!(
            first.await,
            Ok(Err(BrokerError::ConnectionClosedError))
        ));
        assert!(matches!(
            second.await,
            Ok(Err(BrokerError::ConnectionClosedError))
        ));
        assert_eq!(calls.pending_count(), 0);
    }

    #[tokio::test]
    async fn should_discard_without_resolving() {
        let calls = CallTable::default();
        let (correlation_id, slot) = calls.register();

        calls.discard(&correlation_id);

        assert!(!calls.expire(&correlation_id));
        assert!(slot.await.is_err());
    }

    #[tokio::test]
    async fn should_complete_calls_from_reply_stream() {
        let calls = Arc::new(CallTable::default());
        let (correlation_id, slot) = calls.register();

        let replies: DeliveryStream = Box::pin(stream::iter(vec![
            Ok(reply_delivery(None, b"ignored")),
            Ok(reply_delivery(Some("unknown"), b"ignored")),
            Ok(reply_delivery(Some(&correlation_id), b"{\"seq\":3}")),
        ]));

        run_reply_consumer(replies, calls.clone()).await;

        let reply = PendingReply::<Pong>::new(correlation_id, slot, Arc::new(JsonCodec));
        assert_eq!(reply.recv().await, Ok(Pong { seq: 3 }));
        assert_eq!(calls.pending_count(), 0);
    }
}
