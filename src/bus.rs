//! In-process addressed message bus.
//!
//! The bus is an address-keyed map from address to a single active consumer
//! mailbox. Point-to-point only: binding a second consumer to a bound address
//! is rejected, there is no fan-out, and delivery is at-most-once per call.
//! Request/reply is a one-shot completion handle carried with the delivery
//! plus a timer on the caller's side; a late reply from the handler lands on a
//! dead channel and is dropped.

use std::collections::HashMap;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::Reply;

/// Errors surfaced by bus operations. These are bus-level conditions, not
/// persistence error codes; they never travel inside a [`Reply`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    /// No consumer is registered at the target address.
    #[error("no handlers registered for address `{0}`")]
    NoHandlers(String),
    /// The reply did not arrive within the configured timeout.
    #[error("request to `{0}` timed out")]
    Timeout(String),
    /// The address already has an active consumer.
    #[error("address `{0}` already has a registered consumer")]
    AddressInUse(String),
}

/// An addressed message as the consumer sees it.
#[derive(Debug, Clone)]
pub struct Message {
    pub address: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl Message {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// One inbound message plus its reply handle.
///
/// The handle is consumed by [`Delivery::reply`], so a handler cannot reply
/// twice. Fire-and-forget sends carry no handle and `reply` becomes a no-op.
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    reply_tx: Option<oneshot::Sender<Reply>>,
}

impl Delivery {
    /// True when the sender is waiting on a reply.
    pub fn wants_reply(&self) -> bool {
        self.reply_tx.is_some()
    }

    pub fn reply(self, reply: Reply) {
        match self.reply_tx {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    // Caller gave up (timeout or dropped future); discard.
                    debug!(address = %self.message.address, "reply discarded, requester gone");
                }
            }
            None => debug!(address = %self.message.address, "reply to fire-and-forget send ignored"),
        }
    }
}

#[derive(Debug)]
struct Binding {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
struct BusInner {
    registry: Mutex<HashMap<String, Binding>>,
    next_id: AtomicU64,
}

/// Handle to the shared bus. Cloning is cheap; all clones address the same
/// registry, which is local to this process.
#[derive(Debug, Clone, Default)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the sole consumer for `address`.
    ///
    /// Fails with [`BusError::AddressInUse`] if a live consumer is already
    /// bound there; a binding whose consumer has been dropped is replaced.
    pub fn register(&self, address: &str) -> Result<Consumer, BusError> {
        let mut registry = self.inner.registry.lock().expect("bus registry poisoned");
        if let Some(existing) = registry.get(address) {
            if !existing.tx.is_closed() {
                return Err(BusError::AddressInUse(address.to_string()));
            }
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        registry.insert(address.to_string(), Binding { id, tx });
        debug!(address, "consumer registered");
        Ok(Consumer {
            address: address.to_string(),
            registration_id: id,
            bus: self.clone(),
            rx,
        })
    }

    /// Fire-and-forget send: no reply will ever be delivered to the caller.
    pub fn send(
        &self,
        address: &str,
        headers: HashMap<String, String>,
        body: Value,
    ) -> Result<(), BusError> {
        self.dispatch(address, headers, body, None)
    }

    /// Send and await exactly one reply, failing fast when nobody is bound at
    /// `address` and with [`BusError::Timeout`] once `reply_timeout` elapses.
    pub async fn request(
        &self,
        address: &str,
        headers: HashMap<String, String>,
        body: Value,
        reply_timeout: Duration,
    ) -> Result<Reply, BusError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(address, headers, body, Some(reply_tx))?;
        match timeout(reply_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Consumer dropped the delivery without replying.
            Ok(Err(_)) => Err(BusError::NoHandlers(address.to_string())),
            Err(_) => Err(BusError::Timeout(address.to_string())),
        }
    }

    fn dispatch(
        &self,
        address: &str,
        headers: HashMap<String, String>,
        body: Value,
        reply_tx: Option<oneshot::Sender<Reply>>,
    ) -> Result<(), BusError> {
        let mut registry = self.inner.registry.lock().expect("bus registry poisoned");
        let binding = registry
            .get(address)
            .ok_or_else(|| BusError::NoHandlers(address.to_string()))?;
        let delivery = Delivery {
            message: Message {
                address: address.to_string(),
                headers,
                body,
            },
            reply_tx,
        };
        if binding.tx.send(delivery).is_err() {
            // Consumer dropped without unbinding; prune the stale entry.
            registry.remove(address);
            return Err(BusError::NoHandlers(address.to_string()));
        }
        Ok(())
    }

    fn unregister(&self, address: &str, registration_id: u64) {
        let mut registry = self.inner.registry.lock().expect("bus registry poisoned");
        if registry.get(address).is_some_and(|b| b.id == registration_id) {
            registry.remove(address);
            debug!(address, "consumer unregistered");
        }
    }
}

/// The receiving side of a registration. Dropping it unbinds the address.
#[derive(Debug)]
pub struct Consumer {
    address: String,
    registration_id: u64,
    bus: Bus,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next inbound delivery; `None` once the bus has no more senders, which
    /// cannot happen while the owning [`Bus`] is alive.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.bus.unregister(&self.address, self.registration_id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::{ErrorCode, Reply};

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn request_with_no_consumer_fails_immediately() {
        let bus = Bus::new();
        let started = std::time::Instant::now();
        let err = bus
            .request("nobody.home", no_headers(), json!({}), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err, BusError::NoHandlers("nobody.home".to_string()));
        // Fail-fast, not a wait for the 30s timeout.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let bus = Bus::new();
        let mut consumer = bus.register("echo").expect("register");
        tokio::spawn(async move {
            let delivery = consumer.recv().await.expect("delivery");
            assert!(delivery.wants_reply());
            let body = delivery.message.body.clone();
            delivery.reply(Reply::Success(body));
        });

        let reply = bus
            .request("echo", no_headers(), json!({"k": 1}), Duration::from_secs(1))
            .await
            .expect("reply");
        assert_eq!(reply, Reply::Success(json!({"k": 1})));
    }

    #[tokio::test]
    async fn slow_handler_yields_caller_side_timeout() {
        let bus = Bus::new();
        let mut consumer = bus.register("slow").expect("register");
        tokio::spawn(async move {
            let delivery = consumer.recv().await.expect("delivery");
            tokio::time::sleep(Duration::from_millis(200)).await;
            // Late reply: the caller timed out long ago, this is discarded.
            delivery.reply(Reply::failure(ErrorCode::DbError, "too late"));
        });

        let err = bus
            .request("slow", no_headers(), json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Timeout("slow".to_string()));
    }

    #[tokio::test]
    async fn second_registration_on_bound_address_is_rejected() {
        let bus = Bus::new();
        let _first = bus.register("single").expect("first register");
        let err = bus.register("single").unwrap_err();
        assert_eq!(err, BusError::AddressInUse("single".to_string()));
    }

    #[tokio::test]
    async fn dropping_consumer_frees_the_address() {
        let bus = Bus::new();
        let first = bus.register("rebind").expect("first register");
        drop(first);
        assert!(bus.register("rebind").is_ok());
    }

    #[tokio::test]
    async fn send_is_fire_and_forget() {
        let bus = Bus::new();
        let mut consumer = bus.register("drop-box").expect("register");
        bus.send("drop-box", no_headers(), json!({"note": "hi"}))
            .expect("send");

        let delivery = consumer.recv().await.expect("delivery");
        assert!(!delivery.wants_reply());
        assert_eq!(delivery.message.body, json!({"note": "hi"}));
        // Replying anyway must be harmless.
        delivery.reply(Reply::Success(json!(null)));
    }

    #[tokio::test]
    async fn send_to_unbound_address_fails() {
        let bus = Bus::new();
        let err = bus.send("void", no_headers(), json!({})).unwrap_err();
        assert_eq!(err, BusError::NoHandlers("void".to_string()));
    }

    #[tokio::test]
    async fn stale_guard_cannot_unbind_successor() {
        let bus = Bus::new();
        let mut first = bus.register("addr").expect("first");
        // Consumer stops receiving but its drop guard is still alive.
        first.rx.close();
        let _second = bus.register("addr").expect("rebind over dead consumer");
        // The stale guard drops now; the successor's binding must survive it.
        drop(first);
        assert_eq!(
            bus.register("addr").unwrap_err(),
            BusError::AddressInUse("addr".to_string())
        );
    }
}
