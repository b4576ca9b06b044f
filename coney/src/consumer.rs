//! Consumer registry and delivery dispatch
//!
//! Each consumer owns a bounded delivery queue drained by N worker tasks
//! (N = the configured dispatch concurrency). With N = 1 per-consumer
//! delivery order is preserved; above that, ordering is explicitly not
//! guaranteed and the callback must tolerate concurrent invocations. A
//! panicking callback is caught and logged; it never poisons the
//! dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use coney_codec::{BasicProperties, FieldTable};
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// An inbound message handed to a consumer callback as an owned buffer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag of the consumer the message was delivered to
    pub consumer_tag: String,
    /// Server-assigned delivery tag for acking
    pub delivery_tag: u64,
    /// Whether the message was delivered before
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Message properties
    pub properties: BasicProperties,
    /// Message body
    pub body: Bytes,
}

/// A `basic.return`: an unroutable mandatory message coming back
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    /// Reply code explaining the return, e.g. 312 NO_ROUTE
    pub reply_code: u16,
    /// Human-readable reason
    pub reply_text: String,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Message properties
    pub properties: BasicProperties,
    /// Message body
    pub body: Bytes,
}

/// Async callback invoked for each delivery
pub type DeliveryHandler =
    Arc<dyn Fn(Delivery) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Options for `basic.consume`
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Do not deliver messages published on this connection
    pub no_local: bool,
    /// Server considers messages acknowledged once delivered
    pub no_ack: bool,
    /// Only this consumer may access the queue
    pub exclusive: bool,
    /// Consumer arguments, e.g. priorities
    pub arguments: FieldTable,
}

pub(crate) struct ConsumerEntry {
    /// The tag shown to the user; preserved across recovery even when the
    /// server issues a fresh wire tag
    pub user_tag: String,
    /// Whether the tag was generated by the server
    pub server_named: bool,
    pub queue: String,
    pub options: ConsumeOptions,
    pub handler: DeliveryHandler,
    pub tx: mpsc::Sender<Delivery>,
    pub workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for ConsumerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerEntry")
            .field("user_tag", &self.user_tag)
            .field("server_named", &self.server_named)
            .field("queue", &self.queue)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl ConsumerEntry {
    fn abort_workers(&mut self) {
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

/// Consumers of one channel, keyed by the tag the server delivers with
#[derive(Debug, Default)]
pub(crate) struct ConsumerRegistry {
    by_wire_tag: HashMap<String, ConsumerEntry>,
}

impl ConsumerRegistry {
    pub fn insert(&mut self, wire_tag: String, entry: ConsumerEntry) {
        self.by_wire_tag.insert(wire_tag, entry);
    }

    pub fn delivery_queue(&self, wire_tag: &str) -> Option<mpsc::Sender<Delivery>> {
        self.by_wire_tag.get(wire_tag).map(|e| e.tx.clone())
    }

    /// Removes a consumer and stops its workers
    pub fn remove(&mut self, wire_tag: &str) -> Option<ConsumerEntry> {
        let mut entry = self.by_wire_tag.remove(wire_tag)?;
        entry.abort_workers();
        Some(entry)
    }

    /// Finds the wire tag backing a user-visible tag
    pub fn wire_tag_of(&self, user_tag: &str) -> Option<String> {
        self.by_wire_tag
            .iter()
            .find(|(_, e)| e.user_tag == user_tag)
            .map(|(wire, _)| wire.clone())
    }

    /// Drains every consumer for re-registration after recovery, worker
    /// tasks and queues intact
    pub fn drain_for_recovery(&mut self) -> Vec<(String, ConsumerEntry)> {
        self.by_wire_tag.drain().collect()
    }

    /// Stops all workers and drops all consumers
    pub fn cancel_all(&mut self) {
        for (_, mut entry) in self.by_wire_tag.drain() {
            entry.abort_workers();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_wire_tag.is_empty()
    }
}

/// Spawns the worker tasks draining one consumer's delivery queue
pub(crate) fn spawn_workers(
    concurrency: usize,
    rx: mpsc::Receiver<Delivery>,
    handler: DeliveryHandler,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..concurrency.max(1))
        .map(|_| {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                loop {
                    let delivery = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(delivery) = delivery else { break };
                    let fut = std::panic::AssertUnwindSafe(handler(delivery)).catch_unwind();
                    if fut.await.is_err() {
                        tracing::error!("consumer callback panicked");
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            consumer_tag: "ctag".into(),
            delivery_tag: tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: "q".into(),
            properties: BasicProperties::default(),
            body: Bytes::from_static(b"payload"),
        }
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let (tx, rx) = mpsc::channel(16);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let handler: DeliveryHandler = Arc::new(move |_d| {
            let seen = Arc::clone(&seen2);
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });
        let workers = spawn_workers(1, rx, handler);

        for i in 0..5 {
            tx.send(delivery(i)).await.unwrap();
        }
        drop(tx);
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn single_worker_preserves_order() {
        let (tx, rx) = mpsc::channel(16);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let order2 = Arc::clone(&order);
        let handler: DeliveryHandler = Arc::new(move |d| {
            let order = Arc::clone(&order2);
            Box::pin(async move {
                order.lock().push(d.delivery_tag);
            })
        });
        let workers = spawn_workers(1, rx, handler);
        for i in 1..=10 {
            tx.send(delivery(i)).await.unwrap();
        }
        drop(tx);
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(*order.lock(), (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn panicking_callback_does_not_poison_the_workers() {
        let (tx, rx) = mpsc::channel(16);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let handler: DeliveryHandler = Arc::new(move |d| {
            let seen = Arc::clone(&seen2);
            Box::pin(async move {
                if d.delivery_tag == 1 {
                    panic!("boom");
                }
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });
        let workers = spawn_workers(1, rx, handler);
        tx.send(delivery(1)).await.unwrap();
        tx.send(delivery(2)).await.unwrap();
        drop(tx);
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrency_above_one_processes_in_parallel() {
        let (tx, rx) = mpsc::channel(16);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (in2, peak2) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let handler: DeliveryHandler = Arc::new(move |_d| {
            let in_flight = Arc::clone(&in2);
            let peak = Arc::clone(&peak2);
            Box::pin(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        });
        let workers = spawn_workers(4, rx, handler);
        for i in 0..8 {
            tx.send(delivery(i)).await.unwrap();
        }
        drop(tx);
        for worker in workers {
            worker.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn registry_rekeys_across_recovery() {
        let (tx, _rx) = mpsc::channel(1);
        let handler: DeliveryHandler = Arc::new(|_| Box::pin(async {}));
        let mut registry = ConsumerRegistry::default();
        registry.insert(
            "amq.ctag-old".into(),
            ConsumerEntry {
                user_tag: "amq.ctag-old".into(),
                server_named: true,
                queue: "q".into(),
                options: ConsumeOptions::default(),
                handler,
                tx,
                workers: Vec::new(),
            },
        );

        let drained = registry.drain_for_recovery();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
        let (_, entry) = drained.into_iter().next().unwrap();
        registry.insert("amq.ctag-new".into(), entry);
        assert!(registry.delivery_queue("amq.ctag-new").is_some());
        assert_eq!(
            registry.wire_tag_of("amq.ctag-old").as_deref(),
            Some("amq.ctag-new")
        );
    }
}
