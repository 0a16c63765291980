//! In-process broker implementing the bridge contract.
//!
//! Used by tests and by the gateway's broker-less standalone mode. Topics are
//! created on first use and retain their full log, so a subscription created
//! after a publish still replays every retained message in order before
//! tailing live traffic. Consumers that share a subscription name share one
//! cursor: each message is handed to exactly one of them.

use crate::{
    BridgeError, BrokerBridge, ConsumerHandle, Delivery, MessageId, ProducerHandle, Result,
    TopicAddress,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
}

struct TopicState {
    // Retained log; cursors index into it.
    log: Mutex<Vec<Bytes>>,
    subscriptions: Mutex<HashMap<String, Arc<SubscriptionState>>>,
    publish_notify: Notify,
    // Error injection for tests: publishes fail while set.
    failed: AtomicBool,
}

struct SubscriptionState {
    // Shared by every consumer attached under the same subscription name.
    cursor: Mutex<usize>,
    unacked: Mutex<HashMap<u64, usize>>,
    next_message_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publishes to `topic` fail with a terminal error.
    pub fn fail_topic(&self, topic: &TopicAddress) {
        self.topic(topic).failed.store(true, Ordering::Release);
    }

    /// Number of topics that have been touched by any handle.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    /// Outstanding (delivered but unacked) messages for a subscription.
    pub fn unacked_count(&self, topic: &TopicAddress, subscription: &str) -> usize {
        let state = self.topic(topic);
        let subscriptions = state.subscriptions.lock();
        subscriptions
            .get(subscription)
            .map(|sub| sub.unacked.lock().len())
            .unwrap_or(0)
    }

    fn topic(&self, address: &TopicAddress) -> Arc<TopicState> {
        let mut topics = self.topics.lock();
        Arc::clone(topics.entry(address.to_string()).or_insert_with(|| {
            Arc::new(TopicState {
                log: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(HashMap::new()),
                publish_notify: Notify::new(),
                failed: AtomicBool::new(false),
            })
        }))
    }
}

impl BrokerBridge for MemoryBroker {
    fn create_producer(
        &self,
        topic: &TopicAddress,
    ) -> BoxFuture<'_, Result<Box<dyn ProducerHandle>>> {
        let address = topic.clone();
        let topic = self.topic(topic);
        Box::pin(async move {
            Ok(Box::new(MemoryProducer { address, topic }) as Box<dyn ProducerHandle>)
        })
    }

    fn subscribe(
        &self,
        topic: &TopicAddress,
        subscription: &str,
    ) -> BoxFuture<'_, Result<Box<dyn ConsumerHandle>>> {
        let topic = self.topic(topic);
        let subscription = {
            let mut subscriptions = topic.subscriptions.lock();
            Arc::clone(
                subscriptions
                    .entry(subscription.to_string())
                    .or_insert_with(|| {
                        Arc::new(SubscriptionState {
                            cursor: Mutex::new(0),
                            unacked: Mutex::new(HashMap::new()),
                            next_message_id: AtomicU64::new(1),
                        })
                    }),
            )
        };
        Box::pin(async move {
            Ok(Box::new(MemoryConsumer {
                topic,
                subscription,
            }) as Box<dyn ConsumerHandle>)
        })
    }
}

struct MemoryProducer {
    address: TopicAddress,
    topic: Arc<TopicState>,
}

impl ProducerHandle for MemoryProducer {
    fn publish(&mut self, payload: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.topic.failed.load(Ordering::Acquire) {
                return Err(BridgeError::TopicFailed(self.address.clone()));
            }
            self.topic.log.lock().push(payload);
            self.topic.publish_notify.notify_waiters();
            Ok(())
        })
    }
}

struct MemoryConsumer {
    topic: Arc<TopicState>,
    subscription: Arc<SubscriptionState>,
}

impl SubscriptionState {
    fn try_next(&self, topic: &TopicState) -> Option<Delivery> {
        let log = topic.log.lock();
        let mut cursor = self.cursor.lock();
        if *cursor >= log.len() {
            return None;
        }
        let index = *cursor;
        *cursor += 1;
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        self.unacked.lock().insert(id, index);
        Some(Delivery {
            payload: log[index].clone(),
            id: MessageId(id),
        })
    }
}

impl ConsumerHandle for MemoryConsumer {
    fn next_delivery(&mut self) -> BoxFuture<'_, Result<Option<Delivery>>> {
        Box::pin(async move {
            loop {
                // Register for the wakeup before the check so a publish that
                // lands between check and await is not missed.
                let notified = self.topic.publish_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(delivery) = self.subscription.try_next(&self.topic) {
                    return Ok(Some(delivery));
                }
                notified.await;
            }
        })
    }

    fn ack(&mut self, id: MessageId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // Acks are fire-and-forget; an unknown id is ignored.
            self.subscription.unacked.lock().remove(&id.0);
            Ok(())
        })
    }
}
