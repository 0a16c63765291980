//! Broker bridge capability used by the gateway.
//!
//! The gateway never speaks a broker's native protocol inline; every session
//! holds exactly one handle obtained through [`BrokerBridge`]. Two
//! implementations ship with this crate: [`remote::RemoteBroker`] talks to an
//! external broker over framed TCP, and [`memory::MemoryBroker`] is a fully
//! in-process broker for tests and broker-less development.
//!
//! Handles are exclusively owned. Dropping a handle cancels any outstanding
//! work for that handle only; other handles are unaffected.

pub mod memory;
pub mod remote;
pub mod wire;

use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;

pub use memory::MemoryBroker;
pub use remote::RemoteBroker;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("broker connection closed")]
    Closed,
    #[error("publish rejected: {0}")]
    PublishRejected(String),
    #[error("broker protocol error: {0}")]
    Protocol(String),
    #[error("topic failed: {0}")]
    TopicFailed(TopicAddress),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<wire::Error> for BridgeError {
    fn from(err: wire::Error) -> Self {
        match err {
            wire::Error::Io(err) => BridgeError::Io(err),
            other => BridgeError::Protocol(other.to_string()),
        }
    }
}

/// Fully qualified topic identifier. Parsed once at route resolution and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicAddress {
    pub tenant: String,
    pub namespace: String,
    pub topic: String,
}

impl TopicAddress {
    pub fn new(
        tenant: impl Into<String>,
        namespace: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            namespace: namespace.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for TopicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.namespace, self.topic)
    }
}

/// Opaque acknowledgement token for a delivered message. Valid only against
/// the handle that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u64);

/// One message delivered to a consumer handle.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Bytes,
    pub id: MessageId,
}

/// Abstract broker capability.
///
/// Implementations hide connection management behind the two handle
/// constructors; a failed underlying connection surfaces as a terminal error
/// on the affected handle and is never silently retried here.
pub trait BrokerBridge: Send + Sync {
    fn create_producer(
        &self,
        topic: &TopicAddress,
    ) -> BoxFuture<'_, Result<Box<dyn ProducerHandle>>>;

    fn subscribe(
        &self,
        topic: &TopicAddress,
        subscription: &str,
    ) -> BoxFuture<'_, Result<Box<dyn ConsumerHandle>>>;
}

/// Exclusive producer-side handle. `publish` resolves once the broker has
/// acknowledged or rejected the payload.
pub trait ProducerHandle: Send {
    fn publish(&mut self, payload: Bytes) -> BoxFuture<'_, Result<()>>;
}

/// Exclusive consumer-side handle.
///
/// `next_delivery` is the only delivery path; there is no polling
/// alternative. `Ok(None)` means the subscription ended cleanly. Acks must be
/// issued in delivery order and only for messages this handle produced.
pub trait ConsumerHandle: Send {
    fn next_delivery(&mut self) -> BoxFuture<'_, Result<Option<Delivery>>>;

    fn ack(&mut self, id: MessageId) -> BoxFuture<'_, Result<()>>;
}

impl std::fmt::Debug for dyn ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ConsumerHandle")
    }
}
