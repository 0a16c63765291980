//! Network-backed broker client.
//!
//! ## Connection model
//! Every handle owns its own TCP connection to the broker. A producer handle
//! runs a sequential request/response exchange on it: one `Publish` out, one
//! `PublishOk`/`PublishError` back, which trivially preserves ack ordering
//! per handle. A consumer handle splits its connection between two tasks:
//!
//! - an event pump that reads `Event` frames and forwards them into a
//!   **bounded** queue, suspending (not dropping) when the session falls
//!   behind, so the broker connection is simply not read further;
//! - an ack writer that drains a queue of acknowledgement ids in order.
//!
//! ## Failure model
//! Connection failure is terminal for the owning handle: the pump forwards
//! the error and closes the queue, and no reconnect is attempted here.
//! Reconnect/backoff policy belongs to the broker deployment, not this
//! client. Dropping a handle tears down its tasks and connection without
//! touching any other handle.

use crate::wire::{self, WireMessage};
use crate::{
    BridgeError, BrokerBridge, ConsumerHandle, Delivery, MessageId, ProducerHandle, Result,
    TopicAddress,
};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_EVENT_QUEUE_DEPTH: usize = 64;

pub struct RemoteBroker {
    addr: SocketAddr,
    max_frame_bytes: usize,
    event_queue_depth: usize,
}

impl RemoteBroker {
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_limits(addr, DEFAULT_MAX_FRAME_BYTES, DEFAULT_EVENT_QUEUE_DEPTH)
    }

    pub fn with_limits(addr: SocketAddr, max_frame_bytes: usize, event_queue_depth: usize) -> Self {
        Self {
            addr,
            max_frame_bytes: max_frame_bytes.max(1),
            event_queue_depth: event_queue_depth.max(1),
        }
    }
}

impl BrokerBridge for RemoteBroker {
    fn create_producer(
        &self,
        topic: &TopicAddress,
    ) -> BoxFuture<'_, Result<Box<dyn ProducerHandle>>> {
        let topic = topic.clone();
        Box::pin(async move {
            let stream = TcpStream::connect(self.addr).await?;
            let (read, write) = stream.into_split();
            Ok(Box::new(RemoteProducer {
                topic,
                read,
                write,
                scratch: BytesMut::with_capacity(4096),
                next_request_id: 1,
                max_frame_bytes: self.max_frame_bytes,
            }) as Box<dyn ProducerHandle>)
        })
    }

    fn subscribe(
        &self,
        topic: &TopicAddress,
        subscription: &str,
    ) -> BoxFuture<'_, Result<Box<dyn ConsumerHandle>>> {
        let topic = topic.clone();
        let subscription = subscription.to_string();
        Box::pin(async move {
            let stream = TcpStream::connect(self.addr).await?;
            let (mut read, mut write) = stream.into_split();

            wire::write_message(
                &mut write,
                &WireMessage::Subscribe {
                    tenant: topic.tenant.clone(),
                    namespace: topic.namespace.clone(),
                    topic: topic.topic.clone(),
                    subscription,
                },
            )
            .await?;

            let mut scratch = BytesMut::with_capacity(4096);
            match wire::read_message(&mut read, self.max_frame_bytes, &mut scratch).await? {
                Some(WireMessage::Subscribed) => {}
                Some(WireMessage::Error { message }) => {
                    return Err(BridgeError::Protocol(message));
                }
                Some(other) => {
                    return Err(BridgeError::Protocol(format!(
                        "unexpected subscribe response: {other:?}"
                    )));
                }
                None => return Err(BridgeError::Closed),
            }

            let (event_tx, event_rx) = mpsc::channel(self.event_queue_depth);
            let (ack_tx, ack_rx) = mpsc::channel(self.event_queue_depth);
            tokio::spawn(run_event_pump(
                read,
                event_tx,
                self.max_frame_bytes,
                scratch,
            ));
            tokio::spawn(run_ack_writer(write, ack_rx));

            Ok(Box::new(RemoteConsumer { event_rx, ack_tx }) as Box<dyn ConsumerHandle>)
        })
    }
}

struct RemoteProducer {
    topic: TopicAddress,
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    scratch: BytesMut,
    next_request_id: u64,
    max_frame_bytes: usize,
}

impl ProducerHandle for RemoteProducer {
    fn publish(&mut self, payload: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let request_id = self.next_request_id;
            self.next_request_id += 1;
            wire::write_message(
                &mut self.write,
                &WireMessage::Publish {
                    tenant: self.topic.tenant.clone(),
                    namespace: self.topic.namespace.clone(),
                    topic: self.topic.topic.clone(),
                    payload: payload.to_vec(),
                    request_id,
                },
            )
            .await?;

            match wire::read_message(&mut self.read, self.max_frame_bytes, &mut self.scratch)
                .await?
            {
                Some(WireMessage::PublishOk { request_id: id }) if id == request_id => Ok(()),
                Some(WireMessage::PublishError {
                    request_id: id,
                    message,
                }) if id == request_id => Err(BridgeError::PublishRejected(message)),
                Some(WireMessage::Error { message }) => Err(BridgeError::Protocol(message)),
                Some(other) => Err(BridgeError::Protocol(format!(
                    "unexpected publish response: {other:?}"
                ))),
                None => Err(BridgeError::Closed),
            }
        })
    }
}

struct RemoteConsumer {
    event_rx: mpsc::Receiver<Result<Delivery>>,
    ack_tx: mpsc::Sender<u64>,
}

impl ConsumerHandle for RemoteConsumer {
    fn next_delivery(&mut self) -> BoxFuture<'_, Result<Option<Delivery>>> {
        Box::pin(async move {
            match self.event_rx.recv().await {
                Some(Ok(delivery)) => Ok(Some(delivery)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            }
        })
    }

    fn ack(&mut self, id: MessageId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // The writer task preserves queue order, so acks reach the broker
            // in the order they were issued.
            self.ack_tx.send(id.0).await.map_err(|_| BridgeError::Closed)
        })
    }
}

async fn run_event_pump(
    mut read: OwnedReadHalf,
    event_tx: mpsc::Sender<Result<Delivery>>,
    max_frame_bytes: usize,
    mut scratch: BytesMut,
) {
    loop {
        let message = match wire::read_message(&mut read, max_frame_bytes, &mut scratch).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(err) => {
                let _ = event_tx.send(Err(err.into())).await;
                break;
            }
        };
        match message {
            WireMessage::Event {
                payload,
                message_id,
            } => {
                let delivery = Delivery {
                    payload: Bytes::from(payload),
                    id: MessageId(message_id),
                };
                // Blocking send: a slow session backpressures the broker
                // connection instead of dropping deliveries.
                if event_tx.send(Ok(delivery)).await.is_err() {
                    break;
                }
            }
            WireMessage::Error { message } => {
                let _ = event_tx.send(Err(BridgeError::Protocol(message))).await;
                break;
            }
            other => {
                tracing::debug!(message = ?other, "ignoring unexpected frame on event stream");
            }
        }
    }
}

async fn run_ack_writer(mut write: OwnedWriteHalf, mut ack_rx: mpsc::Receiver<u64>) {
    while let Some(message_id) = ack_rx.recv().await {
        if let Err(err) = wire::write_message(&mut write, &WireMessage::Ack { message_id }).await {
            tracing::debug!(error = %err, "ack writer stopped");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn address() -> TopicAddress {
        TopicAddress::new("t1", "ns1", "orders")
    }

    // Scripted peer standing in for a real broker: acks every publish except
    // payloads equal to "reject".
    async fn spawn_publish_peer() -> Result<(SocketAddr, tokio::task::JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (mut read, mut write) = stream.into_split();
            let mut scratch = BytesMut::new();
            while let Some(message) =
                wire::read_message(&mut read, 1024 * 1024, &mut scratch).await?
            {
                match message {
                    WireMessage::Publish {
                        payload,
                        request_id,
                        ..
                    } => {
                        let response = if payload == b"reject" {
                            WireMessage::PublishError {
                                request_id,
                                message: "rejected by peer".to_string(),
                            }
                        } else {
                            WireMessage::PublishOk { request_id }
                        };
                        wire::write_message(&mut write, &response).await?;
                    }
                    other => anyhow::bail!("unexpected message: {other:?}"),
                }
            }
            Ok(())
        });
        Ok((addr, task))
    }

    #[tokio::test]
    async fn publish_resolves_on_peer_ack() -> Result<()> {
        let (addr, peer) = spawn_publish_peer().await?;
        let broker = RemoteBroker::new(addr);
        let mut producer = broker
            .create_producer(&address())
            .await
            .context("create producer")?;

        producer.publish(Bytes::from_static(b"a")).await?;
        producer.publish(Bytes::from_static(b"b")).await?;

        let err = producer
            .publish(Bytes::from_static(b"reject"))
            .await
            .expect_err("peer rejects");
        assert!(matches!(err, BridgeError::PublishRejected(_)));

        drop(producer);
        peer.await.context("peer join")??;
        Ok(())
    }

    #[tokio::test]
    async fn publish_surfaces_closed_connection() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            // Accept and immediately drop the connection.
            let _ = listener.accept().await;
        });

        let broker = RemoteBroker::new(addr);
        let mut producer = broker.create_producer(&address()).await?;
        let err = producer
            .publish(Bytes::from_static(b"x"))
            .await
            .expect_err("closed peer");
        assert!(matches!(err, BridgeError::Closed | BridgeError::Io(_)));
        Ok(())
    }

    #[tokio::test]
    async fn subscribe_delivers_events_and_writes_acks_in_order() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (mut read, mut write) = stream.into_split();
            let mut scratch = BytesMut::new();

            let subscribe = wire::read_message(&mut read, 1024 * 1024, &mut scratch)
                .await?
                .context("subscribe request")?;
            match subscribe {
                WireMessage::Subscribe { subscription, .. } => {
                    assert_eq!(subscription, "sub1");
                }
                other => anyhow::bail!("unexpected message: {other:?}"),
            }
            wire::write_message(&mut write, &WireMessage::Subscribed).await?;

            for (message_id, payload) in [(1u64, b"a"), (2u64, b"b")] {
                wire::write_message(
                    &mut write,
                    &WireMessage::Event {
                        payload: payload.to_vec(),
                        message_id,
                    },
                )
                .await?;
            }

            // Acks come back on the same connection, in delivery order.
            let mut acks = Vec::new();
            while acks.len() < 2 {
                match wire::read_message(&mut read, 1024 * 1024, &mut scratch).await? {
                    Some(WireMessage::Ack { message_id }) => acks.push(message_id),
                    Some(other) => anyhow::bail!("unexpected message: {other:?}"),
                    None => break,
                }
            }
            Ok::<_, anyhow::Error>(acks)
        });

        let broker = RemoteBroker::new(addr);
        let mut consumer = broker.subscribe(&address(), "sub1").await?;

        for expected in [b"a", b"b"] {
            let delivery = timeout(Duration::from_secs(1), consumer.next_delivery())
                .await
                .context("delivery timeout")??
                .context("delivery")?;
            assert_eq!(delivery.payload.as_ref(), expected);
            consumer.ack(delivery.id).await?;
        }

        let acks = peer.await.context("peer join")??;
        assert_eq!(acks, vec![1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn subscribe_error_response_is_terminal() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (mut read, mut write) = stream.into_split();
            let mut scratch = BytesMut::new();
            let _ = wire::read_message(&mut read, 1024 * 1024, &mut scratch).await?;
            wire::write_message(
                &mut write,
                &WireMessage::Error {
                    message: "subscription denied".to_string(),
                },
            )
            .await?;
            Ok::<_, anyhow::Error>(())
        });

        let broker = RemoteBroker::new(addr);
        let err = broker
            .subscribe(&address(), "sub1")
            .await
            .expect_err("denied");
        assert!(matches!(err, BridgeError::Protocol(_)));
        Ok(())
    }

    #[tokio::test]
    async fn consumer_sees_end_of_stream_when_peer_closes() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (mut read, mut write) = stream.into_split();
            let mut scratch = BytesMut::new();
            let _ = wire::read_message(&mut read, 1024 * 1024, &mut scratch).await?;
            wire::write_message(&mut write, &WireMessage::Subscribed).await?;
            // Connection drops here.
            Ok::<_, anyhow::Error>(())
        });

        let broker = RemoteBroker::new(addr);
        let mut consumer = broker.subscribe(&address(), "sub1").await?;
        let next = timeout(Duration::from_secs(1), consumer.next_delivery())
            .await
            .context("timeout")??;
        assert!(next.is_none());
        Ok(())
    }
}
