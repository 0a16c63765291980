//! Per-connection session state machine and role loops.
//!
//! ## Lifecycle
//! A session is `Handshaking` from TCP accept until both the WebSocket
//! upgrade and broker-handle acquisition succeed, `Open` while the role loop
//! runs, `Closing` once any of the read path, the write path, or an external
//! shutdown signal asks for teardown, and `Closed` once the loop has drained.
//! The `Closing` transition is a compare-exchange, so concurrent triggers
//! collapse to a single cancellation signal; later triggers observe the
//! closing state and no-op.
//!
//! ## Role loops
//! The producer loop is strictly sequential: read a frame, publish it, write
//! the acknowledgement. That serialization is what guarantees acks reach the
//! client in frame order. The consumer loop multiplexes the cancel signal,
//! inbound client frames (which are rejected on this route), and broker
//! deliveries; the broker handle is not polled while a client write is in
//! flight, and the ack for a delivery is issued only after its write has
//! flushed.

use crate::routes::Role;
use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use wsgate_bridge::{ConsumerHandle, ProducerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Handshaking,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Shared view of one live session, held by the registry and the role loop.
pub struct SessionHandle {
    id: u64,
    role: Role,
    state: AtomicU8,
    cancel_tx: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn new(id: u64, role: Role) -> (Arc<Self>, watch::Receiver<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = Arc::new(Self {
            id,
            role,
            state: AtomicU8::new(SessionState::Handshaking as u8),
            cancel_tx,
        });
        (handle, cancel_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Handshaking -> Open; false if the session is already past that point.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Handshaking as u8,
                SessionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Request teardown. Exactly one caller wins the transition to Closing
    /// and fires the cancel signal; every later caller returns false.
    pub fn begin_close(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= SessionState::Closing as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    SessionState::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let _ = self.cancel_tx.send(true);
                return true;
            }
        }
    }

    pub fn mark_closed(&self) {
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
    }
}

/// Acknowledgement frames returned to producer-role clients, and the
/// rejection frames sent on consumer routes. JSON text so browser clients
/// can parse them without a binary decoder.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PublishAck {
    Ok,
    Error { message: String },
}

impl PublishAck {
    pub fn error(message: impl Into<String>) -> Self {
        PublishAck::Error {
            message: message.into(),
        }
    }

    pub fn to_frame(&self) -> Message {
        // This enum has no non-serializable states.
        Message::Text(serde_json::to_string(self).expect("ack serializes"))
    }
}

/// Producer role loop: client frames become broker publishes, each answered
/// by an ack frame in order. Any failure transitions the session to closing.
pub async fn run_producer<S>(
    ws: WebSocketStream<S>,
    handle: Arc<SessionHandle>,
    mut cancel_rx: watch::Receiver<bool>,
    mut producer: Box<dyn ProducerHandle>,
    publish_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        let frame = tokio::select! {
            _ = cancel_rx.changed() => break,
            frame = stream.next() => frame,
        };
        let payload = match frame {
            Some(Ok(Message::Text(text))) => Bytes::from(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => Bytes::from(data),
            Some(Ok(Message::Close(_))) | None => {
                handle.begin_close();
                break;
            }
            // Ping/pong are answered by the protocol layer.
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::debug!(session = handle.id(), error = %err, "socket read failed");
                handle.begin_close();
                break;
            }
        };

        let result = tokio::select! {
            _ = cancel_rx.changed() => break,
            result = timeout(publish_timeout, producer.publish(payload)) => result,
        };
        match result {
            Ok(Ok(())) => {
                metrics::counter!("wsgate_publish_total", "result" => "ok").increment(1);
                if sink.send(PublishAck::Ok.to_frame()).await.is_err() {
                    handle.begin_close();
                    break;
                }
            }
            Ok(Err(err)) => {
                metrics::counter!("wsgate_publish_total", "result" => "error").increment(1);
                tracing::warn!(session = handle.id(), error = %err, "publish failed");
                let _ = sink.send(PublishAck::error(err.to_string()).to_frame()).await;
                handle.begin_close();
                break;
            }
            Err(_) => {
                metrics::counter!("wsgate_publish_total", "result" => "timeout").increment(1);
                tracing::warn!(session = handle.id(), "publish timed out");
                let _ = sink.send(PublishAck::error("publish timed out").to_frame()).await;
                handle.begin_close();
                break;
            }
        }
    }

    handle.begin_close();
    // Drain: best-effort close frame; the broker handle drops with this scope.
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.flush().await;
    Ok(())
}

/// Consumer role loop: broker deliveries become client frames, acked back to
/// the broker once each write completes. Client data frames are rejected.
pub async fn run_consumer<S>(
    ws: WebSocketStream<S>,
    handle: Arc<SessionHandle>,
    mut cancel_rx: watch::Receiver<bool>,
    mut consumer: Box<dyn ConsumerHandle>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                        // Delivery-only route; publishes are not permitted here.
                        metrics::counter!("wsgate_rejected_client_frames_total").increment(1);
                        let reject =
                            PublishAck::error("consumer connections do not accept publishes");
                        if sink.send(reject.to_frame()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(session = handle.id(), error = %err, "socket read failed");
                        break;
                    }
                }
            }
            delivery = consumer.next_delivery() => {
                match delivery {
                    Ok(Some(delivery)) => {
                        let frame = Message::Binary(delivery.payload.to_vec());
                        let sent = tokio::select! {
                            _ = cancel_rx.changed() => break,
                            sent = sink.send(frame) => sent,
                        };
                        if sent.is_err() {
                            break;
                        }
                        // The send above flushed, so the ack cannot precede
                        // the delivery reaching the socket.
                        if let Err(err) = consumer.ack(delivery.id).await {
                            tracing::warn!(session = handle.id(), error = %err, "broker ack failed");
                            break;
                        }
                        metrics::counter!("wsgate_delivered_total").increment(1);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(session = handle.id(), error = %err, "subscription failed");
                        break;
                    }
                }
            }
        }
    }

    handle.begin_close();
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.flush().await;
    Ok(())
}
