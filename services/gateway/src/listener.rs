//! Transport listeners: TCP accept, optional TLS, WebSocket upgrade, routing.
//!
//! Each accepted connection gets its own task. The route is resolved inside
//! the upgrade callback so a malformed path is rejected with an HTTP 400
//! before any WebSocket frame is exchanged and before any broker resource is
//! touched. Handshake failures are counted and logged; they never take down
//! the accept loop.

use crate::registry::SessionRegistry;
use crate::routes::{self, Role, TopicRoute};
use crate::session::{self, SessionHandle};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use wsgate_bridge::BrokerBridge;

#[derive(Clone)]
pub struct ListenerContext {
    pub bridge: Arc<dyn BrokerBridge>,
    pub registry: Arc<SessionRegistry>,
    pub publish_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
}

/// Accept loop for the plain listener.
pub async fn serve_plain(listener: TcpListener, ctx: ListenerContext) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "tcp accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, ctx).await;
        });
    }
}

/// Accept loop for the TLS listener. The TLS handshake runs before any
/// WebSocket negotiation; a failed handshake closes the raw connection.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ctx: ListenerContext,
) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "tcp accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let stream = match timeout(ctx.handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    metrics::counter!("wsgate_rejected_connections_total", "reason" => "tls")
                        .increment(1);
                    tracing::info!(peer = %peer, error = %err, "tls handshake failed");
                    return;
                }
                Err(_) => {
                    metrics::counter!("wsgate_rejected_connections_total", "reason" => "tls_timeout")
                        .increment(1);
                    tracing::info!(peer = %peer, "tls handshake timed out");
                    return;
                }
            };
            handle_connection(stream, peer, ctx).await;
        });
    }
}

async fn handle_connection<S>(stream: S, peer: SocketAddr, ctx: ListenerContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // The callback runs during the upgrade, before the 101 response is sent;
    // the slot carries the parsed route out of it.
    let route_slot: Arc<StdMutex<Option<TopicRoute>>> = Arc::new(StdMutex::new(None));
    let callback_slot = Arc::clone(&route_slot);
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(ctx.max_frame_bytes);
    ws_config.max_frame_size = Some(ctx.max_frame_bytes);

    let upgrade = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            match routes::parse_path(request.uri().path()) {
                Ok(route) => {
                    if let Ok(mut slot) = callback_slot.lock() {
                        *slot = Some(route);
                    }
                    Ok(response)
                }
                Err(err) => Err(reject_upgrade(&err)),
            }
        },
        Some(ws_config),
    );
    let ws = match timeout(ctx.handshake_timeout, upgrade).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(err)) => {
            metrics::counter!("wsgate_rejected_connections_total", "reason" => "upgrade")
                .increment(1);
            tracing::info!(peer = %peer, error = %err, "websocket upgrade rejected");
            return;
        }
        Err(_) => {
            metrics::counter!("wsgate_rejected_connections_total", "reason" => "upgrade_timeout")
                .increment(1);
            tracing::info!(peer = %peer, "websocket upgrade timed out");
            return;
        }
    };
    let route = match route_slot.lock().ok().and_then(|mut slot| slot.take()) {
        Some(route) => route,
        // The callback always runs before a successful upgrade resolves.
        None => return,
    };
    metrics::counter!("wsgate_connections_total", "role" => route.role.as_str()).increment(1);
    run_session(ws, peer, route, ctx).await;
}

fn reject_upgrade(err: &routes::RouteError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

async fn run_session<S>(
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    route: TopicRoute,
    ctx: ListenerContext,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session_id = ctx.registry.next_session_id();
    let (handle, cancel_rx) = SessionHandle::new(session_id, route.role);

    // Broker-handle acquisition happens while the session is still
    // handshaking; a failure here never reaches the registry.
    match route.role {
        Role::Producer => {
            let producer = match ctx.bridge.create_producer(&route.address).await {
                Ok(producer) => producer,
                Err(err) => {
                    reject_session(peer, &route, err);
                    close_unopened(ws).await;
                    return;
                }
            };
            handle.mark_open();
            ctx.registry.insert(Arc::clone(&handle));
            tracing::info!(
                session = session_id,
                peer = %peer,
                topic = %route.address,
                "producer session open"
            );
            let result = session::run_producer(
                ws,
                Arc::clone(&handle),
                cancel_rx,
                producer,
                ctx.publish_timeout,
            )
            .await;
            finish_session(&ctx, &handle, result);
        }
        Role::Consumer => {
            // The route parser guarantees a subscription on consumer routes.
            let Some(subscription) = route.subscription.as_deref() else {
                close_unopened(ws).await;
                return;
            };
            let consumer = match ctx.bridge.subscribe(&route.address, subscription).await {
                Ok(consumer) => consumer,
                Err(err) => {
                    reject_session(peer, &route, err);
                    close_unopened(ws).await;
                    return;
                }
            };
            handle.mark_open();
            ctx.registry.insert(Arc::clone(&handle));
            tracing::info!(
                session = session_id,
                peer = %peer,
                topic = %route.address,
                subscription = subscription,
                "consumer session open"
            );
            let result =
                session::run_consumer(ws, Arc::clone(&handle), cancel_rx, consumer).await;
            finish_session(&ctx, &handle, result);
        }
    }
}

fn reject_session(peer: SocketAddr, route: &TopicRoute, err: wsgate_bridge::BridgeError) {
    metrics::counter!("wsgate_rejected_connections_total", "reason" => "broker").increment(1);
    tracing::warn!(
        peer = %peer,
        topic = %route.address,
        role = %route.role,
        error = %err,
        "broker handle acquisition failed"
    );
}

async fn close_unopened<S>(mut ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Best-effort close for connections that never reached Open.
    let _ = ws.close(None).await;
}

fn finish_session(ctx: &ListenerContext, handle: &SessionHandle, result: Result<()>) {
    ctx.registry.remove(handle.id());
    handle.mark_closed();
    if let Err(err) = result {
        tracing::debug!(session = handle.id(), error = %err, "session loop ended with error");
    }
    tracing::info!(session = handle.id(), role = %handle.role(), "session closed");
}
