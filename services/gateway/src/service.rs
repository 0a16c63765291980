//! Proxy service orchestration: listeners, session registry, lifecycle.
//!
//! The bridge is injected at construction so tests can run the whole service
//! against the in-memory broker; there is no process-wide singleton state.
//! `start` returns only after every listener is bound, which gives callers a
//! real readiness signal instead of a sleep-and-poll.

use crate::config::GatewayConfig;
use crate::listener::{self, ListenerContext};
use crate::registry::SessionRegistry;
use crate::tls;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use wsgate_bridge::BrokerBridge;

pub struct ProxyService {
    config: GatewayConfig,
    bridge: Arc<dyn BrokerBridge>,
    registry: Arc<SessionRegistry>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
    bound_tls_addr: Mutex<Option<SocketAddr>>,
}

impl ProxyService {
    pub fn new(config: GatewayConfig, bridge: Arc<dyn BrokerBridge>) -> Self {
        Self {
            config,
            bridge,
            registry: Arc::new(SessionRegistry::new()),
            accept_tasks: Mutex::new(Vec::new()),
            bound_addr: Mutex::new(None),
            bound_tls_addr: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bound address of the plain listener, available once `start` returns.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    /// Bound address of the TLS listener, if TLS is enabled.
    pub fn local_tls_addr(&self) -> Option<SocketAddr> {
        *self.bound_tls_addr.lock()
    }

    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;
        let ctx = ListenerContext {
            bridge: Arc::clone(&self.bridge),
            registry: Arc::clone(&self.registry),
            publish_timeout: Duration::from_millis(self.config.publish_timeout_ms),
            handshake_timeout: Duration::from_millis(self.config.handshake_timeout_ms),
            max_frame_bytes: self.config.max_frame_bytes,
        };

        // Bind everything before spawning any accept loop so configuration
        // problems fail the whole start instead of a half-running service.
        let plain = TcpListener::bind(self.config.ws_bind)
            .await
            .with_context(|| format!("bind websocket listener on {}", self.config.ws_bind))?;
        let plain_addr = plain
            .local_addr()
            .context("read websocket listener address")?;

        let tls_parts = if self.config.tls_enabled {
            let cert_path = self
                .config
                .tls_cert_path
                .as_deref()
                .context("tls enabled without a certificate path")?;
            let key_path = self
                .config
                .tls_key_path
                .as_deref()
                .context("tls enabled without a private key path")?;
            let server_config = tls::load_server_config(cert_path, key_path)?;
            let tls_listener = TcpListener::bind(self.config.ws_tls_bind)
                .await
                .with_context(|| {
                    format!("bind tls websocket listener on {}", self.config.ws_tls_bind)
                })?;
            let tls_addr = tls_listener
                .local_addr()
                .context("read tls websocket listener address")?;
            Some((tls_listener, tls::acceptor(server_config), tls_addr))
        } else {
            None
        };

        let mut tasks = Vec::new();
        {
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = listener::serve_plain(plain, ctx).await {
                    tracing::warn!(error = %err, "websocket accept loop exited");
                }
            }));
        }
        *self.bound_addr.lock() = Some(plain_addr);
        tracing::info!(addr = %plain_addr, cluster = %self.config.cluster_name, "websocket listener started");

        if let Some((tls_listener, acceptor, tls_addr)) = tls_parts {
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = listener::serve_tls(tls_listener, acceptor, ctx).await {
                    tracing::warn!(error = %err, "tls accept loop exited");
                }
            }));
            *self.bound_tls_addr.lock() = Some(tls_addr);
            tracing::info!(addr = %tls_addr, "tls websocket listener started");
        }

        *self.accept_tasks.lock() = tasks;
        Ok(())
    }

    /// Stop accepting, signal every live session to close, and wait (bounded
    /// by the shutdown timeout) for the registry to drain.
    pub async fn stop(&self) -> Result<()> {
        for task in self.accept_tasks.lock().drain(..) {
            task.abort();
        }
        self.registry.signal_close_all();

        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        if self.registry.wait_drained(timeout).await {
            tracing::info!("all sessions drained");
        } else {
            tracing::warn!(
                remaining = self.registry.len(),
                "shutdown timeout lapsed with sessions still open"
            );
        }
        Ok(())
    }
}
