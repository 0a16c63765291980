// Gateway service main entry point.
use anyhow::Result;
use gateway::service::ProxyService;
use gateway::{config, observability};
use std::future::Future;
use std::sync::Arc;
use wsgate_bridge::{BrokerBridge, MemoryBroker, RemoteBroker};

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability();

    let config = config::GatewayConfig::from_env_or_yaml()?;
    // Metrics and health endpoints live on their own listener.
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let bridge: Arc<dyn BrokerBridge> = match config.broker_addr {
        Some(addr) => {
            tracing::info!(addr = %addr, "using remote broker");
            Arc::new(RemoteBroker::with_limits(
                addr,
                config.max_frame_bytes,
                config.session_queue_depth,
            ))
        }
        None => {
            // Standalone mode keeps the full pipeline usable without a
            // broker deployment.
            tracing::info!("no broker address configured, using the in-process broker");
            Arc::new(MemoryBroker::new())
        }
    };

    let service = Arc::new(ProxyService::new(config, bridge));
    service.start().await?;

    // Block until the shutdown future resolves so the process stays alive.
    shutdown.await;
    service.stop().await?;
    tracing::info!("gateway stopped");
    Ok(())
}
