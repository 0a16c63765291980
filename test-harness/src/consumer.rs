// Test harness consumer: receives frames from a gateway subscription.
use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use std::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "consumer")]
#[command(about = "Test harness consumer for the wsgate gateway")]
struct Args {
    /// Gateway base URL (ws://host:port or wss://host:port)
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    gateway: String,

    /// Tenant ID
    #[arg(long, default_value = "test-tenant")]
    tenant: String,

    /// Namespace
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Topic name
    #[arg(long, default_value = "test-topic")]
    topic: String,

    /// Subscription name
    #[arg(long, default_value = "test-sub")]
    subscription: String,

    /// Total number of messages to receive (0 = unlimited)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Consumer ID for logging
    #[arg(long, default_value = "cons-1")]
    id: String,

    /// Disable certificate validation (for self-signed certs)
    #[arg(long, default_value = "true")]
    insecure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let url = format!(
        "{}/ws/consumer/persistent/{}/{}/{}/{}",
        args.gateway.trim_end_matches('/'),
        args.tenant,
        args.namespace,
        args.topic,
        args.subscription
    );
    info!(id = %args.id, url = %url, count = args.count, "Starting consumer");

    let connector = if args.insecure {
        Some(test_harness::tls::insecure_connector())
    } else {
        None
    };
    let (mut ws, _) =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector)
            .await
            .context("connect to gateway")?;
    info!(id = %args.id, "Connected to gateway");

    let start_time = Instant::now();
    let mut received = 0u64;
    let mut bytes = 0u64;

    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Binary(payload)) => {
                received += 1;
                bytes += payload.len() as u64;
                if received % 1000 == 0 {
                    let elapsed = start_time.elapsed();
                    let rate = received as f64 / elapsed.as_secs_f64();
                    info!(
                        id = %args.id,
                        received = received,
                        bytes = bytes,
                        rate = format!("{:.2}", rate),
                        "Consuming progress"
                    );
                }
                if args.count > 0 && received >= args.count {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                info!(id = %args.id, frame = ?frame, "Gateway closed the session");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                error!(id = %args.id, error = %err, "Socket error");
                break;
            }
        }
    }

    let elapsed = start_time.elapsed();
    let rate = received as f64 / elapsed.as_secs_f64();
    info!(
        id = %args.id,
        received = received,
        bytes = bytes,
        elapsed = format!("{:.2}s", elapsed.as_secs_f64()),
        rate = format!("{:.2} msg/s", rate),
        "Consumer completed"
    );

    Ok(())
}
