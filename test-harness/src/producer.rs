// Test harness producer: publishes frames through the gateway at a configured rate.
use anyhow::{Context, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "producer")]
#[command(about = "Test harness producer for the wsgate gateway")]
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

    /// Message payload size in bytes
    #[arg(long, default_value = "1024")]
    payload_size: usize,

    /// Messages per second rate (0 = unlimited)
    #[arg(long, default_value = "100")]
    rate: u64,

    /// Total number of messages to publish (0 = unlimited)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Producer ID for logging
    #[arg(long, default_value = "prod-1")]
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
        "{}/ws/producer/persistent/{}/{}/{}",
        args.gateway.trim_end_matches('/'),
        args.tenant,
        args.namespace,
        args.topic
    );
    info!(
        id = %args.id,
        url = %url,
        payload_size = args.payload_size,
        rate = args.rate,
        count = args.count,
        "Starting producer"
    );

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

    let payload = vec![b'x'; args.payload_size];
    let delay = if args.rate > 0 {
        Some(Duration::from_micros(1_000_000 / args.rate))
    } else {
        None
    };

    let start_time = Instant::now();
    let mut published = 0u64;
    let mut errors = 0u64;

    loop {
        if args.count > 0 && published >= args.count {
            break;
        }

        ws.send(Message::Binary(payload.clone()))
            .await
            .context("send payload")?;

        // The gateway acks each publish in order; wait for it before the
        // next send so error counts stay aligned with frames.
        match ws.next().await {
            Some(Ok(Message::Text(ack))) => {
                let value: serde_json::Value =
                    serde_json::from_str(&ack).context("parse ack frame")?;
                if value["result"] == "ok" {
                    published += 1;
                    if published % 1000 == 0 {
                        let elapsed = start_time.elapsed();
                        let rate = published as f64 / elapsed.as_secs_f64();
                        info!(
                            id = %args.id,
                            published = published,
                            errors = errors,
                            rate = format!("{:.2}", rate),
                            "Publishing progress"
                        );
                    }
                } else {
                    errors += 1;
                    error!(id = %args.id, ack = %ack, "Publish rejected");
                }
            }
            Some(Ok(Message::Close(frame))) => {
                info!(id = %args.id, frame = ?frame, "Gateway closed the session");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                error!(id = %args.id, error = %err, "Socket error");
                break;
            }
            None => break,
        }

        if let Some(delay) = delay {
            sleep(delay).await;
        }
    }

    let elapsed = start_time.elapsed();
    let rate = published as f64 / elapsed.as_secs_f64();
    info!(
        id = %args.id,
        published = published,
        errors = errors,
        elapsed = format!("{:.2}s", elapsed.as_secs_f64()),
        rate = format!("{:.2} msg/s", rate),
        "Producer completed"
    );

    Ok(())
}
