//! Hub process: WebSocket endpoint, cross-instance bus, durable tail.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use gosocket::bus::PubSubAdapter;
use gosocket::config::Config;
use gosocket::stream::StreamProducer;
use gosocket::ws::hub::{Hub, Replicator};
use gosocket::ws::room_manager::RoomManagerConfig;
use gosocket::ws::server::SocketServer;

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = Config::from_env();
    info!(
        instance_id = %cfg.instance_id,
        port = cfg.server_port,
        redis_url = %cfg.redis_url,
        "starting server"
    );

    let cancel = CancellationToken::new();

    let (bus, producer) = match cfg.redis_connection_url() {
        Some(url) => {
            let bus = PubSubAdapter::connect(&url, &cfg.instance_id)
                .await
                .context("connect redis pub/sub")?;
            let producer = StreamProducer::connect(&url)
                .await
                .context("connect redis streams")?;
            (Some(Arc::new(bus)), Some(Arc::new(producer)))
        }
        None => {
            warn!("REDIS_URL empty: local-only mode, no cross-instance fan-out");
            (None, None)
        }
    };

    let replicator = Arc::new(Replicator::new(bus.clone(), producer));
    let (hub, hub_rx) = Hub::new(
        RoomManagerConfig {
            default_max_history: cfg.room_history_limit,
            payload_passthrough: cfg.payload_passthrough,
        },
        replicator,
        cancel.child_token(),
    );
    tokio::spawn(Arc::clone(&hub).run(hub_rx));

    if let Some(bus) = &bus {
        let remote_hub = Arc::clone(&hub);
        bus.spawn_subscriber(cancel.child_token(), move |payload| {
            remote_hub.handle_remote(&payload);
        });
    }

    let server = SocketServer::bind(
        &format!("0.0.0.0:{}", cfg.server_port),
        Arc::clone(&hub),
        cfg.instance_id.clone(),
    )
    .await
    .context("bind listener")?;
    let addr = server.local_addr()?;
    info!(%addr, "websocket endpoint ready at /ws");

    let serve = tokio::spawn(server.run(cancel.child_token()));

    tokio::signal::ctrl_c().await.context("install signal handler")?;
    info!("shutdown signal received");
    cancel.cancel();
    let _ = serve.await;

    info!("server stopped");
    Ok(())
}
