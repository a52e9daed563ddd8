//! Persistence worker: tails the message stream and batches into Postgres.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use gosocket::config::Config;
use gosocket::consumer::{ConsumerConfig, StreamConsumer};
use gosocket::persistence::MessageRepository;

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
        worker_id = %cfg.worker_id,
        redis_url = %cfg.redis_url,
        batch_size = cfg.batch_size,
        batch_timeout = ?cfg.batch_timeout,
        "starting worker"
    );

    let redis_url = cfg
        .redis_connection_url()
        .context("REDIS_URL is required for the worker")?;

    let repository = MessageRepository::connect(&cfg.postgres_url)
        .await
        .context("connect postgres")?;

    let consumer = StreamConsumer::connect(
        &redis_url,
        ConsumerConfig {
            consumer_id: cfg.worker_id.clone(),
            batch_size: cfg.batch_size,
            batch_timeout: cfg.batch_timeout,
        },
        Arc::new(repository.clone()),
    )
    .await
    .context("connect redis streams")?;

    let cancel = CancellationToken::new();
    let consume = tokio::spawn(consumer.run(cancel.child_token()));
    info!("worker ready");

    tokio::signal::ctrl_c().await.context("install signal handler")?;
    info!("shutdown signal received");
    cancel.cancel();
    // The consumer flushes its pending batch before exiting.
    let _ = consume.await;

    match repository.stats().await {
        Ok(stats) => info!(
            total_messages = stats.total_messages,
            total_rooms = stats.total_rooms,
            "final statistics"
        ),
        Err(err) => warn!(error = %err, "could not read final statistics"),
    }

    info!("worker stopped");
    Ok(())
}
