use anyhow::Context;
use event_bus::{EventBus, InMemoryBus, NatsBus};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use learning_rs::booking::{BookingMetadataResolver, HttpSchedulingClient};
use learning_rs::config::{BusType, Config};
use learning_rs::consumer::{learning_handlers, start_learning_consumers, ConsumerContext, Dispatcher};
use learning_rs::events::{DeadLetterSink, EventPublisher, OutboxRelay};
use learning_rs::ledger::{LedgerSweeper, SWEEP_INTERVAL};
use learning_rs::repos::{EnrollmentStore, PgEnrollmentStore};
use learning_rs::{db, learning_router, AppState, EnrollmentService, Metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("Running migrations...");
    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
        BusType::Nats => {
            let nats_url = config
                .nats_url
                .clone()
                .unwrap_or_else(|| "nats://localhost:4222".to_string());
            tracing::info!("Connecting to NATS at {}", nats_url);
            let client = async_nats::connect(&nats_url)
                .await
                .context("failed to connect to NATS")?;
            Arc::new(NatsBus::new(client))
        }
    };

    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
    let store: Arc<dyn EnrollmentStore> = Arc::new(PgEnrollmentStore::new(pool));

    let scheduling = HttpSchedulingClient::new(&config.scheduling_base_url, config.scheduling_timeout)
        .context("failed to build scheduling client")?;
    let service = Arc::new(EnrollmentService::new(
        store.clone(),
        BookingMetadataResolver::new(Arc::new(scheduling)),
    ));

    // Outbox relay
    let relay = OutboxRelay::new(
        store.clone(),
        EventPublisher::new(bus.clone(), config.publish_timeout),
        metrics.clone(),
        config.outbox_poll_interval,
        config.outbox_max_retries,
        config.outbox_claim_lease,
    );
    tokio::spawn(relay.run());

    // Ledger retention
    let sweeper = LedgerSweeper::new(store.clone(), config.ledger_retention);
    tokio::spawn(sweeper.run(SWEEP_INTERVAL));

    // Inbound consumers
    let dispatcher = Dispatcher::new(learning_handlers(service.clone()), store.clone(), config.retry.clone());
    let consumers = start_learning_consumers(
        ConsumerContext {
            bus: bus.clone(),
            dispatcher: Arc::new(dispatcher),
            dlq: DeadLetterSink::new(bus.clone(), config.dlq_subject.clone()),
            metrics: metrics.clone(),
        },
        config.consumer_workers,
    )
    .await
    .context("failed to start consumers")?;
    tracing::info!(workers = config.consumer_workers, "Learning consumers started");

    let app = learning_router(AppState { service, metrics }).layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid HOST/PORT")?;
    tracing::info!("Learning module listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind")?;

    // Losing the consume stream is fatal; a supervisor restarts the process
    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result.context("server failed")?;
            Ok(())
        }
        _ = consumers.wait() => {
            tracing::error!("Event consumers stopped, shutting down");
            anyhow::bail!("event consumers stopped")
        }
    }
}
