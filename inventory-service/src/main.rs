use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use inventory_service::api;
use inventory_service::config::Args;
use inventory_service::consumer::MessageConsumer;
use inventory_service::handlers::inventory_router;
use inventory_service::kafka::KafkaConnector;
use inventory_service::store::{PgStockStore, StockStore};
use inventory_service::supervisor::ConnectionSupervisor;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&args.database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&args.database_url);
    let pool = Pool::builder().build(config).await?;
    let store: Arc<dyn StockStore> = Arc::new(PgStockStore::new(pool));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = ConnectionSupervisor::new(args.connect_policy());
    let broker_status = supervisor.status();

    let consumer_task = {
        let store = Arc::clone(&store);
        let args = args.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let connector = KafkaConnector::new(args.kafka_settings());
            let session = tokio::select! {
                (session, _) = supervisor.establish(&connector) => session,
                _ = shutdown.changed() => return,
            };
            let Some(session) = session else {
                warn!("Inventory service running in degraded mode, messages will not be consumed");
                return;
            };

            let channel = session.channel();
            let consumer = Arc::new(MessageConsumer::new(
                inventory_router(store),
                channel.clone(),
                args.redelivery_policy(),
            ));
            consumer
                .run(session.deliveries(), shutdown, args.max_in_flight)
                .await;

            if let Err(e) = channel.flush() {
                error!("Failed to commit final offsets: {}", e);
            }
        })
    };

    let app = api::create_router(api::AppState::new(store, broker_status));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Inventory service web server started on port {}", args.port);
    info!(
        "Inventory service ready to accept HTTP requests at http://0.0.0.0:{}/products",
        args.port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    if let Err(e) = consumer_task.await {
        error!("Message consumer task failed: {}", e);
    }
    info!("Inventory service stopped");

    Ok(())
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining in-flight messages");
    shutdown.send_replace(true);
}
