//! Courier event delivery service.
//!
//! Main entry point. Connects to PostgreSQL and Kafka, runs dead-letter
//! recovery in the background, and coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier::Config;
use courier_core::{storage::Storage, Clock, DeadLetterStatus, RealClock};
use courier_delivery::{
    kafka::KafkaBrokerClient,
    lock::{LocalLock, PostgresLeaseLock, SchedulerLock, RECOVERY_LEASE},
    PostgresDeadLetterStore, PublishService, Publisher, RecoveryEngine,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!("starting courier event delivery service");
    info!(
        database_url = %config.database_url_masked(),
        kafka_bootstrap_servers = %config.kafka_bootstrap_servers,
        recovery_batch_size = config.recovery_batch_size,
        recovery_max_retry = config.recovery_max_retry,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(Storage::new(db_pool.clone()));
    log_backlog(&storage).await;

    let store = Arc::new(PostgresDeadLetterStore::new(
        storage.clone(),
        clock.clone(),
        config.recovery_max_retry,
    ));
    let broker = KafkaBrokerClient::new(&config.to_kafka_config())?;
    let service = PublishService::new(
        Publisher::new(Arc::new(broker)),
        config.to_classifier(),
        store.clone(),
        clock.clone(),
    )
    .with_publish_timeout(config.publish_timeout());

    let lock: Arc<dyn SchedulerLock> = if config.scheduler_lease_enabled {
        Arc::new(PostgresLeaseLock::new(
            storage.clone(),
            clock.clone(),
            RECOVERY_LEASE,
            config.scheduler_lease_ttl(),
        ))
    } else {
        Arc::new(LocalLock)
    };

    let mut engine =
        RecoveryEngine::new(config.to_recovery_config(), store, Arc::new(service), lock, clock)?;
    engine.start()?;

    info!("courier is ready");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "recovery engine did not stop cleanly");
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing from the configured `RUST_LOG` filter.
fn init_tracing(directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives).context("invalid RUST_LOG filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Creates the dead-letter and lease tables.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letter_events (
            event_id TEXT PRIMARY KEY,
            topic TEXT NOT NULL,
            event_key TEXT NOT NULL,
            value TEXT NOT NULL,
            trace_id TEXT NOT NULL,
            headers JSONB NOT NULL DEFAULT '{}',
            published_at TIMESTAMPTZ NOT NULL,
            error_message TEXT NOT NULL,
            error_kind TEXT NOT NULL,
            cause_kind TEXT,
            stack_snapshot TEXT,
            partition INTEGER,
            event_offset BIGINT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            is_retryable BOOLEAN NOT NULL,
            next_retry_at TIMESTAMPTZ,
            status TEXT NOT NULL DEFAULT 'dead',
            recovered_partition INTEGER,
            recovered_offset BIGINT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CHECK (status IN ('dead', 'recovered')),
            CHECK (retry_count >= 0)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create dead_letter_events table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduler_leases (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create scheduler_leases table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_dead_letter_events_recovery
        ON dead_letter_events(is_retryable, status, created_at, event_id)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create dead_letter_events recovery index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_dead_letter_events_retention
        ON dead_letter_events(created_at)
        WHERE status = 'recovered'
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create dead_letter_events retention index")?;

    Ok(())
}

/// Logs how many dead letters are waiting at startup.
async fn log_backlog(storage: &Storage) {
    match storage.dead_letters.count_by_status(DeadLetterStatus::Dead).await {
        Ok(pending) => info!(pending, "dead letter backlog"),
        Err(e) => warn!(error = %e, "failed to count dead letter backlog"),
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
