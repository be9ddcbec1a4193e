use clap::{Parser, ValueEnum};
use sentinel_service::{build_router, SentinelConfig, ServiceConfig, ServiceState, StoreBackend};
use std::net::SocketAddr;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "sentinel-cpd", version, about = "Sentinel Control Plane orchestration service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8090
    #[arg(long, default_value = "127.0.0.1:8090")]
    listen: SocketAddr,
    /// Rollout store backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StoreMode::Auto, env = "SENTINEL_STORE")]
    store: StoreMode,
    /// PostgreSQL url for the rollout store.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    /// Seconds between drift reconciliation scans.
    #[arg(long, default_value_t = 30, env = "SENTINEL_DRIFT_CHECK_INTERVAL_SECONDS")]
    drift_check_interval_seconds: u64,
    /// Delay between tick-driver re-enqueues for an in-flight rollout.
    #[arg(long, default_value_t = 1, env = "SENTINEL_TICK_DELAY_SECONDS")]
    tick_delay_seconds: u64,
    /// Default progress deadline applied when a rollout omits one, in seconds.
    #[arg(long, default_value_t = 600, env = "SENTINEL_DEFAULT_PROGRESS_DEADLINE_SECONDS")]
    default_progress_deadline_seconds: i64,
}

fn resolve_store_backend(cli: &Cli) -> anyhow::Result<StoreBackend> {
    let resolved_url = cli.database_url.clone().or_else(|| std::env::var("DATABASE_URL").ok());

    let backend = match cli.store {
        StoreMode::Memory => StoreBackend::Memory,
        StoreMode::Postgres => {
            let database_url = resolved_url
                .ok_or_else(|| anyhow::anyhow!("store=postgres requires --database-url or DATABASE_URL"))?;
            StoreBackend::Postgres { database_url }
        }
        StoreMode::Auto => match resolved_url {
            Some(database_url) => StoreBackend::Postgres { database_url },
            None => StoreBackend::Memory,
        },
    };

    Ok(backend)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sentinel_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let store_backend = resolve_store_backend(&cli)?;
    let config = ServiceConfig {
        store_backend,
        sentinel: SentinelConfig {
            drift_check_interval_seconds: cli.drift_check_interval_seconds,
            tick_delay_seconds: cli.tick_delay_seconds,
            default_progress_deadline_seconds: cli.default_progress_deadline_seconds,
            ..SentinelConfig::default()
        },
    };

    let state = std::sync::Arc::new(ServiceState::bootstrap(config).await?);
    state.spawn_background_jobs();

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("sentinel-cp listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
