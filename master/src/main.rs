mod config;
mod handlers;
mod scheduler;
mod state;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::state::AppState;

const DEFAULT_LOG_FILTER: &str = "master=debug,common=debug,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = Config::from_env();
    info!("configuración: {:?}", config);
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let state = AppState::from_config(config)?;

    // router HTTP
    let app = handlers::build_router(state.clone());

    // scheduler de la cola en segundo plano
    tokio::spawn(scheduler::run_scheduler_loop(state.clone()));

    let listener = TcpListener::bind(&state.config.bind_addr).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
