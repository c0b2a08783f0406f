mod config;
mod error;
mod routes;

use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};
use ward_core::util::now_ms;
use ward_core::MemoryBackend;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ward_api=info".parse().expect("valid directive"))
                .add_directive("ward_core=info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting ward-api with config: {:?}", config);

    let state = AppState::new(Arc::clone(&config), MemoryBackend::new());
    spawn_trash_sweep(&state);

    let bind_addr = config.bind_addr.clone();
    let router = app_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("ward-api listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}

/// Permanently drop trash items past their 30-day window.
fn spawn_trash_sweep(state: &AppState) {
    let backend = Arc::clone(&state.backend);
    let every = state.config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            backend.sweep_expired_trash(now_ms());
        }
    });
}
